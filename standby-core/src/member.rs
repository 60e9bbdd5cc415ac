//! Listener group members and their registration.
//!
//! A member is the userspace analogue of one SO_REUSEPORT socket in the
//! group: it owns a bounded queue of connections the admission layer routed
//! to it. Its [`MemberHandle`] is what sits in the registry slot.
//!
//! Liveness is structural. When a [`GroupMember`] is dropped its queue closes,
//! its handle stops listening, and the policy fails over on the next lookup
//! without anyone touching the registry.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use standby_ebpf_common::Slot;

use crate::error::{Result, StandbyError};
use crate::registry::{ListenerHandle, SocketRegistry};

/// Default number of routed-but-not-yet-accepted connections per member.
pub const DEFAULT_MEMBER_BACKLOG: usize = 1024;

/// Which slot a member occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Active target (slot 0)
    Primary,
    /// Hot standby (slot 1)
    Standby,
}

impl Role {
    #[inline]
    pub const fn slot(self) -> Slot {
        match self {
            Role::Primary => Slot::Primary,
            Role::Standby => Slot::Fallback,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Standby => "standby",
        }
    }
}

impl FromStr for Role {
    type Err = StandbyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Role::Primary),
            "standby" => Ok(Role::Standby),
            _ => Err(StandbyError::InvalidRole(s.to_owned())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection the admission layer handed to a member.
#[derive(Debug)]
pub struct RoutedConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Slot the policy picked
    pub slot: Slot,
}

/// Registry-side handle of a member.
pub struct MemberHandle {
    role: Role,
    tx: mpsc::Sender<RoutedConnection>,
}

impl MemberHandle {
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a connection on this member without waiting.
    ///
    /// A full or closed member hands the connection back.
    pub fn deliver(&self, conn: RoutedConnection) -> std::result::Result<(), RoutedConnection> {
        self.tx.try_send(conn).map_err(|e| match e {
            TrySendError::Full(conn) | TrySendError::Closed(conn) => conn,
        })
    }
}

impl ListenerHandle for MemberHandle {
    #[inline]
    fn is_listening(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl fmt::Debug for MemberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberHandle")
            .field("role", &self.role)
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Receiving side of a member.
pub struct GroupMember {
    role: Role,
    rx: mpsc::Receiver<RoutedConnection>,
    handle: Arc<MemberHandle>,
}

impl GroupMember {
    /// Create an unregistered member and its handle.
    pub fn new(role: Role, backlog: usize) -> Self {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        Self {
            role,
            rx,
            handle: Arc::new(MemberHandle { role, tx }),
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handle(&self) -> Arc<MemberHandle> {
        Arc::clone(&self.handle)
    }

    /// Wait for the next connection routed to this member.
    ///
    /// Returns `None` once [`close`](Self::close) was called and the queue
    /// drained.
    pub async fn accept(&mut self) -> Option<RoutedConnection> {
        self.rx.recv().await
    }

    /// Stop accepting new connections while keeping queued ones readable.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl fmt::Debug for GroupMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupMember").field("role", &self.role).finish()
    }
}

/// Create a member for `role` and write its handle into the role's slot.
///
/// This is the control-plane write of `(slot, socket)` into the shared table.
/// An existing occupant of the slot is replaced.
pub fn register_member(
    registry: &SocketRegistry<MemberHandle>,
    role: Role,
    backlog: usize,
) -> Result<GroupMember> {
    let member = GroupMember::new(role, backlog);
    let slot = role.slot().index();

    if let Some(previous) = registry.populate(slot, member.handle())? {
        warn!(
            registry = %registry.name(),
            slot = slot,
            previous_listening = previous.is_listening(),
            "Replaced existing slot occupant"
        );
    }

    info!(
        registry = %registry.name(),
        role = %role,
        slot = slot,
        backlog = backlog,
        "Member registered"
    );
    Ok(member)
}

/// Remove a member's handle from its slot, unless it was already replaced.
pub fn deregister_member(
    registry: &SocketRegistry<MemberHandle>,
    member: &GroupMember,
) -> Result<bool> {
    let removed = registry.depopulate_if(member.role.slot().index(), &member.handle)?;
    if removed {
        info!(registry = %registry.name(), role = %member.role, "Member deregistered");
    }
    Ok(removed)
}

/// Parse a comma-separated member list such as `"primary,standby"`.
pub fn parse_roles(list: &str) -> Result<Vec<Role>> {
    let mut roles = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let role: Role = part.parse()?;
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    Ok(roles)
}
