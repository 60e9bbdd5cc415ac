//! Userspace admission front.
//!
//! Plays the part the kernel plays for a reuseport group: it owns the
//! public listener, asks the hot-standby policy where every new connection
//! goes, and either hands the stream to the chosen member or closes it.
//!
//! The policy call is synchronous and sits directly in the accept loop;
//! logging and counting happen around it, never inside it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use standby_ebpf_common::{select, Selection, Slot, Verdict, IPPROTO_TCP};

use crate::error::Result;
use crate::member::{MemberHandle, RoutedConnection};
use crate::registry::SocketRegistry;

/// Admission listener configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Address to listen on (default: 127.0.0.1:8080)
    pub listen_addr: SocketAddr,

    /// Set SO_REUSEPORT so other group processes can bind the same port
    pub reuse_port: bool,

    /// Kernel accept backlog (default: 1024)
    pub backlog: i32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8080).into(),
            reuse_port: true,
            backlog: 1024,
        }
    }
}

/// Outcome counters for the admission front.
///
/// Uses atomic counters for lock-free updates.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    /// Every decision taken
    pub connections_total: AtomicU64,
    /// Routed to slot 0
    pub accepted_primary: AtomicU64,
    /// Routed to slot 1
    pub accepted_fallback: AtomicU64,
    /// Dropped before the registry was consulted
    pub dropped_protocol: AtomicU64,
    /// Dropped because neither slot was usable
    pub dropped_no_target: AtomicU64,
    /// Accepted, but the member queue refused the stream
    pub delivery_failures: AtomicU64,
}

impl AdmissionMetrics {
    /// Record one policy verdict.
    #[inline]
    pub fn record(&self, ip_protocol: u32, verdict: Verdict) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict {
            Verdict::Accept(Slot::Primary) => &self.accepted_primary,
            Verdict::Accept(Slot::Fallback) => &self.accepted_fallback,
            Verdict::Drop if ip_protocol != IPPROTO_TCP => &self.dropped_protocol,
            Verdict::Drop => &self.dropped_no_target,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            accepted_primary: self.accepted_primary.load(Ordering::Relaxed),
            accepted_fallback: self.accepted_fallback.load(Ordering::Relaxed),
            dropped_protocol: self.dropped_protocol.load(Ordering::Relaxed),
            dropped_no_target: self.dropped_no_target.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AdmissionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub accepted_primary: u64,
    pub accepted_fallback: u64,
    pub dropped_protocol: u64,
    pub dropped_no_target: u64,
    pub delivery_failures: u64,
}

/// Bind a TCP listener suitable for joining a reuseport group.
pub fn create_listener(
    addr: SocketAddr,
    reuse_port: bool,
    backlog: i32,
) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// The admission front server.
pub struct AdmissionServer {
    config: AdmissionConfig,
    registry: Arc<SocketRegistry<MemberHandle>>,
    metrics: Arc<AdmissionMetrics>,
}

impl AdmissionServer {
    pub fn new(
        config: AdmissionConfig,
        registry: Arc<SocketRegistry<MemberHandle>>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<AdmissionMetrics> {
        &self.metrics
    }

    /// Bind the configured address and run the accept loop.
    pub async fn run(&self) -> Result<()> {
        let listener = create_listener(
            self.config.listen_addr,
            self.config.reuse_port,
            self.config.backlog,
        )?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    ///
    /// This method only returns on a listener error.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            registry = %self.registry.name(),
            reuse_port = self.config.reuse_port,
            "Admission front listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept error");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.admit(stream, peer, IPPROTO_TCP);
        }
    }

    /// Decide and dispatch a single connection.
    ///
    /// Returns the policy verdict. A dropped stream is closed before this
    /// returns.
    pub fn admit(&self, stream: TcpStream, peer: SocketAddr, ip_protocol: u32) -> Verdict {
        let selection = select(ip_protocol, &*self.registry);
        let verdict = selection.verdict();
        self.metrics.record(ip_protocol, verdict);

        match selection {
            Selection::Accept { slot, handle } => {
                trace!(peer = %peer, slot = %slot, role = %handle.role(), "Connection admitted");
                if let Err(conn) = handle.deliver(RoutedConnection { stream, peer, slot }) {
                    self.metrics.record_delivery_failure();
                    warn!(peer = %conn.peer, slot = %slot, "Member queue refused connection");
                }
            }
            Selection::Drop => {
                debug!(peer = %peer, ip_protocol = ip_protocol, "Connection dropped");
                drop(stream);
            }
        }

        verdict
    }
}

/// Errors tied to a single pending connection rather than the listener.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), ConnectionAborted | ConnectionReset | Interrupted | WouldBlock)
}
