//! Standby eBPF Common - Shared kernel/userspace selection policy
//!
//! This crate defines the hot-standby selection policy and the constants
//! shared between the `sk_reuseport` program running in kernel space and
//! the userspace admission layer.
//!
//! # Decision
//!
//! ```text
//! incoming connection
//!         │
//!   ip_protocol == TCP ? ──no──► Drop
//!         │ yes
//!   lookup(slot 0) ──found──► Accept(Primary)
//!         │ not found
//!   lookup(slot 1) ──found──► Accept(Fallback)
//!         │ not found
//!         ▼
//!       Drop
//! ```
//!
//! The policy is generic over [`SlotTable`], so the kernel program backs it
//! with `bpf_sk_select_reuseport` and userspace backs it with an in-memory
//! registry. Both get the exact same decision logic.
//!
//! # Constraints
//!
//! Everything here must stay valid for the BPF target: no allocation, no
//! panics on the selection path, at most two table lookups.

#![cfg_attr(not(test), no_std)]

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u32 = 6;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u32 = 17;

/// `sk_action` value telling the kernel to drop the connection.
pub const SK_DROP: u32 = 0;

/// `sk_action` value telling the kernel to use the selected socket.
pub const SK_PASS: u32 = 1;

/// Number of slots in the balancing target table.
pub const TARGETS_MAX_ENTRIES: u32 = 128;

/// Slot holding the active listener.
pub const PRIMARY_SLOT: u32 = 0;

/// Slot holding the pre-provisioned backup listener.
pub const FALLBACK_SLOT: u32 = 1;

/// Map and program names - must match exactly between kernel and userspace.
pub mod map_names {
    /// REUSEPORT_SOCKARRAY of listening sockets, keyed by slot.
    pub const TCP_BALANCING_TARGETS: &str = "tcp_balancing_targets";
}

/// sk_reuseport program name - must match the exported symbol in kernel code.
pub const SELECTOR_PROGRAM_NAME: &str = "hot_standby_selector";

/// bpffs directory the target table is pinned under.
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/tc/globals";

/// A slot the policy is allowed to route to.
///
/// Only two exist. Making this an enum rather than a raw index means a
/// verdict can never name a slot other than 0 or 1.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Slot 0, tried first
    Primary = PRIMARY_SLOT,
    /// Slot 1, used only when the primary lookup fails
    Fallback = FALLBACK_SLOT,
}

impl Slot {
    /// Raw table index for this slot.
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// Map a raw table index back to a routable slot.
    #[inline(always)]
    pub const fn from_index(index: u32) -> Option<Self> {
        match index {
            PRIMARY_SLOT => Some(Slot::Primary),
            FALLBACK_SLOT => Some(Slot::Fallback),
            _ => None,
        }
    }
}

/// Outcome of one admission decision.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Route the connection to the socket in this slot
    Accept(Slot),
    /// Do not admit the connection
    Drop,
}

impl Verdict {
    /// Kernel `sk_action` code for this verdict.
    #[inline(always)]
    pub const fn action(self) -> u32 {
        match self {
            Verdict::Accept(_) => SK_PASS,
            Verdict::Drop => SK_DROP,
        }
    }

    /// The slot the connection was routed to, if accepted.
    #[inline(always)]
    pub const fn slot(self) -> Option<Slot> {
        match self {
            Verdict::Accept(slot) => Some(slot),
            Verdict::Drop => None,
        }
    }

    #[inline(always)]
    pub const fn is_accept(self) -> bool {
        matches!(self, Verdict::Accept(_))
    }
}

/// Read-only indexed view of the balancing target table.
///
/// `lookup` reports whether a usable listening socket occupies `slot` right
/// now. An absent slot and a slot whose socket stopped listening are the
/// same thing to the caller: `None`.
///
/// Implementations must not block or allocate, and must never return a
/// partially updated handle when the table is written concurrently.
pub trait SlotTable {
    /// What a successful lookup hands back for completing the attachment.
    type Handle;

    fn lookup(&self, slot: u32) -> Option<Self::Handle>;
}

impl<T: SlotTable + ?Sized> SlotTable for &T {
    type Handle = T::Handle;

    #[inline(always)]
    fn lookup(&self, slot: u32) -> Option<Self::Handle> {
        (**self).lookup(slot)
    }
}

/// A verdict together with the handle the winning lookup returned.
pub enum Selection<H> {
    Accept { slot: Slot, handle: H },
    Drop,
}

impl<H> Selection<H> {
    /// Discard the handle and keep only the verdict.
    #[inline(always)]
    pub fn verdict(&self) -> Verdict {
        match self {
            Selection::Accept { slot, .. } => Verdict::Accept(*slot),
            Selection::Drop => Verdict::Drop,
        }
    }

    /// Take the handle out of an accepting selection.
    #[inline(always)]
    pub fn into_handle(self) -> Option<(Slot, H)> {
        match self {
            Selection::Accept { slot, handle } => Some((slot, handle)),
            Selection::Drop => None,
        }
    }
}

/// Decide the fate of one incoming connection.
///
/// Non-TCP traffic is dropped without touching the table. Otherwise the
/// primary slot wins if it is usable, then the fallback slot, and the
/// connection is dropped when neither is.
#[inline(always)]
pub fn select<T>(ip_protocol: u32, table: &T) -> Selection<T::Handle>
where
    T: SlotTable + ?Sized,
{
    if ip_protocol != IPPROTO_TCP {
        return Selection::Drop;
    }

    if let Some(handle) = table.lookup(PRIMARY_SLOT) {
        return Selection::Accept {
            slot: Slot::Primary,
            handle,
        };
    }

    if let Some(handle) = table.lookup(FALLBACK_SLOT) {
        return Selection::Accept {
            slot: Slot::Fallback,
            handle,
        };
    }

    Selection::Drop
}

// The kernel reads slot numbers as __u32 keys.
const _: () = {
    assert!(core::mem::size_of::<Slot>() == 4);
    assert!(PRIMARY_SLOT < TARGETS_MAX_ENTRIES);
    assert!(FALLBACK_SLOT < TARGETS_MAX_ENTRIES);
    assert!(PRIMARY_SLOT != FALLBACK_SLOT);
};

#[cfg(any(test, feature = "userspace"))]
mod userspace_impls {
    use super::*;
    use core::fmt;

    impl fmt::Debug for Slot {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Slot::Primary => write!(f, "Primary(0)"),
                Slot::Fallback => write!(f, "Fallback(1)"),
            }
        }
    }

    impl fmt::Display for Slot {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.index())
        }
    }

    impl fmt::Debug for Verdict {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Verdict::Accept(slot) => f.debug_tuple("Accept").field(slot).finish(),
                Verdict::Drop => write!(f, "Drop"),
            }
        }
    }

    impl fmt::Display for Verdict {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Verdict::Accept(slot) => write!(f, "accept(slot {})", slot),
                Verdict::Drop => write!(f, "drop"),
            }
        }
    }

    impl<H: fmt::Debug> fmt::Debug for Selection<H> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Selection::Accept { slot, handle } => f
                    .debug_struct("Accept")
                    .field("slot", slot)
                    .field("handle", handle)
                    .finish(),
                Selection::Drop => write!(f, "Drop"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Table backed by a plain array, recording every slot it was asked for.
    struct FakeTable {
        slots: [Option<char>; TARGETS_MAX_ENTRIES as usize],
        probes: RefCell<Vec<u32>>,
    }

    impl FakeTable {
        fn empty() -> Self {
            Self {
                slots: [None; TARGETS_MAX_ENTRIES as usize],
                probes: RefCell::new(Vec::new()),
            }
        }

        fn with(mut self, slot: usize, socket: char) -> Self {
            self.slots[slot] = Some(socket);
            self
        }

        fn probes(&self) -> Vec<u32> {
            self.probes.borrow().clone()
        }
    }

    impl SlotTable for FakeTable {
        type Handle = char;

        fn lookup(&self, slot: u32) -> Option<char> {
            self.probes.borrow_mut().push(slot);
            self.slots.get(slot as usize).copied().flatten()
        }
    }

    fn accepted(selection: Selection<char>) -> Option<(Slot, char)> {
        selection.into_handle()
    }

    #[test]
    fn test_empty_table_drops() {
        let table = FakeTable::empty();
        assert!(select(IPPROTO_TCP, &table).verdict() == Verdict::Drop);
        assert_eq!(table.probes(), vec![PRIMARY_SLOT, FALLBACK_SLOT]);
    }

    #[test]
    fn test_primary_wins() {
        let table = FakeTable::empty().with(0, 'A');
        assert_eq!(accepted(select(IPPROTO_TCP, &table)), Some((Slot::Primary, 'A')));
    }

    #[test]
    fn test_primary_ignores_fallback_state() {
        let both = FakeTable::empty().with(0, 'A').with(1, 'B');
        assert_eq!(accepted(select(IPPROTO_TCP, &both)), Some((Slot::Primary, 'A')));
        // The fallback is not even probed once the primary answers.
        assert_eq!(both.probes(), vec![PRIMARY_SLOT]);
    }

    #[test]
    fn test_fallback_when_primary_absent() {
        let table = FakeTable::empty().with(1, 'B');
        assert_eq!(accepted(select(IPPROTO_TCP, &table)), Some((Slot::Fallback, 'B')));
        assert_eq!(table.probes(), vec![PRIMARY_SLOT, FALLBACK_SLOT]);
    }

    #[test]
    fn test_non_tcp_never_touches_table() {
        let table = FakeTable::empty().with(0, 'A').with(1, 'B');
        for proto in [IPPROTO_UDP, 0, 1, 58, 132, 255] {
            assert!(select(proto, &table).verdict() == Verdict::Drop);
        }
        assert!(table.probes().is_empty());
    }

    #[test]
    fn test_higher_slots_never_consulted() {
        let mut table = FakeTable::empty().with(5, 'C');
        for slot in 2..TARGETS_MAX_ENTRIES as usize {
            table.slots[slot] = Some('Z');
        }
        assert!(select(IPPROTO_TCP, &table).verdict() == Verdict::Drop);
        assert!(table.probes().iter().all(|s| *s == PRIMARY_SLOT || *s == FALLBACK_SLOT));
    }

    #[test]
    fn test_repeated_decisions_are_identical() {
        let table = FakeTable::empty().with(1, 'B');
        let first = select(IPPROTO_TCP, &table).verdict();
        for _ in 0..16 {
            assert!(select(IPPROTO_TCP, &table).verdict() == first);
        }
    }

    #[test]
    fn test_every_occupancy_of_the_two_slots() {
        for primary in [None, Some('A')] {
            for fallback in [None, Some('B')] {
                let mut table = FakeTable::empty();
                table.slots[0] = primary;
                table.slots[1] = fallback;

                let expected = match (primary, fallback) {
                    (Some(a), _) => Some((Slot::Primary, a)),
                    (None, Some(b)) => Some((Slot::Fallback, b)),
                    (None, None) => None,
                };
                assert_eq!(accepted(select(IPPROTO_TCP, &table)), expected);
                assert!(select(IPPROTO_UDP, &table).verdict() == Verdict::Drop);
            }
        }
    }

    #[test]
    fn test_verdict_actions() {
        assert_eq!(Verdict::Accept(Slot::Primary).action(), SK_PASS);
        assert_eq!(Verdict::Accept(Slot::Fallback).action(), SK_PASS);
        assert_eq!(Verdict::Drop.action(), SK_DROP);
        assert_eq!(Verdict::Drop.slot(), None);
        assert!(!Verdict::Drop.is_accept());
    }

    #[test]
    fn test_slot_index_conversion() {
        assert_eq!(Slot::Primary.index(), 0);
        assert_eq!(Slot::Fallback.index(), 1);
        assert!(Slot::from_index(0) == Some(Slot::Primary));
        assert!(Slot::from_index(1) == Some(Slot::Fallback));
        assert!(Slot::from_index(2).is_none());
        assert!(Slot::from_index(127).is_none());
    }
}
