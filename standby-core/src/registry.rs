//! Socket Registry - fixed-capacity table of listener group members.
//!
//! Userspace counterpart of the pinned `tcp_balancing_targets` sockarray.
//! Each slot is its own `ArcSwapOption`, so:
//!
//! - Reads are a single atomic load: no lock, no allocation, no blocking
//! - Writes replace one slot at a time and never tear a concurrent read
//! - A reader holding an old handle keeps it alive until it lets go
//!
//! Registries are owned objects. [`RegistryNamespace`] hands them out by a
//! stable name so the side that populates slots and the side that decides
//! can be wired up independently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tracing::{debug, info};

use standby_ebpf_common::{SlotTable, TARGETS_MAX_ENTRIES};

use crate::error::{Result, StandbyError};

/// Anything that can sit in a registry slot.
///
/// A handle that stops listening stays in its slot until the control plane
/// removes it, but lookups stop returning it.
pub trait ListenerHandle: Send + Sync + 'static {
    fn is_listening(&self) -> bool;
}

/// One occupied slot, as seen by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub slot: u32,
    pub listening: bool,
}

/// Fixed-capacity, per-slot atomic registry of listening sockets.
pub struct SocketRegistry<H> {
    name: Arc<str>,
    slots: Box<[ArcSwapOption<H>]>,
    /// Bumped on every populate/depopulate
    generation: AtomicU64,
}

impl<H: ListenerHandle> SocketRegistry<H> {
    /// Create an empty registry with the standard 128 slots.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_capacity(name, TARGETS_MAX_ENTRIES)
    }

    fn with_capacity(name: impl Into<Arc<str>>, capacity: u32) -> Self {
        let slots: Vec<ArcSwapOption<H>> = (0..capacity).map(|_| ArcSwapOption::empty()).collect();
        Self {
            name: name.into(),
            slots: slots.into_boxed_slice(),
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look up the handle in `slot` if it is present and still listening.
    ///
    /// This is the hot path. Out-of-range indices report `None`.
    #[inline]
    pub fn lookup(&self, slot: u32) -> Option<Arc<H>> {
        self.slots
            .get(slot as usize)?
            .load_full()
            .filter(|handle| handle.is_listening())
    }

    /// Write `handle` into `slot`, returning whatever was there before.
    pub fn populate(&self, slot: u32, handle: Arc<H>) -> Result<Option<Arc<H>>> {
        let cell = self.cell(slot)?;
        let previous = cell.swap(Some(handle));
        self.generation.fetch_add(1, Ordering::AcqRel);

        debug!(
            registry = %self.name,
            slot = slot,
            replaced = previous.is_some(),
            "Slot populated"
        );
        Ok(previous)
    }

    /// Clear `slot`, returning the handle that was removed.
    pub fn depopulate(&self, slot: u32) -> Result<Option<Arc<H>>> {
        let cell = self.cell(slot)?;
        let previous = cell.swap(None);
        if previous.is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            debug!(registry = %self.name, slot = slot, "Slot depopulated");
        }
        Ok(previous)
    }

    /// Remove `slot` only if it still holds `expected`.
    ///
    /// Lets a departing member clear its own slot without clobbering a
    /// replacement that was registered in the meantime.
    pub fn depopulate_if(&self, slot: u32, expected: &Arc<H>) -> Result<bool> {
        let cell = self.cell(slot)?;
        let prev = cell.compare_and_swap(expected, None);
        let removed = match &*prev {
            Some(current) => Arc::ptr_eq(current, expected),
            None => false,
        };
        if removed {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    /// Every occupied slot with the handle it held at the time of the load,
    /// listening or not. Each slot is loaded exactly once.
    pub fn occupants(&self) -> Vec<(u32, Arc<H>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| cell.load_full().map(|handle| (i as u32, handle)))
            .collect()
    }

    /// Snapshot of every occupied slot.
    pub fn entries(&self) -> Vec<SlotEntry> {
        self.occupants()
            .into_iter()
            .map(|(slot, handle)| SlotEntry {
                slot,
                listening: handle.is_listening(),
            })
            .collect()
    }

    /// Number of occupied slots, listening or not.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|cell| cell.load().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    fn cell(&self, slot: u32) -> Result<&ArcSwapOption<H>> {
        self.slots.get(slot as usize).ok_or(StandbyError::SlotOutOfRange {
            slot,
            capacity: self.capacity(),
        })
    }
}

impl<H: ListenerHandle> SlotTable for SocketRegistry<H> {
    type Handle = Arc<H>;

    #[inline]
    fn lookup(&self, slot: u32) -> Option<Arc<H>> {
        SocketRegistry::lookup(self, slot)
    }
}

impl<H> fmt::Debug for SocketRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("name", &self.name)
            .field("capacity", &self.slots.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

/// Directory of registries keyed by name.
///
/// The userspace stand-in for pinning a map under bpffs: whoever opens a
/// name first creates the registry, everyone after gets the same one, and
/// it lives until explicitly unpinned.
pub struct RegistryNamespace<H> {
    registries: RwLock<HashMap<Arc<str>, Arc<SocketRegistry<H>>>>,
}

impl<H: ListenerHandle> RegistryNamespace<H> {
    pub fn new() -> Self {
        Self {
            registries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the registry pinned under `name`, creating it if needed.
    pub fn open(&self, name: &str) -> Arc<SocketRegistry<H>> {
        if let Some(existing) = self.registries.read().get(name) {
            return Arc::clone(existing);
        }

        let mut registries = self.registries.write();
        // Another opener may have won the race between the two locks.
        if let Some(existing) = registries.get(name) {
            return Arc::clone(existing);
        }

        let registry = Arc::new(SocketRegistry::new(name));
        registries.insert(Arc::from(name), Arc::clone(&registry));
        info!(registry = %name, capacity = registry.capacity(), "Registry created");
        registry
    }

    /// Get an existing registry without creating one.
    pub fn get(&self, name: &str) -> Result<Arc<SocketRegistry<H>>> {
        self.registries
            .read()
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| StandbyError::RegistryNotFound(name.to_owned()))
    }

    /// Remove a registry from the namespace.
    ///
    /// Holders of the returned `Arc` keep working against it; new openers
    /// get a fresh, empty registry.
    pub fn unpin(&self, name: &str) -> Result<Arc<SocketRegistry<H>>> {
        let removed = self
            .registries
            .write()
            .remove(name)
            .ok_or_else(|| StandbyError::RegistryNotFound(name.to_owned()))?;
        info!(registry = %name, "Registry unpinned");
        Ok(removed)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registries.read().keys().map(|k| k.to_string()).collect();
        names.sort_unstable();
        names
    }
}

impl<H: ListenerHandle> Default for RegistryNamespace<H> {
    fn default() -> Self {
        Self::new()
    }
}
