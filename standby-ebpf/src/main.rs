//! Standby sk_reuseport Program - Kernel-level hot-standby selection
//!
//! Attached to a SO_REUSEPORT listener group, this program runs for every
//! new connection before it is queued on any member socket and picks which
//! member gets it.
//!
//! # Selection Flow
//!
//! ```text
//! SYN → reuseport group → hot_standby_selector
//!                               │
//!               ┌───────────────┼────────────────┐
//!               │               │                │
//!               ▼               ▼                ▼
//!          slot 0 live     slot 1 live      neither / not TCP
//!          SK_PASS         SK_PASS          SK_DROP
//!          (primary)       (standby)
//! ```
//!
//! The decision itself lives in `standby_ebpf_common::select` and is shared
//! with userspace. This file only adapts the kernel context to it.
//!
//! aya-ebpf has no typed wrapper or attribute macro for sk_reuseport, so the
//! map and program sections are declared by hand.

#![no_std]
#![no_main]

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem;

use aya_ebpf::bindings::{
    bpf_map_def, bpf_map_type::BPF_MAP_TYPE_REUSEPORT_SOCKARRAY, sk_reuseport_md,
};
use aya_ebpf::helpers::bpf_sk_select_reuseport;
use standby_ebpf_common::{select, SlotTable, TARGETS_MAX_ENTRIES};

/// `LIBBPF_PIN_BY_NAME`: the loader pins the map under its symbol name.
const PIN_BY_NAME: u32 = 1;

// ============================================================================
// BPF MAPS
// ============================================================================

/// REUSEPORT_SOCKARRAY map definition.
///
/// Key: slot index (u32). Value: listening socket fd written by the
/// control plane (u64). The kernel stores a socket reference, not the fd.
#[repr(transparent)]
struct ReusePortSockArray {
    def: UnsafeCell<bpf_map_def>,
}

// Only the kernel mutates the map contents; the definition itself is
// read-only after load.
unsafe impl Sync for ReusePortSockArray {}

impl ReusePortSockArray {
    const fn pinned(max_entries: u32) -> Self {
        Self {
            def: UnsafeCell::new(bpf_map_def {
                type_: BPF_MAP_TYPE_REUSEPORT_SOCKARRAY,
                key_size: mem::size_of::<u32>() as u32,
                value_size: mem::size_of::<u64>() as u32,
                max_entries,
                map_flags: 0,
                id: 0,
                pinning: PIN_BY_NAME,
            }),
        }
    }

    #[inline(always)]
    fn as_ptr(&self) -> *mut c_void {
        self.def.get() as *mut c_void
    }
}

/// Listener group members, keyed by slot. Slot 0 = primary, slot 1 = standby.
#[link_section = "maps"]
#[export_name = "tcp_balancing_targets"]
static TCP_BALANCING_TARGETS: ReusePortSockArray =
    ReusePortSockArray::pinned(TARGETS_MAX_ENTRIES);

// ============================================================================
// SLOT TABLE ADAPTER
// ============================================================================

/// Exposes the sockarray to the shared policy.
///
/// A successful lookup is also the attachment: `bpf_sk_select_reuseport`
/// records the chosen socket on the context, so there is no handle to carry.
struct ReuseportTargets {
    ctx: *mut sk_reuseport_md,
}

impl SlotTable for ReuseportTargets {
    type Handle = ();

    #[inline(always)]
    fn lookup(&self, slot: u32) -> Option<()> {
        let mut key = slot;
        // Returns 0 only when the slot holds a socket that is still listening
        // and belongs to this reuseport group.
        let ret = unsafe {
            bpf_sk_select_reuseport(
                self.ctx,
                TCP_BALANCING_TARGETS.as_ptr(),
                &mut key as *mut u32 as *mut c_void,
                0,
            )
        };
        if ret == 0 {
            Some(())
        } else {
            None
        }
    }
}

// ============================================================================
// SK_REUSEPORT PROGRAM ENTRY POINT
// ============================================================================

/// Called by the kernel once per new connection on the listener group.
#[no_mangle]
#[link_section = "sk_reuseport/selector"]
pub fn hot_standby_selector(ctx: *mut sk_reuseport_md) -> u32 {
    // SAFETY: the kernel always passes a valid context to this program type.
    let ip_protocol = unsafe { (*ctx).ip_protocol };

    select(ip_protocol, &ReuseportTargets { ctx })
        .verdict()
        .action()
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";

// ============================================================================
// PANIC HANDLER (Required for #![no_std])
// ============================================================================

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // The selection path has no panicking branches
    loop {}
}
