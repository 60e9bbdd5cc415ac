//! Standby Core - Hot-standby connection admission
//!
//! Userspace implementation of a reuseport listener group with a strict
//! primary/fallback preference:
//!
//! - **Registry**: 128 per-slot atomic handles, pinned under a stable name
//! - **Policy**: shared with the kernel program via `standby-ebpf-common`;
//!   slot 0 if usable, else slot 1, else drop
//! - **Admission**: accept loop that runs the policy per connection and
//!   hands the stream to the chosen member
//! - **Control plane**: registers members into slots and exposes an HTTP
//!   management API

#![warn(clippy::clone_on_ref_ptr)]

pub mod admission;
pub mod config;
pub mod control;
pub mod error;
pub mod member;
pub mod registry;
pub mod runtime;
pub mod service;

pub use admission::{AdmissionConfig, AdmissionMetrics, AdmissionServer};
pub use config::StandbyConfig;
pub use control::{ControlConfig, ControlServer, ControlState};
pub use error::{Result, StandbyError};
pub use member::{register_member, GroupMember, MemberHandle, Role};
pub use registry::{ListenerHandle, RegistryNamespace, SocketRegistry};
pub use runtime::build_runtime;

pub use standby_ebpf_common::{select, Selection, Slot, SlotTable, Verdict};
