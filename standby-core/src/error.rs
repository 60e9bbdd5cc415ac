//! Error types for registry management and the serving layers.
//!
//! The selection policy itself never fails: every failure mode there is a
//! `Drop` verdict. These errors cover everything around it.

use thiserror::Error;

/// Result type alias for Standby operations.
pub type Result<T> = std::result::Result<T, StandbyError>;

/// Core error types for the Standby admission layer.
#[derive(Error, Debug)]
pub enum StandbyError {
    /// Slot index outside the registry
    #[error("slot {slot} out of range (capacity {capacity})")]
    SlotOutOfRange { slot: u32, capacity: u32 },

    /// No registry pinned under this name
    #[error("registry not found: {0}")]
    RegistryNotFound(String),

    /// Member role string not recognised
    #[error("invalid member role {0:?}: expected \"primary\" or \"standby\"")]
    InvalidRole(String),

    /// Configuration value could not be parsed
    #[error("invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StandbyError {
    /// Returns an HTTP status code appropriate for this error.
    #[inline]
    pub fn status_code(&self) -> u16 {
        match self {
            StandbyError::SlotOutOfRange { .. } | StandbyError::InvalidRole(_) => 400,
            StandbyError::RegistryNotFound(_) => 404,
            _ => 500,
        }
    }
}
