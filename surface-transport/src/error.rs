//! Driver error types

use thiserror::Error;

/// Errors that can occur while talking to a panel
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Panel not found: {0}")]
    PanelNotFound(String),

    #[error("Panel disconnected")]
    Disconnected,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Another process holds the device
    #[error("Failed to claim panel: {0}")]
    ClaimFailed(String),

    #[error("Unsupported panel: {0}")]
    Unsupported(String),

    #[error("Draw rejected for key {key}: {reason}")]
    DrawRejected { key: u32, reason: String },

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Errors after which the panel should be torn down rather than retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::PanelNotFound(_))
    }
}
