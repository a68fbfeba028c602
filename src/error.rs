//! Hub error types

use surface_transport::DriverError;
use thiserror::Error;

/// Errors from hub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// Driver layer error
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Persistence failure
    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    /// Record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid value for a user-facing setting
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    /// Unknown setting name
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Surface not found: {0}")]
    UnknownSurface(String),

    #[error("Group not found: {0}")]
    UnknownGroup(String),

    /// Auto groups hold exactly one surface
    #[error("Cannot add surfaces to auto group {0}")]
    AutoGroupOccupied(String),

    /// Auto groups are only removed by detaching their surface
    #[error("Cannot delete auto group {0}")]
    AutoGroupNotDeletable(String),

    /// A handler for this device path or id already exists
    #[error("Device already added: {0}")]
    DuplicateDevice(String),

    /// Operation only applies to disconnected surfaces
    #[error("Surface is connected: {0}")]
    SurfaceConnected(String),
}

impl HubError {
    pub(crate) fn invalid(key: &str, value: impl ToString) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
