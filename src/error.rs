//! Error types for a3s-warden
//!
//! Classification outcomes and sandbox failures are values, not errors.
//! Only configuration preconditions and isolation setup failures surface here.

use thiserror::Error;

/// Errors that can escape the warden API
#[derive(Debug, Error)]
pub enum WardenError {
    /// Supplied configuration violates a precondition
    #[error("Configuration error: {0}")]
    Config(String),

    /// The isolation boundary could not be constructed for one invocation
    #[error("Isolation setup failed: {0}")]
    IsolationSetup(String),

    /// Underlying I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
