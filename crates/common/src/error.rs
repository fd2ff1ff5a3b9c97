//! Error types for the Loco fleet gateway

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration not found at {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },

    /// Live discovery could not be used. Callers fall back to static data.
    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    #[error("Bridge upstream error: {0}")]
    BridgeUpstream(String),

    #[error("Probe of {target} timed out after {millis}ms")]
    ProbeTimeout { target: String, millis: u64 },

    #[error("No health data for instance {id}")]
    NoHealthData { id: String },

    #[error("Recovery exhausted for {id} after {attempts} attempts")]
    RecoveryExhausted { id: String, attempts: u32 },

    #[error("Restart not supported for instance {id}")]
    RestartUnsupported { id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn instance_not_found(id: impl Into<String>) -> Self {
        Error::InstanceNotFound { id: id.into() }
    }

    /// True for errors that callers are expected to degrade around
    /// rather than surface.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::DiscoveryUnavailable(_) | Error::ProbeTimeout { .. } | Error::NoHealthData { .. }
        )
    }
}
