//! Error types for the device daemon.

use std::path::PathBuf;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the device daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Container name failed validation.
    #[error("invalid container name '{name}': {reason}")]
    InvalidContainerName { name: String, reason: String },

    /// A required request header is missing.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container start failed.
    #[error("failed to start container '{label}': {reason}")]
    StartFailed { label: String, reason: String },

    /// No running process with this identifier.
    #[error("process not found: {0}")]
    ProcessNotFound(u64),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Image not found in storage.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Streaming or committing an image failed; nothing was stored.
    #[error("failed to commit image: {0}")]
    CommitFailed(String),

    /// Registry persistence failed.
    #[error("failed to persist registry: {0}")]
    RegistryWriteFailed(String),

    // =========================================================================
    // Firmware Errors
    // =========================================================================
    /// Firmware validation failed.
    #[error("firmware validation failed: {0}")]
    ValidationFailed(String),

    /// Firmware write, upgrade or rollback failed.
    #[error("firmware operation '{operation}' failed: {reason}")]
    Firmware { operation: String, reason: String },

    // =========================================================================
    // Handshake Errors
    // =========================================================================
    /// A disabled-mode run is already waiting for or holding the network.
    #[error("a disabled-mode container is already in flight")]
    DisableInFlight,

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Network bring-up failed.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// HTTP server failed while serving.
    #[error("server error: {0}")]
    Server(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Maps the error to the HTTP status reported to the caller.
    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidContainerName { .. } | Self::MissingHeader(_) => StatusCode::BAD_REQUEST,
            Self::ImageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::DisableInFlight => StatusCode::CONFLICT,
            Self::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
