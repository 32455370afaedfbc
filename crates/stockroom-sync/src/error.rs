//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Queue       │  │     Remote API          │ │
//! │  │                 │  │                 │  │  (RemoteError)          │ │
//! │  │  InvalidConfig  │  │  Validation     │  │  Network / Timeout      │ │
//! │  │  InvalidUrl     │  │  Core           │  │  RateLimited / Server   │ │
//! │  │  ConfigLoad...  │  │  NotFound       │  │  Client / NotFound      │ │
//! │  └─────────────────┘  └─────────────────┘  │  Conflict               │ │
//! │                                            └─────────────────────────┘ │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Storage      │  │    Internal     │                              │
//! │  │  (DbError)      │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Remote Failure Classes
//! ```text
//! Network, Timeout, 5xx, 429, 401  → Transient  (retry with backoff)
//! Other 4xx, 404, bad response     → Permanent  (failed, manual retry)
//! 409 / 412                        → Conflict   (three-way analysis)
//! ```

use std::time::Duration;

use thiserror::Error;

use stockroom_core::{CoreError, Record, ValidationError};
use stockroom_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Sync Error
// =============================================================================

/// Errors returned by the queue manager, orchestrator and facade.
///
/// Routine remote failures are recorded on the mutation and never returned
/// from a flush; only storage, validation and state errors reach callers.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid remote or probe URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// The mutation spec was rejected at enqueue time.
    #[error("Invalid mutation: {0}")]
    Validation(#[from] ValidationError),

    /// Queue state error (wrong status, bad resolution input).
    #[error(transparent)]
    Core(CoreError),

    /// No queued mutation with this id.
    #[error("Queued mutation not found: {id}")]
    NotFound { id: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The durable store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// A remote call failed outside of a flush (probe, client construction).
    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Background sync is shutting down.
    #[error("Background sync is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(validation) => SyncError::Validation(validation),
            other => SyncError::Core(other),
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation may succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.classify() == FailureClass::Transient,
            SyncError::Storage(err) => err.is_unavailable(),
            SyncError::ChannelError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

// =============================================================================
// Remote Error
// =============================================================================

/// How a failed remote call is handled by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff until `max_retries`.
    Transient,
    /// Mark `failed` immediately.
    Permanent,
    /// Run the three-way conflict analysis.
    Conflict,
}

/// Failure of one remote API call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection could not be established or was reset.
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 429.
    #[error("Rate limited by the server")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP 4xx other than the ones below; the request itself is wrong.
    #[error("Rejected (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    /// HTTP 401, or no credential could be resolved.
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// HTTP 404.
    #[error("Record not found on the server")]
    NotFound,

    /// HTTP 409 / 412. Carries the current server record when the response
    /// included it.
    #[error("Record changed on the server")]
    Conflict { current: Option<Record> },

    /// A 2xx response the client could not interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Maps the error to its queue handling.
    pub fn classify(&self) -> FailureClass {
        match self {
            RemoteError::Network(_)
            | RemoteError::Timeout(_)
            | RemoteError::RateLimited { .. }
            | RemoteError::Server { .. }
            | RemoteError::Unauthenticated(_) => FailureClass::Transient,
            RemoteError::Conflict { .. } => FailureClass::Conflict,
            RemoteError::Client { .. } | RemoteError::NotFound | RemoteError::InvalidResponse(_) => {
                FailureClass::Permanent
            }
        }
    }
}
