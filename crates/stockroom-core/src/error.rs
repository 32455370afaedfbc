//! # Error Types
//!
//! Domain-specific error types for stockroom-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  stockroom-core errors (this file)                                     │
//! │  ├── CoreError        - Queue state / resolution errors                │
//! │  └── ValidationError  - Enqueue input validation failures              │
//! │                                                                         │
//! │  stockroom-db errors (separate crate)                                  │
//! │  └── DbError          - Durable store failures                         │
//! │                                                                         │
//! │  stockroom-sync errors (separate crate)                                │
//! │  └── SyncError        - What the facade returns                        │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → application           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::MutationStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Queue domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status change the state machine does not allow.
    ///
    /// ## When This Occurs
    /// - Resolving a mutation that is not in conflict
    /// - Manually retrying a mutation that has not failed
    #[error("Mutation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: MutationStatus,
        to: MutationStatus,
    },

    /// A merge resolution was requested without merged values.
    #[error("Merge resolution for {id} requires merged data")]
    MissingMergedData { id: String },

    /// Merged data names a field that is not in conflict.
    #[error("Field '{field}' is not in conflict for mutation {id}")]
    UnknownConflictField { id: String, field: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised at enqueue time so a malformed mutation is never persisted.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Field must not be set for this operation.
    #[error("{field} is not allowed for {operation}")]
    Unexpected { field: String, operation: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
