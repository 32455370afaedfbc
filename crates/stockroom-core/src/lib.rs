//! # stockroom-core: Offline Queue Domain for Stockroom
//!
//! This crate holds the data model of the offline mutation queue and the
//! three-way conflict analysis, as pure functions with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Stockroom Offline Architecture                      │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Application (forms, scanners, lot screens)           │   │
//! │  │        produce mutations ──► OfflineCoordinator::queue_mutation │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  stockroom-sync (Queue Manager)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ stockroom-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐  ┌────────────┐  ┌────────────┐               │   │
//! │  │   │   types    │  │  conflict  │  │ validation │               │   │
//! │  │   │ Mutation   │  │  analyze   │  │   specs    │               │   │
//! │  │   │ Status     │  │  merge     │  │   tables   │               │   │
//! │  │   └────────────┘  └────────────┘  └────────────┘               │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Queue types (`QueuedMutation`, `MutationStatus`, ...)
//! - [`conflict`] - Three-way diff and merge of records
//! - [`error`] - Domain error types
//! - [`validation`] - Enqueue-time validation
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use stockroom_core::conflict::analyze;
//! use stockroom_core::Record;
//!
//! fn record(value: serde_json::Value) -> Record {
//!     value.as_object().cloned().unwrap()
//! }
//!
//! let original = record(json!({ "qty": 1 }));
//! let local = record(json!({ "qty": 2 }));
//! let server = record(json!({ "qty": 3 }));
//!
//! let analysis = analyze(&original, &local, &server);
//! assert_eq!(analysis.conflicts.len(), 1);
//! assert_eq!(analysis.conflicts[0].field, "qty");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::ConflictAnalysis;
pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Fields never compared or merged by the conflict analyzer.
///
/// Identifiers and audit timestamps are owned by the server; a difference in
/// them says nothing about user intent.
pub const SYSTEM_FIELDS: &[&str] = &["id", "created_at", "updated_at", "createdAt", "updatedAt"];

/// Maximum length of a table name accepted at enqueue time.
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Maximum length of a record identifier accepted at enqueue time.
pub const MAX_RECORD_ID_LEN: usize = 128;
