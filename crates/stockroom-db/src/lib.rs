//! # stockroom-db: Durable Queue Store
//!
//! SQLite persistence for the offline mutation queue.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Stockroom Offline Data Flow                         │
//! │                                                                         │
//! │  SyncQueueManager (stockroom-sync)                                     │
//! │       │  insert / list_by_status / update / remove                      │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  stockroom-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │ MutationRepository │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │◄───│  impl QueueStore   │  │ (embedded) │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   SQLite file (WAL, synchronous = FULL)                         │   │
//! │  │   table offline_mutations                                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - The `QueueStore` contract and its SQLite implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockroom_db::{Database, DbConfig, QueueStore};
//!
//! let db = Database::new(DbConfig::new("./stockroom.db")).await?;
//! let pending = db.mutations().list_by_status(MutationStatus::Pending).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::mutation::{MutationPatch, MutationRepository, QueueStore, StatusCounts};
