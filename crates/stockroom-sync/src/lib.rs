//! # stockroom-sync: Offline Sync Engine for Stockroom
//!
//! Durable offline mutation queue with replay against the remote REST API
//! and three-way conflict resolution.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Offline Sync Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                OfflineCoordinator (application facade)           │  │
//! │  │  queue_mutation · force_sync · resolve_conflict · sync_status    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ BackgroundSync │  │SyncQueueManager│  │  Connectivity          │    │
//! │  │                │  │                │  │                        │    │
//! │  │ reconnect,     │─►│ FIFO replay,   │  │ Manual (app events)    │    │
//! │  │ periodic,      │  │ backoff,       │  │ Probe (HTTP health)    │    │
//! │  │ manual,        │  │ conflicts      │  │                        │    │
//! │  │ platform       │  │                │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │                              │                                          │
//! │                 ┌────────────┴────────────┐                             │
//! │                 ▼                         ▼                             │
//! │        ┌────────────────┐        ┌────────────────┐                    │
//! │        │  QueueStore    │        │   RemoteApi    │                    │
//! │        │ (stockroom-db) │        │ (HTTP / JSON)  │                    │
//! │        └────────────────┘        └────────────────┘                    │
//! │                                                                         │
//! │  EVENTS (to the UI via SyncEventEmitter):                              │
//! │  • status       - queue counts and connectivity                        │
//! │  • flush        - summary of each flush run                            │
//! │  • conflicts    - new conflicts that need a decision                   │
//! │  • error        - flushes that failed on storage                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`coordinator`] - `OfflineCoordinator` facade and builder
//! - [`queue`] - `SyncQueueManager`: flush, retry, conflict resolution
//! - [`orchestrator`] - Background triggers and mutual exclusion
//! - [`connectivity`] - Online/slow signals
//! - [`remote`] - `RemoteApi` trait and HTTP implementation
//! - [`retry`] - Exponential backoff policy
//! - [`events`] - UI notifications
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockroom_core::MutationSpec;
//! use stockroom_sync::{OfflineCoordinator, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let coordinator = OfflineCoordinator::open(config).await?;
//! coordinator.init().await?;
//!
//! let id = coordinator
//!     .queue_mutation(MutationSpec::update("lots", "L-1", payload, Some(snapshot)))
//!     .await?;
//!
//! let status = coordinator.sync_status().await?;
//! println!("Pending: {}", status.pending_count);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod retry;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::SyncConfig;
pub use connectivity::{
    ConnectivityObserver, ConnectivityState, ManualConnectivity, ProbeConnectivity,
    SharedConnectivity,
};
pub use coordinator::{OfflineCoordinator, OfflineCoordinatorBuilder};
pub use error::{FailureClass, RemoteError, SyncError, SyncResult};
pub use events::{NoOpEmitter, RecordingEmitter, SyncEvent, SyncEventEmitter};
pub use orchestrator::{BackgroundSync, BackgroundSyncHandle, SyncTrigger};
pub use queue::{ResolveOutcome, SyncQueueManager};
pub use remote::{
    CreatedRecord, Credential, CredentialProvider, HttpRemoteApi, NoCredentials, RemoteApi,
    StaticCredentials,
};
pub use retry::RetryPolicy;
