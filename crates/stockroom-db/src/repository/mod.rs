//! # Repository Module
//!
//! Database access behind a storage contract.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncQueueManager                                                      │
//! │       │  Arc<dyn QueueStore>                                            │
//! │       ▼                                                                 │
//! │  QueueStore (trait) ◄── MutationRepository (SQLite, this crate)        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  offline_mutations                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager only sees the trait, so another medium can be plugged in
//! without touching the sync engine.

pub mod mutation;
