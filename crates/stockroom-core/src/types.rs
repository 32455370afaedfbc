//! # Domain Types
//!
//! Core types of the offline mutation queue.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Queue Types                                     │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ QueuedMutation  │   │ MutationStatus  │   │ OperationType   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  Pending        │   │  CREATE         │       │
//! │  │  table          │   │  InFlight       │   │  UPDATE         │       │
//! │  │  record_id      │   │  Failed         │   │  DELETE         │       │
//! │  │  payload        │   │  Conflict       │   └─────────────────┘       │
//! │  │  original_snap  │   │  Done           │                             │
//! │  │  attempts       │   └─────────────────┘                             │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌──────────────────────┐  │
//! │  │ ConflictRecord  │   │  FlushSummary   │   │ SyncStatusSnapshot   │  │
//! │  │ (conflict view) │   │ (one flush run) │   │ (derived counts)     │  │
//! │  └─────────────────┘   └─────────────────┘   └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Schema-less Records
//! Payloads and snapshots are [`Record`]s: JSON objects the queue never
//! interprets. Only the conflict analyzer looks inside them, and it does so
//! generically, field by field.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

/// A schema-less record: field name to JSON value.
pub type Record = serde_json::Map<String, Value>;

// =============================================================================
// Operation Type
// =============================================================================

/// The kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            _ => Err(crate::ValidationError::NotAllowed {
                field: "operation_type".to_string(),
                allowed: vec!["CREATE".into(), "UPDATE".into(), "DELETE".into()],
            }),
        }
    }
}

// =============================================================================
// Mutation Status
// =============================================================================

/// Lifecycle status of a queued mutation.
///
/// ## State Machine
/// ```text
///            dequeued              success
///  Pending ───────────► InFlight ───────────► Done (entry removed)
///     ▲                  │  │  │
///     │ transient,       │  │  └── divergence ──► Conflict ──┐
///     │ retries remain   │  │                       ▲        │ resolved +
///     └──────────────────┘  │                       └────────┤ re-executed
///                           │ exhausted / 4xx                │
///                           ▼                                ▼
///                         Failed ── manual retry ──► Pending  Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be executed.
    Pending,
    /// Currently being executed against the remote API.
    InFlight,
    /// Retries exhausted or rejected by the server; waits for manual retry.
    Failed,
    /// Server diverged from the original snapshot; waits for a resolution.
    Conflict,
    /// Applied on the server.
    Done,
}

impl MutationStatus {
    /// All statuses, in display order.
    pub const ALL: [MutationStatus; 5] = [
        MutationStatus::Pending,
        MutationStatus::InFlight,
        MutationStatus::Failed,
        MutationStatus::Conflict,
        MutationStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Failed => "failed",
            MutationStatus::Conflict => "conflict",
            MutationStatus::Done => "done",
        }
    }

    /// Returns true if the automatic flush may pick this entry up.
    pub fn is_auto_executable(&self) -> bool {
        matches!(self, MutationStatus::Pending)
    }

    /// Returns true if the entry needs a user decision to move on.
    pub fn needs_attention(&self) -> bool {
        matches!(self, MutationStatus::Failed | MutationStatus::Conflict)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;

        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Done)
                | (InFlight, Pending)
                | (InFlight, Failed)
                | (InFlight, Conflict)
                | (Conflict, Done)
                | (Conflict, Conflict)
                | (Conflict, Pending)
                | (Conflict, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationStatus {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" | "in-flight" | "inflight" => Ok(MutationStatus::InFlight),
            "failed" => Ok(MutationStatus::Failed),
            "conflict" => Ok(MutationStatus::Conflict),
            "done" => Ok(MutationStatus::Done),
            _ => Err(crate::ValidationError::NotAllowed {
                field: "status".to_string(),
                allowed: MutationStatus::ALL
                    .iter()
                    .map(|s| s.as_str().to_string())
                    .collect(),
            }),
        }
    }
}

// =============================================================================
// Mutation Spec (enqueue input)
// =============================================================================

/// What the application wants written. Validated and turned into a
/// [`QueuedMutation`] at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationSpec {
    pub operation_type: OperationType,
    pub table: String,
    /// Target record. For `CREATE` this may be a client-provisional id that
    /// later mutations reference until the server assigns the real one.
    pub record_id: Option<String>,
    pub payload: Option<Record>,
    pub original_snapshot: Option<Record>,
    pub credential_ref: Option<String>,
}

impl MutationSpec {
    pub fn create(table: impl Into<String>, payload: Record) -> Self {
        MutationSpec {
            operation_type: OperationType::Create,
            table: table.into(),
            record_id: None,
            payload: Some(payload),
            original_snapshot: None,
            credential_ref: None,
        }
    }

    pub fn update(
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: Record,
        original_snapshot: Option<Record>,
    ) -> Self {
        MutationSpec {
            operation_type: OperationType::Update,
            table: table.into(),
            record_id: Some(record_id.into()),
            payload: Some(payload),
            original_snapshot,
            credential_ref: None,
        }
    }

    pub fn delete(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        MutationSpec {
            operation_type: OperationType::Delete,
            table: table.into(),
            record_id: Some(record_id.into()),
            payload: None,
            original_snapshot: None,
            credential_ref: None,
        }
    }

    /// Sets a client-provisional id on a `CREATE`.
    pub fn with_provisional_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_credential(mut self, credential_ref: impl Into<String>) -> Self {
        self.credential_ref = Some(credential_ref.into());
        self
    }
}

// =============================================================================
// Queued Mutation
// =============================================================================

/// A write waiting in (or moving through) the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueuedMutation {
    /// Unique identifier (UUID v4). Also the idempotency key sent with creates.
    pub id: String,

    /// Store-assigned insertion sequence (FIFO tie-break). Zero until stored.
    #[ts(type = "number")]
    pub seq: i64,

    /// Logical table / collection the mutation targets.
    pub table: String,

    pub operation_type: OperationType,

    /// Affected record. Provisional or absent for creates.
    pub record_id: Option<String>,

    /// Field values to write.
    #[ts(type = "Record<string, unknown> | null")]
    pub payload: Option<Record>,

    /// Server values the local edit was based on.
    #[ts(type = "Record<string, unknown> | null")]
    pub original_snapshot: Option<Record>,

    pub status: MutationStatus,

    /// Execution attempts so far.
    #[ts(type = "number")]
    pub attempts: i64,

    pub last_error: Option<String>,

    /// Opaque reference to the auth context, never the secret itself.
    pub credential_ref: Option<String>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,

    /// Earliest time the entry may be executed again.
    #[ts(as = "Option<String>")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Conflict details while in `Conflict` status.
    pub conflict: Option<ConflictDetails>,
}

impl QueuedMutation {
    /// Builds a fresh `Pending` entry with a new id.
    pub fn from_spec(spec: MutationSpec) -> Self {
        let now = Utc::now();

        QueuedMutation {
            id: Uuid::new_v4().to_string(),
            seq: 0,
            table: spec.table,
            operation_type: spec.operation_type,
            record_id: spec.record_id,
            payload: spec.payload,
            original_snapshot: spec.original_snapshot,
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
            credential_ref: spec.credential_ref,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            conflict: None,
        }
    }

    /// Returns true if the backoff window (if any) has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Key used to keep per-record ordering: `(table, record_id)`.
    pub fn record_key(&self) -> Option<(String, String)> {
        self.record_id
            .as_ref()
            .map(|id| (self.table.clone(), id.clone()))
    }
}

// =============================================================================
// Conflict Types
// =============================================================================

/// Which side a field's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MergeSide {
    Local,
    Server,
}

/// A field both sides changed, to different values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FieldConflict {
    pub field: String,
    /// `None` means the field is absent on that side.
    #[ts(type = "unknown")]
    pub local_value: Option<Value>,
    #[ts(type = "unknown")]
    pub server_value: Option<Value>,
    #[ts(type = "unknown")]
    pub original_value: Option<Value>,
}

/// A field resolved without user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AutoMergedField {
    pub field: String,
    pub resolution: MergeSide,
    /// Resolved value; `None` removes the field.
    #[ts(type = "unknown")]
    pub value: Option<Value>,
}

/// Caller's choice for one conflicting field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum FieldResolution {
    Local,
    Server,
    Merged(Value),
}

/// Whole-record resolution offered by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep the local value of every conflicting field.
    Local,
    /// Keep the server value of every conflicting field.
    Server,
    /// Use caller-supplied merged values.
    Merge,
}

impl std::str::FromStr for ConflictChoice {
    type Err = crate::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ConflictChoice::Local),
            "server" => Ok(ConflictChoice::Server),
            "merge" | "merged" => Ok(ConflictChoice::Merge),
            _ => Err(crate::ValidationError::NotAllowed {
                field: "resolution".to_string(),
                allowed: vec!["local".into(), "server".into(), "merge".into()],
            }),
        }
    }
}

/// Conflict state persisted alongside a mutation in `Conflict` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictDetails {
    /// Server record the analysis was made against.
    #[ts(type = "Record<string, unknown>")]
    pub server_snapshot: Record,
    pub conflicting_fields: Vec<FieldConflict>,
    pub auto_mergeable_fields: Vec<AutoMergedField>,
    #[ts(as = "String")]
    pub detected_at: DateTime<Utc>,
    /// Per-field resolution, once recorded.
    #[ts(type = "Record<string, { choice: string; value?: unknown }> | null")]
    pub resolution: Option<BTreeMap<String, FieldResolution>>,
}

/// A mutation waiting on a conflict decision, as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictRecord {
    pub id: String,
    pub table: String,
    pub record_id: Option<String>,
    pub operation_type: OperationType,
    #[ts(type = "Record<string, unknown> | null")]
    pub local_payload: Option<Record>,
    #[ts(type = "Record<string, unknown> | null")]
    pub original_snapshot: Option<Record>,
    #[ts(type = "Record<string, unknown>")]
    pub server_snapshot: Record,
    pub conflicting_fields: Vec<FieldConflict>,
    pub auto_mergeable_fields: Vec<AutoMergedField>,
    #[ts(type = "Record<string, { choice: string; value?: unknown }> | null")]
    pub resolution: Option<BTreeMap<String, FieldResolution>>,
    #[ts(type = "number")]
    pub attempts: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    /// Builds the conflict view of a mutation. `None` unless the mutation is
    /// in `Conflict` status with details attached.
    pub fn from_mutation(mutation: &QueuedMutation) -> Option<Self> {
        if mutation.status != MutationStatus::Conflict {
            return None;
        }
        let details = mutation.conflict.as_ref()?;

        Some(ConflictRecord {
            id: mutation.id.clone(),
            table: mutation.table.clone(),
            record_id: mutation.record_id.clone(),
            operation_type: mutation.operation_type,
            local_payload: mutation.payload.clone(),
            original_snapshot: mutation.original_snapshot.clone(),
            server_snapshot: details.server_snapshot.clone(),
            conflicting_fields: details.conflicting_fields.clone(),
            auto_mergeable_fields: details.auto_mergeable_fields.clone(),
            resolution: details.resolution.clone(),
            attempts: mutation.attempts,
            created_at: mutation.created_at,
            detected_at: details.detected_at,
        })
    }
}

// =============================================================================
// Flush & Status Reporting
// =============================================================================

/// Outcome counts of one flush run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FlushSummary {
    /// Applied on the server and removed from the queue.
    pub succeeded: u32,
    /// Moved to `Failed` during this run.
    pub failed: u32,
    /// Moved to `Conflict` during this run.
    pub conflicts: u32,
    /// Transient failures put back to `Pending` with backoff.
    pub retried: u32,
    /// Skipped this run (backoff not elapsed, or blocked behind another entry).
    pub deferred: u32,
}

impl FlushSummary {
    /// Number of entries that reached the remote API this run.
    pub fn attempted(&self) -> u32 {
        self.succeeded + self.failed + self.conflicts + self.retried
    }

    pub fn is_empty(&self) -> bool {
        self.attempted() == 0 && self.deferred == 0
    }
}

/// Aggregate queue status for display. Derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub pending_count: u32,
    pub in_flight_count: u32,
    pub failed_count: u32,
    pub conflict_count: u32,
    /// Whether a flush is running right now.
    pub is_processing: bool,
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub is_slow_connection: bool,
}

impl SyncStatusSnapshot {
    /// Entries not yet applied on the server.
    pub fn outstanding(&self) -> u32 {
        self.pending_count + self.in_flight_count + self.failed_count + self.conflict_count
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
