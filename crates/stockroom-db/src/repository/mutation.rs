//! # Mutation Repository
//!
//! The durable queue store: the `QueueStore` contract and its SQLite
//! implementation over the `offline_mutations` table.
//!
//! ## Row Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  enqueue ──► INSERT (status = pending, seq = next rowid)               │
//! │                 │                                                       │
//! │  flush ─────► SELECT ... WHERE status = 'pending' ORDER BY seq          │
//! │                 │                                                       │
//! │               UPDATE status / attempts / next_attempt_at / conflict     │
//! │                 │                                                       │
//! │  success ───► DELETE (done entries are not kept)                        │
//! │  clear ─────► DELETE everything                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write is a single statement (one implicit transaction) except
//! [`QueueStore::rebind_record_id`], which runs in an explicit transaction.
//! With `synchronous = FULL` each one is on disk before the call returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use stockroom_core::{
    ConflictDetails, MutationStatus, OperationType, QueuedMutation, Record,
};

// =============================================================================
// Store Contract
// =============================================================================

/// Durable storage for queued mutations.
///
/// All lists come back in enqueue order (FIFO by insertion sequence).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persists a new entry and returns it with its assigned `seq`.
    async fn insert(&self, mutation: &QueuedMutation) -> DbResult<QueuedMutation>;

    async fn get(&self, id: &str) -> DbResult<Option<QueuedMutation>>;

    async fn list_by_status(&self, status: MutationStatus) -> DbResult<Vec<QueuedMutation>>;

    async fn list_all(&self) -> DbResult<Vec<QueuedMutation>>;

    /// Applies `patch` to one entry. `NotFound` if the entry is gone.
    async fn update(&self, id: &str, patch: MutationPatch) -> DbResult<()>;

    /// Deletes one entry. Returns false if it did not exist.
    async fn remove(&self, id: &str) -> DbResult<bool>;

    /// Deletes every entry, whatever its status. Irreversible.
    async fn clear(&self) -> DbResult<u64>;

    async fn count_by_status(&self) -> DbResult<StatusCounts>;

    /// Puts entries left `in_flight` by a crashed process back to `pending`.
    async fn reset_in_flight(&self) -> DbResult<u64>;

    /// Replaces a provisional record id with the server-assigned one, both as
    /// `record_id` on `table` and as a top-level payload value anywhere in the
    /// queue. Returns the number of entries touched.
    async fn rebind_record_id(
        &self,
        table: &str,
        provisional: &str,
        assigned: &str,
    ) -> DbResult<u64>;
}

// =============================================================================
// Patch & Counts
// =============================================================================

/// Partial update of a queued mutation.
///
/// Each field left `None` is untouched. For nullable columns the inner
/// `Option` is the new value, so `Some(None)` clears the column.
///
/// ## Example
/// ```rust
/// use stockroom_core::MutationStatus;
/// use stockroom_db::MutationPatch;
///
/// let patch = MutationPatch::status(MutationStatus::Failed)
///     .with_attempts(3)
///     .with_last_error(Some("HTTP 400: qty must be positive".into()));
/// assert!(!patch.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationPatch {
    pub status: Option<MutationStatus>,
    pub attempts: Option<i64>,
    pub record_id: Option<Option<String>>,
    pub payload: Option<Option<Record>>,
    pub original_snapshot: Option<Option<Record>>,
    pub last_error: Option<Option<String>>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub conflict: Option<Option<ConflictDetails>>,
}

impl MutationPatch {
    /// Starts a patch that changes the status.
    pub fn status(status: MutationStatus) -> Self {
        MutationPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: i64) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_record_id(mut self, record_id: Option<String>) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn with_payload(mut self, payload: Option<Record>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_original_snapshot(mut self, snapshot: Option<Record>) -> Self {
        self.original_snapshot = Some(snapshot);
        self
    }

    pub fn with_last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn with_next_attempt_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn with_conflict(mut self, conflict: Option<ConflictDetails>) -> Self {
        self.conflict = Some(conflict);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == MutationPatch::default()
    }
}

/// Number of entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u32,
    pub in_flight: u32,
    pub failed: u32,
    pub conflict: u32,
    pub done: u32,
}

impl StatusCounts {
    pub fn get(&self, status: MutationStatus) -> u32 {
        match status {
            MutationStatus::Pending => self.pending,
            MutationStatus::InFlight => self.in_flight,
            MutationStatus::Failed => self.failed,
            MutationStatus::Conflict => self.conflict,
            MutationStatus::Done => self.done,
        }
    }

    pub fn total(&self) -> u32 {
        self.pending + self.in_flight + self.failed + self.conflict + self.done
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

const SELECT_COLUMNS: &str = r#"
    SELECT
        seq, id, table_name, operation_type, record_id,
        payload, original_snapshot, status, attempts, last_error,
        credential_ref, created_at, updated_at, next_attempt_at, conflict
    FROM offline_mutations
"#;

#[derive(Debug, sqlx::FromRow)]
struct MutationRow {
    seq: i64,
    id: String,
    table_name: String,
    operation_type: OperationType,
    record_id: Option<String>,
    payload: Option<String>,
    original_snapshot: Option<String>,
    status: MutationStatus,
    attempts: i64,
    last_error: Option<String>,
    credential_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
    conflict: Option<String>,
}

impl TryFrom<MutationRow> for QueuedMutation {
    type Error = DbError;

    fn try_from(row: MutationRow) -> DbResult<Self> {
        Ok(QueuedMutation {
            id: row.id,
            seq: row.seq,
            table: row.table_name,
            operation_type: row.operation_type,
            record_id: row.record_id,
            payload: decode_json(row.payload)?,
            original_snapshot: decode_json(row.original_snapshot)?,
            status: row.status,
            attempts: row.attempts,
            last_error: row.last_error,
            credential_ref: row.credential_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_attempt_at: row.next_attempt_at,
            conflict: decode_json(row.conflict)?,
        })
    }
}

fn decode_json<T: DeserializeOwned>(raw: Option<String>) -> DbResult<Option<T>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(DbError::from)
}

fn encode_json<T: Serialize>(value: Option<&T>) -> DbResult<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(DbError::from)
}

fn into_mutations(rows: Vec<MutationRow>) -> DbResult<Vec<QueuedMutation>> {
    rows.into_iter().map(QueuedMutation::try_from).collect()
}

/// Rewrites top-level payload values equal to `from`. Returns true if any
/// value changed.
fn replace_references(payload: &mut Record, from: &str, to: &str) -> bool {
    let mut changed = false;
    for value in payload.values_mut() {
        if value.as_str() == Some(from) {
            *value = Value::String(to.to_string());
            changed = true;
        }
    }
    changed
}

// =============================================================================
// SQLite Implementation
// =============================================================================

/// SQLite-backed [`QueueStore`].
#[derive(Debug, Clone)]
pub struct MutationRepository {
    pool: SqlitePool,
}

impl MutationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MutationRepository { pool }
    }
}

#[async_trait]
impl QueueStore for MutationRepository {
    async fn insert(&self, mutation: &QueuedMutation) -> DbResult<QueuedMutation> {
        debug!(
            id = %mutation.id,
            table = %mutation.table,
            operation = %mutation.operation_type,
            "Persisting queued mutation"
        );

        let result = sqlx::query(
            r#"
            INSERT INTO offline_mutations (
                id, table_name, operation_type, record_id, payload,
                original_snapshot, status, attempts, last_error, credential_ref,
                created_at, updated_at, next_attempt_at, conflict
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14
            )
            "#,
        )
        .bind(&mutation.id)
        .bind(&mutation.table)
        .bind(mutation.operation_type.as_str())
        .bind(&mutation.record_id)
        .bind(encode_json(mutation.payload.as_ref())?)
        .bind(encode_json(mutation.original_snapshot.as_ref())?)
        .bind(mutation.status.as_str())
        .bind(mutation.attempts)
        .bind(&mutation.last_error)
        .bind(&mutation.credential_ref)
        .bind(mutation.created_at)
        .bind(mutation.updated_at)
        .bind(mutation.next_attempt_at)
        .bind(encode_json(mutation.conflict.as_ref())?)
        .execute(&self.pool)
        .await?;

        let mut stored = mutation.clone();
        stored.seq = result.last_insert_rowid();
        Ok(stored)
    }

    async fn get(&self, id: &str) -> DbResult<Option<QueuedMutation>> {
        let row = sqlx::query_as::<_, MutationRow>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedMutation::try_from).transpose()
    }

    async fn list_by_status(&self, status: MutationStatus) -> DbResult<Vec<QueuedMutation>> {
        let rows = sqlx::query_as::<_, MutationRow>(&format!(
            "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY seq ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        into_mutations(rows)
    }

    async fn list_all(&self) -> DbResult<Vec<QueuedMutation>> {
        let rows = sqlx::query_as::<_, MutationRow>(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))
            .fetch_all(&self.pool)
            .await?;

        into_mutations(rows)
    }

    async fn update(&self, id: &str, patch: MutationPatch) -> DbResult<()> {
        let MutationPatch {
            status,
            attempts,
            record_id,
            payload,
            original_snapshot,
            last_error,
            next_attempt_at,
            conflict,
        } = patch;

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE offline_mutations SET updated_at = ");
        builder.push_bind(Utc::now());

        if let Some(status) = status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(attempts) = attempts {
            builder.push(", attempts = ").push_bind(attempts);
        }
        if let Some(record_id) = record_id {
            builder.push(", record_id = ").push_bind(record_id);
        }
        if let Some(payload) = payload {
            builder
                .push(", payload = ")
                .push_bind(encode_json(payload.as_ref())?);
        }
        if let Some(snapshot) = original_snapshot {
            builder
                .push(", original_snapshot = ")
                .push_bind(encode_json(snapshot.as_ref())?);
        }
        if let Some(last_error) = last_error {
            builder.push(", last_error = ").push_bind(last_error);
        }
        if let Some(next_attempt_at) = next_attempt_at {
            builder.push(", next_attempt_at = ").push_bind(next_attempt_at);
        }
        if let Some(conflict) = conflict {
            builder
                .push(", conflict = ")
                .push_bind(encode_json(conflict.as_ref())?);
        }

        builder.push(" WHERE id = ").push_bind(id.to_string());

        let result = builder.build().execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Mutation", id));
        }

        Ok(())
    }

    async fn remove(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM offline_mutations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM offline_mutations")
            .execute(&self.pool)
            .await?;

        debug!(removed = result.rows_affected(), "Offline queue cleared");
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> DbResult<StatusCounts> {
        let rows: Vec<(MutationStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM offline_mutations GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count as u32;
            match status {
                MutationStatus::Pending => counts.pending = count,
                MutationStatus::InFlight => counts.in_flight = count,
                MutationStatus::Failed => counts.failed = count,
                MutationStatus::Conflict => counts.conflict = count,
                MutationStatus::Done => counts.done = count,
            }
        }

        Ok(counts)
    }

    async fn reset_in_flight(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE offline_mutations
            SET status = 'pending', updated_at = ?1
            WHERE status = 'in_flight'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn rebind_record_id(
        &self,
        table: &str,
        provisional: &str,
        assigned: &str,
    ) -> DbResult<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rebound = sqlx::query(
            r#"
            UPDATE offline_mutations
            SET record_id = ?1, updated_at = ?2
            WHERE table_name = ?3 AND record_id = ?4
            "#,
        )
        .bind(assigned)
        .bind(now)
        .bind(table)
        .bind(provisional)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Narrow with instr() first, then match exact values in Rust
        let candidates: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, payload FROM offline_mutations
            WHERE payload IS NOT NULL AND instr(payload, ?1) > 0
            "#,
        )
        .bind(provisional)
        .fetch_all(&mut *tx)
        .await?;

        let mut rewritten = 0u64;
        for (id, raw) in candidates {
            let mut payload: Record = serde_json::from_str(&raw)?;
            if !replace_references(&mut payload, provisional, assigned) {
                continue;
            }
            sqlx::query("UPDATE offline_mutations SET payload = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(serde_json::to_string(&payload)?)
                .bind(now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            rewritten += 1;
        }

        tx.commit().await?;

        debug!(
            table = %table,
            provisional = %provisional,
            assigned = %assigned,
            rebound,
            rewritten,
            "Provisional record id rebound"
        );

        Ok(rebound + rewritten)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;
    use stockroom_core::{FieldConflict, MutationSpec};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn repo() -> MutationRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().mutations()
    }

    fn update_spec(record_id: &str) -> QueuedMutation {
        QueuedMutation::from_spec(MutationSpec::update(
            "lots",
            record_id,
            record(json!({ "qty": 2 })),
            Some(record(json!({ "qty": 1 }))),
        ))
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let repo = repo().await;
        let mutation = update_spec("L-1");

        let stored = repo.insert(&mutation).await.unwrap();
        assert!(stored.seq > 0);

        let loaded = repo.get(&mutation.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, mutation.id);
        assert_eq!(loaded.operation_type, OperationType::Update);
        assert_eq!(loaded.status, MutationStatus::Pending);
        assert_eq!(loaded.payload, mutation.payload);
        assert_eq!(loaded.original_snapshot, mutation.original_snapshot);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_status_is_fifo() {
        let repo = repo().await;
        let mut ids = Vec::new();
        for n in 0..5 {
            let mutation = update_spec(&format!("L-{n}"));
            ids.push(mutation.id.clone());
            repo.insert(&mutation).await.unwrap();
        }

        let pending = repo.list_by_status(MutationStatus::Pending).await.unwrap();
        let listed: Vec<String> = pending.into_iter().map(|m| m.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let repo = repo().await;
        let mutation = update_spec("L-1");
        repo.insert(&mutation).await.unwrap();

        assert!(matches!(
            repo.insert(&mutation).await,
            Err(DbError::UniqueViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_patch_and_not_found() {
        let repo = repo().await;
        let mutation = update_spec("L-1");
        repo.insert(&mutation).await.unwrap();

        let retry_at = Utc::now() + chrono::Duration::seconds(30);
        repo.update(
            &mutation.id,
            MutationPatch::status(MutationStatus::Pending)
                .with_attempts(1)
                .with_last_error(Some("HTTP 503".into()))
                .with_next_attempt_at(Some(retry_at)),
        )
        .await
        .unwrap();

        let loaded = repo.get(&mutation.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("HTTP 503"));
        assert!(!loaded.is_due(Utc::now()));

        repo.update(
            &mutation.id,
            MutationPatch::default()
                .with_last_error(None)
                .with_next_attempt_at(None),
        )
        .await
        .unwrap();
        let cleared = repo.get(&mutation.id).await.unwrap().unwrap();
        assert!(cleared.last_error.is_none());
        assert!(cleared.next_attempt_at.is_none());

        assert!(matches!(
            repo.update("missing", MutationPatch::status(MutationStatus::Failed))
                .await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_conflict_details_persist() {
        let repo = repo().await;
        let mutation = update_spec("R1");
        repo.insert(&mutation).await.unwrap();

        let details = ConflictDetails {
            server_snapshot: record(json!({ "color": "blue" })),
            conflicting_fields: vec![FieldConflict {
                field: "color".into(),
                local_value: Some(json!("green")),
                server_value: Some(json!("blue")),
                original_value: Some(json!("red")),
            }],
            auto_mergeable_fields: vec![],
            detected_at: Utc::now(),
            resolution: None,
        };
        repo.update(
            &mutation.id,
            MutationPatch::status(MutationStatus::Conflict).with_conflict(Some(details.clone())),
        )
        .await
        .unwrap();

        let conflicts = repo.list_by_status(MutationStatus::Conflict).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict.as_ref(), Some(&details));
    }

    #[tokio::test]
    async fn test_counts_remove_and_clear() {
        let repo = repo().await;
        let first = update_spec("L-1");
        let second = update_spec("L-2");
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();
        repo.update(&second.id, MutationPatch::status(MutationStatus::Failed))
            .await
            .unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);

        assert!(repo.remove(&first.id).await.unwrap());
        assert!(!repo.remove(&first.id).await.unwrap());

        assert_eq!(repo.clear().await.unwrap(), 1);
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_in_flight() {
        let repo = repo().await;
        let mutation = update_spec("L-1");
        repo.insert(&mutation).await.unwrap();
        repo.update(&mutation.id, MutationPatch::status(MutationStatus::InFlight))
            .await
            .unwrap();

        assert_eq!(repo.reset_in_flight().await.unwrap(), 1);
        let loaded = repo.get(&mutation.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MutationStatus::Pending);
    }

    #[tokio::test]
    async fn test_rebind_record_id_and_payload_references() {
        let repo = repo().await;

        let create = QueuedMutation::from_spec(
            MutationSpec::create("lots", record(json!({ "code": "LOT-7" })))
                .with_provisional_id("tmp-1"),
        );
        let update = QueuedMutation::from_spec(MutationSpec::update(
            "lots",
            "tmp-1",
            record(json!({ "qty": 4 })),
            None,
        ));
        let movement = QueuedMutation::from_spec(MutationSpec::create(
            "movements",
            record(json!({ "lot_id": "tmp-1", "note": "tmp-1 moved" })),
        ));
        for mutation in [&create, &update, &movement] {
            repo.insert(mutation).await.unwrap();
        }

        let touched = repo.rebind_record_id("lots", "tmp-1", "srv-42").await.unwrap();
        assert_eq!(touched, 3);

        let update = repo.get(&update.id).await.unwrap().unwrap();
        assert_eq!(update.record_id.as_deref(), Some("srv-42"));

        let movement = repo.get(&movement.id).await.unwrap().unwrap();
        let payload = movement.payload.unwrap();
        assert_eq!(payload["lot_id"], json!("srv-42"));
        // Only whole-value matches are rewritten
        assert_eq!(payload["note"], json!("tmp-1 moved"));
    }

    #[tokio::test]
    async fn test_closed_pool_reports_unavailable() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.mutations();
        db.close().await;

        let err = repo.insert(&update_spec("L-1")).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
