//! # Sync Queue Manager
//!
//! Replays queued mutations against the remote API, one at a time, in
//! enqueue order.
//!
//! ## Flush Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Flush Run                                       │
//! │                                                                         │
//! │  1. Lock: one flush / resolve / clear at a time                        │
//! │                                                                         │
//! │  2. Snapshot: list_all() ordered by seq                                │
//! │       blocked = records with an entry in `conflict`                    │
//! │       unresolved = provisional ids of creates not yet applied          │
//! │                                                                         │
//! │  3. For each `pending` entry, in seq order:                            │
//! │       backoff not elapsed      → deferred (record blocked)             │
//! │       record blocked           → deferred                              │
//! │       needs unresolved create  → deferred (record blocked)             │
//! │       otherwise                → in_flight → remote call               │
//! │                                                                         │
//! │  4. Outcome:                                                           │
//! │       success       → removed (create: provisional id rebound first)  │
//! │       transient     → pending + backoff, or failed when exhausted      │
//! │       4xx           → failed                                           │
//! │       409 / 412     → three-way analysis                               │
//! │                         clean    → one merged re-write                 │
//! │                         diverged → conflict                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Routine remote failures are recorded on the entry; `flush` only returns
//! an error when the store fails.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use stockroom_core::conflict::{
    analyze, local_view, merge_analysis, records_equal, resolutions_for, strip_system_fields,
};
use stockroom_core::validation::validate_mutation_spec;
use stockroom_core::{
    ConflictAnalysis, ConflictChoice, ConflictDetails, ConflictRecord, CoreError, FlushSummary,
    MutationSpec, MutationStatus, OperationType, QueuedMutation, Record, SyncStatusSnapshot,
};
use stockroom_db::{MutationPatch, QueueStore, StatusCounts};

use crate::connectivity::ConnectivityState;
use crate::error::{FailureClass, RemoteError, SyncError, SyncResult};
use crate::remote::{Credential, CredentialProvider, NoCredentials, RemoteApi};
use crate::retry::RetryPolicy;

/// Default bound on a single remote call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to one entry during a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retried,
    Failed,
    Conflict,
}

/// What `resolve_conflict` did with the resolved entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Merged record written on the server; entry removed.
    Applied,
    /// Merged record equals the server record; nothing to write, entry removed.
    Unchanged,
    /// The server moved on again and the new analysis has conflicts.
    StillConflicting,
    /// Back to `pending` with the merged payload (transient failure, or the
    /// server moved on in fields the resolution does not touch).
    Requeued,
    /// Rejected by the server or out of retries.
    Failed,
}

// =============================================================================
// Sync Queue Manager
// =============================================================================

/// Owns the execution of queued mutations.
pub struct SyncQueueManager {
    store: Arc<dyn QueueStore>,
    remote: Arc<dyn RemoteApi>,
    credentials: Arc<dyn CredentialProvider>,
    policy: RetryPolicy,
    request_timeout: Duration,

    /// Serializes flush, resolve and clear.
    flush_lock: Mutex<()>,
    processing: AtomicBool,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
}

impl SyncQueueManager {
    pub fn new(store: Arc<dyn QueueStore>, remote: Arc<dyn RemoteApi>) -> Self {
        SyncQueueManager {
            store,
            remote,
            credentials: Arc::new(NoCredentials),
            policy: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            flush_lock: Mutex::new(()),
            processing: AtomicBool::new(false),
            last_sync_at: RwLock::new(None),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Crash recovery: entries a previous process left `in_flight` go back
    /// to `pending`. Creates among them are safe to resend because of the
    /// idempotency key.
    pub async fn init(&self) -> SyncResult<u64> {
        let _guard = self.flush_lock.lock().await;

        let reset = self.store.reset_in_flight().await?;
        if reset > 0 {
            warn!(count = reset, "Recovered in-flight mutations from previous run");
        }
        Ok(reset)
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Validates and persists a mutation. Never touches the network.
    pub async fn enqueue(&self, spec: MutationSpec) -> SyncResult<String> {
        validate_mutation_spec(&spec)?;

        let mutation = QueuedMutation::from_spec(spec);
        let stored = self.store.insert(&mutation).await?;

        info!(
            id = %stored.id,
            seq = stored.seq,
            table = %stored.table,
            operation = %stored.operation_type,
            record_id = ?stored.record_id,
            "Mutation queued"
        );

        Ok(stored.id)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Processes every eligible `pending` entry, waiting for a running flush
    /// to finish first.
    pub async fn flush(&self) -> SyncResult<FlushSummary> {
        let _guard = self.flush_lock.lock().await;
        self.run_flush().await
    }

    /// Like [`flush`](Self::flush), but returns `None` at once if a flush,
    /// resolve or clear is already running.
    pub async fn try_flush(&self) -> SyncResult<Option<FlushSummary>> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("Flush already running, trigger coalesced");
            return Ok(None);
        };
        self.run_flush().await.map(Some)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Completion time of the last flush that ran without a store error.
    pub async fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.read().await
    }

    async fn run_flush(&self) -> SyncResult<FlushSummary> {
        let _processing = ProcessingGuard::start(&self.processing);

        let summary = self.process_pending().await?;
        *self.last_sync_at.write().await = Some(Utc::now());

        if summary.is_empty() {
            debug!("Nothing to flush");
        } else {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                conflicts = summary.conflicts,
                retried = summary.retried,
                deferred = summary.deferred,
                "Flush completed"
            );
        }

        Ok(summary)
    }

    async fn process_pending(&self) -> SyncResult<FlushSummary> {
        let entries = self.store.list_all().await?;
        let now = Utc::now();
        let mut summary = FlushSummary::default();

        let mut blocked: HashSet<(String, String)> = entries
            .iter()
            .filter(|m| m.status == MutationStatus::Conflict)
            .filter_map(QueuedMutation::record_key)
            .collect();

        let mut unresolved = UnresolvedCreates::from_queue(&entries);

        let pending: Vec<&QueuedMutation> = entries
            .iter()
            .filter(|m| m.status.is_auto_executable())
            .collect();

        for snapshot in pending {
            // Earlier entries may have rebound ids or been discarded.
            let Some(entry) = self.store.get(&snapshot.id).await? else {
                continue;
            };
            if entry.status != MutationStatus::Pending {
                continue;
            }

            let key = entry.record_key();
            let is_blocked = key.as_ref().is_some_and(|key| blocked.contains(key));

            let blocking_create = unresolved.blocking(&entry);
            let defer_reason = if !entry.is_due(now) {
                Some("backoff not elapsed")
            } else if is_blocked {
                Some("blocked behind an earlier entry on the same record")
            } else if blocking_create.is_some() {
                Some("waiting for the create it references")
            } else {
                None
            };

            if let Some(reason) = defer_reason {
                if let Some(create) = blocking_create.filter(|create| create.failed) {
                    self.note_failed_dependency(&entry, &create.mutation_id)
                        .await?;
                }
                debug!(id = %entry.id, reason, "Deferring mutation");
                summary.deferred += 1;
                if let Some(key) = key {
                    blocked.insert(key);
                }
                continue;
            }

            match self.execute(&entry).await? {
                Outcome::Succeeded => {
                    summary.succeeded += 1;
                    if entry.operation_type == OperationType::Create {
                        unresolved.resolve(&entry.id);
                    }
                }
                Outcome::Failed => {
                    summary.failed += 1;
                    if entry.operation_type == OperationType::Create {
                        unresolved.mark_failed(&entry.id);
                    }
                }
                Outcome::Retried => {
                    summary.retried += 1;
                    if let Some(key) = key {
                        blocked.insert(key);
                    }
                }
                Outcome::Conflict => {
                    summary.conflicts += 1;
                    if let Some(key) = key {
                        blocked.insert(key);
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Records on a stalled entry which failed create it is waiting for.
    async fn note_failed_dependency(
        &self,
        entry: &QueuedMutation,
        create_id: &str,
    ) -> SyncResult<()> {
        let message = format!("waiting for failed create {create_id}");
        if entry.last_error.as_deref() == Some(message.as_str()) {
            return Ok(());
        }

        warn!(id = %entry.id, create_id, "Mutation stalled behind a failed create");
        self.store
            .update(&entry.id, MutationPatch::default().with_last_error(Some(message)))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute(&self, mutation: &QueuedMutation) -> SyncResult<Outcome> {
        self.store
            .update(&mutation.id, MutationPatch::status(MutationStatus::InFlight))
            .await?;

        debug!(
            id = %mutation.id,
            table = %mutation.table,
            operation = %mutation.operation_type,
            attempt = mutation.attempts + 1,
            "Executing mutation"
        );

        let credential = match self
            .credentials
            .resolve(mutation.credential_ref.as_deref())
            .await
        {
            Ok(credential) => credential,
            Err(err) => return self.handle_transient(mutation, err).await,
        };
        let credential = credential.as_ref();

        match mutation.operation_type {
            OperationType::Create => self.execute_create(mutation, credential).await,
            OperationType::Update => self.execute_update(mutation, credential).await,
            OperationType::Delete => self.execute_delete(mutation, credential).await,
        }
    }

    async fn execute_create(
        &self,
        mutation: &QueuedMutation,
        credential: Option<&Credential>,
    ) -> SyncResult<Outcome> {
        let payload = mutation.payload.clone().unwrap_or_default();

        let result = self
            .call(
                self.remote
                    .create(&mutation.table, &payload, &mutation.id, credential),
            )
            .await;

        match result {
            Ok(created) => {
                if let Some(provisional) = mutation.record_id.as_deref() {
                    if provisional != created.record_id {
                        let rebound = self
                            .store
                            .rebind_record_id(&mutation.table, provisional, &created.record_id)
                            .await?;
                        debug!(
                            provisional,
                            assigned = %created.record_id,
                            rebound,
                            "Rebound provisional record id"
                        );
                    }
                }
                self.complete(mutation).await
            }
            Err(err) => self.handle_failure(mutation, err).await,
        }
    }

    async fn execute_update(
        &self,
        mutation: &QueuedMutation,
        credential: Option<&Credential>,
    ) -> SyncResult<Outcome> {
        let Some(record_id) = mutation.record_id.as_deref() else {
            return self.mark_failed(mutation, "update has no record id").await;
        };
        let payload = mutation.payload.clone().unwrap_or_default();

        let result = self
            .call(self.remote.update(
                &mutation.table,
                record_id,
                &payload,
                mutation.original_snapshot.as_ref(),
                credential,
            ))
            .await;

        match result {
            Ok(()) => self.complete(mutation).await,
            Err(RemoteError::Conflict { current }) => {
                self.handle_conflict(mutation, record_id, current, credential)
                    .await
            }
            Err(err) => self.handle_failure(mutation, err).await,
        }
    }

    async fn execute_delete(
        &self,
        mutation: &QueuedMutation,
        credential: Option<&Credential>,
    ) -> SyncResult<Outcome> {
        let Some(record_id) = mutation.record_id.as_deref() else {
            return self.mark_failed(mutation, "delete has no record id").await;
        };

        let result = self
            .call(self.remote.delete(&mutation.table, record_id, credential))
            .await;

        match result {
            Ok(()) | Err(RemoteError::NotFound) => self.complete(mutation).await,
            Err(err) => self.handle_failure(mutation, err).await,
        }
    }

    /// Bounds a remote call by the request timeout.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.request_timeout)),
        }
    }

    // =========================================================================
    // Outcome Handling
    // =========================================================================

    async fn complete(&self, mutation: &QueuedMutation) -> SyncResult<Outcome> {
        self.store.remove(&mutation.id).await?;

        info!(
            id = %mutation.id,
            table = %mutation.table,
            operation = %mutation.operation_type,
            "Mutation applied"
        );
        Ok(Outcome::Succeeded)
    }

    async fn handle_failure(&self, mutation: &QueuedMutation, err: RemoteError) -> SyncResult<Outcome> {
        match err.classify() {
            FailureClass::Transient => self.handle_transient(mutation, err).await,
            FailureClass::Permanent | FailureClass::Conflict => {
                self.mark_failed(mutation, &err.to_string()).await
            }
        }
    }

    async fn handle_transient(&self, mutation: &QueuedMutation, err: RemoteError) -> SyncResult<Outcome> {
        let attempts = mutation.attempts + 1;
        let message = err.to_string();

        if self.policy.exhausted(attempts) {
            warn!(
                id = %mutation.id,
                attempts,
                error = %message,
                "Retries exhausted, marking mutation failed"
            );
            self.store
                .update(
                    &mutation.id,
                    MutationPatch::status(MutationStatus::Failed)
                        .with_attempts(attempts)
                        .with_last_error(Some(message))
                        .with_next_attempt_at(None),
                )
                .await?;
            return Ok(Outcome::Failed);
        }

        let next_attempt_at = self.next_attempt_at(attempts, &err);
        debug!(
            id = %mutation.id,
            attempts,
            error = %message,
            %next_attempt_at,
            "Transient failure, will retry"
        );

        self.store
            .update(
                &mutation.id,
                MutationPatch::status(MutationStatus::Pending)
                    .with_attempts(attempts)
                    .with_last_error(Some(message))
                    .with_next_attempt_at(Some(next_attempt_at)),
            )
            .await?;
        Ok(Outcome::Retried)
    }

    fn next_attempt_at(&self, attempts: i64, err: &RemoteError) -> DateTime<Utc> {
        let now = Utc::now();
        match err {
            RemoteError::RateLimited {
                retry_after: Some(retry_after),
            } => self.policy.retry_after_at(attempts, *retry_after, now),
            _ => self.policy.next_attempt_at(attempts, now),
        }
    }

    async fn mark_failed(&self, mutation: &QueuedMutation, message: &str) -> SyncResult<Outcome> {
        let attempts = mutation.attempts + 1;
        warn!(id = %mutation.id, attempts, error = %message, "Mutation rejected");

        self.store
            .update(
                &mutation.id,
                MutationPatch::status(MutationStatus::Failed)
                    .with_attempts(attempts)
                    .with_last_error(Some(message.to_string()))
                    .with_next_attempt_at(None),
            )
            .await?;
        Ok(Outcome::Failed)
    }

    // =========================================================================
    // Conflict Handling
    // =========================================================================

    /// The server refused an update because the record moved on.
    async fn handle_conflict(
        &self,
        mutation: &QueuedMutation,
        record_id: &str,
        current: Option<Record>,
        credential: Option<&Credential>,
    ) -> SyncResult<Outcome> {
        let server = match self
            .server_record(&mutation.table, record_id, current, credential)
            .await
        {
            Ok(Some(server)) => server,
            Ok(None) => {
                return self
                    .mark_failed(mutation, "record no longer exists on the server")
                    .await
            }
            Err(err) => return self.handle_failure(mutation, err).await,
        };

        let original = mutation.original_snapshot.clone().unwrap_or_default();
        let local = local_view(mutation.original_snapshot.as_ref(), mutation.payload.as_ref());
        let analysis = analyze(&original, &local, &server);

        if !analysis.is_clean() {
            return self.mark_conflict(mutation, server, analysis).await;
        }

        // Only one side touched each field: write the merge once, guarded by
        // the server version it was built on.
        let merged = strip_system_fields(&merge_analysis(&server, &analysis, &BTreeMap::new()));
        info!(
            id = %mutation.id,
            fields = analysis.auto_mergeable.len(),
            "Server diverged without conflicts, writing merged record"
        );

        let result = self
            .call(self.remote.update(
                &mutation.table,
                record_id,
                &merged,
                Some(&server),
                credential,
            ))
            .await;

        match result {
            Ok(()) => self.complete(mutation).await,
            Err(RemoteError::Conflict { current }) => {
                let newest = current.unwrap_or(server);
                let analysis = analyze(&original, &local, &newest);
                if analysis.is_clean() {
                    let err = RemoteError::Conflict { current: None };
                    self.handle_transient(mutation, err).await
                } else {
                    self.mark_conflict(mutation, newest, analysis).await
                }
            }
            Err(err) => self.handle_failure(mutation, err).await,
        }
    }

    async fn server_record(
        &self,
        table: &str,
        record_id: &str,
        current: Option<Record>,
        credential: Option<&Credential>,
    ) -> Result<Option<Record>, RemoteError> {
        match current {
            Some(record) => Ok(Some(record)),
            None => {
                self.call(self.remote.fetch(table, record_id, credential))
                    .await
            }
        }
    }

    async fn mark_conflict(
        &self,
        mutation: &QueuedMutation,
        server: Record,
        analysis: ConflictAnalysis,
    ) -> SyncResult<Outcome> {
        let fields = analysis.conflicting_field_names().join(", ");
        warn!(id = %mutation.id, table = %mutation.table, fields = %fields, "Conflict detected");

        let details = ConflictDetails {
            server_snapshot: server,
            conflicting_fields: analysis.conflicts,
            auto_mergeable_fields: analysis.auto_mergeable,
            detected_at: Utc::now(),
            resolution: None,
        };

        self.store
            .update(
                &mutation.id,
                MutationPatch::status(MutationStatus::Conflict)
                    .with_attempts(mutation.attempts + 1)
                    .with_last_error(Some(format!("Conflicting fields: {fields}")))
                    .with_next_attempt_at(None)
                    .with_conflict(Some(details)),
            )
            .await?;
        Ok(Outcome::Conflict)
    }

    // =========================================================================
    // Conflict Resolution
    // =========================================================================

    /// Entries waiting on a conflict decision.
    pub async fn get_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        let entries = self.store.list_by_status(MutationStatus::Conflict).await?;
        Ok(entries.iter().filter_map(ConflictRecord::from_mutation).collect())
    }

    /// Applies a resolution to a conflicted entry and writes the result.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        choice: ConflictChoice,
        merged_data: Option<Record>,
    ) -> SyncResult<ResolveOutcome> {
        let _guard = self.flush_lock.lock().await;

        let mutation = self.require(id).await?;
        let details = match (&mutation.status, &mutation.conflict) {
            (MutationStatus::Conflict, Some(details)) => details.clone(),
            _ => {
                return Err(CoreError::InvalidTransition {
                    id: id.to_string(),
                    from: mutation.status,
                    to: MutationStatus::Done,
                }
                .into())
            }
        };
        let Some(record_id) = mutation.record_id.clone() else {
            return Err(SyncError::Internal(format!("conflicted mutation {id} has no record id")));
        };

        let server = details.server_snapshot.clone();
        let analysis = ConflictAnalysis {
            conflicts: details.conflicting_fields.clone(),
            auto_mergeable: details.auto_mergeable_fields.clone(),
        };
        let resolutions = resolutions_for(id, choice, &analysis, &server, merged_data.as_ref())?;
        let merged = strip_system_fields(&merge_analysis(&server, &analysis, &resolutions));

        let mut resolved = details;
        resolved.resolution = Some(resolutions);
        self.store
            .update(id, MutationPatch::default().with_conflict(Some(resolved)))
            .await?;

        info!(id, ?choice, "Conflict resolved");

        if records_equal(&merged, &strip_system_fields(&server)) {
            self.store.remove(id).await?;
            info!(id, "Resolution matches the server record, nothing to write");
            return Ok(ResolveOutcome::Unchanged);
        }

        let credential = match self
            .credentials
            .resolve(mutation.credential_ref.as_deref())
            .await
        {
            Ok(credential) => credential,
            Err(err) => return self.requeue_resolved(&mutation, merged, server, err).await,
        };
        let credential = credential.as_ref();

        let result = self
            .call(self.remote.update(
                &mutation.table,
                &record_id,
                &merged,
                Some(&server),
                credential,
            ))
            .await;

        match result {
            Ok(()) => {
                self.store.remove(id).await?;
                info!(id, table = %mutation.table, "Resolved mutation applied");
                Ok(ResolveOutcome::Applied)
            }
            Err(RemoteError::Conflict { current }) => {
                let newest = match self
                    .server_record(&mutation.table, &record_id, current, credential)
                    .await
                {
                    Ok(Some(newest)) => newest,
                    Ok(None) => {
                        self.fail_resolved(&mutation, merged, server, "record no longer exists on the server")
                            .await?;
                        return Ok(ResolveOutcome::Failed);
                    }
                    Err(err) => return self.requeue_resolved(&mutation, merged, server, err).await,
                };
                self.reconflict_resolved(&mutation, merged, server, newest)
                    .await
            }
            Err(err) => match err.classify() {
                FailureClass::Transient => self.requeue_resolved(&mutation, merged, server, err).await,
                FailureClass::Permanent | FailureClass::Conflict => {
                    self.fail_resolved(&mutation, merged, server, &err.to_string())
                        .await?;
                    Ok(ResolveOutcome::Failed)
                }
            },
        }
    }

    /// The resolved write hit a newer server version. The merged record is
    /// now the local intent, based on the server version it was built from.
    async fn reconflict_resolved(
        &self,
        mutation: &QueuedMutation,
        merged: Record,
        base: Record,
        newest: Record,
    ) -> SyncResult<ResolveOutcome> {
        let analysis = analyze(&base, &merged, &newest);
        let patch = MutationPatch::default()
            .with_attempts(mutation.attempts + 1)
            .with_payload(Some(merged))
            .with_original_snapshot(Some(base));

        if analysis.is_clean() {
            // Next flush merges it automatically against the newest version.
            self.store
                .update(
                    &mutation.id,
                    MutationPatch {
                        status: Some(MutationStatus::Pending),
                        ..patch
                    }
                    .with_last_error(None)
                    .with_next_attempt_at(None)
                    .with_conflict(None),
                )
                .await?;
            info!(id = %mutation.id, "Server moved on in untouched fields, requeued");
            return Ok(ResolveOutcome::Requeued);
        }

        let fields = analysis.conflicting_field_names().join(", ");
        warn!(id = %mutation.id, fields = %fields, "Resolved write conflicted again");

        let details = ConflictDetails {
            server_snapshot: newest,
            conflicting_fields: analysis.conflicts,
            auto_mergeable_fields: analysis.auto_mergeable,
            detected_at: Utc::now(),
            resolution: None,
        };
        self.store
            .update(
                &mutation.id,
                MutationPatch {
                    status: Some(MutationStatus::Conflict),
                    ..patch
                }
                .with_last_error(Some(format!("Conflicting fields: {fields}")))
                .with_conflict(Some(details)),
            )
            .await?;
        Ok(ResolveOutcome::StillConflicting)
    }

    async fn requeue_resolved(
        &self,
        mutation: &QueuedMutation,
        merged: Record,
        base: Record,
        err: RemoteError,
    ) -> SyncResult<ResolveOutcome> {
        let attempts = mutation.attempts + 1;
        if self.policy.exhausted(attempts) {
            self.fail_resolved(mutation, merged, base, &err.to_string())
                .await?;
            return Ok(ResolveOutcome::Failed);
        }

        debug!(id = %mutation.id, error = %err, "Resolved write failed transiently, requeued");
        self.store
            .update(
                &mutation.id,
                MutationPatch::status(MutationStatus::Pending)
                    .with_attempts(attempts)
                    .with_payload(Some(merged))
                    .with_original_snapshot(Some(base))
                    .with_last_error(Some(err.to_string()))
                    .with_next_attempt_at(Some(self.next_attempt_at(attempts, &err)))
                    .with_conflict(None),
            )
            .await?;
        Ok(ResolveOutcome::Requeued)
    }

    async fn fail_resolved(
        &self,
        mutation: &QueuedMutation,
        merged: Record,
        base: Record,
        message: &str,
    ) -> SyncResult<()> {
        warn!(id = %mutation.id, error = %message, "Resolved write rejected");
        self.store
            .update(
                &mutation.id,
                MutationPatch::status(MutationStatus::Failed)
                    .with_attempts(mutation.attempts + 1)
                    .with_payload(Some(merged))
                    .with_original_snapshot(Some(base))
                    .with_last_error(Some(message.to_string()))
                    .with_next_attempt_at(None)
                    .with_conflict(None),
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Manual Operations
    // =========================================================================

    /// Moves a `failed` entry back to `pending` with a fresh retry budget.
    pub async fn retry_failed(&self, id: &str) -> SyncResult<()> {
        let mutation = self.require(id).await?;
        if mutation.status != MutationStatus::Failed {
            return Err(CoreError::InvalidTransition {
                id: id.to_string(),
                from: mutation.status,
                to: MutationStatus::Pending,
            }
            .into());
        }

        self.store.update(id, reset_for_retry()).await?;
        info!(id, "Failed mutation requeued");
        Ok(())
    }

    /// Requeues every `failed` entry. Returns how many were requeued.
    pub async fn retry_all_failed(&self) -> SyncResult<u32> {
        let failed = self.store.list_by_status(MutationStatus::Failed).await?;
        for mutation in &failed {
            self.store.update(&mutation.id, reset_for_retry()).await?;
        }

        if !failed.is_empty() {
            info!(count = failed.len(), "Failed mutations requeued");
        }
        Ok(failed.len() as u32)
    }

    /// Drops one entry without applying it.
    pub async fn discard(&self, id: &str) -> SyncResult<()> {
        let _guard = self.flush_lock.lock().await;

        if !self.store.remove(id).await? {
            return Err(SyncError::NotFound { id: id.to_string() });
        }
        info!(id, "Mutation discarded");
        Ok(())
    }

    /// Drops every entry, conflicts included. Irreversible.
    pub async fn clear(&self) -> SyncResult<u64> {
        let _guard = self.flush_lock.lock().await;

        let removed = self.store.clear().await?;
        warn!(count = removed, "Offline queue cleared");
        Ok(removed)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: &str) -> SyncResult<Option<QueuedMutation>> {
        Ok(self.store.get(id).await?)
    }

    /// Entries in `status`, or all of them, in enqueue order.
    pub async fn list(&self, status: Option<MutationStatus>) -> SyncResult<Vec<QueuedMutation>> {
        let entries = match status {
            Some(status) => self.store.list_by_status(status).await?,
            None => self.store.list_all().await?,
        };
        Ok(entries)
    }

    pub async fn status_counts(&self) -> SyncResult<StatusCounts> {
        Ok(self.store.count_by_status().await?)
    }

    /// Current counts combined with the given connectivity.
    pub async fn status_snapshot(
        &self,
        connectivity: ConnectivityState,
    ) -> SyncResult<SyncStatusSnapshot> {
        let counts = self.status_counts().await?;

        Ok(SyncStatusSnapshot {
            pending_count: counts.pending,
            in_flight_count: counts.in_flight,
            failed_count: counts.failed,
            conflict_count: counts.conflict,
            is_processing: self.is_processing(),
            last_sync_at: self.last_sync_at().await,
            is_online: connectivity.is_online,
            is_slow_connection: connectivity.is_slow_connection,
        })
    }

    async fn require(&self, id: &str) -> SyncResult<QueuedMutation> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })
    }
}

fn reset_for_retry() -> MutationPatch {
    MutationPatch::status(MutationStatus::Pending)
        .with_attempts(0)
        .with_last_error(None)
        .with_next_attempt_at(None)
}

// =============================================================================
// Processing Flag
// =============================================================================

struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        ProcessingGuard(flag)
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Create Dependencies
// =============================================================================

/// A create that has not been applied yet.
#[derive(Debug, Clone)]
struct PendingCreate {
    table: String,
    mutation_id: String,
    seq: i64,
    /// Rejected: dependents stay queued until it is retried or discarded.
    failed: bool,
}

/// Creates whose provisional id is still in use, keyed by that id.
#[derive(Debug, Default)]
struct UnresolvedCreates {
    by_provisional: HashMap<String, PendingCreate>,
}

impl UnresolvedCreates {
    fn from_queue(entries: &[QueuedMutation]) -> Self {
        let by_provisional = entries
            .iter()
            .filter(|m| m.operation_type == OperationType::Create)
            .filter_map(|m| {
                m.record_id.as_ref().map(|id| {
                    let create = PendingCreate {
                        table: m.table.clone(),
                        mutation_id: m.id.clone(),
                        seq: m.seq,
                        failed: m.status == MutationStatus::Failed,
                    };
                    (id.clone(), create)
                })
            })
            .collect();

        UnresolvedCreates { by_provisional }
    }

    fn resolve(&mut self, mutation_id: &str) {
        self.by_provisional
            .retain(|_, create| create.mutation_id != mutation_id);
    }

    fn mark_failed(&mut self, mutation_id: &str) {
        for create in self.by_provisional.values_mut() {
            if create.mutation_id == mutation_id {
                create.failed = true;
            }
        }
    }

    /// The earlier, unapplied create whose provisional id `mutation` targets
    /// or references.
    fn blocking(&self, mutation: &QueuedMutation) -> Option<&PendingCreate> {
        let depends_on = |provisional: &str, same_table_only: bool| {
            self.by_provisional.get(provisional).filter(|create| {
                create.mutation_id != mutation.id
                    && create.seq < mutation.seq
                    && (!same_table_only || create.table == mutation.table)
            })
        };

        if let Some(create) = mutation
            .record_id
            .as_deref()
            .and_then(|record_id| depends_on(record_id, true))
        {
            return Some(create);
        }

        mutation.payload.as_ref().and_then(|payload| {
            payload
                .values()
                .filter_map(|value| value.as_str())
                .find_map(|value| depends_on(value, false))
        })
    }
}
