//! Shared fixtures: an in-memory SQLite queue and a fake remote API.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use stockroom_core::conflict::strip_system_fields;
use stockroom_core::Record;
use stockroom_db::{Database, DbConfig, QueueStore};
use stockroom_sync::{
    CreatedRecord, Credential, RemoteApi, RemoteError, RetryPolicy, SyncQueueManager,
};

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("test records are JSON objects")
}

pub async fn database() -> Database {
    Database::new(DbConfig::in_memory())
        .await
        .expect("in-memory database")
}

/// Three attempts, no backoff delay.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(1))
}

pub struct Harness {
    pub db: Database,
    pub store: Arc<dyn QueueStore>,
    pub remote: Arc<FakeRemote>,
    pub manager: Arc<SyncQueueManager>,
}

pub async fn harness() -> Harness {
    let db = database().await;
    let store: Arc<dyn QueueStore> = Arc::new(db.mutations());
    let remote = Arc::new(FakeRemote::new());
    let manager = Arc::new(
        SyncQueueManager::new(Arc::clone(&store), remote.clone())
            .with_retry_policy(fast_policy())
            .with_request_timeout(Duration::from_secs(2)),
    );

    Harness {
        db,
        store,
        remote,
        manager,
    }
}

// =============================================================================
// Fake Remote
// =============================================================================

/// One call received by the fake remote.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: &'static str,
    pub table: String,
    pub record_id: Option<String>,
    pub payload: Option<Record>,
    pub idempotency_key: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Default)]
struct FakeState {
    records: HashMap<(String, String), Record>,
    created_by_key: HashMap<String, String>,
    record_failures: HashMap<(String, String), (RemoteError, u32)>,
    global_failure: Option<RemoteError>,
    lose_next_create_response: bool,
    omit_conflict_body: bool,
    latency: Option<Duration>,
    calls: Vec<Call>,
    next_id: u64,
}

/// In-memory REST resource store with failure injection.
///
/// Updates with an `expected` snapshot answer `Conflict` unless the stored
/// record matches it (system fields ignored). Creates honor idempotency keys.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    paused: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake remote state")
    }

    pub fn seed(&self, table: &str, record_id: &str, fields: Value) {
        let mut record = record(fields);
        record.insert("id".into(), json!(record_id));
        self.state()
            .records
            .insert((table.to_string(), record_id.to_string()), record);
    }

    pub fn record(&self, table: &str, record_id: &str) -> Option<Record> {
        self.state()
            .records
            .get(&(table.to_string(), record_id.to_string()))
            .cloned()
    }

    pub fn records_in(&self, table: &str) -> Vec<Record> {
        self.state()
            .records
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// `"METHOD table[/id]"` per call, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| match &call.record_id {
                Some(id) => format!("{} {}/{}", call.method, call.table, id),
                None => format!("{} {}", call.method, call.table),
            })
            .collect()
    }

    /// Fails the next `times` calls touching `table/record_id`.
    pub fn fail_record(&self, table: &str, record_id: &str, error: RemoteError, times: u32) {
        self.state()
            .record_failures
            .insert((table.to_string(), record_id.to_string()), (error, times));
    }

    /// Fails every call until cleared.
    pub fn fail_all(&self, error: Option<RemoteError>) {
        self.state().global_failure = error;
    }

    /// Applies the next create but answers with a network error.
    pub fn lose_next_create_response(&self) {
        self.state().lose_next_create_response = true;
    }

    /// Answers conflicts without the current record.
    pub fn omit_conflict_body(&self, omit: bool) {
        self.state().omit_conflict_body = omit;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Holds every call until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
        self.release.notify_one();
    }

    /// Resolves once a call is held by [`pause`](Self::pause).
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    async fn enter(&self, call: Call) -> Result<(), RemoteError> {
        let latency = self.state().latency;
        if self.paused.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.calls.push(call.clone());

        if let Some(error) = state.global_failure.clone() {
            return Err(error);
        }

        if let Some(record_id) = call.record_id {
            let key = (call.table, record_id);
            if let Some((error, remaining)) = state.record_failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }

        Ok(())
    }
}

fn call(
    method: &'static str,
    table: &str,
    record_id: Option<&str>,
    payload: Option<&Record>,
    credential: Option<&Credential>,
) -> Call {
    Call {
        method,
        table: table.to_string(),
        record_id: record_id.map(str::to_string),
        payload: payload.cloned(),
        idempotency_key: None,
        bearer: credential.map(|c| c.token.clone()),
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(
        &self,
        table: &str,
        payload: &Record,
        idempotency_key: &str,
        credential: Option<&Credential>,
    ) -> Result<CreatedRecord, RemoteError> {
        let mut received = call("POST", table, None, Some(payload), credential);
        received.idempotency_key = Some(idempotency_key.to_string());
        self.enter(received).await?;

        let mut state = self.state();
        let record_id = match state.created_by_key.get(idempotency_key) {
            Some(existing) => existing.clone(),
            None => {
                state.next_id += 1;
                let record_id = format!("srv-{}", state.next_id);
                let mut record = payload.clone();
                record.insert("id".into(), json!(record_id));
                state
                    .records
                    .insert((table.to_string(), record_id.clone()), record);
                state
                    .created_by_key
                    .insert(idempotency_key.to_string(), record_id.clone());
                record_id
            }
        };

        if state.lose_next_create_response {
            state.lose_next_create_response = false;
            return Err(RemoteError::Network("connection reset".into()));
        }

        let record = state
            .records
            .get(&(table.to_string(), record_id.clone()))
            .cloned();
        Ok(CreatedRecord { record_id, record })
    }

    async fn update(
        &self,
        table: &str,
        record_id: &str,
        payload: &Record,
        expected: Option<&Record>,
        credential: Option<&Credential>,
    ) -> Result<(), RemoteError> {
        self.enter(call("PATCH", table, Some(record_id), Some(payload), credential))
            .await?;

        let mut state = self.state();
        let omit_body = state.omit_conflict_body;
        let key = (table.to_string(), record_id.to_string());
        let current = state.records.get_mut(&key).ok_or(RemoteError::NotFound)?;

        if let Some(expected) = expected {
            if strip_system_fields(current) != strip_system_fields(expected) {
                return Err(RemoteError::Conflict {
                    current: (!omit_body).then(|| current.clone()),
                });
            }
        }

        for (field, value) in payload {
            current.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        record_id: &str,
        credential: Option<&Credential>,
    ) -> Result<(), RemoteError> {
        self.enter(call("DELETE", table, Some(record_id), None, credential))
            .await?;

        let key = (table.to_string(), record_id.to_string());
        match self.state().records.remove(&key) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound),
        }
    }

    async fn fetch(
        &self,
        table: &str,
        record_id: &str,
        credential: Option<&Credential>,
    ) -> Result<Option<Record>, RemoteError> {
        self.enter(call("GET", table, Some(record_id), None, credential))
            .await?;

        Ok(self.record(table, record_id))
    }
}
