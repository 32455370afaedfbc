//! # Offline Coordinator
//!
//! The surface the application talks to. Owns the queue manager and the
//! background orchestrator and keeps the UI informed through the emitter.
//!
//! ## Lifecycle
//! ```text
//! OfflineCoordinator::open(&config)       or  OfflineCoordinatorBuilder::new(config)
//!         │                                        .with_store(..).with_remote(..)
//!         ▼                                        .build()
//!     init()     crash recovery, status, background task (if enabled)
//!     attach()   same without crash recovery, for a process that shares
//!                the queue with a running worker
//!         │
//!         ▼
//!     queue_mutation / force_sync / resolve_conflict / ...
//!         │
//!         ▼
//!     dispose()  stops background task and probe, closes the database
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use stockroom_core::{
    ConflictChoice, ConflictRecord, FlushSummary, MutationSpec, MutationStatus, QueuedMutation,
    Record, SyncStatusSnapshot,
};
use stockroom_db::{Database, DbConfig, QueueStore};

use crate::config::SyncConfig;
use crate::connectivity::{ManualConnectivity, ProbeConnectivity, SharedConnectivity};
use crate::error::{SyncError, SyncResult};
use crate::events::{NoOpEmitter, SyncEventEmitter};
use crate::orchestrator::{BackgroundSync, BackgroundSyncHandle, SyncTrigger};
use crate::queue::{ResolveOutcome, SyncQueueManager};
use crate::remote::{
    Credential, CredentialProvider, HttpRemoteApi, NoCredentials, RemoteApi, StaticCredentials,
};

/// Explicit offline-sync service instance. No global state.
pub struct OfflineCoordinator {
    manager: Arc<SyncQueueManager>,
    background: Arc<BackgroundSync>,
    background_enabled: bool,
    handle: Mutex<Option<BackgroundSyncHandle>>,
    probe: Option<Arc<ProbeConnectivity>>,
    database: Option<Database>,
}

impl OfflineCoordinator {
    /// Opens the SQLite queue and the HTTP remote described by `config`.
    ///
    /// Connectivity comes from the probe when `connectivity.probe_url` is
    /// set and is assumed online otherwise.
    pub async fn open(config: SyncConfig) -> SyncResult<Self> {
        let db_config = DbConfig::new(config.database_path()?)
            .max_connections(config.database.max_connections);
        let database = Database::new(db_config).await?;

        let remote = HttpRemoteApi::new(
            config.base_url()?,
            config.device_id(),
            config.request_timeout(),
        )?;

        let credentials =
            StaticCredentials::new(config.remote.api_token.clone().map(Credential::bearer));

        let mut builder = OfflineCoordinatorBuilder::new(config.clone())
            .with_store(Arc::new(database.mutations()))
            .with_remote(Arc::new(remote))
            .with_credentials(Arc::new(credentials));

        if config.connectivity.probe_url.is_some() {
            let probe = Arc::new(ProbeConnectivity::spawn(&config.connectivity)?);
            builder = builder.with_probe(probe);
        }

        let mut coordinator = builder.build()?;
        coordinator.database = Some(database);
        Ok(coordinator)
    }

    pub fn manager(&self) -> &Arc<SyncQueueManager> {
        &self.manager
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recovers interrupted work and starts the background orchestrator.
    ///
    /// Only the process that replays the queue should call this: entries
    /// another live process has in flight would be sent twice.
    pub async fn init(&self) -> SyncResult<()> {
        self.manager.init().await?;
        self.start().await
    }

    /// Like [`init`](Self::init) but leaves `in_flight` entries alone.
    pub async fn attach(&self) -> SyncResult<()> {
        self.start().await
    }

    async fn start(&self) -> SyncResult<()> {
        self.background.publish_status().await;

        if self.background_enabled {
            let mut handle = self.handle.lock().await;
            if handle.is_none() {
                *handle = Some(Arc::clone(&self.background).spawn());
            }
        }

        info!(background = self.background_enabled, "Offline coordinator initialized");
        Ok(())
    }

    /// Stops background work. Queued mutations stay in the store.
    pub async fn dispose(&self) -> SyncResult<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await?;
        }
        if let Some(probe) = &self.probe {
            probe.shutdown().await;
        }
        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("Offline coordinator disposed");
        Ok(())
    }

    /// Waits for the first reachability check when connectivity comes from
    /// a URL check. Returns at once otherwise.
    pub async fn wait_for_connectivity(&self) {
        if let Some(probe) = &self.probe {
            probe.ready().await;
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Persists a mutation for later replay. Errors only on invalid input
    /// or storage failure.
    pub async fn queue_mutation(&self, spec: MutationSpec) -> SyncResult<String> {
        let id = self.manager.enqueue(spec).await?;
        self.background.publish_status().await;
        Ok(id)
    }

    /// Flushes now. `None` when offline or when a flush is already running.
    pub async fn force_sync(&self) -> SyncResult<Option<FlushSummary>> {
        self.wait_for_connectivity().await;
        self.background.run_trigger(SyncTrigger::Manual).await
    }

    /// Entry point for the platform background-sync callback.
    pub async fn on_platform_sync(&self) -> SyncResult<Option<FlushSummary>> {
        self.wait_for_connectivity().await;
        self.background.run_trigger(SyncTrigger::Platform).await
    }

    /// Asks the running orchestrator for a flush without waiting for it.
    /// Returns false if no orchestrator runs or a request is already queued.
    pub async fn request_sync(&self) -> bool {
        match self.handle.lock().await.as_ref() {
            Some(handle) => handle.trigger(SyncTrigger::Manual),
            None => false,
        }
    }

    // =========================================================================
    // Conflicts & Failures
    // =========================================================================

    pub async fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.manager.get_conflicts().await
    }

    pub async fn resolve_conflict(
        &self,
        id: &str,
        choice: ConflictChoice,
        merged_data: Option<Record>,
    ) -> SyncResult<ResolveOutcome> {
        let outcome = self.manager.resolve_conflict(id, choice, merged_data).await?;
        self.background.publish_status().await;
        Ok(outcome)
    }

    pub async fn retry_failed(&self, id: &str) -> SyncResult<()> {
        self.manager.retry_failed(id).await?;
        self.background.publish_status().await;
        Ok(())
    }

    pub async fn retry_all_failed(&self) -> SyncResult<u32> {
        let count = self.manager.retry_all_failed().await?;
        self.background.publish_status().await;
        Ok(count)
    }

    pub async fn discard(&self, id: &str) -> SyncResult<()> {
        self.manager.discard(id).await?;
        self.background.publish_status().await;
        Ok(())
    }

    /// Wipes the queue and every conflict in one store operation, waiting
    /// for a running flush first. Irreversible.
    pub async fn clear_all_offline_data(&self) -> SyncResult<u64> {
        let removed = self.manager.clear().await?;
        warn!(count = removed, "All offline data cleared");
        self.background.publish_status().await;
        Ok(removed)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn sync_status(&self) -> SyncResult<SyncStatusSnapshot> {
        self.wait_for_connectivity().await;
        self.manager
            .status_snapshot(self.background.connectivity().current())
            .await
    }

    pub async fn pending_mutations(&self) -> SyncResult<Vec<QueuedMutation>> {
        self.manager.list(Some(MutationStatus::Pending)).await
    }

    pub async fn failed_mutations(&self) -> SyncResult<Vec<QueuedMutation>> {
        self.manager.list(Some(MutationStatus::Failed)).await
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for an [`OfflineCoordinator`] with injected collaborators.
pub struct OfflineCoordinatorBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn QueueStore>>,
    remote: Option<Arc<dyn RemoteApi>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    connectivity: Option<SharedConnectivity>,
    probe: Option<Arc<ProbeConnectivity>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl OfflineCoordinatorBuilder {
    /// Creates a new builder; retry, timeout and background settings come
    /// from `config`.
    pub fn new(config: SyncConfig) -> Self {
        OfflineCoordinatorBuilder {
            config,
            store: None,
            remote: None,
            credentials: None,
            connectivity: None,
            probe: None,
            emitter: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the connectivity source (e.g. a [`ManualConnectivity`] fed by
    /// platform network events).
    pub fn with_connectivity(mut self, connectivity: SharedConnectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Uses a running probe as connectivity source; it is stopped on dispose.
    pub fn with_probe(mut self, probe: Arc<ProbeConnectivity>) -> Self {
        self.connectivity = Some(probe.clone());
        self.probe = Some(probe);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the OfflineCoordinator.
    pub fn build(self) -> SyncResult<OfflineCoordinator> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Queue store required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote API required".into()))?;

        let credentials = self.credentials.unwrap_or_else(|| Arc::new(NoCredentials));
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(ManualConnectivity::default()));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let manager = Arc::new(
            SyncQueueManager::new(store, remote)
                .with_credentials(credentials)
                .with_retry_policy(self.config.retry_policy())
                .with_request_timeout(self.config.request_timeout()),
        );

        let background = Arc::new(BackgroundSync::new(
            Arc::clone(&manager),
            connectivity,
            emitter,
            self.config.background.clone(),
        ));

        Ok(OfflineCoordinator {
            manager,
            background,
            background_enabled: self.config.background.enabled,
            handle: Mutex::new(None),
            probe: self.probe,
            database: None,
        })
    }
}
