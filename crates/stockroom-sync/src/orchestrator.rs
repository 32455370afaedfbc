//! # Background Sync Orchestrator
//!
//! Decides when the queue is flushed.
//!
//! ## Triggers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   BackgroundSync task                                   │
//! │                                                                         │
//! │   tokio::select! {                                                     │
//! │     periodic tick            → Periodic      (skipped on slow link)    │
//! │     trigger channel          → Manual / Platform / Startup             │
//! │     connectivity watch       → Reconnected on offline → online         │
//! │     shutdown channel         → stop (after the current flush)          │
//! │   }                                                                     │
//! │                                                                         │
//! │   every trigger: offline? skip : try_flush()                           │
//! │                  a flush already running → coalesced                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use stockroom_core::FlushSummary;

use crate::config::BackgroundSettings;
use crate::connectivity::{ConnectivityState, SharedConnectivity};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEventEmitter;
use crate::queue::SyncQueueManager;

// =============================================================================
// Triggers
// =============================================================================

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The device came back online.
    Reconnected,
    /// Periodic timer.
    Periodic,
    /// User asked to sync now.
    Manual,
    /// Platform background-sync callback.
    Platform,
    /// Orchestrator started while online.
    Startup,
}

impl SyncTrigger {
    /// Opportunistic triggers wait for a better connection.
    pub fn is_opportunistic(&self) -> bool {
        matches!(self, SyncTrigger::Periodic | SyncTrigger::Platform)
    }
}

/// Whether a trigger may flush under the current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Run,
    SkipOffline,
    SkipSlow,
}

pub fn gate(trigger: SyncTrigger, state: ConnectivityState, sync_on_slow_connection: bool) -> Gate {
    if !state.is_online {
        Gate::SkipOffline
    } else if state.is_slow_connection && trigger.is_opportunistic() && !sync_on_slow_connection {
        Gate::SkipSlow
    } else {
        Gate::Run
    }
}

// =============================================================================
// Background Sync
// =============================================================================

/// Runs flushes on triggers and reports results to the emitter.
pub struct BackgroundSync {
    manager: Arc<SyncQueueManager>,
    connectivity: SharedConnectivity,
    emitter: Arc<dyn SyncEventEmitter>,
    settings: BackgroundSettings,
}

impl BackgroundSync {
    pub fn new(
        manager: Arc<SyncQueueManager>,
        connectivity: SharedConnectivity,
        emitter: Arc<dyn SyncEventEmitter>,
        settings: BackgroundSettings,
    ) -> Self {
        BackgroundSync {
            manager,
            connectivity,
            emitter,
            settings,
        }
    }

    pub fn connectivity(&self) -> &SharedConnectivity {
        &self.connectivity
    }

    /// Flushes once if the gate allows it.
    ///
    /// Returns `None` when skipped or coalesced into a running flush.
    pub async fn run_trigger(&self, trigger: SyncTrigger) -> SyncResult<Option<FlushSummary>> {
        let state = self.connectivity.current();

        match gate(trigger, state, self.settings.sync_on_slow_connection) {
            Gate::Run => {}
            Gate::SkipOffline => {
                debug!(?trigger, "Offline, skipping flush");
                return Ok(None);
            }
            Gate::SkipSlow => {
                debug!(?trigger, "Slow connection, skipping flush");
                return Ok(None);
            }
        }

        debug!(?trigger, "Flush triggered");

        let summary = match self.manager.try_flush().await {
            Ok(Some(summary)) => summary,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!(?e, ?trigger, "Flush failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                return Err(e);
            }
        };

        self.emitter.emit_flush_completed(&summary);

        if summary.conflicts > 0 {
            let conflicts = self.manager.get_conflicts().await?;
            self.emitter.emit_conflicts(&conflicts);
        }

        self.publish_status().await;

        Ok(Some(summary))
    }

    /// Emits the current status snapshot. Store errors are logged only.
    pub async fn publish_status(&self) {
        match self.manager.status_snapshot(self.connectivity.current()).await {
            Ok(status) => self.emitter.emit_status(&status),
            Err(e) => error!(?e, "Failed to read sync status"),
        }
    }

    /// Starts the trigger loop on the tokio runtime.
    pub fn spawn(self: Arc<Self>) -> BackgroundSyncHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        // Subscribe before returning so no transition after spawn is missed
        let connectivity_rx = self.connectivity.subscribe();

        let task = tokio::spawn(self.run(trigger_rx, shutdown_rx, connectivity_rx));

        BackgroundSyncHandle {
            trigger_tx,
            shutdown_tx,
            task,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut trigger_rx: mpsc::Receiver<SyncTrigger>,
        mut shutdown_rx: mpsc::Receiver<()>,
        mut connectivity_rx: watch::Receiver<ConnectivityState>,
    ) {
        info!(
            interval_secs = self.settings.periodic_interval_secs,
            "Background sync starting"
        );

        let mut ticker = tokio::time::interval(self.settings.periodic_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut was_online = connectivity_rx.borrow_and_update().is_online;
        let mut watching = true;

        if self.settings.sync_on_start {
            self.fire(SyncTrigger::Startup).await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.fire(SyncTrigger::Periodic).await;
                }

                Some(trigger) = trigger_rx.recv() => {
                    self.fire(trigger).await;
                }

                changed = connectivity_rx.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Connectivity source closed");
                        watching = false;
                        continue;
                    }

                    let state = *connectivity_rx.borrow_and_update();
                    self.publish_status().await;

                    if state.is_online && !was_online {
                        info!("Back online");
                        self.fire(SyncTrigger::Reconnected).await;
                    }
                    was_online = state.is_online;
                }

                _ = shutdown_rx.recv() => {
                    info!("Background sync shutting down");
                    break;
                }
            }
        }

        info!("Background sync stopped");
    }

    async fn fire(&self, trigger: SyncTrigger) {
        // Errors are already reported to the emitter
        let _ = self.run_trigger(trigger).await;
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running [`BackgroundSync`] task.
pub struct BackgroundSyncHandle {
    trigger_tx: mpsc::Sender<SyncTrigger>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl BackgroundSyncHandle {
    /// Requests a flush. Returns false if one is already queued, in which
    /// case this request is coalesced into it.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.trigger_tx.try_send(trigger).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop after the current flush and waits for it to exit.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("background sync task: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOW: ConnectivityState = ConnectivityState {
        is_online: true,
        is_slow_connection: true,
    };

    #[test]
    fn test_offline_skips_every_trigger() {
        for trigger in [
            SyncTrigger::Reconnected,
            SyncTrigger::Periodic,
            SyncTrigger::Manual,
            SyncTrigger::Platform,
            SyncTrigger::Startup,
        ] {
            assert_eq!(
                gate(trigger, ConnectivityState::OFFLINE, true),
                Gate::SkipOffline
            );
        }
    }

    #[test]
    fn test_slow_connection_gates_opportunistic_triggers() {
        assert_eq!(gate(SyncTrigger::Periodic, SLOW, false), Gate::SkipSlow);
        assert_eq!(gate(SyncTrigger::Platform, SLOW, false), Gate::SkipSlow);
        assert_eq!(gate(SyncTrigger::Manual, SLOW, false), Gate::Run);
        assert_eq!(gate(SyncTrigger::Reconnected, SLOW, false), Gate::Run);

        // Opt-in
        assert_eq!(gate(SyncTrigger::Periodic, SLOW, true), Gate::Run);
    }

    #[test]
    fn test_online_runs() {
        assert_eq!(
            gate(SyncTrigger::Periodic, ConnectivityState::ONLINE, false),
            Gate::Run
        );
    }
}
