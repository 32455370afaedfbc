//! # Connectivity
//!
//! Online/offline and slow-connection signals for the orchestrator.
//!
//! ```text
//! ManualConnectivity   application pushes platform network events
//! ProbeConnectivity    periodic GET against a health URL
//!                        no answer in time    → offline
//!                        answer > threshold   → online, slow
//!                        answer ≤ threshold   → online
//! ```
//!
//! Both publish through a `tokio::sync::watch` channel, so subscribers
//! always see the latest state and never a backlog.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ConnectivitySettings;
use crate::error::{SyncError, SyncResult};

/// Point-in-time connectivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,
    pub is_slow_connection: bool,
}

impl ConnectivityState {
    pub const OFFLINE: ConnectivityState = ConnectivityState {
        is_online: false,
        is_slow_connection: false,
    };

    pub const ONLINE: ConnectivityState = ConnectivityState {
        is_online: true,
        is_slow_connection: false,
    };
}

/// Source of connectivity changes.
pub trait ConnectivityObserver: Send + Sync {
    fn current(&self) -> ConnectivityState;

    /// Receiver that wakes on every change.
    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;
}

// =============================================================================
// Manual
// =============================================================================

/// Connectivity reported by the application.
pub struct ManualConnectivity {
    tx: watch::Sender<ConnectivityState>,
}

impl ManualConnectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        ManualConnectivity { tx }
    }

    pub fn set(&self, state: ConnectivityState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            info!(
                online = state.is_online,
                slow = state.is_slow_connection,
                "Connectivity changed"
            );
        }
    }

    pub fn set_online(&self, is_online: bool) {
        let mut state = self.current();
        state.is_online = is_online;
        if !is_online {
            state.is_slow_connection = false;
        }
        self.set(state);
    }

    pub fn set_slow(&self, is_slow: bool) {
        let mut state = self.current();
        state.is_slow_connection = is_slow;
        self.set(state);
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        ManualConnectivity::new(ConnectivityState::ONLINE)
    }
}

impl ConnectivityObserver for ManualConnectivity {
    fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

// =============================================================================
// Probe
// =============================================================================

/// Connectivity derived from a periodic HTTP probe.
pub struct ProbeConnectivity {
    state: watch::Receiver<ConnectivityState>,
    /// Flips to true once the first check has answered or timed out.
    checked: watch::Receiver<bool>,
    ready_timeout: Duration,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ProbeConnectivity {
    /// Starts probing. The first probe runs immediately; until it answers
    /// the state is offline. Call [`ready`](Self::ready) before trusting
    /// [`current`](ConnectivityObserver::current) right after start.
    pub fn spawn(settings: &ConnectivitySettings) -> SyncResult<Self> {
        let url = settings
            .probe_url
            .clone()
            .ok_or_else(|| SyncError::InvalidConfig("connectivity.probe_url is not set".into()))?;
        let url = url::Url::parse(&url)?;

        let timeout = Duration::from_secs(settings.probe_timeout_secs);
        let slow_threshold = Duration::from_millis(settings.slow_threshold_ms);
        let interval = Duration::from_secs(settings.probe_interval_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("HTTP client: {e}")))?;

        let (state_tx, state_rx) = watch::channel(ConnectivityState::OFFLINE);
        let (checked_tx, checked_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            info!(%url, "Connectivity probe starting");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let reachable = client.get(url.clone()).send().await.is_ok();
                        let state = evaluate_probe(reachable.then(|| started.elapsed()), slow_threshold);

                        debug!(
                            online = state.is_online,
                            slow = state.is_slow_connection,
                            "Connectivity probe"
                        );
                        state_tx.send_if_modified(|current| {
                            if *current == state {
                                return false;
                            }
                            *current = state;
                            true
                        });
                        checked_tx.send_if_modified(|checked| !std::mem::replace(checked, true));
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Connectivity probe shutting down");
                        break;
                    }
                }
            }
        });

        Ok(ProbeConnectivity {
            state: state_rx,
            checked: checked_rx,
            ready_timeout: timeout + Duration::from_secs(1),
            shutdown_tx,
            task,
        })
    }

    /// Waits for the first check to finish, bounded by the request timeout.
    /// Returns at once after that.
    pub async fn ready(&self) {
        let mut checked = self.checked.clone();
        let settled =
            tokio::time::timeout(self.ready_timeout, checked.wait_for(|done| *done)).await;
        if settled.is_err() {
            debug!("First connectivity check still running, keeping offline state");
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.checked.borrow()
    }

    /// Stops probing. The last published state stays readable.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConnectivityObserver for ProbeConnectivity {
    fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.clone()
    }
}

/// Any HTTP answer means the network is up; the status code does not matter.
/// `None` means the probe failed or timed out.
pub fn evaluate_probe(latency: Option<Duration>, slow_threshold: Duration) -> ConnectivityState {
    match latency {
        None => ConnectivityState::OFFLINE,
        Some(latency) => ConnectivityState {
            is_online: true,
            is_slow_connection: latency > slow_threshold,
        },
    }
}

/// Shared handle type used by the orchestrator and facade.
pub type SharedConnectivity = Arc<dyn ConnectivityObserver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_probe() {
        let threshold = Duration::from_millis(2000);

        assert_eq!(evaluate_probe(None, threshold), ConnectivityState::OFFLINE);
        assert_eq!(
            evaluate_probe(Some(Duration::from_millis(120)), threshold),
            ConnectivityState::ONLINE
        );
        assert_eq!(
            evaluate_probe(Some(Duration::from_millis(3500)), threshold),
            ConnectivityState {
                is_online: true,
                is_slow_connection: true
            }
        );
    }

    #[tokio::test]
    async fn test_manual_connectivity_notifies_subscribers() {
        let connectivity = ManualConnectivity::new(ConnectivityState::OFFLINE);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_online);

        connectivity.set_slow(true);
        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow_and_update(),
            ConnectivityState {
                is_online: true,
                is_slow_connection: true
            }
        );

        // Going offline clears the slow flag
        connectivity.set_online(false);
        assert_eq!(connectivity.current(), ConnectivityState::OFFLINE);
    }

    fn settings_for(url: String) -> ConnectivitySettings {
        ConnectivitySettings {
            probe_url: Some(url),
            probe_interval_secs: 60,
            probe_timeout_secs: 2,
            ..ConnectivitySettings::default()
        }
    }

    #[tokio::test]
    async fn test_ready_reports_a_reachable_server_online() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            use std::io::{Read, Write};
            for stream in listener.incoming().take(1) {
                let mut stream = stream.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        });

        let connectivity = ProbeConnectivity::spawn(&settings_for(format!("http://{addr}/health")))
            .unwrap();
        assert!(!connectivity.current().is_online);

        connectivity.ready().await;
        assert!(connectivity.is_ready());
        assert_eq!(connectivity.current(), ConnectivityState::ONLINE);
        connectivity.shutdown().await;
    }

    #[tokio::test]
    async fn test_ready_returns_when_nothing_answers() {
        // Bind then drop to get a port with no listener
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let connectivity = ProbeConnectivity::spawn(&settings_for(format!("http://{addr}/")))
            .unwrap();
        connectivity.ready().await;

        assert!(connectivity.is_ready());
        assert_eq!(connectivity.current(), ConnectivityState::OFFLINE);
        connectivity.shutdown().await;
    }

    #[test]
    fn test_probe_requires_url() {
        let settings = ConnectivitySettings::default();
        assert!(matches!(
            ProbeConnectivity::spawn(&settings),
            Err(SyncError::InvalidConfig(_))
        ));
    }
}
