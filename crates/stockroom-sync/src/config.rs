//! # Sync Configuration
//!
//! Configuration management for the offline sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STOCKROOM_API_URL=https://api.example.com/v1                       │
//! │     STOCKROOM_MAX_RETRIES=8                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/stockroom-sync/sync.toml (Linux)                         │
//! │     ~/Library/Application Support/com.stockroom.sync/sync.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Dock scanner 2"
//!
//! [database]
//! path = "/var/lib/stockroom/queue.db"
//!
//! [remote]
//! base_url = "https://api.example.com/v1"
//! request_timeout_secs = 30
//!
//! [queue]
//! max_retries = 5
//! initial_backoff_ms = 1000
//! max_backoff_secs = 300
//!
//! [background]
//! enabled = true
//! periodic_interval_secs = 300
//! sync_on_slow_connection = false
//!
//! [connectivity]
//! probe_url = "https://api.example.com/health"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4), sent with every request.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Dock scanner 2").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Stockroom Client".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

/// Where the durable queue lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `queue.db` in the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// The REST API mutations are replayed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL; resources live at `{base_url}/{table}/{id}`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bound on every remote call (seconds). Expiry counts as transient.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bearer token used when a mutation carries no credential reference.
    /// Usually supplied through `STOCKROOM_API_TOKEN` rather than the file.
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            api_token: None,
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Retry behavior of the queue manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Failed attempts before an entry is marked `failed`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound of the backoff delay (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    300
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Background Settings
// =============================================================================

/// When the orchestrator flushes on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSettings {
    /// Run the background orchestrator at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Periodic flush interval (seconds).
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,

    /// Let periodic and platform triggers run on a slow connection.
    /// Manual and reconnect triggers always run.
    #[serde(default)]
    pub sync_on_slow_connection: bool,

    /// Flush once right after start when online.
    #[serde(default = "default_true")]
    pub sync_on_start: bool,
}

fn default_true() -> bool {
    true
}

fn default_periodic_interval() -> u64 {
    300
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        BackgroundSettings {
            enabled: true,
            periodic_interval_secs: default_periodic_interval(),
            sync_on_slow_connection: false,
            sync_on_start: true,
        }
    }
}

impl BackgroundSettings {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }
}

// =============================================================================
// Connectivity Settings
// =============================================================================

/// Reachability probing. Without a probe URL the application reports
/// connectivity itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    #[serde(default)]
    pub probe_url: Option<String>,

    /// Interval between probes (seconds).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Probe timeout (seconds). A timed out probe means offline.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Round trips slower than this mark the connection as slow (milliseconds).
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_ms: u64,
}

fn default_probe_interval() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_slow_threshold() -> u64 {
    2000
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        ConnectivitySettings {
            probe_url: None,
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            slow_threshold_ms: default_slow_threshold(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub background: BackgroundSettings,

    #[serde(default)]
    pub connectivity: ConnectivitySettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file. The API token is never written.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if let Some(ref url) = self.remote.base_url {
            validate_http_url("remote.base_url", url)?;
        }

        if let Some(ref url) = self.connectivity.probe_url {
            validate_http_url("connectivity.probe_url", url)?;
        }

        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "remote.request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.queue.max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.max_retries must be greater than 0".into(),
            ));
        }

        if self.queue.initial_backoff_ms > self.queue.max_backoff_secs.saturating_mul(1000) {
            return Err(SyncError::InvalidConfig(
                "queue.initial_backoff_ms must not exceed queue.max_backoff_secs".into(),
            ));
        }

        if self.background.periodic_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "background.periodic_interval_secs must be greater than 0".into(),
            ));
        }

        if self.connectivity.probe_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connectivity.probe_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `STOCKROOM_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup; the environment in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("STOCKROOM_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("STOCKROOM_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(path) = lookup("STOCKROOM_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(url) = lookup("STOCKROOM_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.remote.base_url = Some(url);
        }

        if let Some(token) = lookup("STOCKROOM_API_TOKEN") {
            self.remote.api_token = Some(token);
        }

        if let Some(secs) = lookup("STOCKROOM_REQUEST_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.remote.request_timeout_secs = secs,
                Err(_) => warn!(value = %secs, "Ignoring invalid STOCKROOM_REQUEST_TIMEOUT_SECS"),
            }
        }

        if let Some(retries) = lookup("STOCKROOM_MAX_RETRIES") {
            match retries.parse() {
                Ok(retries) => self.queue.max_retries = retries,
                Err(_) => warn!(value = %retries, "Ignoring invalid STOCKROOM_MAX_RETRIES"),
            }
        }

        if let Some(secs) = lookup("STOCKROOM_SYNC_INTERVAL_SECS") {
            match secs.parse() {
                Ok(secs) => self.background.periodic_interval_secs = secs,
                Err(_) => warn!(value = %secs, "Ignoring invalid STOCKROOM_SYNC_INTERVAL_SECS"),
            }
        }

        if let Some(flag) = lookup("STOCKROOM_SYNC_ON_SLOW") {
            match parse_flag(&flag) {
                Some(flag) => self.background.sync_on_slow_connection = flag,
                None => warn!(value = %flag, "Ignoring invalid STOCKROOM_SYNC_ON_SLOW"),
            }
        }

        if let Some(url) = lookup("STOCKROOM_PROBE_URL") {
            self.connectivity.probe_url = Some(url);
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "stockroom", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Configured database file, or `queue.db` in the platform data directory.
    pub fn database_path(&self) -> SyncResult<PathBuf> {
        if let Some(ref path) = self.database.path {
            return Ok(path.clone());
        }

        directories::ProjectDirs::from("com", "stockroom", "sync")
            .map(|dirs| dirs.data_dir().join("queue.db"))
            .ok_or_else(|| SyncError::InvalidConfig("No data directory available".into()))
    }

    /// Parsed remote base URL.
    pub fn base_url(&self) -> SyncResult<Url> {
        let raw = self
            .remote
            .base_url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("remote.base_url is not set".into()))?;
        Ok(Url::parse(raw)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.queue)
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }
}

fn validate_http_url(field: &str, raw: &str) -> SyncResult<()> {
    let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{field}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(SyncError::InvalidUrl(format!(
            "{field} must start with http:// or https://, got: {raw}"
        )));
    }
    if url.cannot_be_a_base() {
        return Err(SyncError::InvalidUrl(format!("{field} cannot be a base URL: {raw}")));
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.initial_backoff_ms, 1000);
        assert_eq!(config.queue.max_backoff_secs, 300);
        assert_eq!(config.background.periodic_interval_secs, 300);
        assert_eq!(config.remote.request_timeout_secs, 30);
        assert!(!config.background.sync_on_slow_connection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(config.validate().is_err());

        config.device.id = "dock-2".to_string();
        config.remote.base_url = Some("ftp://files.example.com".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.remote.base_url = Some("https://api.example.com/v1".to_string());
        assert!(config.validate().is_ok());

        config.queue.max_retries = 0;
        assert!(config.validate().is_err());
        config.queue.max_retries = 5;

        config.background.periodic_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "dock-2"

            [remote]
            base_url = "https://api.example.com/v1"

            [queue]
            max_retries = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.device.name, "Stockroom Client");
        assert_eq!(config.queue.max_retries, 8);
        assert_eq!(config.queue.max_backoff_secs, 300);
        assert!(config.background.enabled);
        assert_eq!(
            config.base_url().unwrap().as_str(),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("STOCKROOM_API_URL", "http://localhost:8080/api"),
            ("STOCKROOM_API_TOKEN", "secret"),
            ("STOCKROOM_MAX_RETRIES", "9"),
            ("STOCKROOM_SYNC_ON_SLOW", "yes"),
            ("STOCKROOM_SYNC_INTERVAL_SECS", "not-a-number"),
        ]);

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.remote.base_url.as_deref(),
            Some("http://localhost:8080/api")
        );
        assert_eq!(config.remote.api_token.as_deref(), Some("secret"));
        assert_eq!(config.queue.max_retries, 9);
        assert!(config.background.sync_on_slow_connection);
        // Invalid values are ignored
        assert_eq!(config.background.periodic_interval_secs, 300);
    }

    #[test]
    fn test_token_is_never_serialized() {
        let mut config = SyncConfig::default();
        config.remote.api_token = Some("secret".into());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[queue]"));
        assert!(!toml_str.contains("secret"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("stockroom-config-{}", Uuid::new_v4()));
        let path = dir.join("sync.toml");

        let mut config = SyncConfig::default();
        config.queue.max_retries = 3;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert_eq!(loaded.queue.max_retries, 3);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
