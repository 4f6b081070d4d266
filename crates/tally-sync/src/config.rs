//! # Core Configuration
//!
//! Configuration for the consistency core of one device process.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_REMOTE_MODE=postgres                                         │
//! │     TALLY_STORE_ID=store-001                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/tally.toml (Linux)                             │
//! │     ~/Library/Application Support/com.tally.pos/tally.toml (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     offline remote, auto-generated device id, no store override        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # tally.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [tenant]
//! store_id = "store-001"    # optional; the device session is used otherwise
//! cache_ttl_secs = 300
//!
//! [remote]
//! mode = "postgres"         # postgres | memory | offline
//! url = "postgres://tally@db.example.com/tally"
//! request_timeout_secs = 10
//! allow_best_effort_sales = false
//!
//! [queue]
//! max_attempts = 5
//! batch_size = 100
//!
//! [agent]
//! interval_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Remote Mode
// =============================================================================

/// Which `RemoteClient` implementation the process talks to.
///
/// Chosen once at startup; the backend is never re-detected later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMode {
    /// Hosted Postgres with the atomic sale procedures installed.
    Postgres,

    /// In-process store. Demo wiring and tests.
    Memory,

    /// No remote at all: every call fails as a network error, so writes
    /// queue locally.
    #[default]
    Offline,
}

impl RemoteMode {
    pub fn is_remote_enabled(&self) -> bool {
        !matches!(self, RemoteMode::Offline)
    }
}

impl std::fmt::Display for RemoteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteMode::Postgres => write!(f, "postgres"),
            RemoteMode::Memory => write!(f, "memory"),
            RemoteMode::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for RemoteMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(RemoteMode::Postgres),
            "memory" | "mem" => Ok(RemoteMode::Memory),
            "offline" | "disabled" | "none" => Ok(RemoteMode::Offline),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown remote mode: '{}'. Valid options: postgres, memory, offline",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1", "Back Office").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
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
// Tenant Settings
// =============================================================================

/// Tenant resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Explicit store id. When set, it wins over the device session.
    #[serde(default)]
    pub store_id: Option<String>,

    /// How long a resolved tenant is reused before resolving again.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl() -> u64 {
    300
}

impl Default for TenantSettings {
    fn default() -> Self {
        TenantSettings {
            store_id: None,
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Remote store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub mode: RemoteMode,

    /// Connection URL, required in `postgres` mode.
    #[serde(default)]
    pub url: Option<String>,

    /// Upper bound on every remote call (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Allows the non-atomic sale path when the remote lacks the atomic
    /// procedure. Concurrent devices can oversell in that mode.
    #[serde(default)]
    pub allow_best_effort_sales: bool,

    #[serde(default = "default_remote_connections")]
    pub max_connections: u32,
}

fn default_request_timeout() -> u64 {
    10
}

fn default_remote_connections() -> u32 {
    4
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            mode: RemoteMode::default(),
            url: None,
            request_timeout_secs: default_request_timeout(),
            allow_best_effort_sales: false,
            max_connections: default_remote_connections(),
        }
    }
}

impl RemoteSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Sync queue drain behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Failed deliveries before an entry turns terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Entries read per drain pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Ceiling for the retry delay (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Age after which another process may steal a claim (seconds).
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_batch_size() -> u32 {
    100
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    300
}
fn default_claim_ttl() -> u64 {
    120
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            claim_ttl_secs: default_claim_ttl(),
        }
    }
}

// =============================================================================
// Agent Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Seconds between background push/pull cycles.
    #[serde(default = "default_agent_interval")]
    pub interval_secs: u64,
}

fn default_agent_interval() -> u64 {
    30
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            interval_secs: default_agent_interval(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub tenant: TenantSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub agent: AgentSettings,
}

impl CoreConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
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
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if self.queue.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.batch_size must be greater than 0".into(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.max_attempts must be greater than 0".into(),
            ));
        }

        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "remote.request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.remote.mode == RemoteMode::Postgres {
            let raw = self.remote.url.as_deref().ok_or_else(|| {
                SyncError::InvalidConfig("remote.url is required in postgres mode".into())
            })?;
            let url = Url::parse(raw)?;
            if !matches!(url.scheme(), "postgres" | "postgresql") {
                return Err(SyncError::InvalidConfig(format!(
                    "remote.url must start with postgres:// or postgresql://, got scheme '{}'",
                    url.scheme()
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(store_id) = lookup("TALLY_STORE_ID") {
            debug!(store_id = %store_id, "Overriding store ID from environment");
            self.tenant.store_id = Some(store_id).filter(|s| !s.trim().is_empty());
        }

        if let Some(url) = lookup("TALLY_REMOTE_URL") {
            self.remote.url = Some(url);
        }

        if let Some(mode) = lookup("TALLY_REMOTE_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding remote mode from environment");
                    self.remote.mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown remote mode in environment"),
            }
        }

        if let Some(attempts) = lookup("TALLY_MAX_ATTEMPTS") {
            if let Ok(n) = attempts.parse::<u32>() {
                self.queue.max_attempts = n;
            }
        }

        if let Some(flag) = lookup("TALLY_ALLOW_BEST_EFFORT") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.remote.allow_best_effort_sales = true,
                "0" | "false" | "no" | "off" => self.remote.allow_best_effort_sales = false,
                _ => warn!(value = %flag, "Unknown TALLY_ALLOW_BEST_EFFORT value"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Explicit store override, if configured.
    pub fn store_id(&self) -> Option<&str> {
        self.tenant.store_id.as_deref()
    }

    pub fn remote_mode(&self) -> RemoteMode {
        self.remote.mode
    }

    pub fn agent_interval(&self) -> Duration {
        Duration::from_secs(self.agent.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_remote_mode_parsing() {
        assert_eq!("postgres".parse::<RemoteMode>().unwrap(), RemoteMode::Postgres);
        assert_eq!("PG".parse::<RemoteMode>().unwrap(), RemoteMode::Postgres);
        assert_eq!("memory".parse::<RemoteMode>().unwrap(), RemoteMode::Memory);
        assert_eq!("offline".parse::<RemoteMode>().unwrap(), RemoteMode::Offline);
        assert!("supabase".parse::<RemoteMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.remote.mode, RemoteMode::Offline);
        assert_eq!(config.tenant.cache_ttl_secs, 300);
        assert!(!config.remote.allow_best_effort_sales);
        assert!(config.store_id().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CoreConfig::default();
        assert!(config.validate().is_ok());

        config.device.id = "  ".to_string();
        assert!(config.validate().is_err());
        config.device.id = "till-1".to_string();

        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
        config.queue.max_attempts = 3;

        config.remote.mode = RemoteMode::Postgres;
        assert!(config.validate().is_err());

        config.remote.url = Some("http://db.example.com".to_string());
        assert!(config.validate().is_err());

        config.remote.url = Some("postgres://tally@localhost/tally".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TALLY_STORE_ID", "store-9"),
            ("TALLY_REMOTE_MODE", "memory"),
            ("TALLY_MAX_ATTEMPTS", "7"),
            ("TALLY_ALLOW_BEST_EFFORT", "yes"),
        ]
        .into_iter()
        .collect();

        let mut config = CoreConfig::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.store_id(), Some("store-9"));
        assert_eq!(config.remote.mode, RemoteMode::Memory);
        assert_eq!(config.queue.max_attempts, 7);
        assert!(config.remote.allow_best_effort_sales);
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = r#"
            [device]
            id = "till-1"

            [remote]
            mode = "postgres"
            url = "postgresql://localhost/tally"
        "#;
        let config: CoreConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.name, "POS Terminal");
        assert_eq!(config.remote.mode, RemoteMode::Postgres);
        assert_eq!(config.queue.batch_size, 100);
        assert!(config.validate().is_ok());

        let written = toml::to_string_pretty(&config).unwrap();
        assert!(written.contains("[queue]"));
    }
}
