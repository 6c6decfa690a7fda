//! # Sync Configuration
//!
//! Configuration management for the sync orchestrator.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     KEEL_SYNC_MODE=offline                                             │
//! │     KEEL_DEVICE_ID=abc-123                                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/keel/sync.toml (Linux)                                   │
//! │     ~/Library/Application Support/com.keel.keel/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     SyncMode::Bidirectional, auto-generated device_id                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Laptop"
//!
//! [sync]
//! mode = "bidirectional"  # bidirectional | offline
//! poll_interval_ms = 1000
//! batch_size = 100
//! sync_page_size = 100
//! max_push_attempts = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Mode
// =============================================================================

/// The synchronization mode for this device.
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                        Sync Mode Behavior                               │
/// │                                                                         │
/// │  BIDIRECTIONAL (Default)                                               │
/// │  ───────────────────────                                               │
/// │  • Pushes local changes to the remote                                  │
/// │  • Subscribes to remote changes for every registered model             │
/// │  • Runs a catch-up pass on start                                       │
/// │                                                                         │
/// │  OFFLINE                                                               │
/// │  ───────                                                               │
/// │  • Sync disabled completely                                            │
/// │  • Local operations only; changes stay pending                         │
/// │  • Use for testing or isolated mode                                    │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Bidirectional,

    /// Sync disabled - offline mode only.
    Offline,
}

impl SyncMode {
    /// Returns true if sync is enabled at all.
    pub fn is_sync_enabled(&self) -> bool {
        !matches!(self, SyncMode::Offline)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Bidirectional => write!(f, "bidirectional"),
            SyncMode::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bidirectional" | "online" | "enabled" => Ok(SyncMode::Bidirectional),
            "offline" | "disabled" => Ok(SyncMode::Offline),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync mode: '{}'. Valid options: bidirectional, offline",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Keel Device".to_string()
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
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Sync mode for this device.
    #[serde(default)]
    pub mode: SyncMode,

    /// Interval between outbound poll cycles (milliseconds). Local changes
    /// also wake the outbound processor directly.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Number of pending changes read per outbound pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Page size for catch-up queries.
    #[serde(default = "default_page_size")]
    pub sync_page_size: u32,

    /// Push attempts per change and pass before the change is deferred.
    #[serde(default = "default_max_push_attempts")]
    pub max_push_attempts: u32,

    /// Initial backoff duration (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// How long `stop()` waits for in-flight pushes (milliseconds).
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// A delta catch-up becomes a full one when the last full pass is older
    /// than this (minutes).
    #[serde(default = "default_full_sync_interval")]
    pub full_sync_interval_mins: u64,

    /// Capacity of the sync event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_batch_size() -> u32 {
    100
}

fn default_page_size() -> u32 {
    100
}

fn default_max_push_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_drain_timeout() -> u64 {
    5_000
}

fn default_full_sync_interval() -> u64 {
    24 * 60
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            mode: SyncMode::default(),
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            sync_page_size: default_page_size(),
            max_push_attempts: default_max_push_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            drain_timeout_ms: default_drain_timeout(),
            full_sync_interval_mins: default_full_sync_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,
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

    /// Saves configuration to file.
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
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let sync = &self.sync;
        if sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if sync.sync_page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_page_size must be greater than 0".into(),
            ));
        }
        if sync.max_push_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_push_attempts must be greater than 0".into(),
            ));
        }
        if sync.poll_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }
        if sync.initial_backoff_ms > sync.max_backoff_ms {
            return Err(SyncError::InvalidConfig(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                sync.initial_backoff_ms, sync.max_backoff_ms
            )));
        }
        if sync.event_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "event_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("KEEL_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(mode) = std::env::var("KEEL_SYNC_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding sync mode from environment");
                    self.sync.mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown sync mode in environment"),
            }
        }

        if let Ok(size) = std::env::var("KEEL_SYNC_PAGE_SIZE") {
            if let Ok(n) = size.parse::<u32>() {
                debug!(page_size = n, "Overriding sync page size from environment");
                self.sync.sync_page_size = n;
            }
        }

        if let Ok(attempts) = std::env::var("KEEL_MAX_PUSH_ATTEMPTS") {
            if let Ok(n) = attempts.parse::<u32>() {
                debug!(attempts = n, "Overriding max push attempts from environment");
                self.sync.max_push_attempts = n;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "keel", "keel").map(|dirs| {
            let config_dir = dirs.config_dir();
            config_dir.join("sync.toml")
        })
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the sync mode.
    pub fn mode(&self) -> SyncMode {
        self.sync.mode
    }

    /// Returns true if sync is enabled.
    pub fn is_sync_enabled(&self) -> bool {
        self.sync.mode.is_sync_enabled()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.poll_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.max_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.drain_timeout_ms)
    }

    pub fn full_sync_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.sync.full_sync_interval_mins as i64)
    }
}
