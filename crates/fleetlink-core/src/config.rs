//! Configuration system for the Fleetlink agent
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of every knob the sync engine depends on for correctness

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "FLEETLINK_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetlinkConfig {
    /// Agent process settings
    pub agent: AgentSettings,

    /// Fleet server connection settings
    pub fleet: FleetSettings,

    /// Sync cycle settings
    pub sync: SyncSettings,

    /// Local record storage settings
    pub storage: StorageSettings,

    /// Check-in settings
    pub heartbeat: HeartbeatSettings,

    /// Credential vault settings
    pub vault: VaultSettings,
}

/// Agent process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Log format: text, json
    pub log_format: String,

    /// Directory holding the record database and the encrypted vault
    pub data_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            data_dir: None,
        }
    }
}

/// Fleet server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Base URL of the fleet API
    pub url: String,

    /// Enrollment token, supplied once out-of-band
    pub enrollment_token: Option<String>,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Require the server to report HEALTHY before enrolling
    pub check_server_health: bool,

    /// Verify the server's TLS certificate
    pub verify_tls: bool,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            url: "https://localhost:8220".to_string(),
            enrollment_token: None,
            request_timeout_ms: 30_000,
            check_server_health: true,
            verify_tls: true,
        }
    }
}

/// Sync cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Max records per ingest batch
    pub batch_max_records: usize,

    /// Max payload bytes per ingest batch
    pub batch_max_bytes: usize,

    /// Requeues a record may take before it is dropped as failed
    pub max_attempts: u32,

    /// Wall-clock budget of one sync cycle in milliseconds
    pub cycle_max_duration_ms: u64,

    /// Batch budget of one sync cycle
    pub cycle_max_batches: u32,

    /// Interval between periodic sync cycles in seconds
    pub interval_secs: u64,

    /// First retry delay in milliseconds
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds
    pub backoff_max_ms: u64,

    /// Relative jitter applied to retry delays (0.2 = ±20%)
    pub backoff_jitter: f64,

    /// Age after which a held sync lease is considered abandoned
    pub lease_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_max_records: 500,
            batch_max_bytes: 1024 * 1024,
            max_attempts: 10,
            cycle_max_duration_ms: 60_000,
            cycle_max_batches: 20,
            interval_secs: 60,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_jitter: 0.2,
            lease_timeout_secs: 600,
        }
    }
}

/// Local record storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Max unsent records buffered before appends are refused (0 = unbounded)
    pub max_pending_records: usize,

    /// How long acknowledged records are kept for audit (0 = delete on compaction)
    pub ack_retention_secs: u64,

    /// How long failed records are kept for diagnostics
    pub failed_retention_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            max_pending_records: 1_000_000,
            ack_retention_secs: 0,
            failed_retention_secs: 7 * 24 * 3600,
        }
    }
}

/// Check-in settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Send periodic check-ins while running as a daemon
    pub enabled: bool,

    /// Interval between check-ins in seconds
    pub interval_secs: u64,

    /// Consecutive failures before escalating to error logs
    pub max_failures: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            max_failures: 5,
        }
    }
}

/// Secure storage backend for device credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultBackend {
    /// OS keychain / secret service
    Keychain,
    /// Passphrase-encrypted file in the data directory
    EncryptedFile,
}

impl std::str::FromStr for VaultBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keychain" => Ok(VaultBackend::Keychain),
            "encrypted_file" | "encrypted-file" | "file" => Ok(VaultBackend::EncryptedFile),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid vault backend: {}. Must be one of: [\"keychain\", \"encrypted_file\"]",
                other
            ))),
        }
    }
}

/// Credential vault settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Storage backend
    pub backend: VaultBackend,

    /// Vault file path (encrypted_file backend)
    pub path: Option<PathBuf>,

    /// Environment variable holding the vault passphrase (encrypted_file backend)
    pub passphrase_env: String,

    /// Keychain service name (keychain backend)
    pub keychain_service: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            backend: VaultBackend::EncryptedFile,
            path: None,
            passphrase_env: "FLEETLINK_VAULT_PASSPHRASE".to_string(),
            keychain_service: "fleetlink".to_string(),
        }
    }
}

impl FleetlinkConfig {
    /// Directory holding agent state
    pub fn data_dir(&self) -> PathBuf {
        self.agent
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("fleetlink")))
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleetlink"))
    }

    /// Path of the SQLite record database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("fleetlink.db")
    }

    /// Path of the encrypted vault file
    pub fn vault_path(&self) -> PathBuf {
        self.vault
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("vault").join("credentials.enc"))
    }
}

impl FleetSettings {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SyncSettings {
    /// Get cycle duration budget as Duration
    pub fn cycle_max_duration(&self) -> Duration {
        Duration::from_millis(self.cycle_max_duration_ms)
    }

    /// Get sync interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Get base backoff as Duration
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Get backoff cap as Duration
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Get lease timeout as Duration
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

impl StorageSettings {
    /// Get ack retention as Duration
    pub fn ack_retention(&self) -> Duration {
        Duration::from_secs(self.ack_retention_secs)
    }

    /// Get failed-record retention as Duration
    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }
}

impl HeartbeatSettings {
    /// Get check-in interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Lookup of a single environment variable
type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,

    /// Source of `FLEETLINK_*` variables, the process environment by default
    env: EnvLookup,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            cli_path: None,
            env: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Read variables from `lookup` instead of the process environment
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    fn var(&self, key: &str) -> Option<String> {
        (self.env)(key)
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. FLEETLINK_CONFIG environment variable
    /// 3. ~/.config/fleetlink/config.toml
    /// 4. /etc/fleetlink/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<FleetlinkConfig> {
        let config_path = self.find_config_file()?;

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            FleetlinkConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    ///
    /// An explicit CLI path that does not exist is an error; discovered
    /// locations are simply skipped.
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Some(env_path) = self.var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("{} path does not exist: {}", CONFIG_ENV, env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("fleetlink").join("config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/fleetlink/config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<FleetlinkConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetlinkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut FleetlinkConfig) {
        // Agent settings
        if let Some(val) = self.var("FLEETLINK_LOG_LEVEL") {
            config.agent.log_level = val;
        }
        if let Some(val) = self.var("FLEETLINK_LOG_FORMAT") {
            config.agent.log_format = val;
        }
        if let Some(val) = self.var("FLEETLINK_DATA_DIR") {
            config.agent.data_dir = Some(PathBuf::from(val));
        }

        // Fleet settings
        if let Some(val) = self.var("FLEETLINK_FLEET_URL") {
            config.fleet.url = val;
        }
        if let Some(val) = self.var("FLEETLINK_ENROLLMENT_TOKEN") {
            config.fleet.enrollment_token = Some(val);
        }
        if let Some(val) = self.var("FLEETLINK_VERIFY_TLS") {
            config.fleet.verify_tls = val.parse().unwrap_or(config.fleet.verify_tls);
        }

        // Sync settings
        if let Some(val) = self.var("FLEETLINK_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                config.sync.interval_secs = secs;
            }
        }
        if let Some(val) = self.var("FLEETLINK_BATCH_MAX_RECORDS") {
            if let Ok(n) = val.parse() {
                config.sync.batch_max_records = n;
            }
        }

        // Vault settings
        if let Some(val) = self.var("FLEETLINK_VAULT_BACKEND") {
            match val.parse() {
                Ok(backend) => config.vault.backend = backend,
                Err(e) => warn!("Ignoring FLEETLINK_VAULT_BACKEND: {}", e),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &FleetlinkConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.agent.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.agent.log_level, valid_levels
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&config.agent.log_format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                config.agent.log_format, valid_formats
            )));
        }

        let url = url::Url::parse(&config.fleet.url).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid fleet url {}: {}", config.fleet.url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::ValidationError(format!(
                "Fleet url must be http or https, got: {}",
                url.scheme()
            )));
        }

        if config.fleet.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "fleet.request_timeout_ms cannot be 0".to_string(),
            ));
        }

        let sync = &config.sync;
        if sync.batch_max_records == 0 || sync.batch_max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "Batch caps must be greater than 0".to_string(),
            ));
        }
        if sync.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "sync.max_attempts must be at least 1".to_string(),
            ));
        }
        if sync.backoff_base_ms > sync.backoff_max_ms {
            return Err(ConfigError::ValidationError(format!(
                "sync.backoff_base_ms ({}) exceeds sync.backoff_max_ms ({})",
                sync.backoff_base_ms, sync.backoff_max_ms
            )));
        }
        if !(0.0..1.0).contains(&sync.backoff_jitter) {
            return Err(ConfigError::ValidationError(format!(
                "sync.backoff_jitter must be in [0, 1), got {}",
                sync.backoff_jitter
            )));
        }
        if sync.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync.interval_secs cannot be 0".to_string(),
            ));
        }
        if sync.cycle_max_duration_ms == 0 || sync.cycle_max_batches == 0 {
            return Err(ConfigError::ValidationError(
                "Sync cycle budget cannot be 0".to_string(),
            ));
        }

        if config.storage.failed_retention_secs < config.storage.ack_retention_secs {
            return Err(ConfigError::ValidationError(
                "storage.failed_retention_secs must not be shorter than storage.ack_retention_secs"
                    .to_string(),
            ));
        }

        if config.heartbeat.enabled && config.heartbeat.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat.interval_secs cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &FleetlinkConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fleetlink").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .ok()
            .map(PathBuf::from)
    }

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(target_os = "windows"))]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| home_dir().map(|h| h.join(".config")))
        }
    }

    /// Get the user's data directory
    pub fn data_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            home_dir().map(|h| h.join("Library").join("Application Support"))
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| home_dir().map(|h| h.join(".local").join("share")))
        }
    }
}
