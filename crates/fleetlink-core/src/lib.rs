//! Fleetlink Core - configuration shared by the agent crates
//!
//! - **Config**: TOML schema, file discovery, environment overrides and validation

pub mod config;

// Re-export commonly used types
pub use config::{
    AgentSettings, ConfigError, ConfigLoader, ConfigResult, FleetSettings, FleetlinkConfig,
    HeartbeatSettings, StorageSettings, SyncSettings, VaultBackend, VaultSettings,
};

/// Agent version
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
