//! Fleetlink Sync - durable enrollment and telemetry delivery
//!
//! This crate keeps a device enrolled with a fleet server and ships locally
//! buffered telemetry to it with at-least-once delivery.
//!
//! ## Features
//!
//! - **Credential Vault** - API key encrypted at rest (OS keychain or passphrase file)
//! - **Enrollment** - Persisted state machine that survives crashes mid-enrollment
//! - **Event Store** - SQLite record queue with a single in-flight batch
//! - **Sync Engine** - Budgeted delivery cycles with classified retries and backoff
//! - **Scheduler Adapter** - Non-reentrant entry point for periodic host wake-ups
//! - **Heartbeat** - Periodic check-ins that acknowledge and carry out server actions
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleetlink_core::FleetlinkConfig;
//! use fleetlink_sync::{Agent, SyncBudget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FleetlinkConfig::default();
//!     let agent = Agent::open(&config)?;
//!
//!     agent.enrollment().enroll("enrollment-token").await?;
//!     agent.events().append(br#"{"message":"hello"}"#)?;
//!
//!     let report = agent
//!         .engine()
//!         .run_cycle(SyncBudget::from_settings(&config.sync))
//!         .await?;
//!     println!("{}", report.outcome);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod backoff;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod heartbeat;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;
pub mod vault;

// Re-exports for convenience
pub use agent::Agent;
pub use backoff::{Backoff, BackoffPolicy};
pub use engine::{CycleOutcome, SyncBudget, SyncEngine, SyncEngineConfig, SyncReport};
pub use enrollment::{EnrollmentConfig, EnrollmentManager, EnrollmentResult};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use heartbeat::{HeartbeatConfig, HeartbeatService, HeartbeatStats};
pub use scheduler::{SchedulerAdapter, SchedulerConfig, WakeOutcome};
pub use store::{
    AgentStats, AppliedPolicy, Database, EnrollmentState, EnrollmentStatus, EventStore,
    EventStoreConfig, PolicyStore, StoreCounts, TelemetryRecord,
};
pub use transport::{HttpTransport, MockTransport, Transport, TransportError};
pub use types::{AgentHealth, DeviceIdentity, PolicySettings, ServerAction};
pub use vault::{CredentialVault, EncryptedFileVault, KeychainVault, MemoryVault};
