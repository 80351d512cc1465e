//! Wiring of the agent components around one database

use crate::engine::{SyncEngine, SyncEngineConfig};
use crate::enrollment::{EnrollmentConfig, EnrollmentManager};
use crate::error::SyncResult;
use crate::heartbeat::{HeartbeatConfig, HeartbeatService};
use crate::scheduler::{SchedulerAdapter, SchedulerConfig};
use crate::store::{AgentStatsStore, Database, EventStore, EventStoreConfig};
use crate::transport::{HttpTransport, Transport};
use crate::vault::{self, CredentialVault};
use fleetlink_core::FleetlinkConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// A fully wired agent
pub struct Agent {
    database: Database,
    events: EventStore,
    enrollment: Arc<EnrollmentManager>,
    engine: Arc<SyncEngine>,
    scheduler: Arc<SchedulerAdapter>,
    heartbeat: Arc<HeartbeatService>,
}

impl Agent {
    /// Open the database, vault and HTTP transport named by `config`
    pub fn open(config: &FleetlinkConfig) -> SyncResult<Self> {
        let database = Database::open(&config.database_path())?;
        let vault = vault::from_config(config)?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            &config.fleet.url,
            config.fleet.request_timeout(),
            config.fleet.verify_tls,
        )?);

        Self::with_parts(config, database, vault, transport)
    }

    /// Build an agent from already constructed parts.
    ///
    /// Runs startup recovery: batches left in flight by a crashed process
    /// return to the queue and an interrupted enrollment becomes retryable.
    /// The last policy received from the server is applied again.
    pub fn with_parts(
        config: &FleetlinkConfig,
        database: Database,
        vault: Arc<dyn CredentialVault>,
        transport: Arc<dyn Transport>,
    ) -> SyncResult<Self> {
        let events = database.events(EventStoreConfig::from_config(config));
        let stats: AgentStatsStore = database.agent_stats();

        let enrollment = Arc::new(EnrollmentManager::new(
            database.enrollment(),
            vault,
            transport.clone(),
            EnrollmentConfig {
                check_server_health: config.fleet.check_server_health,
                ..Default::default()
            },
        ));

        let recovered = events.recover_in_flight()?;
        if recovered > 0 {
            warn!("Recovered {} in-flight records from a previous run", recovered);
        }
        enrollment.recover_interrupted()?;

        let engine = Arc::new(SyncEngine::new(
            events.clone(),
            enrollment.clone(),
            transport.clone(),
            stats.clone(),
            SyncEngineConfig::from_settings(&config.sync),
        ));
        let scheduler = Arc::new(SchedulerAdapter::new(
            engine.clone(),
            SchedulerConfig::from_settings(&config.sync),
        ));
        let heartbeat = Arc::new(
            HeartbeatService::new(
                enrollment.clone(),
                transport,
                events.clone(),
                stats,
                HeartbeatConfig::from_settings(&config.heartbeat),
            )
            .with_scheduler(scheduler.clone())
            .with_policy_store(database.policy()),
        );

        if let Some(policy) = database.policy().load()? {
            info!(
                "Applying stored policy {}",
                policy.policy_id.as_deref().unwrap_or("(unnamed)")
            );
            heartbeat.apply_policy(&policy.settings);
        }

        info!(
            "Agent ready, enrolled: {}",
            enrollment.is_enrolled()
        );

        Ok(Self {
            database,
            events,
            enrollment,
            engine,
            scheduler,
            heartbeat,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn enrollment(&self) -> &Arc<EnrollmentManager> {
        &self.enrollment
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<SchedulerAdapter> {
        &self.scheduler
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatService> {
        &self.heartbeat
    }
}
