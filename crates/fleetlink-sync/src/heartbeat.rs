//! Heartbeat service for periodic check-ins
//!
//! Sends regular check-ins to the fleet server to report agent health and
//! queue depth, and carries out the actions the server sends back.
//!
//! Actions that carry an id are acknowledged before they are applied.
//! Policy settings re-tune the check-in interval, the sync interval and the
//! engine's batching and backoff.

use crate::engine::cancelled;
use crate::enrollment::EnrollmentManager;
use crate::error::{ErrorClass, SyncResult};
use crate::scheduler::SchedulerAdapter;
use crate::store::{AgentStatsStore, EventStore, PolicyStore};
use crate::transport::{Transport, TransportError};
use crate::types::{
    AckRequest, AgentHealth, AgentMetadata, CheckinStats, DeviceCredentials, HeartbeatRequest,
    HeartbeatResponse, PolicySettings, ServerAction,
};
use fleetlink_core::HeartbeatSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Heartbeat service configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats
    pub interval: Duration,

    /// Max consecutive failures before alerting
    pub max_failures: u32,

    /// Metadata reported with each check-in
    pub metadata: AgentMetadata,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_failures: 5,
            metadata: AgentMetadata::default(),
        }
    }
}

impl HeartbeatConfig {
    pub fn from_settings(settings: &HeartbeatSettings) -> Self {
        Self {
            interval: settings.interval(),
            max_failures: settings.max_failures,
            ..Default::default()
        }
    }
}

/// Heartbeat service
pub struct HeartbeatService {
    enrollment: Arc<EnrollmentManager>,
    transport: Arc<dyn Transport>,
    events: EventStore,
    agent_stats: AgentStatsStore,
    config: HeartbeatConfig,
    scheduler: Option<Arc<SchedulerAdapter>>,
    policy_store: Option<PolicyStore>,

    // State
    interval_ms: AtomicU64,
    ack_token: RwLock<Option<String>>,
    last_heartbeat: RwLock<Option<Instant>>,
    consecutive_failures: AtomicU64,
    total_sent: AtomicU64,
    total_failed: AtomicU64,
}

impl HeartbeatService {
    pub fn new(
        enrollment: Arc<EnrollmentManager>,
        transport: Arc<dyn Transport>,
        events: EventStore,
        agent_stats: AgentStatsStore,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            enrollment,
            transport,
            events,
            agent_stats,
            interval_ms: AtomicU64::new(config.interval.as_millis() as u64),
            config,
            scheduler: None,
            policy_store: None,
            ack_token: RwLock::new(None),
            last_heartbeat: RwLock::new(None),
            consecutive_failures: AtomicU64::new(0),
            total_sent: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    /// Forward policy settings to the sync scheduler
    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerAdapter>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Persist applied policies here
    pub fn with_policy_store(mut self, store: PolicyStore) -> Self {
        self.policy_store = Some(store);
        self
    }

    /// Current check-in interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Apply policy settings to the check-in loop and the sync scheduler
    pub fn apply_policy(&self, settings: &PolicySettings) {
        if let Some(interval) = settings.checkin_interval() {
            self.interval_ms
                .store(interval.as_millis() as u64, Ordering::Relaxed);
            info!("Check-in interval set to {:?}", interval);
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.apply_policy(settings);
        }
    }

    async fn build_request(&self) -> SyncResult<HeartbeatRequest> {
        let counts = self.events.counts()?;
        let stats = self.agent_stats.load()?;

        let message = match stats.agent_health {
            AgentHealth::Healthy => "Healthy".to_string(),
            AgentHealth::Unhealthy => format!(
                "Unhealthy: last sync {}",
                stats.last_sync_outcome.as_deref().unwrap_or("unknown")
            ),
        };

        Ok(HeartbeatRequest {
            status: "online".to_string(),
            ack_token: self.ack_token.read().await.clone(),
            message,
            local_metadata: self.config.metadata.clone(),
            stats: CheckinStats {
                agent_health: stats.agent_health,
                buffered_records: counts.unsent(),
                failed_records: counts.failed,
                total_checkins: stats.total_checkins,
                total_failures: stats.total_failures,
                last_sent_at: stats.last_sent_at,
                last_sent_count: stats.last_sent_count,
            },
        })
    }

    /// Send a single heartbeat
    pub async fn send_heartbeat(&self) -> SyncResult<HeartbeatResponse> {
        let creds = self.enrollment.credentials()?;
        let request = self.build_request().await?;

        debug!("Sending heartbeat for device {}", creds.device_id);

        let response = match self
            .transport
            .heartbeat(&creds.device_id, &creds.api_key, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                if let Err(stats_err) = self.agent_stats.record_checkin(false) {
                    warn!("Failed to update check-in stats: {}", stats_err);
                }
                if e.class() == ErrorClass::AuthFailure {
                    self.enrollment.invalidate(&e.to_string())?;
                }
                return Err(e.into());
            }
        };

        // Update state
        {
            let mut last = self.last_heartbeat.write().await;
            *last = Some(Instant::now());
        }

        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.agent_stats.record_checkin(true) {
            warn!("Failed to update check-in stats: {}", e);
        }

        if !response.actions.is_empty() {
            self.handle_actions(&creds, &response.actions).await?;
        }

        // Echoing the token tells the server these actions arrived, so it
        // only advances once they are acknowledged
        if let Some(token) = &response.ack_token {
            if self.enrollment.is_enrolled() {
                let mut ack = self.ack_token.write().await;
                *ack = Some(token.clone());
            }
        }

        Ok(response)
    }

    /// Tell the server which actions were received
    async fn ack_actions(&self, creds: &DeviceCredentials, action_ids: &[&str]) -> SyncResult<()> {
        let request = AckRequest::new(&creds.device_id, action_ids);
        let response = self
            .transport
            .ack_actions(&creds.device_id, &creds.api_key, &request)
            .await?;

        if let Some(item) = response.first_error() {
            warn!("Server refused action ack ({}): {}", item.status, item.message);
            return Err(TransportError::unexpected(item.status, item.message.clone()).into());
        }
        debug!("Acknowledged {} actions", action_ids.len());
        Ok(())
    }

    /// Acknowledge, then carry out server actions
    async fn handle_actions(
        &self,
        creds: &DeviceCredentials,
        actions: &[ServerAction],
    ) -> SyncResult<()> {
        let ids: Vec<&str> = actions.iter().filter_map(ServerAction::action_id).collect();
        if !ids.is_empty() {
            self.ack_actions(creds, &ids).await?;
        }

        for action in actions {
            info!("Received server action: {:?}", action);

            match action {
                ServerAction::PolicyChange {
                    action_id,
                    policy_id,
                    settings,
                } => {
                    self.enrollment.set_policy_id(policy_id.as_deref())?;
                    if let Some(settings) = settings {
                        self.apply_policy(settings);
                        if let Some(store) = &self.policy_store {
                            store.save(action_id.as_deref(), policy_id.as_deref(), settings)?;
                        }
                    }
                }
                ServerAction::Unenroll { .. } => {
                    warn!("Server unenrolled this device");
                    self.enrollment.unenroll().await?;
                    *self.ack_token.write().await = None;
                    if let Some(store) = &self.policy_store {
                        store.clear()?;
                    }
                    // Nothing after an unenroll applies to this identity
                    break;
                }
                ServerAction::Unknown => {
                    debug!("Ignoring unsupported server action");
                }
            }
        }
        Ok(())
    }

    /// Start background heartbeat task, stopped by `shutdown`
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let max_failures = self.config.max_failures;

        tokio::spawn(async move {
            info!(
                "Starting heartbeat service with {}s interval",
                self.interval().as_secs()
            );

            loop {
                // Wait for interval
                tokio::select! {
                    _ = cancelled(&mut shutdown) => break,
                    _ = tokio::time::sleep(self.interval()) => {}
                }

                if !self.enrollment.is_enrolled() {
                    debug!("Skipping heartbeat - not enrolled");
                    continue;
                }

                match self.send_heartbeat().await {
                    Ok(response) => {
                        debug!(
                            "Heartbeat successful, {} actions",
                            response.actions.len()
                        );
                    }
                    Err(e) => {
                        let failures = self.consecutive_failures.load(Ordering::Relaxed);
                        if failures >= max_failures as u64 {
                            error!("Heartbeat failed {} consecutive times: {}", failures, e);
                        } else {
                            warn!("Heartbeat failed ({}/{}): {}", failures, max_failures, e);
                        }
                    }
                }
            }

            info!("Heartbeat service stopped");
        })
    }

    /// Get heartbeat statistics
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Get time since last successful heartbeat
    pub async fn time_since_last(&self) -> Option<Duration> {
        let last = self.last_heartbeat.read().await;
        last.map(|t| t.elapsed())
    }

    /// Check if heartbeat is overdue
    pub async fn is_overdue(&self) -> bool {
        match self.time_since_last().await {
            Some(elapsed) => elapsed > self.interval() * 2,
            None => true, // Never sent
        }
    }
}

/// Heartbeat statistics
#[derive(Debug, Clone, Default)]
pub struct HeartbeatStats {
    /// Total heartbeats sent successfully
    pub total_sent: u64,

    /// Total failed heartbeats
    pub total_failed: u64,

    /// Current consecutive failures
    pub consecutive_failures: u64,
}
