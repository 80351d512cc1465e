//! Sync engine
//!
//! Drains the record queue in budgeted cycles. Each batch is handed to the
//! transport; acknowledged records are acked, the rest are requeued, and
//! transient failures back off exponentially before the next batch.
//! Delivery is at-least-once and ordered by `local_id`: a batch that was
//! sent but never confirmed is sent again, possibly duplicating it
//! server-side (the batch id lets the server de-duplicate).

use crate::backoff::{Backoff, BackoffPolicy};
use crate::enrollment::EnrollmentManager;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::store::{AgentStatsStore, Batch, EventStore};
use crate::transport::{Transport, TransportError};
use crate::types::{AgentHealth, IngestResponse, PolicySettings};
use fleetlink_core::SyncSettings;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Resources one cycle may consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBudget {
    pub max_duration: Duration,
    pub max_batches: u32,
}

impl SyncBudget {
    pub fn new(max_duration: Duration, max_batches: u32) -> Self {
        Self {
            max_duration,
            max_batches,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.cycle_max_duration(), settings.cycle_max_batches)
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No pending records remain
    Drained,
    /// Out of time or batches; pending records wait for the next cycle
    BudgetExhausted,
    /// Device not enrolled, nothing was attempted
    NotEnrolled,
    /// Server rejected the credentials; enrollment must run again
    ReEnrollmentRequired,
    /// Credential vault inaccessible; try again later
    Deferred,
    /// The host revoked the budget mid-cycle
    Cancelled,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Drained => "drained",
            CycleOutcome::BudgetExhausted => "budget_exhausted",
            CycleOutcome::NotEnrolled => "not_enrolled",
            CycleOutcome::ReEnrollmentRequired => "re_enrollment_required",
            CycleOutcome::Deferred => "deferred",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub outcome: CycleOutcome,
    /// Ingest calls made
    pub batches: u32,
    /// Records handed to the transport, counting resends
    pub sent: usize,
    pub acked: usize,
    pub requeued: usize,
    /// Records the server refused (marked failed)
    pub rejected: usize,
    /// Records that exceeded the attempts ceiling (marked failed)
    pub dropped: usize,
    pub elapsed_ms: u64,
    pub last_error: Option<String>,
}

impl SyncReport {
    fn new() -> Self {
        Self {
            outcome: CycleOutcome::Drained,
            batches: 0,
            sent: 0,
            acked: 0,
            requeued: 0,
            rejected: 0,
            dropped: 0,
            elapsed_ms: 0,
            last_error: None,
        }
    }

    /// Records that became terminally failed during the cycle
    pub fn failed(&self) -> usize {
        self.rejected + self.dropped
    }
}

/// Batch sizing and retry policy
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub backoff: BackoffPolicy,
    /// When false a retryable failure ends the cycle instead of sleeping
    pub use_backoff: bool,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            batch_max_records: 500,
            batch_max_bytes: 1024 * 1024,
            backoff: BackoffPolicy::default(),
            use_backoff: true,
        }
    }
}

impl SyncEngineConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            batch_max_records: settings.batch_max_records,
            batch_max_bytes: settings.batch_max_bytes,
            backoff: BackoffPolicy::from_settings(settings),
            use_backoff: true,
        }
    }

    /// Overlay the settings a server policy carries
    pub fn apply_policy(&mut self, settings: &PolicySettings) {
        if let Some(n) = settings.max_documents_per_request() {
            self.batch_max_records = n;
        }
        if let Some(use_backoff) = settings.use_backoff {
            self.use_backoff = use_backoff;
        }
        if let Some(max) = settings.max_backoff_interval() {
            self.backoff.max = max;
            self.backoff.base = self.backoff.base.min(max);
        }
    }
}

/// What to do after handling one batch
enum Step {
    /// Send the next batch right away
    Continue,
    /// Back off first, at least for the server's hint if given
    Retry(Option<Duration>),
    /// End the cycle
    Stop(CycleOutcome),
}

/// Drains the event store through the transport
pub struct SyncEngine {
    events: EventStore,
    enrollment: Arc<EnrollmentManager>,
    transport: Arc<dyn Transport>,
    stats: AgentStatsStore,
    config: RwLock<SyncEngineConfig>,
}

impl SyncEngine {
    pub fn new(
        events: EventStore,
        enrollment: Arc<EnrollmentManager>,
        transport: Arc<dyn Transport>,
        stats: AgentStatsStore,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            events,
            enrollment,
            transport,
            stats,
            config: RwLock::new(config),
        }
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Settings the next cycle will run with
    pub fn config(&self) -> SyncEngineConfig {
        self.config.read().clone()
    }

    /// Apply server policy settings from the next cycle on
    pub fn apply_policy(&self, settings: &PolicySettings) {
        let mut config = self.config.write();
        config.apply_policy(settings);
        info!(
            batch_max_records = config.batch_max_records,
            use_backoff = config.use_backoff,
            backoff_max = ?config.backoff.max,
            "Applied policy to sync engine"
        );
    }

    /// Run one cycle that cannot be cancelled
    pub async fn run_cycle(&self, budget: SyncBudget) -> SyncResult<SyncReport> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_cycle_with_cancel(budget, cancel_rx).await
    }

    /// Run one cycle; setting `cancel` to true stops it at the next await.
    ///
    /// A batch interrupted mid-call stays in flight and is recovered to
    /// Pending at the start of the next cycle.
    pub async fn run_cycle_with_cancel(
        &self,
        budget: SyncBudget,
        mut cancel: watch::Receiver<bool>,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let deadline = started + budget.max_duration;
        let mut report = SyncReport::new();

        let _identity = self.enrollment.identity_guard().await;

        let creds = match self.enrollment.credentials() {
            Ok(creds) => creds,
            Err(SyncError::NotEnrolled) => {
                debug!("Device not enrolled, skipping sync cycle");
                return Ok(self.finish(report, CycleOutcome::NotEnrolled, started));
            }
            Err(SyncError::CredentialsMissing) => {
                report.last_error = Some(SyncError::CredentialsMissing.to_string());
                self.enrollment
                    .invalidate("credentials missing from vault")?;
                return Ok(self.finish(report, CycleOutcome::ReEnrollmentRequired, started));
            }
            Err(e) if e.is_retryable() => {
                warn!("Deferring sync cycle: {}", e);
                report.last_error = Some(e.to_string());
                return Ok(self.finish(report, CycleOutcome::Deferred, started));
            }
            Err(e) => return Err(e),
        };

        self.events.recover_in_flight()?;

        let config = self.config();
        let mut backoff = Backoff::new(config.backoff);
        let mut max_records = config.batch_max_records.max(1);

        let outcome = loop {
            if *cancel.borrow() {
                break CycleOutcome::Cancelled;
            }
            if report.batches >= budget.max_batches || Instant::now() >= deadline {
                break CycleOutcome::BudgetExhausted;
            }

            let batch = self
                .events
                .next_batch(max_records, config.batch_max_bytes)?;
            if batch.is_empty() {
                break CycleOutcome::Drained;
            }
            report.batches += 1;
            report.sent += batch.len();
            debug!(
                batch_id = %batch.id,
                records = batch.len(),
                bytes = batch.total_bytes(),
                "Sending batch"
            );

            let result = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => None,
                result = self.transport.ingest(
                    &creds.device_id,
                    &creds.api_key,
                    &batch.id,
                    &batch.records,
                ) => Some(result),
            };
            let Some(result) = result else {
                warn!(
                    "Sync cycle cancelled, batch {} left in flight for recovery",
                    batch.id
                );
                break CycleOutcome::Cancelled;
            };

            let step = match result {
                Ok(response) => self.apply_response(&batch, response, &mut report)?,
                Err(e) => self.handle_failure(&batch, e, &mut report, &mut max_records)?,
            };

            match step {
                Step::Continue => backoff.reset(),
                Step::Stop(outcome) => break outcome,
                Step::Retry(_) if !config.use_backoff => {
                    debug!("Backoff disabled by policy, ending cycle after failure");
                    break CycleOutcome::BudgetExhausted;
                }
                Step::Retry(hint) => {
                    let delay = backoff.next_delay().max(hint.unwrap_or_default());
                    if Instant::now() + delay >= deadline {
                        debug!("Backoff of {:?} would overrun the cycle budget", delay);
                        break CycleOutcome::BudgetExhausted;
                    }
                    warn!(
                        "Retrying in {:?} after {} consecutive failures",
                        delay,
                        backoff.failures()
                    );

                    let interrupted = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if interrupted {
                        break CycleOutcome::Cancelled;
                    }
                }
            }
        };

        Ok(self.finish(report, outcome, started))
    }

    /// Ack what the server accepted, fail what it rejected, requeue the rest
    fn apply_response(
        &self,
        batch: &Batch,
        response: IngestResponse,
        report: &mut SyncReport,
    ) -> SyncResult<Step> {
        let in_batch: HashSet<i64> = batch.ids().into_iter().collect();

        let acked: HashSet<i64> = response
            .acked
            .into_iter()
            .filter(|id| in_batch.contains(id))
            .collect();
        let rejected: Vec<_> = response
            .rejected
            .into_iter()
            .filter(|r| in_batch.contains(&r.local_id) && !acked.contains(&r.local_id))
            .collect();
        let rejected_ids: HashSet<i64> = rejected.iter().map(|r| r.local_id).collect();

        let ack_ids: Vec<i64> = batch
            .ids()
            .into_iter()
            .filter(|id| acked.contains(id))
            .collect();
        let acked_count = self.events.ack(&ack_ids)?;

        let mut rejected_count = 0;
        for record in &rejected {
            rejected_count += self
                .events
                .mark_failed(&[record.local_id], &record.reason)?;
        }
        if rejected_count > 0 {
            error!(
                dropped = rejected_count,
                ids = ?rejected_ids,
                "Server rejected records, marked failed"
            );
        }

        let remaining: Vec<i64> = batch
            .ids()
            .into_iter()
            .filter(|id| !acked.contains(id) && !rejected_ids.contains(id))
            .collect();
        let requeue = self
            .events
            .requeue(&remaining, "not acknowledged by server")?;

        report.acked += acked_count;
        report.rejected += rejected_count;
        report.requeued += requeue.requeued;
        report.dropped += requeue.failed.len();
        self.note_delivery(acked_count, rejected_count + requeue.failed.len());

        debug!(
            batch_id = %batch.id,
            acked = acked_count,
            rejected = rejected_count,
            requeued = requeue.requeued,
            "Batch settled"
        );

        if acked_count == 0 && rejected_count == 0 {
            report.last_error = Some("server acknowledged no records".to_string());
            Ok(Step::Retry(None))
        } else {
            Ok(Step::Continue)
        }
    }

    fn handle_failure(
        &self,
        batch: &Batch,
        err: TransportError,
        report: &mut SyncReport,
        max_records: &mut usize,
    ) -> SyncResult<Step> {
        report.last_error = Some(err.to_string());
        self.note_failure();

        match err.class() {
            ErrorClass::AuthFailure => {
                // Not the records' fault, keep their attempts
                self.events.release(&batch.ids())?;
                self.enrollment.invalidate(&err.to_string())?;
                Ok(Step::Stop(CycleOutcome::ReEnrollmentRequired))
            }
            ErrorClass::Validation if batch.len() > 1 => {
                // Split until the offending record is alone
                self.events.release(&batch.ids())?;
                *max_records = (batch.len() / 2).max(1);
                warn!(
                    "Server rejected a batch of {} records ({}), retrying in batches of {}",
                    batch.len(),
                    err,
                    max_records
                );
                Ok(Step::Continue)
            }
            ErrorClass::Validation => {
                let ids = batch.ids();
                let rejected = self.events.mark_failed(&ids, &err.to_string())?;
                report.rejected += rejected;
                self.note_delivery(0, rejected);
                error!(dropped = rejected, ids = ?ids, "Server rejected record: {}", err);
                Ok(Step::Continue)
            }
            _ => {
                let retry_after = match err {
                    TransportError::RateLimited(Some(secs)) => Some(Duration::from_secs(secs)),
                    _ => None,
                };
                let requeue = self.events.requeue(&batch.ids(), &err.to_string())?;
                report.requeued += requeue.requeued;
                report.dropped += requeue.failed.len();
                self.note_delivery(0, requeue.failed.len());

                warn!("Batch {} failed: {}", batch.id, err);
                Ok(Step::Retry(retry_after))
            }
        }
    }

    fn finish(&self, mut report: SyncReport, outcome: CycleOutcome, started: Instant) -> SyncReport {
        report.outcome = outcome;
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if outcome != CycleOutcome::NotEnrolled {
            let health = match outcome {
                CycleOutcome::ReEnrollmentRequired => AgentHealth::Unhealthy,
                CycleOutcome::Drained => AgentHealth::Healthy,
                _ if report.acked == 0 && report.last_error.is_some() => AgentHealth::Unhealthy,
                _ => AgentHealth::Healthy,
            };
            if let Err(e) = self.stats.set_health(health) {
                warn!("Failed to update agent health: {}", e);
            }
        }
        if let Err(e) = self.stats.record_sync_outcome(outcome.as_str()) {
            warn!("Failed to record sync outcome: {}", e);
        }

        info!(
            outcome = %outcome,
            batches = report.batches,
            acked = report.acked,
            requeued = report.requeued,
            failed = report.failed(),
            elapsed_ms = report.elapsed_ms,
            "Sync cycle finished"
        );
        report
    }

    fn note_delivery(&self, acked: usize, dropped: usize) {
        if let Err(e) = self.stats.record_delivery(acked, dropped) {
            warn!("Failed to update delivery stats: {}", e);
        }
    }

    fn note_failure(&self) {
        if let Err(e) = self.stats.record_failure() {
            warn!("Failed to update failure stats: {}", e);
        }
    }
}

/// Resolves once `cancel` reads true; never resolves if the sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::EnrollmentConfig;
    use crate::store::{Database, EnrollmentStatus, EventStoreConfig, RecordStatus};
    use crate::transport::{MockCall, MockTransport};
    use crate::types::RejectedRecord;
    use crate::vault::{CredentialVault, MemoryVault};

    struct Fixture {
        db: Database,
        vault: Arc<MemoryVault>,
        transport: MockTransport,
        enrollment: Arc<EnrollmentManager>,
        engine: SyncEngine,
    }

    fn fixture_with(events: EventStoreConfig, batch_max_records: usize) -> Fixture {
        let db = Database::in_memory().unwrap();
        let vault = Arc::new(MemoryVault::new());
        let transport = MockTransport::new();
        let enrollment = Arc::new(EnrollmentManager::new(
            db.enrollment(),
            vault.clone(),
            Arc::new(transport.clone()),
            EnrollmentConfig::default(),
        ));
        let engine = SyncEngine::new(
            db.events(events),
            enrollment.clone(),
            Arc::new(transport.clone()),
            db.agent_stats(),
            SyncEngineConfig {
                batch_max_records,
                batch_max_bytes: usize::MAX,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(100),
                    max: Duration::from_secs(1),
                    jitter: 0.0,
                },
                use_backoff: true,
            },
        );
        Fixture {
            db,
            vault,
            transport,
            enrollment,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EventStoreConfig::default(), 3)
    }

    async fn enrolled() -> Fixture {
        let f = fixture();
        f.enrollment.enroll("token").await.unwrap();
        f
    }

    fn budget() -> SyncBudget {
        SyncBudget::new(Duration::from_secs(60), 100)
    }

    fn append(f: &Fixture, n: usize) {
        for i in 0..n {
            f.engine
                .events()
                .append(format!("event-{}", i).as_bytes())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_not_enrolled_skips_cycle() {
        let f = fixture();
        append(&f, 2);

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::NotEnrolled);
        assert_eq!(report.batches, 0);
        assert!(f.transport.ingest_batches().is_empty());
        assert_eq!(f.engine.events().counts().unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let f = enrolled().await;
        append(&f, 7);

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(report.batches, 3);
        assert_eq!(report.acked, 7);
        assert_eq!(
            f.transport.ingest_batches(),
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]
        );

        let delivered = f.transport.delivered_ids();
        assert!(delivered.windows(2).all(|w| w[0] <= w[1]));

        let counts = f.engine.events().counts().unwrap();
        assert_eq!(counts.acked, 7);
        assert_eq!(counts.unsent(), 0);
        assert_eq!(f.db.agent_stats().load().unwrap().records_acked, 7);
    }

    #[tokio::test]
    async fn test_records_buffered_before_enrollment_are_sent() {
        let f = fixture();
        append(&f, 2);
        f.enrollment.enroll("token").await.unwrap();

        f.engine.run_cycle(budget()).await.unwrap();

        let ingest = f
            .transport
            .calls()
            .into_iter()
            .find(|c| matches!(c, MockCall::Ingest { .. }))
            .unwrap();
        match ingest {
            MockCall::Ingest {
                device_id,
                api_key,
                local_ids,
                ..
            } => {
                assert_eq!(device_id, "mock-device-1");
                assert_eq!(api_key, "mock-api-key-1");
                assert_eq!(local_ids, vec![1, 2]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_partial_ack_requeues_remainder() {
        let f = enrolled().await;
        append(&f, 5);
        f.transport
            .queue_ingest(Ok(IngestResponse::ack_all(vec![1, 2])));

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(f.transport.ingest_batches(), vec![vec![1, 2, 3], vec![3, 4, 5]]);
        assert_eq!(report.acked, 5);
        assert_eq!(report.requeued, 1);

        let record = f.engine.events().get(3).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Acked);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_backs_off_then_succeeds() {
        let f = enrolled().await;
        append(&f, 2);
        f.transport
            .fail_next_ingest(TransportError::server(503, "unavailable"));

        let started = Instant::now();
        let report = f.engine.run_cycle(budget()).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(f.transport.ingest_batches(), vec![vec![1, 2], vec![1, 2]]);
        assert_eq!(report.requeued, 2);
        assert_eq!(report.acked, 2);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(f.engine.events().get(1).unwrap().unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_overrunning_budget_ends_cycle() {
        let f = enrolled().await;
        append(&f, 1);
        for _ in 0..5 {
            f.transport.fail_next_ingest(TransportError::Timeout);
        }

        // 100ms fits, the following 200ms does not
        let report = f
            .engine
            .run_cycle(SyncBudget::new(Duration::from_millis(250), 100))
            .await
            .unwrap();

        assert_eq!(report.outcome, CycleOutcome::BudgetExhausted);
        assert_eq!(report.batches, 2);
        assert_eq!(report.acked, 0);

        let record = f.engine.events().get(1).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempts, 2);
        assert_eq!(
            f.db.agent_stats().load().unwrap().agent_health,
            AgentHealth::Unhealthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_extends_backoff() {
        let f = enrolled().await;
        append(&f, 1);
        f.transport
            .fail_next_ingest(TransportError::RateLimited(Some(5)));

        let started = Instant::now();
        let report = f.engine.run_cycle(budget()).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_auth_failure_requires_reenrollment() {
        let f = enrolled().await;
        append(&f, 3);
        f.transport
            .fail_next_ingest(TransportError::auth(401, "key revoked"));

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::ReEnrollmentRequired);
        assert_eq!(
            f.enrollment.state().unwrap().status,
            EnrollmentStatus::Failed
        );

        // Released without consuming attempts
        let counts = f.engine.events().counts().unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(f.engine.events().get(1).unwrap().unwrap().attempts, 0);

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::NotEnrolled);

        f.enrollment.reenroll().await.unwrap();
        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(report.acked, 3);
    }

    #[tokio::test]
    async fn test_rejected_records_marked_failed() {
        let f = enrolled().await;
        append(&f, 3);
        f.transport.queue_ingest(Ok(IngestResponse {
            acked: vec![1, 3],
            rejected: vec![RejectedRecord {
                local_id: 2,
                reason: "schema violation".into(),
            }],
        }));

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(report.acked, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.failed(), 1);

        let failed = f.engine.events().failed_records(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].local_id, 2);
        assert_eq!(failed[0].last_error.as_deref(), Some("schema violation"));
        assert_eq!(f.db.agent_stats().load().unwrap().records_dropped, 1);
    }

    #[tokio::test]
    async fn test_validation_error_isolates_bad_record() {
        let f = fixture_with(EventStoreConfig::default(), 4);
        f.enrollment.enroll("token").await.unwrap();
        append(&f, 4);

        // Record 3 is poison: every batch containing it is refused
        f.transport
            .fail_next_ingest(TransportError::validation(400, "bad record"));
        f.transport
            .queue_ingest(Ok(IngestResponse::ack_all(vec![1, 2])));
        f.transport
            .fail_next_ingest(TransportError::validation(400, "bad record"));
        f.transport
            .fail_next_ingest(TransportError::validation(400, "bad record"));

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(
            f.transport.ingest_batches(),
            vec![vec![1, 2, 3, 4], vec![1, 2], vec![3, 4], vec![3], vec![4]]
        );
        assert_eq!(report.acked, 3);
        assert_eq!(report.rejected, 1);

        let events = f.engine.events();
        assert_eq!(events.get(3).unwrap().unwrap().status, RecordStatus::Failed);
        assert_eq!(events.get(4).unwrap().unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_ceiling_drops_record() {
        let f = fixture_with(
            EventStoreConfig {
                max_attempts: 1,
                ..Default::default()
            },
            3,
        );
        f.enrollment.enroll("token").await.unwrap();
        append(&f, 1);
        f.transport.fail_next_ingest(TransportError::Timeout);
        f.transport.fail_next_ingest(TransportError::Timeout);

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(report.batches, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(
            f.engine.events().get(1).unwrap().unwrap().status,
            RecordStatus::Failed
        );
        assert_eq!(f.db.agent_stats().load().unwrap().records_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_batch_in_flight() {
        let f = enrolled().await;
        append(&f, 2);
        f.transport.set_ingest_delay(Duration::from_secs(10));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (report, _) = tokio::join!(
            f.engine.run_cycle_with_cancel(budget(), cancel_rx),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel_tx.send(true).unwrap();
            }
        );

        let report = report.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(report.acked, 0);
        assert_eq!(f.engine.events().counts().unwrap().in_flight, 2);

        // Next cycle recovers and redelivers
        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(f.transport.delivered_ids(), vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_crash_mid_batch_redelivers() {
        let f = enrolled().await;
        append(&f, 4);

        // A previous process took a batch and died before the ack
        let lost = f.engine.events().next_batch(3, usize::MAX).unwrap();
        assert_eq!(lost.ids(), vec![1, 2, 3]);

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(f.transport.ingest_batches(), vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_during_cycle_does_not_block() {
        let f = enrolled().await;
        append(&f, 1);
        f.transport.set_ingest_delay(Duration::from_millis(500));

        let (report, appended) = tokio::join!(f.engine.run_cycle(budget()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.engine.events().append(b"late").unwrap()
        });

        assert_eq!(appended, 2);
        let report = report.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(f.transport.ingest_batches(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_vault_unavailable_defers() {
        let f = enrolled().await;
        append(&f, 1);
        f.vault.set_unavailable(true);

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Deferred);
        assert!(f.transport.ingest_batches().is_empty());
        // Transient: still enrolled
        assert!(f.enrollment.is_enrolled());
    }

    #[tokio::test]
    async fn test_missing_credentials_force_reenrollment() {
        let f = enrolled().await;
        f.vault.clear().unwrap();

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::ReEnrollmentRequired);
        assert!(!f.enrollment.is_enrolled());
    }

    #[tokio::test]
    async fn test_max_batches_budget() {
        let f = enrolled().await;
        append(&f, 5);

        let report = f
            .engine
            .run_cycle(SyncBudget::new(Duration::from_secs(60), 1))
            .await
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::BudgetExhausted);
        assert_eq!(report.batches, 1);
        assert_eq!(f.engine.events().counts().unwrap().pending, 2);

        let stats = f.db.agent_stats().load().unwrap();
        assert_eq!(stats.last_sync_outcome.as_deref(), Some("budget_exhausted"));
    }

    #[tokio::test]
    async fn test_missing_ingest_endpoint_keeps_records() {
        use crate::transport::HttpTransport;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let f = enrolled().await;
        append(&f, 8);
        let http = HttpTransport::new(&server.uri(), Duration::from_secs(5), true).unwrap();
        let engine = SyncEngine::new(
            f.engine.events().clone(),
            f.enrollment.clone(),
            Arc::new(http),
            f.db.agent_stats(),
            f.engine.config(),
        );

        let report = engine
            .run_cycle(SyncBudget::new(Duration::from_millis(250), 100))
            .await
            .unwrap();

        assert_eq!(report.outcome, CycleOutcome::BudgetExhausted);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.failed(), 0);

        let counts = f.engine.events().counts().unwrap();
        assert_eq!(counts.pending, 8);
        assert_eq!(counts.failed, 0);
        assert!(f.enrollment.is_enrolled());
    }

    #[tokio::test]
    async fn test_policy_resizes_batches() {
        let f = enrolled().await;
        append(&f, 5);
        f.engine.apply_policy(&PolicySettings {
            max_documents_per_request: Some(2),
            ..Default::default()
        });

        let report = f.engine.run_cycle(budget()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Drained);
        assert_eq!(
            f.transport.ingest_batches(),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_without_backoff_ends_cycle_on_failure() {
        let f = enrolled().await;
        append(&f, 1);
        f.engine.apply_policy(&PolicySettings {
            use_backoff: Some(false),
            ..Default::default()
        });
        f.transport.fail_next_ingest(TransportError::Timeout);

        let started = Instant::now();
        let report = f.engine.run_cycle(budget()).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::BudgetExhausted);
        assert_eq!(report.batches, 1);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(f.engine.events().counts().unwrap().pending, 1);
    }

    #[test]
    fn test_policy_caps_backoff() {
        let mut config = SyncEngineConfig::default();
        config.apply_policy(&PolicySettings {
            max_backoff_interval: Some("500ms".into()),
            ..Default::default()
        });
        // Unparseable values are ignored
        assert_eq!(config.backoff.max, Duration::from_secs(60));

        config.apply_policy(&PolicySettings {
            max_backoff_interval: Some("10s".into()),
            max_documents_per_request: Some(0),
            ..Default::default()
        });
        assert_eq!(config.backoff.max, Duration::from_secs(10));
        assert_eq!(config.batch_max_records, 500);
        assert!(config.use_backoff);

        let mut config = SyncEngineConfig::default();
        config.backoff.base = Duration::from_secs(30);
        config.apply_policy(&PolicySettings {
            max_backoff_interval: Some("5s".into()),
            ..Default::default()
        });
        assert_eq!(config.backoff.base, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_ack_backs_off() {
        let f = enrolled().await;
        append(&f, 1);
        f.transport.queue_ingest(Ok(IngestResponse::default()));

        let report = f
            .engine
            .run_cycle(SyncBudget::new(Duration::from_millis(50), 10))
            .await
            .unwrap();
        // The 100ms backoff does not fit in a 50ms budget
        assert_eq!(report.outcome, CycleOutcome::BudgetExhausted);
        assert_eq!(report.requeued, 1);
        assert_eq!(f.engine.events().counts().unwrap().pending, 1);
    }
}
