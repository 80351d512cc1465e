//! Scheduler adapter
//!
//! Turns periodic or triggered wake-ups into budgeted sync cycles. At most
//! one cycle runs at a time: a wake-up that arrives while a cycle holds the
//! lease is coalesced. A lease older than `lease_timeout` is treated as
//! abandoned and taken over.
//!
//! The period of the `run` loop can change while it runs, when a server
//! policy sets a new delivery interval.

use crate::engine::{cancelled, CycleOutcome, SyncBudget, SyncEngine, SyncReport};
use crate::types::PolicySettings;
use fleetlink_core::SyncSettings;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Result reported back to the host scheduler
#[derive(Debug, Clone)]
pub enum WakeOutcome {
    /// The cycle ran and made progress (or had nothing to do)
    Success(SyncReport),
    /// The cycle failed in a way retrying will not fix
    Failure(String),
    /// Try again later, preferably with the host's backoff
    Deferred(String),
    /// Another cycle was already running
    Coalesced,
}

impl WakeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WakeOutcome::Success(_))
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the `run` loop
    pub interval: Duration,

    /// Budget of each periodic cycle
    pub budget: SyncBudget,

    /// Age after which a held lease counts as abandoned
    pub lease_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            budget: SyncBudget::new(Duration::from_secs(60), 20),
            lease_timeout: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            interval: settings.interval(),
            budget: SyncBudget::from_settings(settings),
            lease_timeout: settings.lease_timeout(),
        }
    }
}

struct Lease {
    token: Ulid,
    acquired_at: Instant,
}

/// Releases the lease on drop, unless it was taken over meanwhile
struct LeaseGuard<'a> {
    slot: &'a Mutex<Option<Lease>>,
    token: Ulid,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|l| l.token == self.token) {
            *slot = None;
        }
    }
}

/// Non-reentrant entry point for host wake-ups
pub struct SchedulerAdapter {
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
    period: watch::Sender<Duration>,
    lease: Mutex<Option<Lease>>,
    trigger: Notify,
}

impl SchedulerAdapter {
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        let (period, _) = watch::channel(config.interval);
        Self {
            engine,
            config,
            period,
            lease: Mutex::new(None),
            trigger: Notify::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current period of the `run` loop
    pub fn interval(&self) -> Duration {
        *self.period.borrow()
    }

    /// Change the period; a running loop restarts its ticker
    pub fn set_interval(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let previous = self.period.send_replace(interval);
        if previous != interval {
            info!("Sync interval changed from {:?} to {:?}", previous, interval);
        }
    }

    /// Apply server policy settings to the loop and the engine
    pub fn apply_policy(&self, settings: &PolicySettings) {
        if let Some(interval) = settings.put_interval() {
            self.set_interval(interval);
        }
        self.engine.apply_policy(settings);
    }

    /// Whether a cycle currently holds a live lease
    pub fn is_running(&self) -> bool {
        self.lease
            .lock()
            .as_ref()
            .is_some_and(|l| l.acquired_at.elapsed() < self.config.lease_timeout)
    }

    fn try_acquire(&self) -> Option<LeaseGuard<'_>> {
        let mut slot = self.lease.lock();
        if let Some(lease) = slot.as_ref() {
            let age = lease.acquired_at.elapsed();
            if age < self.config.lease_timeout {
                return None;
            }
            warn!(
                "Taking over sync lease held for {:?}, previous cycle presumed dead",
                age
            );
        }

        let token = Ulid::new();
        *slot = Some(Lease {
            token,
            acquired_at: Instant::now(),
        });
        Some(LeaseGuard {
            slot: &self.lease,
            token,
        })
    }

    /// Handle one wake-up with the given budget
    pub async fn invoke(&self, budget: SyncBudget) -> WakeOutcome {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.invoke_with_cancel(budget, cancel_rx).await
    }

    /// Handle one wake-up; `cancel` revokes the budget mid-cycle
    pub async fn invoke_with_cancel(
        &self,
        budget: SyncBudget,
        cancel: watch::Receiver<bool>,
    ) -> WakeOutcome {
        let Some(_lease) = self.try_acquire() else {
            debug!("Sync cycle already running, coalescing wake-up");
            return WakeOutcome::Coalesced;
        };

        match self.engine.run_cycle_with_cancel(budget, cancel).await {
            Ok(report) => classify(report),
            Err(e) => {
                error!("Sync cycle aborted: {}", e);
                WakeOutcome::Failure(e.to_string())
            }
        }
    }

    /// Ask the `run` loop to start a cycle now (user request, connectivity back)
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    /// Drive periodic cycles until `shutdown` reads true.
    ///
    /// Shutdown also cancels a cycle in progress.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.period.subscribe();
        let every = *period.borrow_and_update();
        info!("Starting sync scheduler with {}s interval", every.as_secs());

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                Ok(()) = period.changed() => {
                    let every = *period.borrow_and_update();
                    interval = tokio::time::interval_at(Instant::now() + every, every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    continue;
                }
                _ = self.trigger.notified() => debug!("Sync triggered"),
                _ = interval.tick() => {}
            }

            match self
                .invoke_with_cancel(self.config.budget, shutdown.clone())
                .await
            {
                WakeOutcome::Success(report) => debug!("Sync cycle ended: {}", report.outcome),
                WakeOutcome::Deferred(reason) => info!("Sync deferred: {}", reason),
                WakeOutcome::Failure(reason) => warn!("Sync failed: {}", reason),
                WakeOutcome::Coalesced => {}
            }

            if *shutdown.borrow() {
                break;
            }
        }

        info!("Sync scheduler stopped");
    }
}

fn classify(report: SyncReport) -> WakeOutcome {
    match report.outcome {
        CycleOutcome::Drained => WakeOutcome::Success(report),
        CycleOutcome::BudgetExhausted => {
            if report.acked == 0 && report.failed() == 0 {
                if let Some(err) = report.last_error {
                    return WakeOutcome::Deferred(err);
                }
            }
            WakeOutcome::Success(report)
        }
        CycleOutcome::NotEnrolled => WakeOutcome::Deferred("device not enrolled".into()),
        CycleOutcome::Deferred => WakeOutcome::Deferred(
            report
                .last_error
                .unwrap_or_else(|| "credential vault unavailable".into()),
        ),
        CycleOutcome::Cancelled => WakeOutcome::Deferred("sync cycle cancelled".into()),
        CycleOutcome::ReEnrollmentRequired => {
            WakeOutcome::Failure("re-enrollment required".into())
        }
    }
}
