//! Exponential backoff with jitter
//!
//! The nominal delay after `n` consecutive failures is
//! `base * 2^(n-1)`, capped at `max`. Jitter spreads each delay uniformly
//! over `[1 - jitter, 1 + jitter]` of the nominal value and is clamped to
//! `max` again so the cap holds.

use fleetlink_core::SyncSettings;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1)`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            base: settings.backoff_base(),
            max: settings.backoff_max(),
            jitter: settings.backoff_jitter,
        }
    }

    /// Policy without jitter, for deterministic schedules
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the next attempt, ignoring jitter
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay before the next attempt with jitter applied
    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures);
        if nominal.is_zero() || self.jitter <= 0.0 {
            return nominal;
        }

        let jitter = self.jitter.min(0.999);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor).min(self.max)
    }
}

/// Consecutive-failure counter over a policy
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure and return the delay to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: 0.2,
        }
    }

    #[test]
    fn test_nominal_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.nominal_delay(0), Duration::ZERO);
        assert_eq!(p.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(p.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(p.nominal_delay(3), Duration::from_millis(400));
        assert_eq!(p.nominal_delay(6), Duration::from_secs(2));
        assert_eq!(p.nominal_delay(1000), Duration::from_secs(2));
    }

    #[test]
    fn test_nominal_is_monotonic() {
        let p = policy();
        let delays: Vec<_> = (0..64).map(|n| p.nominal_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = policy();
        for failures in 1..12 {
            let nominal = p.nominal_delay(failures);
            for _ in 0..50 {
                let d = p.delay(failures);
                assert!(d >= nominal.mul_f64(0.8), "{:?} below {:?}", d, nominal);
                assert!(d <= nominal.mul_f64(1.2));
                assert!(d <= p.max);
            }
        }
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let p = policy().without_jitter();
        assert_eq!(p.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_stateful_backoff() {
        let mut backoff = Backoff::new(policy().without_jitter());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
