//! Exponential backoff for failed renewals

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use lk_core::config::RenewalPolicy;

/// Retry state of one profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive failures
    pub failures: u32,
    /// Earliest instant the profile may be attempted again
    pub next_attempt: Instant,
}

/// Per-profile exponential backoff.
///
/// State is created on the first failure and dropped on success; it is never
/// persisted.
#[derive(Debug)]
pub struct BackoffController {
    /// Delay after the first failure
    initial: Duration,
    /// Maximum delay
    max: Duration,
    retries: HashMap<String, RetryState>,
}

impl BackoffController {
    /// Create a controller with the given bounds
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            retries: HashMap::new(),
        }
    }

    /// Create a controller from the renewal policy
    pub fn from_policy(policy: &RenewalPolicy) -> Self {
        Self::new(policy.initial_retry_backoff, policy.max_retry_backoff)
    }

    /// `min(initial * 2^failures, max)` without overflow
    pub fn next_delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Record a failed attempt at `now` and return the delay before the next one
    pub fn record_failure(&mut self, profile: &str, now: Instant) -> Duration {
        let failures = self.failure_count(profile);
        let delay = self.next_delay(failures);
        self.retries.insert(
            profile.to_string(),
            RetryState {
                failures: failures.saturating_add(1),
                next_attempt: saturating_add(now, delay),
            },
        );
        delay
    }

    /// Forget all failures of a profile
    pub fn record_success(&mut self, profile: &str) {
        self.retries.remove(profile);
    }

    /// Whether the profile may be attempted at `now`
    pub fn is_eligible(&self, profile: &str, now: Instant) -> bool {
        self.retries
            .get(profile)
            .map_or(true, |state| now >= state.next_attempt)
    }

    /// Consecutive failures of a profile
    pub fn failure_count(&self, profile: &str) -> u32 {
        self.retries.get(profile).map_or(0, |state| state.failures)
    }

    /// Next eligible instant, if the profile is backing off
    pub fn next_attempt(&self, profile: &str) -> Option<Instant> {
        self.retries.get(profile).map(|state| state.next_attempt)
    }

    /// Full retry state of a profile
    pub fn state(&self, profile: &str) -> Option<RetryState> {
        self.retries.get(profile).copied()
    }
}

fn saturating_add(now: Instant, mut delay: Duration) -> Instant {
    loop {
        if let Some(at) = now.checked_add(delay) {
            return at;
        }
        delay /= 2;
    }
}
