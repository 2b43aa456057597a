//! Renewal decision for a stored token

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use lk_core::config::RenewalPolicy;
use lk_core::time::to_chrono;
use lk_core::Token;

/// Why a renewal is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    /// Remaining TTL fell below the absolute floor
    BelowMinTtl,
    /// Elapsed share of the lease reached the threshold
    ThresholdReached,
}

/// Outcome of evaluating a token at an instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    NotDue,
    Due(DueReason),
    /// Lease already over; renewal is pointless
    Expired,
}

impl RenewalDecision {
    pub fn is_due(self) -> bool {
        matches!(self, RenewalDecision::Due(_))
    }
}

/// The lease facts the decision depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenState {
    pub renewable: bool,
    pub lease: Duration,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    pub fn of(token: &Token) -> Self {
        Self {
            renewable: token.renewable,
            lease: token.lease(),
            expires_at: token.expires_at,
        }
    }

    /// Remaining time to live; `None` for tokens that never expire
    pub fn ttl(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.expires_at.map(|expires| expires - now)
    }

    /// Decide whether the lease should be renewed at `now`.
    ///
    /// A token is due when its TTL drops below `min_ttl`, or when at least
    /// `threshold` of its lease has elapsed.
    pub fn decide(&self, now: DateTime<Utc>, threshold: f64, min_ttl: Duration) -> RenewalDecision {
        if !self.renewable {
            return RenewalDecision::NotDue;
        }
        let Some(ttl) = self.ttl(now) else {
            return RenewalDecision::NotDue;
        };
        if ttl <= TimeDelta::zero() {
            return RenewalDecision::Expired;
        }
        if ttl < to_chrono(min_ttl) {
            return RenewalDecision::Due(DueReason::BelowMinTtl);
        }

        let lease = self.lease.as_secs_f64();
        if lease <= 0.0 {
            return RenewalDecision::NotDue;
        }
        let ttl_secs = ttl.num_milliseconds() as f64 / 1000.0;
        let elapsed_ratio = (lease - ttl_secs) / lease;
        if elapsed_ratio >= threshold {
            RenewalDecision::Due(DueReason::ThresholdReached)
        } else {
            RenewalDecision::NotDue
        }
    }

    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: f64, min_ttl: Duration) -> bool {
        self.decide(now, threshold, min_ttl).is_due()
    }
}

/// Evaluate `token` under `policy`
pub fn evaluate(token: &Token, now: DateTime<Utc>, policy: &RenewalPolicy) -> RenewalDecision {
    TokenState::of(token).decide(now, policy.renew_threshold, policy.min_renew_ttl)
}
