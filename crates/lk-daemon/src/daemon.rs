//! Renewal scheduler
//!
//! One task ticks at the configured interval and walks every profile in
//! configuration order. Profiles never run concurrently, ticks never
//! overlap, and a failing profile never stops the loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use lk_core::config::DaemonConfig;
use lk_core::error::ConfigError;
use lk_core::pidfile::{self, PidFileError, PidFileGuard};
use lk_core::time::format_duration;
use lk_core::Profile;

use crate::backoff::BackoffController;
use crate::engine::{RenewalEngine, RenewalOutcome, SkipReason};
use crate::health::{DaemonStatus, HealthServer, SharedStatus};
use crate::notify::{FilteredNotifier, Notification, NotificationKind, Notifier};

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Conditions that prevent the daemon from starting
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickSummary {
    /// Outcome per evaluated profile, in configuration order
    pub outcomes: Vec<(String, RenewalOutcome)>,
    /// Profiles skipped because they are backing off
    pub deferred: Vec<String>,
    /// Shutdown was requested before every profile was visited
    pub interrupted: bool,
}

impl TickSummary {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).count()
    }

    pub fn renewals(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn outcome(&self, profile: &str) -> Option<&RenewalOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == profile)
            .map(|(_, outcome)| outcome)
    }
}

/// Drives renewals for every configured profile
pub struct Scheduler {
    config: DaemonConfig,
    profiles: Arc<[Profile]>,
    engine: RenewalEngine,
    backoff: BackoffController,
    notifier: FilteredNotifier,
    status: SharedStatus,
    last_outcomes: HashMap<String, RenewalOutcome>,
    state: DaemonState,
}

impl Scheduler {
    /// Build a scheduler; fails if the configuration is invalid
    pub fn new(
        config: DaemonConfig,
        engine: RenewalEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;

        let profiles: Arc<[Profile]> = config.profiles.clone().into();
        let backoff = BackoffController::from_policy(&config.policy());
        let notifier = FilteredNotifier::new(notifier, config.notifications.clone());
        let status = DaemonStatus::new(std::process::id(), config.check_interval).shared();

        Ok(Self {
            config,
            profiles,
            engine,
            backoff,
            notifier,
            status,
            last_outcomes: HashMap::new(),
            state: DaemonState::Idle,
        })
    }

    /// Handle to the status the health endpoint serves
    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }

    pub fn engine(&self) -> &RenewalEngine {
        &self.engine
    }

    /// Where the PID file lives
    pub fn pid_path(&self) -> PathBuf {
        pidfile::pid_path_in(&self.config.data_dir)
    }

    /// Run until `cancel` fires.
    ///
    /// Refuses to start while another live daemon owns the PID file.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let _pid_guard = PidFileGuard::acquire(self.pid_path(), std::process::id())?;

        self.set_state(DaemonState::Running).await;
        self.status.write().await.started_at = Some(Utc::now());

        let health = if self.config.health_enabled() {
            HealthServer::start(&self.config.health_address, self.status(), cancel.child_token())
                .await
        } else {
            None
        };

        tracing::info!(
            profiles = self.profiles.len(),
            "Renewal daemon running, checking every {}",
            format_duration(self.config.check_interval)
        );

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.run_once(&cancel).await;
                    tracing::debug!(
                        renewed = summary.renewals(),
                        failed = summary.failures(),
                        deferred = summary.deferred.len(),
                        "Tick complete"
                    );
                }
            }
        }

        tracing::info!("Shutdown requested, stopping renewal daemon");
        self.set_state(DaemonState::ShuttingDown).await;

        if let Some(health) = health {
            health.stopped().await;
        }

        self.set_state(DaemonState::Stopped).await;
        tracing::info!("Renewal daemon stopped");
        Ok(())
    }

    /// Visit every profile once
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> TickSummary {
        let tick_started = Utc::now();
        let profiles = Arc::clone(&self.profiles);
        let mut summary = TickSummary::default();

        for profile in profiles.iter() {
            if cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            if !self.backoff.is_eligible(&profile.name, Instant::now()) {
                tracing::debug!(
                    profile = %profile.name,
                    failures = self.backoff.failure_count(&profile.name),
                    "Backing off, skipping"
                );
                summary.deferred.push(profile.name.clone());
                continue;
            }

            let outcome = self.engine.renew_if_needed(profile, cancel).await;
            if outcome == RenewalOutcome::Cancelled {
                summary.interrupted = true;
                break;
            }

            self.handle_outcome(profile, &outcome).await;
            summary.outcomes.push((profile.name.clone(), outcome));
        }

        let mut status = self.status.write().await;
        status.last_tick = Some(tick_started);
        if summary.failures() == 0 && !summary.interrupted {
            status.last_successful_tick = Some(tick_started);
        }
        drop(status);

        summary
    }

    async fn handle_outcome(&mut self, profile: &Profile, outcome: &RenewalOutcome) {
        let name = profile.name.as_str();
        let changed = self
            .last_outcomes
            .insert(name.to_string(), outcome.clone())
            .map_or(true, |previous| previous.label() != outcome.label());

        match outcome {
            RenewalOutcome::Renewed { expires_at, .. } => {
                self.backoff.record_success(name);
                let message = match expires_at {
                    Some(at) => format!("{}, valid until {}", outcome, at.to_rfc3339()),
                    None => outcome.to_string(),
                };
                self.notify(NotificationKind::Renewed, name, message);
            }
            RenewalOutcome::RenewedUnverified => {
                self.backoff.record_success(name);
                self.notify(NotificationKind::Renewed, name, outcome.to_string());
            }
            RenewalOutcome::Failed { .. } => {
                let delay = self.backoff.record_failure(name, Instant::now());
                tracing::warn!(
                    profile = name,
                    failures = self.backoff.failure_count(name),
                    "Renewal failed ({}), retrying in {}",
                    outcome,
                    format_duration(delay)
                );
                self.notify(NotificationKind::RenewalFailed, name, outcome.to_string());
            }
            RenewalOutcome::Expired => {
                if changed {
                    tracing::warn!(profile = name, "Token expired, log in again to resume renewal");
                    self.notify(NotificationKind::Expired, name, outcome.to_string());
                }
            }
            RenewalOutcome::Invalid(_) | RenewalOutcome::Skipped(SkipReason::BinaryMissing) => {
                if changed {
                    tracing::warn!(profile = name, "Profile skipped: {}", outcome);
                }
            }
            RenewalOutcome::NotDue
            | RenewalOutcome::Skipped(SkipReason::NotLoggedIn)
            | RenewalOutcome::Cancelled => {
                tracing::debug!(profile = name, "{}", outcome);
            }
        }

        let mut status = self.status.write().await;
        let entry = status.profiles.entry(name.to_string()).or_default();
        entry.last_outcome = Some(outcome.label().to_string());
        entry.last_message = Some(outcome.to_string());
        entry.last_attempt = Some(Utc::now());
        entry.consecutive_failures = self.backoff.failure_count(name);
        entry.next_attempt = self.backoff.next_attempt(name);
    }

    fn notify(&self, kind: NotificationKind, profile: &str, message: String) {
        self.notifier
            .notify(&Notification::new(kind, profile, message));
    }

    async fn set_state(&mut self, state: DaemonState) {
        tracing::debug!("Scheduler state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.status.write().await.state = state;
    }
}
