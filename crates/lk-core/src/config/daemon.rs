//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::profile::Profile;

/// Configuration for the renewal daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How often every profile is inspected
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,

    /// Fraction of the lease that must elapse before renewing (0 < t <= 1)
    pub renew_threshold: f64,

    /// Renew whenever less than this much TTL remains
    #[serde(with = "duration_secs")]
    pub min_renew_ttl: Duration,

    /// First retry delay after a failed renewal
    #[serde(with = "duration_secs")]
    pub initial_retry_backoff: Duration,

    /// Upper bound for the retry delay
    #[serde(with = "duration_secs")]
    pub max_retry_backoff: Duration,

    /// Upper bound for a single lookup/renew/revoke subprocess call
    #[serde(with = "duration_secs")]
    pub operation_timeout: Duration,

    /// Health endpoint address (`host:port`); empty disables it
    pub health_address: String,

    /// Directory for the PID file and file-backed token store
    pub data_dir: PathBuf,

    /// Logging
    pub log: LogConfig,

    /// Notification toggles
    pub notifications: NotificationConfig,

    /// Profiles, renewed in this order every tick
    pub profiles: Vec<Profile>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            renew_threshold: 0.75,
            min_renew_ttl: Duration::from_secs(300),
            initial_retry_backoff: Duration::from_secs(30),
            max_retry_backoff: Duration::from_secs(30 * 60),
            operation_timeout: Duration::from_secs(30),
            health_address: String::new(),
            data_dir: super::default_data_dir(),
            log: LogConfig::default(),
            notifications: NotificationConfig::default(),
            profiles: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Renewal policy view of this configuration
    pub fn policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            check_interval: self.check_interval,
            renew_threshold: self.renew_threshold,
            min_renew_ttl: self.min_renew_ttl,
            initial_retry_backoff: self.initial_retry_backoff,
            max_retry_backoff: self.max_retry_backoff,
            operation_timeout: self.operation_timeout,
        }
    }

    /// Whether the health endpoint is enabled
    pub fn health_enabled(&self) -> bool {
        !self.health_address.trim().is_empty()
    }

    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Validate the configuration as a whole
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy().validate()?;

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.name.is_empty() {
                return Err(ConfigError::MissingField("profiles[].name".to_string()));
            }
            if !is_valid_profile_name(&profile.name) {
                return Err(ConfigError::Invalid(format!(
                    "profile name {:?} may only contain letters, digits, '-', '_' and '.'",
                    profile.name
                )));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile name {:?}",
                    profile.name
                )));
            }
        }
        Ok(())
    }
}

/// Whether a profile name is usable as a storage key
pub fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Timing parameters that drive renewal and retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalPolicy {
    pub check_interval: Duration,
    pub renew_threshold: f64,
    pub min_renew_ttl: Duration,
    pub initial_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub operation_timeout: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        DaemonConfig::default().policy()
    }
}

impl RenewalPolicy {
    /// Check the policy invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.renew_threshold > 0.0 && self.renew_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "renew_threshold must be in (0, 1], got {}",
                self.renew_threshold
            )));
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid("check_interval must be positive".to_string()));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "operation_timeout must be positive".to_string(),
            ));
        }
        if self.initial_retry_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "initial_retry_backoff must be positive".to_string(),
            ));
        }
        if self.initial_retry_backoff > self.max_retry_backoff {
            return Err(ConfigError::Invalid(format!(
                "initial_retry_backoff ({}s) exceeds max_retry_backoff ({}s)",
                self.initial_retry_backoff.as_secs(),
                self.max_retry_backoff.as_secs()
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log file; stderr when unset
    pub file: Option<PathBuf>,

    /// Level filter (error, warn, info, debug, trace)
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    pub json: bool,

    /// Rotate the log file at startup once it exceeds this size
    pub max_size_mb: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
            json: false,
            max_size_mb: 10,
        }
    }
}

/// Which events produce user notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch
    pub enabled: bool,

    /// Notify after a successful renewal
    pub on_renewal: bool,

    /// Notify after a failed renewal or an expired token
    pub on_failure: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_renewal: false,
            on_failure: true,
        }
    }
}
