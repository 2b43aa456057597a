//! Renewal notifications
//!
//! Delivery is pluggable; the daemon ships a notifier that writes to the
//! log and a recording notifier for tests.

use std::fmt;
use std::sync::{Arc, Mutex};

use lk_core::config::NotificationConfig;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Renewed,
    RenewalFailed,
    Expired,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Renewed => write!(f, "renewed"),
            NotificationKind::RenewalFailed => write!(f, "renewal failed"),
            NotificationKind::Expired => write!(f, "expired"),
        }
    }
}

/// A notification about one profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub profile: String,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, profile: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            profile: profile.into(),
            message: message.into(),
        }
    }

    /// Title suitable for a desktop notification
    pub fn title(&self) -> String {
        format!("leasekeeper: {} {}", self.profile, self.kind)
    }
}

/// Delivers notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) {
        match n.kind {
            NotificationKind::Renewed => {
                tracing::info!(profile = %n.profile, "{}: {}", n.title(), n.message)
            }
            NotificationKind::RenewalFailed | NotificationKind::Expired => {
                tracing::warn!(profile = %n.profile, "{}: {}", n.title(), n.message)
            }
        }
    }
}

/// Applies the configured toggles before delegating
pub struct FilteredNotifier {
    inner: Arc<dyn Notifier>,
    config: NotificationConfig,
}

impl FilteredNotifier {
    pub fn new(inner: Arc<dyn Notifier>, config: NotificationConfig) -> Self {
        Self { inner, config }
    }

    /// Whether a notification of `kind` passes the toggles
    pub fn allows(&self, kind: NotificationKind) -> bool {
        self.config.enabled
            && match kind {
                NotificationKind::Renewed => self.config.on_renewal,
                NotificationKind::RenewalFailed | NotificationKind::Expired => {
                    self.config.on_failure
                }
            }
    }
}

impl Notifier for FilteredNotifier {
    fn notify(&self, notification: &Notification) {
        if self.allows(notification.kind) {
            self.inner.notify(notification);
        }
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.notifications().iter().map(|n| n.kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        seen.push(notification.clone());
    }
}
