//! lk-daemon: Token renewal daemon for leasekeeper
//!
//! The scheduler ticks at a fixed interval, decides per profile whether the
//! stored token is due for renewal, runs the credential binary through the
//! subprocess executor, and backs off exponentially after failures. An
//! optional HTTP endpoint reports liveness.

pub mod backoff;
pub mod daemon;
pub mod engine;
pub mod health;
pub mod logging;
pub mod notify;
pub mod token_state;

pub use backoff::BackoffController;
pub use daemon::{DaemonError, DaemonState, Scheduler, TickSummary};
pub use engine::{EngineError, FailureKind, RenewalEngine, RenewalOutcome, SkipReason};
pub use health::{DaemonStatus, HealthReport, HealthServer, HealthStatus, SharedStatus};
pub use notify::{LogNotifier, Notification, NotificationKind, Notifier};
pub use token_state::{RenewalDecision, TokenState};
