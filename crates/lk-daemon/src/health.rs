//! Health endpoint
//!
//! Read-only view of the scheduler's status. The scheduler writes into a
//! shared [`DaemonStatus`]; the endpoint only reads it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lk_core::time::to_chrono;

use crate::daemon::DaemonState;

/// Ticks older than this many check intervals are stale
const STALE_INTERVALS: u32 = 3;

/// Status shared between the scheduler and the endpoint
pub type SharedStatus = Arc<RwLock<DaemonStatus>>;

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Starting,
    Stale,
    Stopped,
}

/// What the scheduler last recorded for one profile
#[derive(Debug, Clone, Default)]
pub struct ProfileStatus {
    pub last_outcome: Option<String>,
    pub last_message: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub next_attempt: Option<Instant>,
}

/// Live scheduler status
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub pid: u32,
    pub check_interval: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_successful_tick: Option<DateTime<Utc>>,
    pub profiles: BTreeMap<String, ProfileStatus>,
}

impl DaemonStatus {
    pub fn new(pid: u32, check_interval: Duration) -> Self {
        Self {
            state: DaemonState::Idle,
            pid,
            check_interval,
            started_at: None,
            last_tick: None,
            last_successful_tick: None,
            profiles: BTreeMap::new(),
        }
    }

    /// Shareable handle
    pub fn shared(self) -> SharedStatus {
        Arc::new(RwLock::new(self))
    }

    /// Health at `now`
    pub fn health(&self, now: DateTime<Utc>) -> HealthStatus {
        match self.state {
            DaemonState::ShuttingDown | DaemonState::Stopped => HealthStatus::Stopped,
            DaemonState::Idle => HealthStatus::Starting,
            DaemonState::Running => match self.last_tick {
                None => HealthStatus::Starting,
                Some(tick) => {
                    let window = to_chrono(self.check_interval.saturating_mul(STALE_INTERVALS));
                    if now - tick > window {
                        HealthStatus::Stale
                    } else {
                        HealthStatus::Ok
                    }
                }
            },
        }
    }

    /// Serializable report at `now`; `instant` is the matching monotonic time
    pub fn report(&self, now: DateTime<Utc>, instant: Instant) -> HealthReport {
        let status = self.health(now);
        let profiles = self
            .profiles
            .iter()
            .map(|(name, p)| {
                let report = ProfileReport {
                    last_outcome: p.last_outcome.clone(),
                    last_message: p.last_message.clone(),
                    last_attempt: p.last_attempt,
                    consecutive_failures: p.consecutive_failures,
                    next_attempt_in_secs: p
                        .next_attempt
                        .map(|at| at.saturating_duration_since(instant).as_secs()),
                };
                (name.clone(), report)
            })
            .collect();

        HealthReport {
            status,
            alive: matches!(status, HealthStatus::Ok | HealthStatus::Starting),
            pid: self.pid,
            started_at: self.started_at,
            last_tick: self.last_tick,
            last_successful_tick: self.last_successful_tick,
            profiles,
        }
    }
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub alive: bool,
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_successful_tick: Option<DateTime<Utc>>,
    pub profiles: BTreeMap<String, ProfileReport>,
}

/// Per-profile part of the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub last_outcome: Option<String>,
    pub last_message: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub next_attempt_in_secs: Option<u64>,
}

/// Router serving `GET /health`
pub fn router(status: SharedStatus) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(status)
}

async fn health_handler(State(status): State<SharedStatus>) -> impl IntoResponse {
    let report = status.read().await.report(Utc::now(), Instant::now());
    let code = if report.alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Running health endpoint
pub struct HealthServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HealthServer {
    /// Bind `address` and serve until `cancel` fires.
    ///
    /// A bind failure is logged and yields `None`; the daemon runs on
    /// without the endpoint.
    pub async fn start(
        address: &str,
        status: SharedStatus,
        cancel: CancellationToken,
    ) -> Option<Self> {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("Health endpoint disabled, cannot bind {}: {}", address, e);
                return None;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Health endpoint disabled: {}", e);
                return None;
            }
        };

        tracing::info!("Health endpoint listening on http://{}/health", local_addr);

        let app = router(status);
        let handle = tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Health endpoint error: {}", e);
            }
        });

        Some(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server task to finish after its token was cancelled
    pub async fn stopped(self) {
        if tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .is_err()
        {
            tracing::warn!("Health endpoint did not shut down in time");
        }
    }
}
