//! Stored token representation

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A token held in the token store for one profile.
///
/// Tokens are never edited field by field once stored: a successful
/// renewal replaces the whole value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The secret client token
    pub client_token: String,

    /// Opaque accessor usable for introspection
    #[serde(default)]
    pub accessor: String,

    /// Attached policies
    #[serde(default)]
    pub policies: Vec<String>,

    /// Lease granted at issuance or last renewal, in seconds
    pub lease_duration: u64,

    /// Whether the server allows extending the lease
    pub renewable: bool,

    /// Identity entity the token belongs to
    #[serde(default)]
    pub entity_id: String,

    /// When this lease was granted
    pub created_at: DateTime<Utc>,

    /// Lease expiry, `None` for tokens that never expire
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Build a token issued at `now` with the given lease.
    ///
    /// A lease of zero seconds means the token does not expire.
    pub fn issued(
        client_token: impl Into<String>,
        lease_duration: u64,
        renewable: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_token: client_token.into(),
            accessor: String::new(),
            policies: Vec::new(),
            lease_duration,
            renewable,
            entity_id: String::new(),
            created_at: now,
            expires_at: expiry_for(lease_duration, now),
        }
    }

    /// Lease duration as a `Duration`
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_duration)
    }

    /// Remaining time to live at `now`; negative once expired
    pub fn ttl_at(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.expires_at.map(|expires| expires - now)
    }
}

/// Compute the expiry for a lease starting at `now`
pub fn expiry_for(lease_duration: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if lease_duration == 0 {
        return None;
    }
    let secs = i64::try_from(lease_duration).unwrap_or(i64::MAX);
    ChronoDuration::try_seconds(secs).and_then(|lease| now.checked_add_signed(lease))
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("client_token", &"<redacted>")
            .field("accessor", &self.accessor)
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("entity_id", &self.entity_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
