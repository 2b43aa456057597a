//! Parsing of the credential binary's JSON output
//!
//! The binary may print warnings before its JSON document, so parsing
//! starts by locating the first balanced object in the captured text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::fmt;

use lk_core::Token;

use crate::error::ParseError;

/// Find the first balanced JSON object embedded in `text`.
///
/// Braces inside string literals (including escaped quotes) are ignored.
/// A balanced candidate that is not valid JSON is skipped in favour of the
/// next one by opening position, including objects nested inside it. The
/// text is scanned once; only balanced candidates are handed to the JSON
/// parser.
///
/// ```
/// use lk_exec::response::extract_json_object;
///
/// let text = "WARNING! something\n{\"a\":\"}\"}\ntrailing";
/// assert_eq!(extract_json_object(text), Some("{\"a\":\"}\"}"));
/// ```
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut candidates = balanced_spans(text.as_bytes());
    candidates.sort_unstable_by_key(|&(open, _)| open);

    candidates.into_iter().find_map(|(open, close)| {
        let candidate = &text[open..=close];
        serde_json::from_str::<serde_json::Value>(candidate)
            .map(|v| v.is_object())
            .unwrap_or(false)
            .then_some(candidate)
    })
}

/// Every `(open, close)` brace pair outside string literals, in closing order.
///
/// Quotes only start a string inside an object; stray quotes in prose
/// around the document are ignored.
fn balanced_spans(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut open = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, i));
                }
            }
            _ => {}
        }
    }
    spans
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_default_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `auth` block of a login or renew response
#[derive(Clone, Deserialize)]
pub struct AuthData {
    pub client_token: String,

    #[serde(default, deserialize_with = "null_as_default_string")]
    pub accessor: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub policies: Vec<String>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub token_policies: Vec<String>,

    #[serde(default)]
    pub lease_duration: u64,

    #[serde(default)]
    pub renewable: bool,

    #[serde(default, deserialize_with = "null_as_default_string")]
    pub entity_id: String,
}

impl AuthData {
    /// Token as it stands after being issued or renewed at `now`
    pub fn into_token(self, now: DateTime<Utc>) -> Token {
        let policies = if self.policies.is_empty() {
            self.token_policies
        } else {
            self.policies
        };
        let mut token = Token::issued(self.client_token, self.lease_duration, self.renewable, now);
        token.accessor = self.accessor;
        token.policies = policies;
        token.entity_id = self.entity_id;
        token
    }
}

impl fmt::Debug for AuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthData")
            .field("client_token", &"<redacted>")
            .field("accessor", &self.accessor)
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct AuthEnvelope {
    #[serde(default)]
    auth: Option<AuthData>,
}

/// Parse the output of a login or `token renew` call
pub fn parse_auth_response(output: &str) -> Result<AuthData, ParseError> {
    let json = extract_json_object(output).ok_or(ParseError::NoJson)?;
    let envelope: AuthEnvelope = serde_json::from_str(json)?;
    envelope.auth.ok_or(ParseError::MissingAuth)
}

/// `data` block of a `token lookup` response
#[derive(Clone, Deserialize)]
pub struct LookupInfo {
    #[serde(default, deserialize_with = "null_as_default_string")]
    pub id: String,

    #[serde(default, deserialize_with = "null_as_default_string")]
    pub accessor: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub policies: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default_string")]
    pub display_name: String,

    /// Remaining TTL in seconds
    #[serde(default)]
    pub ttl: u64,

    #[serde(default)]
    pub creation_ttl: u64,

    #[serde(default, deserialize_with = "null_as_default_string")]
    pub path: String,

    #[serde(default, deserialize_with = "null_as_default_string")]
    pub entity_id: String,

    #[serde(default)]
    pub renewable: bool,

    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
}

impl LookupInfo {
    /// Token reconstructed from the lookup at `now`.
    ///
    /// The remaining TTL becomes the new expiry; the lease is the creation
    /// TTL when the server reports one.
    pub fn to_token(&self, now: DateTime<Utc>) -> Token {
        let lease = if self.creation_ttl > 0 {
            self.creation_ttl
        } else {
            self.ttl
        };
        let mut token = Token::issued(self.id.clone(), lease, self.renewable, now);
        token.accessor = self.accessor.clone();
        token.policies = self.policies.clone();
        token.entity_id = self.entity_id.clone();
        token.expires_at = match (self.expire_time, self.ttl) {
            (Some(expire), _) => Some(expire),
            (None, 0) => None,
            (None, ttl) => lk_core::token::expiry_for(ttl, now),
        };
        token
    }
}

impl fmt::Debug for LookupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupInfo")
            .field("id", &"<redacted>")
            .field("accessor", &self.accessor)
            .field("policies", &self.policies)
            .field("display_name", &self.display_name)
            .field("ttl", &self.ttl)
            .field("creation_ttl", &self.creation_ttl)
            .field("path", &self.path)
            .field("entity_id", &self.entity_id)
            .field("renewable", &self.renewable)
            .field("expire_time", &self.expire_time)
            .finish()
    }
}

#[derive(Deserialize)]
struct DataEnvelope {
    #[serde(default)]
    data: Option<LookupInfo>,
}

/// Parse the output of `token lookup`
pub fn parse_lookup_response(output: &str) -> Result<LookupInfo, ParseError> {
    let json = extract_json_object(output).ok_or(ParseError::NoJson)?;
    let envelope: DataEnvelope = serde_json::from_str(json)?;
    envelope.data.ok_or(ParseError::MissingData)
}
