//! Child environment construction
//!
//! The child's environment is always built as an explicit overlay on a
//! snapshot; the daemon's own process environment is never modified.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;

use lk_core::{BinaryKind, Profile};

/// Snapshot of environment variables
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    /// Empty environment
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot the current process environment
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    /// Value of a variable
    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    /// Set a variable in this snapshot
    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Copy of this snapshot with `vars` layered on top; overlay values win
    pub fn overlay<I, K, V>(&self, vars: I) -> Environment
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut merged = self.clone();
        for (key, value) in vars {
            merged.set(key, value);
        }
        merged
    }

    /// Iterate over all variables
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl fmt::Debug for Environment {
    // Values carry tokens; only list keys
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.vars.keys()).finish()
    }
}

/// Connection parameters for one subprocess call
#[derive(Clone, PartialEq, Eq)]
pub struct Connection {
    pub address: String,
    pub namespace: Option<String>,
    pub token: Option<String>,
    pub kind: BinaryKind,
    pub binary: String,
    pub tls_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

impl Connection {
    /// Connection parameters for a profile, without a token
    pub fn for_profile(profile: &Profile) -> Self {
        let path = |p: &Option<std::path::PathBuf>| {
            p.as_ref().map(|p| p.to_string_lossy().into_owned())
        };
        Self {
            address: profile.address.clone(),
            namespace: profile.namespace.clone(),
            token: None,
            kind: profile.binary_kind,
            binary: profile.binary().to_string(),
            tls_skip_verify: profile.tls.skip_verify,
            ca_cert: path(&profile.tls.ca_cert),
            client_cert: path(&profile.tls.client_cert),
            client_key: path(&profile.tls.client_key),
        }
    }

    /// Variables injected for this connection.
    ///
    /// Each variable is present only when its source field is non-empty.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let prefix = self.kind.env_prefix();
        let mut vars = Vec::new();
        let mut push = |suffix: &str, value: Option<&str>| {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                vars.push((format!("{}_{}", prefix, suffix), value.to_string()));
            }
        };

        push("ADDR", Some(&self.address));
        push("TOKEN", self.token.as_deref());
        push("NAMESPACE", self.namespace.as_deref());
        push("SKIP_VERIFY", self.tls_skip_verify.then_some("true"));
        push("CACERT", self.ca_cert.as_deref());
        push("CLIENT_CERT", self.client_cert.as_deref());
        push("CLIENT_KEY", self.client_key.as_deref());
        vars
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("namespace", &self.namespace)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("kind", &self.kind)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

/// Build the full child environment: base, then connection variables, then
/// caller overrides.
pub fn child_environment(
    base: &Environment,
    connection: &Connection,
    overrides: &BTreeMap<String, String>,
) -> Environment {
    base.overlay(connection.env_vars())
        .overlay(overrides.iter().map(|(k, v)| (k.clone(), v.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn profile() -> Profile {
        let mut profile = Profile::new("dev", "https://vault.local:8200");
        profile.namespace = Some("team-a".to_string());
        profile.tls.ca_cert = Some(PathBuf::from("/etc/ca.pem"));
        profile
    }

    #[test]
    fn test_env_vars_only_for_present_fields() {
        let mut conn = Connection::for_profile(&profile());
        let vars: BTreeMap<_, _> = conn.env_vars().into_iter().collect();

        assert_eq!(vars["VAULT_ADDR"], "https://vault.local:8200");
        assert_eq!(vars["VAULT_NAMESPACE"], "team-a");
        assert_eq!(vars["VAULT_CACERT"], "/etc/ca.pem");
        assert!(!vars.contains_key("VAULT_TOKEN"));
        assert!(!vars.contains_key("VAULT_SKIP_VERIFY"));
        assert!(!vars.contains_key("VAULT_CLIENT_CERT"));

        conn.token = Some(String::new());
        assert!(!conn.env_vars().iter().any(|(k, _)| k == "VAULT_TOKEN"));

        conn.token = Some("s.abc".to_string());
        conn.tls_skip_verify = true;
        let vars: BTreeMap<_, _> = conn.env_vars().into_iter().collect();
        assert_eq!(vars["VAULT_TOKEN"], "s.abc");
        assert_eq!(vars["VAULT_SKIP_VERIFY"], "true");
    }

    #[test]
    fn test_prefix_follows_binary_kind() {
        let mut p = profile();
        p.binary_kind = BinaryKind::Generic;
        let conn = Connection::for_profile(&p);
        assert!(conn.env_vars().iter().any(|(k, _)| k == "SERVER_ADDR"));
        assert!(conn.env_vars().iter().any(|(k, _)| k == "SERVER_NAMESPACE"));
    }

    #[test]
    fn test_overlay_wins_and_base_untouched() {
        let mut base = Environment::empty();
        base.set("VAULT_ADDR", "http://stale:8200");
        base.set("VAULT_TOKEN", "inherited");
        base.set("HOME", "/home/op");

        let mut conn = Connection::for_profile(&profile());
        conn.token = Some("fresh".to_string());
        let mut overrides = BTreeMap::new();
        overrides.insert("VAULT_NAMESPACE".to_string(), "override".to_string());

        let env = child_environment(&base, &conn, &overrides);
        assert_eq!(env.get("VAULT_ADDR").unwrap(), "https://vault.local:8200");
        assert_eq!(env.get("VAULT_TOKEN").unwrap(), "fresh");
        assert_eq!(env.get("VAULT_NAMESPACE").unwrap(), "override");
        assert_eq!(env.get("HOME").unwrap(), "/home/op");

        assert_eq!(base.get("VAULT_TOKEN").unwrap(), "inherited");
    }

    #[test]
    fn test_debug_hides_values() {
        let mut env = Environment::empty();
        env.set("VAULT_TOKEN", "s.secret");
        assert!(!format!("{:?}", env).contains("s.secret"));

        let mut conn = Connection::for_profile(&profile());
        conn.token = Some("s.secret".to_string());
        assert!(!format!("{:?}", conn).contains("s.secret"));
    }
}
