//! Credential profile definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Which flavour of credential binary a profile drives.
///
/// The kind decides the default binary name and the prefix of the
/// environment variables injected into the child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryKind {
    /// HashiCorp Vault CLI (`vault`, `VAULT_*`)
    #[default]
    Vault,
    /// OpenBao CLI (`bao`, `BAO_*`)
    OpenBao,
    /// Any compatible binary reading `SERVER_*`
    Generic,
}

impl BinaryKind {
    /// Default executable name for this kind
    pub fn default_binary(self) -> &'static str {
        match self {
            BinaryKind::Vault => "vault",
            BinaryKind::OpenBao => "bao",
            BinaryKind::Generic => "server-cli",
        }
    }

    /// Prefix for connection environment variables
    pub fn env_prefix(self) -> &'static str {
        match self {
            BinaryKind::Vault => "VAULT",
            BinaryKind::OpenBao => "BAO",
            BinaryKind::Generic => "SERVER",
        }
    }
}

impl fmt::Display for BinaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryKind::Vault => write!(f, "vault"),
            BinaryKind::OpenBao => write!(f, "openbao"),
            BinaryKind::Generic => write!(f, "generic"),
        }
    }
}

/// TLS options passed through to the credential binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Disable server certificate verification
    pub skip_verify: bool,

    /// CA bundle used to verify the server
    pub ca_cert: Option<PathBuf>,

    /// Client certificate for mutual TLS
    pub client_cert: Option<PathBuf>,

    /// Client key for mutual TLS
    pub client_key: Option<PathBuf>,
}

/// A configured credential profile.
///
/// Profiles are owned by the configuration and only ever borrowed by the
/// daemon during a renewal cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique profile name, also the token store key
    pub name: String,

    /// Server address, e.g. `https://vault.example.com:8200`
    pub address: String,

    /// Enterprise namespace
    #[serde(default)]
    pub namespace: Option<String>,

    /// Flavour of credential binary
    #[serde(default)]
    pub binary_kind: BinaryKind,

    /// Binary path or bare name; defaults to the kind's binary
    #[serde(default)]
    pub binary: Option<String>,

    /// TLS material
    #[serde(default)]
    pub tls: TlsOptions,

    /// Extra environment for this profile's subprocess calls
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Profile {
    /// Create a profile with defaults for everything but name and address
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            namespace: None,
            binary_kind: BinaryKind::default(),
            binary: None,
            tls: TlsOptions::default(),
            env: BTreeMap::new(),
        }
    }

    /// The binary to execute, falling back to the kind's default
    pub fn binary(&self) -> &str {
        self.binary
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| self.binary_kind.default_binary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_defaults_to_kind() {
        let mut profile = Profile::new("dev", "https://vault.local:8200");
        assert_eq!(profile.binary(), "vault");

        profile.binary_kind = BinaryKind::OpenBao;
        assert_eq!(profile.binary(), "bao");

        profile.binary = Some("/opt/bin/bao".to_string());
        assert_eq!(profile.binary(), "/opt/bin/bao");

        profile.binary = Some(String::new());
        assert_eq!(profile.binary(), "bao");
    }

    #[test]
    fn test_profile_from_toml() {
        let profile: Profile = toml::from_str(
            r#"
            name = "prod"
            address = "https://bao.example.com"
            binary_kind = "openbao"
            namespace = "team-a"

            [tls]
            skip_verify = true
            ca_cert = "/etc/ssl/ca.pem"
            "#,
        )
        .unwrap();

        assert_eq!(profile.binary_kind, BinaryKind::OpenBao);
        assert_eq!(profile.namespace.as_deref(), Some("team-a"));
        assert!(profile.tls.skip_verify);
        assert_eq!(profile.tls.ca_cert, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert!(profile.tls.client_cert.is_none());
    }
}
