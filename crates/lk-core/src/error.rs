//! Core error types for leasekeeper

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the core crate
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Token store error
    #[error("Token store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Token store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Profile name cannot be used as a storage key
    #[error("Invalid profile name for storage: {0:?}")]
    InvalidProfile(String),

    /// Stored token could not be decoded
    #[error("Corrupt token entry for profile {profile}: {source}")]
    Corrupt {
        profile: String,
        #[source]
        source: serde_json::Error,
    },

    /// Token could not be encoded
    #[error("Failed to encode token: {0}")]
    Encode(#[from] serde_json::Error),

    /// Backend I/O failure
    #[error("Token store I/O error: {0}")]
    Io(#[from] std::io::Error),
}
