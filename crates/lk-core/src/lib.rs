//! lk-core: Core types and configuration for leasekeeper
//!
//! This crate provides the credential profile and token model, daemon
//! configuration, token storage, and PID file handling shared by the
//! subprocess executor and the renewal daemon.

pub mod config;
pub mod error;
pub mod pidfile;
pub mod profile;
pub mod store;
pub mod time;
pub mod token;

pub use error::{ConfigError, CoreError, StoreError};
pub use profile::{BinaryKind, Profile, TlsOptions};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use token::Token;
