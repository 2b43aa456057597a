//! Error types for subprocess execution

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a profile's connection parameters were rejected before spawning
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Server address is not an http(s) URL with a host
    #[error("invalid server address {address:?}: {reason}")]
    Address { address: String, reason: String },

    /// No binary configured
    #[error("binary path is empty")]
    EmptyBinary,

    /// Binary is neither absolute nor a bare name
    #[error("binary {0:?} must be an absolute path or a bare command name")]
    RelativeBinary(String),

    /// Binary path contains `..`
    #[error("binary path {0:?} contains a parent-directory component")]
    Traversal(String),

    /// Binary path contains a NUL byte
    #[error("binary path {0:?} contains a NUL byte")]
    NulByte(String),

    /// Configured binary is a symlink
    #[error("binary {0:?} is a symlink")]
    Symlink(PathBuf),

    /// Binary is not a regular file
    #[error("binary {0:?} is not a regular file")]
    NotAFile(PathBuf),

    /// Binary lacks execute permission
    #[error("binary {0:?} is not executable")]
    NotExecutable(PathBuf),
}

/// Failure to run the credential binary at all.
///
/// A child that ran and exited non-zero is not an `ExecError`; it is
/// reported through the exit code of [`crate::ExecutionResult`].
#[derive(Error, Debug)]
pub enum ExecError {
    /// Connection parameters failed validation; nothing was spawned
    #[error("invalid invocation: {0}")]
    Validation(#[from] ValidationError),

    /// Binary could not be found on disk or in PATH
    #[error("binary not found: {binary}")]
    BinaryNotFound { binary: String },

    /// The OS refused to start the process
    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading output from or waiting on the child failed
    #[error("I/O error communicating with child: {0}")]
    Io(#[from] io::Error),

    /// Caller cancelled the call; the child was terminated
    #[error("command cancelled")]
    Cancelled,

    /// Call exceeded its time limit; the child was terminated
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
}

/// Coarse classification of [`ExecError`] used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    Validation,
    BinaryNotFound,
    Execution,
    Cancelled,
    TimedOut,
}

impl ExecError {
    /// Classify this error
    pub fn kind(&self) -> ExecErrorKind {
        match self {
            ExecError::Validation(_) => ExecErrorKind::Validation,
            ExecError::BinaryNotFound { .. } => ExecErrorKind::BinaryNotFound,
            ExecError::Spawn { .. } | ExecError::Io(_) => ExecErrorKind::Execution,
            ExecError::Cancelled => ExecErrorKind::Cancelled,
            ExecError::TimedOut(_) => ExecErrorKind::TimedOut,
        }
    }
}

/// Failure to interpret the binary's structured output
#[derive(Error, Debug)]
pub enum ParseError {
    /// No JSON object anywhere in the output
    #[error("no JSON object found in command output")]
    NoJson,

    /// JSON object did not match the expected shape
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),

    /// Response had no `auth` block
    #[error("response has no auth block")]
    MissingAuth,

    /// Response had no `data` block
    #[error("response has no data block")]
    MissingData,
}
