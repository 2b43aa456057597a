//! lk-exec: Subprocess execution engine for leasekeeper
//!
//! Runs the external credential binary with an explicit, overlaid
//! environment, streams its output in real time while optionally
//! capturing it, forwards interruption signals to the child, and parses
//! the JSON responses it prints.

pub mod capture;
pub mod env;
pub mod error;
pub mod executor;
pub mod response;
pub mod runner;
pub mod scripted;
pub mod signals;
pub mod validate;

pub use capture::{CaptureBuffer, OutputSink, DEFAULT_CAPTURE_LIMIT};
pub use env::{Connection, Environment};
pub use error::{ExecError, ExecErrorKind, ParseError, ValidationError};
pub use executor::{ExecContext, ExecutionResult, Executor, ExecutorConfig};
pub use response::{parse_auth_response, parse_lookup_response, AuthData, LookupInfo};
pub use runner::{ForwardedSignal, ProcessRunner, SystemRunner};
pub use scripted::{Script, ScriptedRunner};
