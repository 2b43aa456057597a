//! Subprocess executor for the credential binary
//!
//! One call = validate, resolve, spawn, stream (and optionally capture)
//! output, forward signals, and wait, honouring cancellation and timeout.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lk_core::Profile;

use crate::capture::{CaptureBuffer, OutputSink, StreamKind};
use crate::env::{child_environment, Connection, Environment};
use crate::error::ExecError;
use crate::runner::{
    ChildOutput, ChildProcess, ForwardedSignal, ProcessRunner, SpawnSpec, StdioMode, SystemRunner,
};
use crate::signals::SignalForwarder;
use crate::validate::{validate_address, validate_binary_path};

const READ_CHUNK: usize = 8 * 1024;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Real-time destination for the child's stdout
    pub stdout: OutputSink,

    /// Real-time destination for the child's stderr
    pub stderr: OutputSink,

    /// Time between SIGTERM and SIGKILL when a call is cancelled
    pub kill_grace: Duration,

    /// How long to keep reading output after the child exits
    pub drain_timeout: Duration,

    /// Relay SIGINT/SIGTERM to the child while it runs
    pub forward_signals: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stdout: OutputSink::Inherit,
            stderr: OutputSink::Inherit,
            kill_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            forward_signals: true,
        }
    }
}

/// Explicit context for one call.
///
/// Everything the child sees comes from here rather than from process-wide
/// state.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub connection: Connection,
    pub base_env: Environment,
    pub overrides: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl ExecContext {
    /// Context for a connection on top of `base_env`
    pub fn new(connection: Connection, base_env: Environment) -> Self {
        Self {
            connection,
            base_env,
            overrides: BTreeMap::new(),
            cwd: None,
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    /// Context for a profile; the profile's own `env` becomes the overrides
    pub fn for_profile(profile: &Profile, base_env: Environment) -> Self {
        let mut ctx = Self::new(Connection::for_profile(profile), base_env);
        ctx.overrides = profile.env.clone();
        ctx
    }

    /// Inject a token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.connection.token = Some(token.into());
        self
    }

    /// Bound the call's duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tie the call to a cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Add a caller override
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Run the child in `dir`
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Environment the child will receive
    pub fn child_environment(&self) -> Environment {
        child_environment(&self.base_env, &self.connection, &self.overrides)
    }
}

/// Outcome of one call
#[derive(Debug)]
pub struct ExecutionResult {
    /// Child exit code; 1 when the child could not be run
    pub exit_code: i32,

    /// Set when the child could not be run or communicated with
    pub error: Option<ExecError>,
}

impl ExecutionResult {
    fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            error: None,
        }
    }

    fn failed(error: ExecError) -> Self {
        Self {
            exit_code: 1,
            error: Some(error),
        }
    }

    /// Child ran and exited 0
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }

    /// Exit code, or the execution error
    pub fn into_result(self) -> Result<i32, ExecError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.exit_code),
        }
    }
}

/// Runs the credential binary
pub struct Executor {
    runner: Arc<dyn ProcessRunner>,
    config: ExecutorConfig,
}

impl Executor {
    /// Executor using real processes
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_runner(Arc::new(SystemRunner), config)
    }

    /// Executor using a custom runner
    pub fn with_runner(runner: Arc<dyn ProcessRunner>, config: ExecutorConfig) -> Self {
        Self { runner, config }
    }

    /// Active configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the binary with `args`.
    ///
    /// With `capture`, stdout and stderr are read concurrently; each chunk
    /// goes to its real-time sink first and is then appended to `capture`.
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        args: &[&str],
        capture: Option<&CaptureBuffer>,
    ) -> ExecutionResult {
        match self.run(ctx, args, capture).await {
            Ok(code) => {
                tracing::debug!(
                    binary = %ctx.connection.binary,
                    exit_code = code,
                    "Credential command exited"
                );
                ExecutionResult::exited(code)
            }
            Err(err) => {
                tracing::debug!(
                    binary = %ctx.connection.binary,
                    kind = ?err.kind(),
                    "Credential command did not run: {}",
                    err
                );
                ExecutionResult::failed(err)
            }
        }
    }

    async fn run(
        &self,
        ctx: &ExecContext,
        args: &[&str],
        capture: Option<&CaptureBuffer>,
    ) -> Result<i32, ExecError> {
        validate_address(&ctx.connection.address)?;
        validate_binary_path(&ctx.connection.binary)?;

        let env = ctx.child_environment();
        let program = self.runner.lookup_path(&ctx.connection.binary, &env)?;

        if ctx.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let capturing = capture.is_some();
        let spec = SpawnSpec {
            program: program.clone(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env,
            cwd: ctx.cwd.clone(),
            stdout: stdio_mode(&self.config.stdout, capturing),
            stderr: stdio_mode(&self.config.stderr, capturing),
        };

        tracing::debug!(program = %program.display(), ?args, capturing, "Spawning credential binary");
        let mut child = self
            .runner
            .spawn(spec)
            .map_err(|source| ExecError::Spawn { program, source })?;

        let pumps = self.start_pumps(child.as_mut(), capture);

        let forwarder = match (self.config.forward_signals, child.id()) {
            (true, Some(pid)) => SignalForwarder::start(Arc::clone(&self.runner), pid),
            _ => None,
        };

        let waited = self.wait_for_exit(child.as_mut(), ctx).await;

        if let Some(forwarder) = forwarder {
            forwarder.stop().await;
        }
        let drained = self.drain(pumps).await;

        let code = waited?;
        drained?;
        Ok(code)
    }

    fn start_pumps(
        &self,
        child: &mut dyn ChildProcess,
        capture: Option<&CaptureBuffer>,
    ) -> Vec<JoinHandle<io::Result<()>>> {
        let mut pumps = Vec::with_capacity(2);
        if let Some(reader) = child.take_stdout() {
            let sink = self.config.stdout.writer(StreamKind::Stdout);
            pumps.push(tokio::spawn(pump(reader, sink, capture.cloned())));
        }
        if let Some(reader) = child.take_stderr() {
            let sink = self.config.stderr.writer(StreamKind::Stderr);
            pumps.push(tokio::spawn(pump(reader, sink, capture.cloned())));
        }
        pumps
    }

    async fn wait_for_exit(
        &self,
        child: &mut dyn ChildProcess,
        ctx: &ExecContext,
    ) -> Result<i32, ExecError> {
        let timeout = ctx.timeout;
        let expired = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let reason = tokio::select! {
            status = child.wait() => return status.map_err(ExecError::Io),
            _ = ctx.cancel.cancelled() => ExecError::Cancelled,
            _ = expired => ExecError::TimedOut(timeout.unwrap_or_default()),
        };

        self.terminate(child).await;
        Err(reason)
    }

    async fn terminate(&self, child: &mut dyn ChildProcess) {
        if let Some(pid) = child.id() {
            if let Err(e) = self.runner.signal(pid, ForwardedSignal::Terminate) {
                tracing::debug!("Failed to send SIGTERM to pid {}: {}", pid, e);
            }
            if tokio::time::timeout(self.config.kill_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            tracing::warn!(
                "Child pid {} still running {:?} after SIGTERM, killing",
                pid,
                self.config.kill_grace
            );
        }

        if let Err(e) = child.start_kill() {
            tracing::debug!("Failed to kill child: {}", e);
        }
        if let Err(e) = child.wait().await {
            tracing::debug!("Failed to reap killed child: {}", e);
        }
    }

    async fn drain(&self, pumps: Vec<JoinHandle<io::Result<()>>>) -> Result<(), ExecError> {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut first_error = None;

        for mut pump in pumps {
            match tokio::time::timeout_at(deadline, &mut pump).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    if first_error.is_none() {
                        first_error = Some(ExecError::Io(e));
                    }
                }
                Ok(Err(join_err)) => {
                    tracing::debug!("Output reader task failed: {}", join_err);
                }
                Err(_) => {
                    // A grandchild can hold the pipe open past the child's exit
                    tracing::warn!("Child output still open after exit, abandoning reader");
                    pump.abort();
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn stdio_mode(sink: &OutputSink, capturing: bool) -> StdioMode {
    if capturing {
        return StdioMode::Piped;
    }
    match sink {
        OutputSink::Inherit => StdioMode::Inherit,
        OutputSink::Discard => StdioMode::Null,
        OutputSink::Buffer(_) => StdioMode::Piped,
    }
}

async fn pump(
    mut reader: ChildOutput,
    mut sink: Box<dyn AsyncWrite + Send + Unpin>,
    capture: Option<CaptureBuffer>,
) -> io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut sink_open = true;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];

        if sink_open {
            if let Err(e) = write_chunk(&mut sink, chunk).await {
                tracing::debug!("Output sink closed, continuing without it: {}", e);
                sink_open = false;
            }
        }
        if let Some(capture) = &capture {
            capture.append(chunk);
        }
    }
    Ok(())
}

async fn write_chunk(
    sink: &mut Box<dyn AsyncWrite + Send + Unpin>,
    chunk: &[u8],
) -> io::Result<()> {
    sink.write_all(chunk).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecErrorKind, ValidationError};
    use crate::scripted::{Script, ScriptedRunner};
    use lk_core::BinaryKind;

    fn profile() -> Profile {
        Profile::new("dev", "http://127.0.0.1:8200")
    }

    fn scripted(runner: &ScriptedRunner) -> Executor {
        Executor::with_runner(
            Arc::new(runner.clone()),
            ExecutorConfig {
                stdout: OutputSink::Discard,
                stderr: OutputSink::Discard,
                kill_grace: Duration::from_millis(50),
                forward_signals: false,
                ..ExecutorConfig::default()
            },
        )
    }

    fn vault_runner() -> ScriptedRunner {
        ScriptedRunner::new().with_binary("vault", "/usr/bin/vault")
    }

    #[tokio::test]
    async fn test_injects_connection_env() {
        let runner = vault_runner();
        runner.push(Script::success("{}"));
        let executor = scripted(&runner);

        let mut p = profile();
        p.namespace = Some("ops".to_string());
        p.env.insert("VAULT_FORMAT".to_string(), "json".to_string());
        let mut base = Environment::empty();
        base.set("VAULT_TOKEN", "stale");
        let ctx = ExecContext::for_profile(&p, base).with_token("s.fresh");

        let result = executor.execute(&ctx, &["token", "lookup"], None).await;
        assert!(result.success());

        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, PathBuf::from("/usr/bin/vault"));
        assert_eq!(calls[0].args, vec!["token", "lookup"]);
        let env = &calls[0].env;
        assert_eq!(env.get("VAULT_TOKEN").unwrap(), "s.fresh");
        assert_eq!(env.get("VAULT_ADDR").unwrap(), "http://127.0.0.1:8200");
        assert_eq!(env.get("VAULT_NAMESPACE").unwrap(), "ops");
        assert_eq!(env.get("VAULT_FORMAT").unwrap(), "json");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let runner = vault_runner();
        runner.push(Script::exit(2).with_stderr("permission denied"));
        let executor = scripted(&runner);

        let ctx = ExecContext::for_profile(&profile(), Environment::empty());
        let result = executor.execute(&ctx, &["token", "renew"], None).await;
        assert_eq!(result.exit_code, 2);
        assert!(result.error.is_none());
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_capture_collects_both_streams() {
        let runner = vault_runner();
        runner.push(Script::success("{\"ok\":true}").with_stderr("WARNING! x\n"));
        let executor = scripted(&runner);

        let capture = CaptureBuffer::new();
        let ctx = ExecContext::for_profile(&profile(), Environment::empty());
        let result = executor.execute(&ctx, &["status"], Some(&capture)).await;
        assert!(result.success());

        let captured = capture.to_string_lossy();
        assert!(captured.contains("{\"ok\":true}"));
        assert!(captured.contains("WARNING! x\n"));
        assert_eq!(captured.len(), "{\"ok\":true}".len() + "WARNING! x\n".len());
    }

    #[tokio::test]
    async fn test_capture_stops_at_limit_but_child_completes() {
        let runner = vault_runner();
        runner.push(Script::success("{".repeat(3 * READ_CHUNK)));
        let executor = scripted(&runner);

        let capture = CaptureBuffer::with_limit(READ_CHUNK);
        let ctx = ExecContext::for_profile(&profile(), Environment::empty());
        let result = executor.execute(&ctx, &["token", "renew"], Some(&capture)).await;

        assert!(result.success());
        assert_eq!(capture.len(), READ_CHUNK);
        assert!(capture.truncated());
    }

    #[tokio::test]
    async fn test_missing_binary_is_distinct() {
        let runner = ScriptedRunner::new();
        let executor = scripted(&runner);

        let ctx = ExecContext::for_profile(&profile(), Environment::empty());
        let result = executor.execute(&ctx, &["status"], None).await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error.unwrap().kind(), ExecErrorKind::BinaryNotFound);
        assert_eq!(runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_parameters_never_spawn() {
        let runner = vault_runner().with_binary("evil", "/tmp/evil");
        runner.set_fallback(Script::success(""));
        let executor = scripted(&runner);

        let mut bad_addr = profile();
        bad_addr.address = "not a url".to_string();
        let ctx = ExecContext::for_profile(&bad_addr, Environment::empty());
        let result = executor.execute(&ctx, &["status"], None).await;
        assert!(matches!(
            result.error,
            Some(ExecError::Validation(ValidationError::Address { .. }))
        ));

        for binary in ["../evil", "bin/evil", "/opt/../tmp/evil", ""] {
            let mut p = profile();
            p.binary = Some(binary.to_string());
            p.binary_kind = BinaryKind::Generic;
            if binary.is_empty() {
                // Empty falls back to the kind's default name, which is unknown
                let ctx = ExecContext::for_profile(&p, Environment::empty());
                let result = executor.execute(&ctx, &["status"], None).await;
                assert_eq!(result.error.unwrap().kind(), ExecErrorKind::BinaryNotFound);
                continue;
            }
            let ctx = ExecContext::for_profile(&p, Environment::empty());
            let result = executor.execute(&ctx, &["status"], None).await;
            assert_eq!(
                result.error.unwrap().kind(),
                ExecErrorKind::Validation,
                "{:?} should fail validation",
                binary
            );
        }

        assert_eq!(runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_execution_error() {
        let runner = vault_runner();
        runner.push(Script::spawn_failure());
        let executor = scripted(&runner);

        let ctx = ExecContext::for_profile(&profile(), Environment::empty());
        let result = executor.execute(&ctx, &["status"], None).await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error.unwrap().kind(), ExecErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let runner = vault_runner();
        runner.push(Script::hang());
        let executor = scripted(&runner);

        let ctx = ExecContext::for_profile(&profile(), Environment::empty())
            .with_timeout(Duration::from_millis(50));
        let result = executor.execute(&ctx, &["token", "renew"], None).await;

        assert_eq!(result.exit_code, 1);
        assert!(matches!(result.error, Some(ExecError::TimedOut(_))));
        let signals = runner.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].1, ForwardedSignal::Terminate);
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let runner = vault_runner();
        runner.push(Script::hang());
        let executor = scripted(&runner);

        let cancel = CancellationToken::new();
        let ctx = ExecContext::for_profile(&profile(), Environment::empty())
            .with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(&ctx, &["token", "renew"], None),
        )
        .await
        .expect("cancelled call must not block");
        assert!(matches!(result.error, Some(ExecError::Cancelled)));
    }

    #[tokio::test]
    async fn test_precancelled_call_does_not_spawn() {
        let runner = vault_runner();
        let executor = scripted(&runner);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx =
            ExecContext::for_profile(&profile(), Environment::empty()).with_cancel(cancel);
        let result = executor.execute(&ctx, &["status"], None).await;
        assert!(matches!(result.error, Some(ExecError::Cancelled)));
        assert_eq!(runner.spawn_count(), 0);
    }
}
