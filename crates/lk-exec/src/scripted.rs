//! Deterministic process runner for tests
//!
//! [`ScriptedRunner`] never touches the OS: binaries resolve from a fixed
//! table and every spawn plays back the next queued [`Script`].

use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::env::Environment;
use crate::error::ExecError;
use crate::runner::{ChildOutput, ChildProcess, ForwardedSignal, ProcessRunner, SpawnSpec};
use crate::validate::{validate_binary_path, BinarySpec};

/// Canned behaviour for one spawn
#[derive(Debug, Clone, Default)]
pub struct Script {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    hang: bool,
    spawn_error: bool,
}

impl Script {
    /// Exit 0 after writing `stdout`
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Exit with `code` and no output
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// Never exit until killed
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// Fail to spawn
    pub fn spawn_failure() -> Self {
        Self {
            spawn_error: true,
            ..Self::default()
        }
    }

    /// Also write `stderr`
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

/// A recorded spawn
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Environment,
    pub started_at: Instant,
}

#[derive(Default)]
struct State {
    binaries: HashMap<String, PathBuf>,
    scripts: VecDeque<Script>,
    fallback: Option<Script>,
    invocations: Vec<Invocation>,
    signals: Vec<(u32, ForwardedSignal)>,
    next_pid: u32,
    running: usize,
    peak_running: usize,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

/// Scripted [`ProcessRunner`]
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<State>>,
}

impl ScriptedRunner {
    /// Runner that knows no bare binaries and has no scripts queued
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Make a bare binary name resolvable
    pub fn with_binary(self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.state().binaries.insert(name.to_string(), path.into());
        self
    }

    /// Queue a script for the next spawn
    pub fn push(&self, script: Script) {
        self.state().scripts.push_back(script);
    }

    /// Script used once the queue is empty
    pub fn set_fallback(&self, script: Script) {
        self.state().fallback = Some(script);
    }

    /// All spawns so far
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state().invocations.clone()
    }

    /// Number of spawns so far
    pub fn spawn_count(&self) -> usize {
        self.state().invocations.len()
    }

    /// Most children ever alive at the same time
    pub fn peak_running(&self) -> usize {
        self.state().peak_running
    }

    /// Signals delivered so far
    pub fn signals(&self) -> Vec<(u32, ForwardedSignal)> {
        self.state().signals.clone()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn lookup_path(&self, binary: &str, _env: &Environment) -> Result<PathBuf, ExecError> {
        match validate_binary_path(binary)? {
            BinarySpec::Absolute(path) => Ok(path),
            BinarySpec::Bare(name) => {
                self.state()
                    .binaries
                    .get(&name)
                    .cloned()
                    .ok_or(ExecError::BinaryNotFound { binary: name })
            }
        }
    }

    fn spawn(&self, spec: SpawnSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut state = self.state();
        state.invocations.push(Invocation {
            program: spec.program.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            started_at: Instant::now(),
        });

        let script = match state.scripts.pop_front() {
            Some(script) => script,
            None => state.fallback.clone().unwrap_or_default(),
        };
        if script.spawn_error {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "scripted spawn failure",
            ));
        }

        state.next_pid += 1;
        state.running += 1;
        state.peak_running = state.peak_running.max(state.running);
        Ok(Box::new(ScriptedChild {
            runner: Arc::clone(&self.state),
            pid: 10_000 + state.next_pid,
            stdout: Some(script.stdout),
            stderr: Some(script.stderr),
            exit_code: script.exit_code,
            hang: script.hang,
            killed: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            exited: false,
        }))
    }

    fn signal(&self, pid: u32, signal: ForwardedSignal) -> io::Result<()> {
        self.state().signals.push((pid, signal));
        Ok(())
    }
}

struct ScriptedChild {
    runner: Arc<Mutex<State>>,
    pid: u32,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    exit_code: i32,
    hang: bool,
    killed: Arc<AtomicBool>,
    wake: Arc<Notify>,
    exited: bool,
}

#[async_trait]
impl ChildProcess for ScriptedChild {
    fn id(&self) -> Option<u32> {
        (!self.exited).then_some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.stdout
            .take()
            .map(|bytes| Box::new(Cursor::new(bytes)) as ChildOutput)
    }

    fn take_stderr(&mut self) -> Option<ChildOutput> {
        self.stderr
            .take()
            .map(|bytes| Box::new(Cursor::new(bytes)) as ChildOutput)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        while self.hang && !self.killed.load(Ordering::SeqCst) {
            self.wake.notified().await;
        }
        self.reap();
        if self.killed.load(Ordering::SeqCst) {
            return Ok(137);
        }
        Ok(self.exit_code)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        Ok(())
    }
}

impl ScriptedChild {
    fn reap(&mut self) {
        if !self.exited {
            self.exited = true;
            lock(&self.runner).running -= 1;
        }
    }
}

impl Drop for ScriptedChild {
    fn drop(&mut self) {
        self.reap();
    }
}
