//! Process runner abstraction
//!
//! The executor talks to processes only through [`ProcessRunner`], so tests
//! can substitute [`crate::scripted::ScriptedRunner`] for the tokio-backed
//! [`SystemRunner`].

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::env::Environment;
use crate::error::ExecError;
use crate::validate::lookup_in_path;

/// Boxed child output stream
pub type ChildOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How a child stream is wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the daemon's stream
    Inherit,
    /// Pipe back to the executor
    Piped,
    /// Discard
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Signals relayed from the daemon to a running child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardedSignal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
impl ForwardedSignal {
    fn as_raw(self) -> libc::c_int {
        match self {
            ForwardedSignal::Interrupt => libc::SIGINT,
            ForwardedSignal::Terminate => libc::SIGTERM,
        }
    }
}

/// Everything needed to start one child
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Environment,
    pub cwd: Option<PathBuf>,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

/// A started child process
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id while the child is running
    fn id(&self) -> Option<u32>;

    /// Take the piped stdout, if piped
    fn take_stdout(&mut self) -> Option<ChildOutput>;

    /// Take the piped stderr, if piped
    fn take_stderr(&mut self) -> Option<ChildOutput>;

    /// Wait for exit and return the exit code.
    ///
    /// Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Forcefully kill the child without waiting
    fn start_kill(&mut self) -> io::Result<()>;
}

/// Locates and starts processes
pub trait ProcessRunner: Send + Sync {
    /// Resolve a configured binary (absolute path or bare name) using the
    /// `PATH` of `env`
    fn lookup_path(&self, binary: &str, env: &Environment) -> Result<PathBuf, ExecError>;

    /// Start a child
    fn spawn(&self, spec: SpawnSpec) -> io::Result<Box<dyn ChildProcess>>;

    /// Deliver a signal to a running child
    fn signal(&self, pid: u32, signal: ForwardedSignal) -> io::Result<()>;
}

/// Runner backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn lookup_path(&self, binary: &str, env: &Environment) -> Result<PathBuf, ExecError> {
        lookup_in_path(binary, env)
    }

    fn spawn(&self, spec: SpawnSpec) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = Command::new(&spec.program);

        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter())
            .stdin(Stdio::null())
            .stdout(spec.stdout.to_stdio())
            .stderr(spec.stderr.to_stdio())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        Ok(Box::new(SystemChild { child }))
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: ForwardedSignal) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: kill has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, signal.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _pid: u32, _signal: ForwardedSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signal forwarding is only supported on unix",
        ))
    }
}

struct SystemChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for SystemChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as ChildOutput)
    }

    fn take_stderr(&mut self) -> Option<ChildOutput> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as ChildOutput)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Numeric exit code; signal deaths map to `128 + signal` like a shell
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: Environment::capture(),
            cwd: None,
            stdout: StdioMode::Piped,
            stderr: StdioMode::Null,
        }
    }

    #[tokio::test]
    async fn test_system_runner_exit_codes() {
        let mut child = SystemRunner.spawn(sh("exit 7")).unwrap();
        assert_eq!(child.wait().await.unwrap(), 7);

        let mut child = SystemRunner.spawn(sh("kill -TERM $$")).unwrap();
        assert_eq!(child.wait().await.unwrap(), 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_system_runner_env_is_exact() {
        let mut spec = sh("printf '%s' \"$LK_PROBE-$HOME\"");
        let mut env = Environment::empty();
        env.set("LK_PROBE", "yes");
        spec.env = env;

        let mut child = SystemRunner.spawn(spec).unwrap();
        let mut out = String::new();
        child
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);
        assert_eq!(out, "yes-");
    }

    #[tokio::test]
    async fn test_system_runner_signal() {
        let mut child = SystemRunner.spawn(sh("sleep 30")).unwrap();
        let pid = child.id().unwrap();
        SystemRunner.signal(pid, ForwardedSignal::Terminate).unwrap();
        assert_eq!(child.wait().await.unwrap(), 128 + libc::SIGTERM);
    }
}
