//! PID file utilities for single-instance management
//!
//! The daemon records its PID at startup so external "is it running"
//! checks can find it. A PID file whose process is gone is stale and is
//! never reported as running.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default PID file name
pub const PID_FILE_NAME: &str = "leasekeeperd.pid";

/// PID file path inside a data directory
pub fn pid_path_in(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Get the default PID file path
pub fn default_pid_path() -> PathBuf {
    pid_path_in(&crate::config::default_data_dir())
}

/// PID recorded in `path`; `None` when there is no file.
///
/// Contents that are not a decimal PID are reported as `InvalidData`.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    contents
        .trim()
        .parse()
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Record `pid` in `path`.
///
/// The file is replaced in one rename so readers never see a partial PID.
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, format!("{}\n", pid))?;
    fs::rename(&staging, path)
}

/// Remove the PID file; a missing file is not an error
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    fs::remove_file(path).or_else(|e| match e.kind() {
        io::ErrorKind::NotFound => Ok(()),
        _ => Err(e),
    })
}

/// PID of the running daemon, if any.
///
/// A missing, unreadable or malformed file and a file naming a dead process
/// all mean "not running".
pub fn running_pid(path: &Path) -> Option<u32> {
    match read_pid_file(path) {
        Ok(Some(pid)) if pid != 0 && is_process_alive(pid) => Some(pid),
        Ok(Some(pid)) => {
            tracing::debug!("Ignoring stale PID file {:?} (pid {})", path, pid);
            None
        }
        Ok(None) => None,
        Err(e) => {
            tracing::debug!("Ignoring unreadable PID file {:?}: {}", path, e);
            None
        }
    }
}

/// Check if a process with the given PID is still alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) probes without signalling; EPERM still means the process exists
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 || handle == INVALID_HANDLE_VALUE {
            return false;
        }
        CloseHandle(handle);
        true
    }
}

/// Error acquiring the PID file
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    /// Another live daemon owns the PID file
    #[error("leasekeeperd is already running (pid {pid}, {path:?})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    /// The file could not be written
    #[error("failed to write PID file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Guard that removes the PID file when dropped
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Write the PID file unconditionally
    pub fn new(path: PathBuf, pid: u32) -> io::Result<Self> {
        write_pid_file(&path, pid)?;
        Ok(Self { path })
    }

    /// Write the PID file unless another live process already owns it.
    ///
    /// Stale files are overwritten.
    pub fn acquire(path: PathBuf, pid: u32) -> Result<Self, PidFileError> {
        if let Some(existing) = running_pid(&path) {
            if existing != pid {
                return Err(PidFileError::AlreadyRunning {
                    pid: existing,
                    path,
                });
            }
        }
        Self::new(path.clone(), pid).map_err(|source| PidFileError::Io { path, source })
    }

    /// Path of the guarded file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_pid_file(&self.path) {
            tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}
