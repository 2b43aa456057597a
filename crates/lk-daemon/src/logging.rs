//! Logging setup for the daemon

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lk_core::config::LogConfig;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Rename `path` to `<path>.1` if it has grown past `max_size_mb`.
///
/// Returns whether the file was rotated. A limit of zero disables rotation.
pub fn rotate_if_oversized(path: &Path, max_size_mb: u64) -> io::Result<bool> {
    if max_size_mb == 0 {
        return Ok(false);
    }
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= max_size_mb.saturating_mul(1024 * 1024) {
        return Ok(false);
    }

    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    fs::rename(path, PathBuf::from(rotated))?;
    Ok(true)
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. Keep the returned guard alive for the
/// life of the process or buffered lines are lost.
pub fn init(config: &LogConfig, level: &str) -> Result<WorkerGuard, LoggingError> {
    let filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()));

    let mut rotated = false;
    let (writer, guard) = match &config.file {
        Some(path) => {
            let io_err = |source| LoggingError::Io {
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            rotated = rotate_if_oversized(path, config.max_size_mb).map_err(io_err)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(io_err)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(io::stderr()),
    };

    let (json_layer, text_layer) = if config.json {
        (Some(fmt::layer().json().with_writer(writer)), None)
    } else {
        let text = fmt::layer()
            .with_ansi(config.file.is_none())
            .with_writer(writer);
        (None, Some(text))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| LoggingError::Configure(e.to_string()))?;

    if rotated {
        tracing::info!("Rotated oversized log file");
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("daemon.log");

        assert!(!rotate_if_oversized(&log, 1).unwrap());

        fs::write(&log, vec![b'x'; 1024 * 1024]).unwrap();
        assert!(!rotate_if_oversized(&log, 1).unwrap());
        assert!(log.exists());

        fs::write(&log, vec![b'x'; 1024 * 1024 + 1]).unwrap();
        assert!(rotate_if_oversized(&log, 1).unwrap());
        assert!(!log.exists());
        assert!(dir.path().join("daemon.log.1").exists());
    }

    #[test]
    fn test_zero_limit_disables_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("daemon.log");
        fs::write(&log, b"some lines\n").unwrap();
        assert!(!rotate_if_oversized(&log, 0).unwrap());
        assert!(log.exists());
    }
}
