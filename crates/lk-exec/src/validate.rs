//! Pre-spawn validation of connection parameters
//!
//! Nothing is ever spawned for a profile whose address or binary fails
//! these checks.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::env::Environment;
use crate::error::{ExecError, ValidationError};

/// How a configured binary is to be located
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinarySpec {
    /// Absolute path, used verbatim after filesystem checks
    Absolute(PathBuf),
    /// Bare command name, resolved through PATH
    Bare(String),
}

/// Check that a server address is an http(s) URL with a host
pub fn validate_address(address: &str) -> Result<Url, ValidationError> {
    let reject = |reason: &str| ValidationError::Address {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.trim().is_empty() {
        return Err(reject("address is empty"));
    }

    let url = Url::parse(address).map_err(|e| reject(&e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(reject(&format!("unsupported scheme {:?}", other))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(reject("missing host"));
    }
    Ok(url)
}

/// Syntactic checks on a configured binary: absolute or bare, no `..`
pub fn validate_binary_path(binary: &str) -> Result<BinarySpec, ValidationError> {
    if binary.is_empty() {
        return Err(ValidationError::EmptyBinary);
    }
    if binary.contains('\0') {
        return Err(ValidationError::NulByte(binary.to_string()));
    }

    let path = Path::new(binary);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ValidationError::Traversal(binary.to_string()));
    }
    if path.is_absolute() {
        return Ok(BinarySpec::Absolute(path.to_path_buf()));
    }
    if binary.contains('/') || binary.contains(std::path::MAIN_SEPARATOR) {
        return Err(ValidationError::RelativeBinary(binary.to_string()));
    }
    Ok(BinarySpec::Bare(binary.to_string()))
}

/// Filesystem checks on a concrete binary path.
///
/// `allow_symlink` is false for explicitly configured paths; PATH entries
/// are commonly symlinked by package managers and are allowed through.
pub fn verify_executable(path: &Path, allow_symlink: bool) -> Result<(), ExecError> {
    let link_meta = fs::symlink_metadata(path).map_err(|e| not_found_or_io(path, e))?;
    if link_meta.file_type().is_symlink() && !allow_symlink {
        return Err(ValidationError::Symlink(path.to_path_buf()).into());
    }

    let meta = fs::metadata(path).map_err(|e| not_found_or_io(path, e))?;
    if !meta.is_file() {
        return Err(ValidationError::NotAFile(path.to_path_buf()).into());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(ValidationError::NotExecutable(path.to_path_buf()).into());
        }
    }

    Ok(())
}

fn not_found_or_io(path: &Path, e: io::Error) -> ExecError {
    if e.kind() == io::ErrorKind::NotFound {
        ExecError::BinaryNotFound {
            binary: path.display().to_string(),
        }
    } else {
        ExecError::Io(e)
    }
}

/// Resolve a binary against the `PATH` of an explicit environment
pub fn lookup_in_path(binary: &str, env: &Environment) -> Result<PathBuf, ExecError> {
    match validate_binary_path(binary)? {
        BinarySpec::Absolute(path) => {
            verify_executable(&path, false)?;
            Ok(path)
        }
        BinarySpec::Bare(name) => {
            let search = env.get("PATH").ok_or_else(|| ExecError::BinaryNotFound {
                binary: name.clone(),
            })?;

            for dir in std::env::split_paths(search) {
                if dir.as_os_str().is_empty() {
                    continue;
                }
                for candidate in candidates(&dir, &name) {
                    if verify_executable(&candidate, true).is_ok() {
                        return Ok(candidate);
                    }
                }
            }
            Err(ExecError::BinaryNotFound { binary: name })
        }
    }
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name), dir.join(format!("{}.exe", name))]
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}
