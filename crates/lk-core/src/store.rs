//! Token storage
//!
//! The daemon only needs `get`, `set` and `delete` keyed by profile name.
//! Production deployments plug in an OS credential store; the file-backed
//! store here keeps one JSON document per profile and the in-memory store
//! backs tests and foreground runs.

use dashmap::DashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::is_valid_profile_name;
use crate::error::StoreError;
use crate::token::Token;

/// Storage backend for per-profile tokens
pub trait TokenStore: Send + Sync {
    /// Fetch the token for a profile, `None` when not logged in
    fn get(&self, profile: &str) -> Result<Option<Token>, StoreError>;

    /// Replace the token for a profile
    fn set(&self, profile: &str, token: &Token) -> Result<(), StoreError>;

    /// Remove the token for a profile; removing a missing token is not an error
    fn delete(&self, profile: &str) -> Result<(), StoreError>;
}

/// File-backed store: `<dir>/<profile>.json`, owner-only permissions on unix
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding token files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, profile: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_profile_name(profile) {
            return Err(StoreError::InvalidProfile(profile.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", profile)))
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, profile: &str) -> Result<Option<Token>, StoreError> {
        let path = self.path_for(profile)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                profile: profile.to_string(),
                source,
            })
    }

    fn set(&self, profile: &str, token: &Token) -> Result<(), StoreError> {
        let path = self.path_for(profile)?;
        let content = serde_json::to_vec_pretty(token)?;

        fs::create_dir_all(&self.dir)?;

        // Write beside the target and rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        tracing::debug!(profile, path = %path.display(), "Stored token");
        Ok(())
    }

    fn delete(&self, profile: &str) -> Result<(), StoreError> {
        let path = self.path_for(profile)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// In-memory store
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: DashMap<String, Token>,
}

impl MemoryTokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, profile: &str) -> Result<Option<Token>, StoreError> {
        Ok(self.tokens.get(profile).map(|t| t.value().clone()))
    }

    fn set(&self, profile: &str, token: &Token) -> Result<(), StoreError> {
        self.tokens.insert(profile.to_string(), token.clone());
        Ok(())
    }

    fn delete(&self, profile: &str) -> Result<(), StoreError> {
        self.tokens.remove(profile);
        Ok(())
    }
}
