use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::debug;

/// Durable storage for the liveness token and configuration snapshot.
///
/// Readers must tolerate absent or partially written records: a token that
/// does not parse reads as `None`, while [`SessionStore::has_token`] still
/// reports it as present.
pub trait SessionStore: Send + Sync {
    fn read_token(&self) -> Option<u32>;

    /// Whether any token is recorded, parseable or not.
    fn has_token(&self) -> bool;

    fn write_token(&self, pid: u32) -> Result<()>;

    fn delete_token(&self) -> Result<()>;

    fn read_config(&self) -> Option<String>;

    fn write_config(&self, contents: &str) -> Result<()>;

    fn delete_config(&self) -> Result<()>;
}

/// Records as two files in a state directory: `pid` and `config`.
///
/// Writes replace whole files through a temporary sibling and a rename, so
/// a concurrent reader sees the old or the new contents.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn token_path(&self) -> PathBuf {
        self.dir.join("pid")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config")
    }

    fn replace(&self, path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create state dir {:?}", self.dir))?;
        let tmp = path.with_extension("tmp");
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("create {:?}", tmp))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("write {:?}", tmp))?;
        if let Err(e) = file.sync_all() {
            debug!("Syncing {:?} failed: {}", tmp, e);
        }
        fs::rename(&tmp, path).with_context(|| format!("replace {:?}", path))?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {:?}", path)),
    }
}

impl SessionStore for FileSessionStore {
    fn read_token(&self) -> Option<u32> {
        fs::read_to_string(self.token_path())
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn has_token(&self) -> bool {
        self.token_path().exists()
    }

    fn write_token(&self, pid: u32) -> Result<()> {
        self.replace(&self.token_path(), &pid.to_string())
    }

    fn delete_token(&self) -> Result<()> {
        remove_if_present(&self.token_path())
    }

    fn read_config(&self) -> Option<String> {
        let raw = fs::read(self.config_path()).ok()?;
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    fn write_config(&self, contents: &str) -> Result<()> {
        self.replace(&self.config_path(), contents)
    }

    fn delete_config(&self) -> Result<()> {
        remove_if_present(&self.config_path())
    }
}

/// In-process records, for tests and embedders without a state directory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    token: Mutex<Option<String>>,
    config: Mutex<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw token text, as another writer might have left it.
    pub fn set_raw_token(&self, raw: impl Into<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw.into());
    }
}

impl SessionStore for MemorySessionStore {
    fn read_token(&self) -> Option<u32> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()?
            .trim()
            .parse()
            .ok()
    }

    fn has_token(&self) -> bool {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn write_token(&self, pid: u32) -> Result<()> {
        self.set_raw_token(pid.to_string());
        Ok(())
    }

    fn delete_token(&self) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn read_config(&self) -> Option<String> {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_config(&self, contents: &str) -> Result<()> {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }

    fn delete_config(&self) -> Result<()> {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
