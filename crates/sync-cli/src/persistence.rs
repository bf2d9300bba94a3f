//! The configuration file: account session, options and the change-state
//! store, kept as one JSON document.
//!
//! The file is guarded by an exclusive lock on a sibling `.lock` file for as
//! long as the `ConfigStore` lives, and saved by writing a temp file next to
//! it and renaming it into place.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use sync_core::HistoryStore;
use tracing::{debug, info};

use crate::auth::AccountSession;
use crate::config::SyncOptions;

/// Everything persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Absent until the first authorization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AccountSession>,

    #[serde(default)]
    pub options: SyncOptions,

    /// Change-state store, keyed by local path
    #[serde(default)]
    pub files: HistoryStore,
}

/// Locked handle on a configuration file.
pub struct ConfigStore {
    path: PathBuf,
    lock: File,
}

impl ConfigStore {
    /// Take the lock for `path`. Fails when another process holds it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = sibling(&path, |name| format!("{}.lock", name));

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        lock.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "{} is in use by another drive-sync process",
                path.display()
            )
        })?;
        debug!("Locked {}", lock_path.display());

        Ok(Self { path, lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the file, or an empty configuration when it does not exist.
    pub fn load(&self) -> Result<ConfigFile> {
        if !self.exists() {
            info!("No configuration at {}, starting a new one", self.path.display());
            return Ok(ConfigFile::default());
        }

        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let config: ConfigFile = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        info!(
            "Loaded configuration from {} ({} tracked entries)",
            self.path.display(),
            config.files.len()
        );
        Ok(config)
    }

    /// Replace the file atomically.
    pub fn save(&self, config: &ConfigFile) -> Result<()> {
        let json = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        let temp_path = sibling(&self.path, |name| format!(".{}.{}.tmp", name, std::process::id()));

        let mut temp = File::create(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        temp.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        temp.sync_all()
            .with_context(|| format!("Failed to flush {}", temp_path.display()))?;
        drop(temp);

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

/// Path next to `path` whose file name is derived from `path`'s.
fn sibling(path: &Path, name: impl Fn(&str) -> String) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(name(&file_name))
}
