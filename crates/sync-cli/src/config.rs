//! Sync options stored in the configuration file and their command-line
//! overrides.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sync_core::{normalize_remote_root, PathMapper, SyncMode};

/// Persisted options of one sync pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Absolute local directory, ending with the platform separator
    #[serde(default)]
    pub local_dir: String,

    /// OneDrive folder, `/`-rooted and ending with `/`
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Only paths matching this regex take part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,

    /// Paths matching this regex never take part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,

    #[serde(default)]
    pub mode: SyncMode,

    /// Append log output to this file as well
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            local_dir: String::new(),
            remote_dir: default_remote_dir(),
            include: None,
            exclude: None,
            mode: SyncMode::default(),
            log_file: None,
        }
    }
}

fn default_remote_dir() -> String {
    "/".to_string()
}

/// Values given on the command line. `None` keeps the stored value; for
/// `include`, `exclude` and `log_file` an empty string clears it.
#[derive(Debug, Clone, Default)]
pub struct OptionOverrides {
    pub local_dir: Option<PathBuf>,
    pub remote_dir: Option<String>,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub mode: Option<SyncMode>,
    pub log_file: Option<String>,
}

impl SyncOptions {
    /// Merge command-line values into the stored options and validate the
    /// result.
    pub fn apply(&mut self, overrides: OptionOverrides) -> Result<()> {
        if let Some(local_dir) = overrides.local_dir.filter(|p| !p.as_os_str().is_empty()) {
            self.local_dir = canonical_dir(&local_dir)?;
        }
        if let Some(remote_dir) = overrides.remote_dir.filter(|r| !r.is_empty()) {
            self.remote_dir = normalize_remote_root(&remote_dir);
        }
        if let Some(include) = overrides.include {
            self.include = non_empty(include);
        }
        if let Some(exclude) = overrides.exclude {
            self.exclude = non_empty(exclude);
        }
        if let Some(mode) = overrides.mode {
            self.mode = mode;
        }
        if let Some(log_file) = overrides.log_file {
            self.log_file = non_empty(log_file).map(PathBuf::from);
        }

        self.validate()
    }

    /// Check that the options describe a usable pairing.
    pub fn validate(&self) -> Result<()> {
        if self.local_dir.is_empty() {
            bail!("A local directory is required for a new configuration (--local-dir)");
        }
        self.to_mapper()?;
        Ok(())
    }

    /// Path mapper for these options, compiling the filters.
    pub fn to_mapper(&self) -> Result<PathMapper> {
        let mapper = PathMapper::new(self.local_dir.clone(), self.remote_dir.clone())
            .with_include(self.include.as_deref())?
            .with_exclude(self.exclude.as_deref())?;
        Ok(mapper)
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Absolute form of an existing directory, with a trailing separator.
fn canonical_dir(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Local directory {} does not exist", path.display()))?;
    if !canonical.is_dir() {
        bail!("{} is not a directory", canonical.display());
    }

    let mut dir = canonical.to_string_lossy().into_owned();
    if !dir.ends_with(MAIN_SEPARATOR) {
        dir.push(MAIN_SEPARATOR);
    }
    Ok(dir)
}
