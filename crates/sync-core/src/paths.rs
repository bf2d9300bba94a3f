//! Translation between the local and remote path namespaces, plus the
//! include/exclude filter.
//!
//! Local paths are full paths under `local_root` using the platform separator;
//! remote paths are `/`-separated under `remote_root`. Both roots end with
//! their separator, and directory paths on either side do too.

use regex::Regex;
use std::path::MAIN_SEPARATOR;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Invalid {which} pattern \"{pattern}\": {source}")]
    InvalidPattern {
        which: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Maps paths between the two trees and decides which paths take part.
#[derive(Debug, Clone)]
pub struct PathMapper {
    local_root: String,
    remote_root: String,
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl PathMapper {
    /// Create a mapper for the two roots. Missing trailing separators are added
    /// and the remote root is forced to start with `/`.
    pub fn new(local_root: impl Into<String>, remote_root: impl Into<String>) -> Self {
        let mut local_root = local_root.into();
        if !local_root.ends_with(MAIN_SEPARATOR) {
            local_root.push(MAIN_SEPARATOR);
        }
        Self {
            local_root,
            remote_root: normalize_remote_root(&remote_root.into()),
            include: None,
            exclude: None,
        }
    }

    /// Only paths matching `pattern` take part (`None` or empty: no constraint).
    pub fn with_include(mut self, pattern: Option<&str>) -> Result<Self, PathError> {
        self.include = compile("include", pattern)?;
        Ok(self)
    }

    /// Paths matching `pattern` never take part (`None` or empty: no constraint).
    pub fn with_exclude(mut self, pattern: Option<&str>) -> Result<Self, PathError> {
        self.exclude = compile("exclude", pattern)?;
        Ok(self)
    }

    pub fn local_root(&self) -> &str {
        &self.local_root
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Local path → remote path.
    pub fn to_remote(&self, local: &str) -> String {
        let relative = local.strip_prefix(&self.local_root).unwrap_or(local);
        format!(
            "{}{}",
            self.remote_root,
            relative.replace(MAIN_SEPARATOR, "/")
        )
    }

    /// Remote path → local path (the store key).
    pub fn to_local(&self, remote: &str) -> String {
        let relative = remote.strip_prefix(&self.remote_root).unwrap_or(remote);
        format!(
            "{}{}",
            self.local_root,
            relative.replace('/', &MAIN_SEPARATOR.to_string())
        )
    }

    /// The path as the filter sees it: relative to its root, `/`-separated,
    /// rooted at `/`. Identical for both forms of the same entry.
    pub fn filter_path(&self, path: &str, is_local: bool) -> String {
        let relative = if is_local {
            path.strip_prefix(&self.local_root)
                .unwrap_or(path)
                .replace(MAIN_SEPARATOR, "/")
        } else {
            path.strip_prefix(&self.remote_root)
                .unwrap_or(path)
                .to_string()
        };
        format!("/{}", relative.trim_start_matches('/'))
    }

    /// Whether `path` takes part in the sync.
    pub fn matches(&self, path: &str, is_local: bool) -> bool {
        let candidate = self.filter_path(path, is_local);

        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&candidate) {
                debug!("Skipping \"{}\" (exclude filter matched)", candidate);
                return false;
            }
        }
        if let Some(include) = &self.include {
            if !include.is_match(&candidate) {
                debug!("Skipping \"{}\" (include filter not matched)", candidate);
                return false;
            }
        }
        true
    }

    /// Whether a store key names a directory.
    pub fn is_dir_key(key: &str) -> bool {
        key.ends_with(MAIN_SEPARATOR)
    }

    /// Key of the directory containing `key` (the root has none).
    pub fn parent_key(&self, key: &str) -> Option<String> {
        if key.len() <= self.local_root.len() {
            return None;
        }
        let trimmed = key.strip_suffix(MAIN_SEPARATOR).unwrap_or(key);
        trimmed
            .rfind(MAIN_SEPARATOR)
            .map(|pos| trimmed[..=pos].to_string())
    }

    /// Path relative to the local root, for display.
    pub fn display_path<'a>(&self, key: &'a str) -> &'a str {
        let relative = key.get(self.local_root.len()..).unwrap_or(key);
        if relative.is_empty() { key } else { relative }
    }
}

fn compile(which: &'static str, pattern: Option<&str>) -> Result<Option<Regex>, PathError> {
    match pattern.filter(|p| !p.is_empty()) {
        Some(pattern) => Regex::new(pattern)
            .map(Some)
            .map_err(|source| PathError::InvalidPattern {
                which,
                pattern: pattern.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// `Bilder` / `\Bilder\` / `/Bilder` → `/Bilder/`; empty → `/`.
pub fn normalize_remote_root(root: &str) -> String {
    let trimmed = root.replace('\\', "/");
    let trimmed = trimmed.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}
