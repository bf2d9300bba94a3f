//! FileSystem trait abstraction for the local side of a sync run.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-cli) - Uses tokio::fs
//!
//! Paths handed to a `FileSystem` are full local-style paths, exactly the keys
//! of the change-state store. Directory keys carry a trailing separator, which
//! implementations must tolerate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Last modification time (UTC)
    pub modified: DateTime<Utc>,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent local filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Overwrite the modification time of a file or directory
    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<()>;

    /// Delete a single file
    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Delete a directory and everything below it
    async fn remove_dir_all(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// In-memory filesystem for testing.
///
/// Mirrors the timestamp behavior of a real filesystem that the reconciler
/// relies on: creating or removing an entry touches the parent directory's
/// modification time, rewriting an existing file does not.
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    mtimes: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Fixed clock for deterministic tests; wall clock when unset
    clock: RwLock<Option<DateTime<Utc>>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
            clock: RwLock::new(None),
        }
    }

    /// Pin the clock used for every subsequent mutation.
    pub fn set_clock(&self, now: DateTime<Utc>) {
        *self.clock.write().unwrap() = Some(now);
    }

    /// Set a specific mtime for testing "latest wins" scenarios
    pub fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) {
        let path = Self::normalize_path(path);
        self.mtimes.write().unwrap().insert(path, mtime);
    }

    /// Names of every stored file, normalized.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.read().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.read().unwrap().unwrap_or_else(Utc::now)
    }

    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/").trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn touch_parent(&self, path: &str) {
        if let Some(parent) = Self::parent_path(path) {
            let now = self.now();
            self.mtimes.write().unwrap().insert(parent, now);
        }
    }

    fn mkdir_sync(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        if self.files.read().unwrap().contains_key(&path) {
            return Err(FsError::NotDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir_sync(&parent)?;
        }

        let created = self.dirs.write().unwrap().insert(path.clone());
        if created {
            let now = self.now();
            self.mtimes.write().unwrap().insert(path.clone(), now);
            self.touch_parent(&path);
        }
        Ok(())
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        // Create parent directories
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir_sync(&parent)?;
        }

        let existed = self
            .files
            .write()
            .unwrap()
            .insert(path.clone(), content.to_vec())
            .is_some();

        let now = self.now();
        self.mtimes.write().unwrap().insert(path.clone(), now);
        if !existed {
            self.touch_parent(&path);
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);
        let mtime = self
            .mtimes
            .read()
            .unwrap()
            .get(&path)
            .copied()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let files = self.files.read().unwrap();
        if let Some(content) = files.get(&path) {
            return Ok(FileStat {
                modified: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let dirs = self.dirs.read().unwrap();
        if dirs.contains(&path) {
            return Ok(FileStat {
                modified: mtime,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_sync(path)
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<()> {
        let path = Self::normalize_path(path);
        let known =
            self.files.read().unwrap().contains_key(&path) || self.dirs.read().unwrap().contains(&path);
        if !known {
            return Err(FsError::NotFound(path));
        }
        self.mtimes.write().unwrap().insert(path, modified);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        if self.files.write().unwrap().remove(&path).is_none() {
            return Err(FsError::NotFound(path));
        }
        self.mtimes.write().unwrap().remove(&path);
        self.touch_parent(&path);
        Ok(())
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() || !self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::NotFound(path));
        }
        let prefix = format!("{}/", path);

        self.files
            .write()
            .unwrap()
            .retain(|p, _| !p.starts_with(&prefix));
        self.dirs
            .write()
            .unwrap()
            .retain(|p| p != &path && !p.starts_with(&prefix));
        self.mtimes
            .write()
            .unwrap()
            .retain(|p, _| p != &path && !p.starts_with(&prefix));

        self.touch_parent(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows a test to keep a handle on the filesystem the engine owns
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<()> {
        (**self).set_modified(path, modified).await
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        (**self).remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        (**self).remove_dir_all(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }
}
