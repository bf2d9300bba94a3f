//! Native filesystem implementation using tokio::fs.
//!
//! Paths are the full local paths stored as change-state keys, so no base
//! directory is joined in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use sync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use tokio::fs;
use tracing::{info, warn};

/// Local filesystem as seen by the sync engine
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFs;

impl NativeFs {
    pub fn new() -> Self {
        Self
    }
}

fn io_error(e: std::io::Error, path: &Path) -> FsError {
    let shown = path.display().to_string();
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(shown),
        ErrorKind::IsADirectory => FsError::IsDirectory(shown),
        ErrorKind::NotADirectory => FsError::NotDirectory(shown),
        _ => FsError::Io(format!("{}: {}", shown, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = Path::new(path);
        fs::read(full_path).await.map_err(|e| io_error(e, full_path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = Path::new(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, parent))?;
        }

        fs::write(full_path, content)
            .await
            .map_err(|e| io_error(e, full_path))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = Path::new(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(full_path)
            .await
            .map_err(|e| io_error(e, full_path))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error(e, full_path))?
        {
            let entry_path = entry.path();
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => {
                    warn!("Skipping {}: name is not valid UTF-8", entry_path.display());
                    continue;
                }
            };

            // Does not follow links, which may point outside the tree or form a cycle
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| io_error(e, &entry_path))?;
            if file_type.is_symlink() {
                warn!("Skipping symbolic link {}", entry_path.display());
                continue;
            }

            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = Path::new(path);
        let metadata = fs::metadata(full_path)
            .await
            .map_err(|e| io_error(e, full_path))?;

        let modified = metadata
            .modified()
            .map_err(|e| io_error(e, full_path))?;

        Ok(FileStat {
            modified: DateTime::<Utc>::from(modified),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = Path::new(path);
        fs::create_dir_all(full_path)
            .await
            .map_err(|e| io_error(e, full_path))
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<()> {
        let full_path = PathBuf::from(path);
        let mtime = FileTime::from_system_time(SystemTime::from(modified));

        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&full_path, mtime).map_err(|e| io_error(e, &full_path))
        })
        .await
        .map_err(|e| FsError::Io(e.to_string()))?
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let full_path = Path::new(path);
        fs::remove_file(full_path)
            .await
            .map_err(|e| io_error(e, full_path))
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        let root = PathBuf::from(path);
        let mut pending = vec![root];
        let mut visited = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| io_error(e, &dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(e, &dir))? {
                let entry_path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(e, &entry_path))?;

                if file_type.is_dir() {
                    pending.push(entry_path);
                } else {
                    fs::remove_file(&entry_path)
                        .await
                        .map_err(|e| io_error(e, &entry_path))?;
                    info!("Deleted file {}", entry_path.display());
                }
            }
            visited.push(dir);
        }

        // Every directory comes after its parent in `visited`
        for dir in visited.into_iter().rev() {
            fs::remove_dir(&dir).await.map_err(|e| io_error(e, &dir))?;
            info!("Deleted directory {}", dir.display());
        }

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = Path::new(path);
        fs::try_exists(full_path)
            .await
            .map_err(|e| io_error(e, full_path))
    }
}
