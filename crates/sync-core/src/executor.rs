//! Carries out one reconciled direction and records the result.
//!
//! State is written back only after the operation succeeded, so a failed
//! entry keeps its last known-good record.

use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs::{FileSystem, FsError};
use crate::history::{FileHistory, HistoryStore, WriteTime};
use crate::paths::PathMapper;
use crate::reconcile::SyncDirection;
use crate::remote::{RemoteError, RemoteStorage};
use crate::scan::content_fingerprint;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("local: {0}")]
    Local(#[from] FsError),

    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, ActionError>;

/// Size and duration of one file transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kb = (self.bytes as f64 / 1024.0).round();
        let millis = self.elapsed.as_millis();
        if millis > 0 {
            // bytes per millisecond is close enough to kB/s
            write!(f, "{} kB, {:.2} kB/s", kb, self.bytes as f64 / millis as f64)
        } else {
            write!(f, "{} kB, ? kB/s", kb)
        }
    }
}

/// What the executor did for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Uploaded(Transfer),
    CreatedRemoteFolder,
    DeletedRemote,
    Downloaded(Transfer),
    CreatedLocalFolder { timestamp_preserved: bool },
    DeletedLocal,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Uploaded(transfer) => write!(f, "file uploaded ({})", transfer),
            Action::CreatedRemoteFolder => f.write_str("remote folder created"),
            Action::DeletedRemote => f.write_str("remote item deleted"),
            Action::Downloaded(transfer) => write!(f, "file downloaded ({})", transfer),
            Action::CreatedLocalFolder {
                timestamp_preserved: true,
            } => f.write_str("local folder created"),
            Action::CreatedLocalFolder {
                timestamp_preserved: false,
            } => f.write_str("local folder created (warning: modification time could not be set)"),
            Action::DeletedLocal => f.write_str("local item deleted"),
        }
    }
}

/// Performs the operation a direction implies against both collaborators.
pub struct Executor<'a, F: ?Sized, R: ?Sized> {
    fs: &'a F,
    remote: &'a R,
    mapper: &'a PathMapper,
    dry_run: bool,
}

impl<'a, F, R> Executor<'a, F, R>
where
    F: FileSystem + ?Sized,
    R: RemoteStorage + ?Sized,
{
    pub fn new(fs: &'a F, remote: &'a R, mapper: &'a PathMapper, dry_run: bool) -> Self {
        Self {
            fs,
            remote,
            mapper,
            dry_run,
        }
    }

    /// Apply `direction` to the entry at `key`. Returns `None` when there was
    /// nothing to do.
    pub async fn apply(
        &self,
        key: &str,
        direction: SyncDirection,
        store: &mut HistoryStore,
    ) -> Result<Option<Action>> {
        let Some(entry) = store.get(key) else {
            return Ok(None);
        };
        let is_dir = PathMapper::is_dir_key(key);
        let (local_seen, remote_seen) = (entry.local.seen, entry.remote.seen);
        let remote_write_time = entry.remote.write_time;

        let action = match direction {
            SyncDirection::NoOp => return Ok(None),
            SyncDirection::PushLocal if local_seen && is_dir => self.create_remote_folder(key, store).await?,
            SyncDirection::PushLocal if local_seen => self.upload(key, store).await?,
            SyncDirection::PushLocal => self.delete_remote(key, store).await?,
            SyncDirection::PullRemote if remote_seen && is_dir => {
                self.create_local_folder(key, remote_write_time, store).await?
            }
            SyncDirection::PullRemote if remote_seen => self.download(key, remote_write_time, store).await?,
            SyncDirection::PullRemote => self.delete_local(key, store).await?,
        };
        Ok(Some(action))
    }

    async fn upload(&self, key: &str, store: &mut HistoryStore) -> Result<Action> {
        if self.dry_run {
            return Ok(Action::Uploaded(Transfer::default()));
        }

        let content = self.fs.read(key).await?;
        let bytes = content.len() as u64;
        let started = Instant::now();
        let item = self.remote.put_content(&self.mapper.to_remote(key), content).await?;
        let elapsed = started.elapsed();

        if let Some(entry) = store.get_mut(key) {
            entry
                .remote
                .materialized(WriteTime::at(item.modified), item.c_tag().map(str::to_string));
        }
        Ok(Action::Uploaded(Transfer { bytes, elapsed }))
    }

    async fn create_remote_folder(&self, key: &str, store: &mut HistoryStore) -> Result<Action> {
        if self.dry_run {
            return Ok(Action::CreatedRemoteFolder);
        }

        let item = self.remote.create_folder(&self.mapper.to_remote(key)).await?;
        if let Some(entry) = store.get_mut(key) {
            entry.remote.materialized(WriteTime::at(item.modified), None);
        }
        Ok(Action::CreatedRemoteFolder)
    }

    async fn delete_remote(&self, key: &str, store: &mut HistoryStore) -> Result<Action> {
        if !self.dry_run {
            self.remote.delete(&self.mapper.to_remote(key)).await?;
        }
        self.retire_subtree(key, store, |entry| entry.remote.seen = false);
        Ok(Action::DeletedRemote)
    }

    async fn download(&self, key: &str, remote_write_time: WriteTime, store: &mut HistoryStore) -> Result<Action> {
        if self.dry_run {
            return Ok(Action::Downloaded(Transfer::default()));
        }

        let started = Instant::now();
        let content = self.remote.get_content(&self.mapper.to_remote(key)).await?;
        self.fs.write(key, &content).await?;
        let elapsed = started.elapsed();

        if let Some(modified) = remote_write_time.get() {
            self.fs.set_modified(key, modified).await?;
        }
        let stat = self.fs.stat(key).await?;

        if let Some(entry) = store.get_mut(key) {
            entry
                .local
                .materialized(WriteTime::at(stat.modified), Some(content_fingerprint(&content)));
        }
        Ok(Action::Downloaded(Transfer {
            bytes: content.len() as u64,
            elapsed,
        }))
    }

    async fn create_local_folder(
        &self,
        key: &str,
        remote_write_time: WriteTime,
        store: &mut HistoryStore,
    ) -> Result<Action> {
        if self.dry_run {
            return Ok(Action::CreatedLocalFolder {
                timestamp_preserved: true,
            });
        }

        self.fs.mkdir(key).await?;
        let timestamp_preserved = match remote_write_time.get() {
            Some(modified) => match self.fs.set_modified(key, modified).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not set modification time of \"{}\": {}", key, e);
                    false
                }
            },
            None => false,
        };
        let stat = self.fs.stat(key).await?;

        if let Some(entry) = store.get_mut(key) {
            entry.local.materialized(WriteTime::at(stat.modified), None);
        }
        Ok(Action::CreatedLocalFolder { timestamp_preserved })
    }

    async fn delete_local(&self, key: &str, store: &mut HistoryStore) -> Result<Action> {
        if !self.dry_run {
            if PathMapper::is_dir_key(key) {
                self.fs.remove_dir_all(key).await?;
            } else {
                self.fs.remove_file(key).await?;
            }
        }
        self.retire_subtree(key, store, |entry| entry.local.seen = false);
        Ok(Action::DeletedLocal)
    }

    /// After a delete nothing below `key` may be touched again this run. A
    /// dry run only blocks the subtree; the records keep their flags.
    fn retire_subtree<G>(&self, key: &str, store: &mut HistoryStore, mut unsee: G)
    where
        G: FnMut(&mut FileHistory),
    {
        let dry_run = self.dry_run;
        let mut count = 0;
        store.for_subtree(key, |entry| {
            if !dry_run {
                unsee(entry);
            }
            entry.skip_sync = true;
            count += 1;
        });
        debug!("Retired {} entries below \"{}\"", count, self.mapper.display_path(key));
    }
}
