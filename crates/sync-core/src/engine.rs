//! SyncEngine: one batch run from scan to purge.
//!
//! A run goes through four phases:
//!
//! 1. Resolve the remote root item
//! 2. Scan the local tree, then the remote tree
//! 3. Reconcile every entry in ascending path length and execute its direction
//! 4. Purge entries seen on neither side
//!
//! The scans work on a copy of the caller's store. Only a run that completes
//! hands its state back, so an aborted run leaves the store exactly as it was
//! loaded.

use thiserror::Error;
use tracing::{debug, error, info};

use crate::executor::{Action, Executor};
use crate::fs::{FileSystem, FsError};
use crate::history::HistoryStore;
use crate::paths::PathMapper;
use crate::reconcile::{self, SyncDirection, SyncMode};
use crate::remote::{RemoteError, RemoteStorage};
use crate::scan::{scan_local, scan_remote, ScanSummary};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Cannot open remote folder {path}: {source}")]
    RemoteRoot {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("Local scan failed: {0}")]
    LocalScan(#[source] FsError),

    #[error("Remote scan failed: {0}")]
    RemoteScan(#[source] RemoteError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Result of one reconciled entry.
#[derive(Debug)]
pub struct ItemOutcome {
    /// Path relative to the local root
    pub path: String,
    pub direction: SyncDirection,
    pub action: Option<Action>,
    /// Error text when the operation failed
    pub error: Option<String>,
}

/// Overall result of a run that got past the scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Clean,
    CompletedWithErrors,
}

/// Report from one sync run
#[derive(Debug, Default)]
pub struct RunReport {
    pub local_scan: ScanSummary,
    pub remote_scan: ScanSummary,
    /// One outcome per reconciled entry, in processing order
    pub items: Vec<ItemOutcome>,
    /// Entries dropped because neither side has them anymore
    pub purged: usize,
    pub dry_run: bool,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.failed() > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Clean
        }
    }

    /// Entries on which an operation succeeded
    pub fn applied(&self) -> usize {
        self.items.iter().filter(|item| item.action.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.iter().filter(|item| item.error.is_some()).count()
    }

    /// Entries whose direction was not `NoOp`
    pub fn changes(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.direction != SyncDirection::NoOp)
            .count()
    }
}

/// Drives a run over a local filesystem and a remote store.
pub struct SyncEngine<F, R> {
    fs: F,
    remote: R,
    mapper: PathMapper,
    mode: SyncMode,
    dry_run: bool,
}

impl<F: FileSystem, R: RemoteStorage> SyncEngine<F, R> {
    pub fn new(fs: F, remote: R, mapper: PathMapper, mode: SyncMode) -> Self {
        Self {
            fs,
            remote,
            mapper,
            mode,
            dry_run: false,
        }
    }

    /// Decide and report, but modify neither side.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run one full pass against `store`.
    ///
    /// On `Err`, and after a dry run, the store is untouched. Otherwise it
    /// holds the post-run state; persisting it is up to the caller.
    pub async fn run(&self, store: &mut HistoryStore) -> Result<RunReport> {
        let root_path = self.mapper.remote_root().to_string();
        let root = self
            .remote
            .get_item(&root_path)
            .await
            .map_err(|source| SyncError::RemoteRoot {
                path: root_path.clone(),
                source,
            })?;

        let mut working = store.clone();

        info!("Scanning local directory {}", self.mapper.local_root());
        let local_scan = scan_local(&self.fs, &self.mapper, &mut working)
            .await
            .map_err(SyncError::LocalScan)?;
        debug!("Local scan: {:?}", local_scan);

        info!("Scanning remote folder {}", root_path);
        let remote_scan = scan_remote(&self.remote, &root, &self.mapper, &mut working)
            .await
            .map_err(SyncError::RemoteScan)?;
        debug!("Remote scan: {:?}", remote_scan);

        info!("Looking for differences");
        let mut report = RunReport {
            local_scan,
            remote_scan,
            dry_run: self.dry_run,
            ..Default::default()
        };
        let executor = Executor::new(&self.fs, &self.remote, &self.mapper, self.dry_run);

        for key in reconcile::plan(&working, &self.mapper) {
            // An earlier delete or failure may have retired this entry
            if working.get(&key).is_none_or(|entry| entry.skip_sync) {
                continue;
            }

            let direction = reconcile::decide(self.mode, &key, &working, &self.mapper);
            let path = self.mapper.display_path(&key).to_string();

            let outcome = match executor.apply(&key, direction, &mut working).await {
                Ok(Some(action)) => {
                    info!("{} {}: {}", direction, path, action);
                    ItemOutcome {
                        path,
                        direction,
                        action: Some(action),
                        error: None,
                    }
                }
                Ok(None) => {
                    debug!("{} {}", direction, path);
                    ItemOutcome {
                        path,
                        direction,
                        action: None,
                        error: None,
                    }
                }
                Err(e) => {
                    error!("{} {}: {}", direction, path, e);
                    working.invalidate_subtree(&key);
                    ItemOutcome {
                        path,
                        direction,
                        action: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.items.push(outcome);
        }

        report.purged = working.purge_unseen();
        if !self.dry_run {
            *store = working;
        }

        info!(
            "Sync finished: {} changes, {} applied, {} failed, {} records purged{}",
            report.changes(),
            report.applied(),
            report.failed(),
            report.purged,
            if self.dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }
}
