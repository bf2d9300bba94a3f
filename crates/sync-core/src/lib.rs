//! sync-core: Engine for mirroring a local directory tree against a remote
//! cloud-storage tree.
//!
//! This crate provides:
//! - The change-state store recording what each side looked like last time
//! - Local and remote tree scanners feeding that store
//! - The reconciler choosing a direction per entry (pull, push or both ways)
//! - The executor applying it with per-item failure containment
//! - FileSystem and RemoteStorage trait abstractions with in-memory test doubles

pub mod engine;
pub mod executor;
pub mod fs;
pub mod history;
pub mod paths;
pub mod reconcile;
pub mod remote;
pub mod scan;

pub use engine::{ItemOutcome, RunReport, RunStatus, SyncEngine, SyncError};
pub use executor::{Action, ActionError, Transfer};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use history::{FileHistory, HistoryStore, Side, SideState, WriteTime};
pub use paths::{normalize_remote_root, PathError, PathMapper};
pub use reconcile::{ParseModeError, SyncDirection, SyncMode};
pub use remote::{ChildPage, InMemoryRemote, ItemKind, RemoteError, RemoteItem, RemoteOp, RemoteStorage};
pub use scan::{content_fingerprint, ScanSummary};
