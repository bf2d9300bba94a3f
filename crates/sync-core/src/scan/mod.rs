//! Tree scanners feeding the change-state store.
//!
//! Both scanners run to completion before anything is reconciled. Either one
//! failing aborts the run: reconciling against a half-scanned tree would read
//! every unvisited path as deleted.

pub mod local;
pub mod remote;

pub use local::{content_fingerprint, scan_local};
pub use remote::scan_remote;

use tracing::{debug, info};

use crate::history::{Observation, Side, WriteTime};

/// Counters from one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Directories and files recorded in the store
    pub visited: usize,
    /// Of those, entries whose side counts as changed
    pub changed: usize,
    /// Entries rejected by the include/exclude filter
    pub filtered: usize,
    /// Remote items of a type that cannot be synchronized
    pub unsupported: usize,
}

impl ScanSummary {
    fn record(&mut self, observation: Observation) {
        self.visited += 1;
        if observation.is_change() {
            self.changed += 1;
        }
    }
}

/// One log line per visited entry; unchanged entries only at debug level.
fn log_observation(
    side: Side,
    is_dir: bool,
    path: &str,
    observation: Observation,
    write_time: WriteTime,
    tag: Option<&str>,
) {
    let kind = if is_dir { "directory" } else { "file" };
    let tag = tag.unwrap_or("-");
    if observation.is_change() {
        info!(
            "{} {} \"{}\" {:?} ({}, {})",
            side, kind, path, observation, write_time, tag
        );
    } else {
        debug!(
            "{} {} \"{}\" {:?} ({}, {})",
            side, kind, path, observation, write_time, tag
        );
    }
}
