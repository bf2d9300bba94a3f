//! Local tree scan.

use sha2::{Digest, Sha256};
use std::path::MAIN_SEPARATOR;

use super::{log_observation, ScanSummary};
use crate::fs::{FileSystem, Result};
use crate::history::{HistoryStore, Side, WriteTime};
use crate::paths::PathMapper;

/// Fingerprint of a local file's content (SHA-256, hex).
pub fn content_fingerprint(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Walk the local tree below the mapper's local root and record every
/// directory and file that passes the filter.
///
/// Files are hashed only when their write time moved, so an untouched tree
/// costs one `stat` per entry.
pub async fn scan_local<F>(fs: &F, mapper: &PathMapper, store: &mut HistoryStore) -> Result<ScanSummary>
where
    F: FileSystem + ?Sized,
{
    store.begin_scan(Side::Local);
    let mut summary = ScanSummary::default();
    let mut pending = vec![mapper.local_root().to_string()];

    while let Some(dir) = pending.pop() {
        if !mapper.matches(&dir, true) {
            summary.filtered += 1;
            continue;
        }

        let stat = fs.stat(&dir).await?;
        let write_time = WriteTime::at(stat.modified);
        let observation = store.observe_local(&dir, write_time, None);
        summary.record(observation);
        log_observation(Side::Local, true, mapper.display_path(&dir), observation, write_time, None);

        let mut subdirs = Vec::new();
        for entry in fs.list(&dir).await? {
            let path = format!("{}{}", dir, entry.name);
            if entry.is_dir {
                subdirs.push(format!("{}{}", path, MAIN_SEPARATOR));
                continue;
            }
            if !mapper.matches(&path, true) {
                summary.filtered += 1;
                continue;
            }

            let stat = fs.stat(&path).await?;
            let write_time = WriteTime::at(stat.modified);
            let fingerprint = if store.local_is_stale(&path, write_time) {
                Some(content_fingerprint(&fs.read(&path).await?))
            } else {
                None
            };
            let observation = store.observe_local(&path, write_time, fingerprint);
            summary.record(observation);

            let tag = store.get(&path).and_then(|h| h.local.tag.clone());
            log_observation(
                Side::Local,
                false,
                mapper.display_path(&path),
                observation,
                write_time,
                tag.as_deref(),
            );
        }

        // Visit subdirectories in listing order
        pending.extend(subdirs.into_iter().rev());
    }

    Ok(summary)
}
