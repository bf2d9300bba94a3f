//! Change-state store: what is known about every path on both sides.
//!
//! One `FileHistory` per store key (a full local path, directories ending with
//! the separator). Only write times and tags survive between runs; the
//! seen/changed/skip flags describe the current run and start out cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use crate::paths::PathMapper;

/// A modification time that may never have been observed.
///
/// Unknown orders before every known time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteTime(Option<DateTime<Utc>>);

impl WriteTime {
    pub const UNKNOWN: WriteTime = WriteTime(None);

    pub fn at(time: DateTime<Utc>) -> Self {
        Self(Some(time))
    }

    pub fn is_known(&self) -> bool {
        self.0.is_some()
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }
}

impl From<DateTime<Utc>> for WriteTime {
    fn from(time: DateTime<Utc>) -> Self {
        Self::at(time)
    }
}

impl fmt::Display for WriteTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(time) => write!(f, "{}", time.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => f.write_str("unknown"),
        }
    }
}

/// Which tree a piece of state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// What one side knows about an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideState {
    pub write_time: WriteTime,
    /// Content fingerprint: hash of the local file, or the remote change-tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Observed by this run's scan of the side
    #[serde(skip)]
    pub seen: bool,
    /// Write time or fingerprint moved since the previous run
    #[serde(skip)]
    pub changed: bool,
}

impl SideState {
    /// Record a successful materialization on this side.
    pub fn materialized(&mut self, write_time: WriteTime, tag: Option<String>) {
        self.write_time = write_time;
        self.tag = tag;
        self.seen = true;
        self.changed = false;
    }
}

/// Where an entry currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Both,
    LocalOnly,
    RemoteOnly,
    Neither,
}

/// The change record of one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    pub local: SideState,
    pub remote: SideState,
    /// No further operation on this entry during the current run
    #[serde(skip)]
    pub skip_sync: bool,
}

impl FileHistory {
    /// Record for a path seen for the first time on `side`.
    pub fn first_seen(side: Side) -> Self {
        let mut history = Self::default();
        history.side_mut(side).changed = true;
        history
    }

    pub fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    pub fn presence(&self) -> Presence {
        match (self.local.seen, self.remote.seen) {
            (true, true) => Presence::Both,
            (true, false) => Presence::LocalOnly,
            (false, true) => Presence::RemoteOnly,
            (false, false) => Presence::Neither,
        }
    }

    pub fn any_changed(&self) -> bool {
        self.local.changed || self.remote.changed
    }
}

/// How a scan observation compared with the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// No record existed
    New,
    /// The side's content is considered changed
    Changed,
    /// Write time moved but the content is considered the same
    Touched,
    Unchanged,
}

impl Observation {
    pub fn is_change(&self) -> bool {
        matches!(self, Observation::New | Observation::Changed)
    }
}

/// Youngest write times within a directory subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Youngest {
    pub local: WriteTime,
    pub remote: WriteTime,
}

/// The persistent path → record mapping.
///
/// Keys are kept sorted, so every directory subtree is one contiguous key
/// range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryStore {
    entries: BTreeMap<String, FileHistory>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FileHistory> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut FileHistory> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileHistory)> {
        self.entries.iter()
    }

    pub fn insert(&mut self, key: impl Into<String>, history: FileHistory) {
        self.entries.insert(key.into(), history);
    }

    /// Record for `key`, created as a first sighting on `side` if absent.
    pub fn entry(&mut self, key: &str, side: Side) -> (&mut FileHistory, bool) {
        let created = !self.entries.contains_key(key);
        let history = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| FileHistory::first_seen(side));
        (history, created)
    }

    /// Clear the per-run flags of `side` ahead of its scan.
    pub fn begin_scan(&mut self, side: Side) {
        for history in self.entries.values_mut() {
            let state = history.side_mut(side);
            state.seen = false;
            state.changed = false;
        }
    }

    /// Stored write time of `side` for `key` (unknown when there is no record).
    pub fn write_time(&self, key: &str, side: Side) -> WriteTime {
        self.entries
            .get(key)
            .map(|history| history.side(side).write_time)
            .unwrap_or_default()
    }

    /// Whether a local observation at `write_time` will replace the stored
    /// one, i.e. whether the scanner has to compute a fresh fingerprint.
    pub fn local_is_stale(&self, key: &str, write_time: WriteTime) -> bool {
        self.write_time(key, Side::Local) != write_time
    }

    /// Record a local observation. The write time alone drives change
    /// detection; `fingerprint` is only stored when the write time moved.
    pub fn observe_local(
        &mut self,
        key: &str,
        write_time: WriteTime,
        fingerprint: Option<String>,
    ) -> Observation {
        let (history, created) = self.entry(key, Side::Local);
        history.local.seen = true;
        if history.local.write_time != write_time {
            history.local.write_time = write_time;
            history.local.tag = fingerprint;
            history.local.changed = true;
        }
        if created {
            Observation::New
        } else if history.local.changed {
            Observation::Changed
        } else {
            Observation::Unchanged
        }
    }

    /// Record a remote observation. Only a different change-tag (or an item
    /// without one, such as a folder) counts as a content change.
    pub fn observe_remote(
        &mut self,
        key: &str,
        write_time: WriteTime,
        tag: Option<String>,
    ) -> Observation {
        let (history, created) = self.entry(key, Side::Remote);
        history.remote.seen = true;
        if created {
            history.remote.write_time = write_time;
            history.remote.tag = tag;
            return Observation::New;
        }
        if history.remote.write_time != write_time {
            history.remote.write_time = write_time;
            let content_changed = tag.is_none() || history.remote.tag != tag;
            history.remote.tag = tag;
            if content_changed {
                history.remote.changed = true;
                return Observation::Changed;
            }
            return if history.remote.changed {
                Observation::Changed
            } else {
                Observation::Touched
            };
        }
        if history.remote.changed {
            Observation::Changed
        } else {
            Observation::Unchanged
        }
    }

    /// Keys of `key` and everything below it. A file key covers only itself.
    pub fn subtree_keys(&self, key: &str) -> Vec<String> {
        if !PathMapper::is_dir_key(key) {
            return if self.entries.contains_key(key) {
                vec![key.to_string()]
            } else {
                Vec::new()
            };
        }
        self.entries
            .range::<str, _>((Bound::Included(key), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(key))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Apply `f` to `key` and every record below it.
    pub fn for_subtree<F>(&mut self, key: &str, mut f: F)
    where
        F: FnMut(&mut FileHistory),
    {
        for k in self.subtree_keys(key) {
            if let Some(history) = self.entries.get_mut(&k) {
                f(history);
            }
        }
    }

    /// Mark `key` and its subtree as not to be touched again this run.
    pub fn invalidate_subtree(&mut self, key: &str) {
        self.for_subtree(key, |history| history.skip_sync = true);
    }

    /// Youngest write time per side over `key` and its subtree; unknown on a
    /// side where `key` itself was not seen.
    pub fn youngest_write_times(&self, key: &str) -> Youngest {
        let Some(own) = self.entries.get(key) else {
            return Youngest::default();
        };
        let keys = self.subtree_keys(key);
        let max_of = |side: Side| {
            keys.iter()
                .filter_map(|k| self.entries.get(k))
                .map(|history| history.side(side).write_time)
                .max()
                .unwrap_or_default()
        };
        Youngest {
            local: if own.local.seen { max_of(Side::Local) } else { WriteTime::UNKNOWN },
            remote: if own.remote.seen { max_of(Side::Remote) } else { WriteTime::UNKNOWN },
        }
    }

    /// Drop every record that neither scan (nor an action) saw this run.
    /// Returns the number of records removed.
    pub fn purge_unseen(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, history| history.presence() != Presence::Neither);
        before - self.entries.len()
    }
}
