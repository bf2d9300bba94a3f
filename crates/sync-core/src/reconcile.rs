//! Direction decision for every entry of a fully scanned store.
//!
//! Pure functions over the store: no I/O happens here, so every branch can be
//! exercised with hand-built records.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

use crate::history::{FileHistory, HistoryStore, Presence};
use crate::paths::PathMapper;

#[derive(Debug, Error)]
#[error("Unknown sync mode \"{0}\": expected pull (r2l), push (l2r) or both")]
pub struct ParseModeError(String);

/// Which way changes may flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Remote → local only
    #[default]
    #[serde(alias = "r2l")]
    Pull,
    /// Local → remote only
    #[serde(alias = "l2r")]
    Push,
    Both,
}

impl Display for SyncMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Pull => f.write_str("remote > local"),
            SyncMode::Push => f.write_str("local > remote"),
            SyncMode::Both => f.write_str("both directions"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pull" | "r2l" => Ok(SyncMode::Pull),
            "push" | "l2r" => Ok(SyncMode::Push),
            "both" => Ok(SyncMode::Both),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// The operation chosen for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Make the remote side match the local side
    PushLocal,
    /// Make the local side match the remote side
    PullRemote,
    NoOp,
}

impl Display for SyncDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::PushLocal => f.write_str("push"),
            SyncDirection::PullRemote => f.write_str("pull"),
            SyncDirection::NoOp => f.write_str("unchanged"),
        }
    }
}

/// Keys to reconcile, parents before children.
///
/// Entries seen on neither side, the local root itself and filtered paths
/// are left out. Ordering is by key length (ties broken by key, so the order
/// is deterministic).
pub fn plan(store: &HistoryStore, mapper: &PathMapper) -> Vec<String> {
    let mut keys: Vec<String> = store
        .iter()
        .filter(|(key, history)| {
            history.presence() != Presence::Neither
                && !history.skip_sync
                && key.as_str() != mapper.local_root()
                && mapper.matches(key, true)
        })
        .map(|(key, _)| key.clone())
        .collect();
    keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    keys
}

/// Direction for the entry at `key` under `mode`.
pub fn decide(mode: SyncMode, key: &str, store: &HistoryStore, mapper: &PathMapper) -> SyncDirection {
    let Some(entry) = store.get(key) else {
        return SyncDirection::NoOp;
    };
    let is_dir = PathMapper::is_dir_key(key);

    match mode {
        SyncMode::Push => one_way(entry, is_dir, SyncDirection::PushLocal),
        SyncMode::Pull => one_way(entry, is_dir, SyncDirection::PullRemote),
        SyncMode::Both => {
            let parent = mapper
                .parent_key(key)
                .and_then(|parent| store.get(&parent).cloned())
                .unwrap_or_default();
            if is_dir {
                both_ways_dir(key, entry, &parent, store)
            } else {
                both_ways_file(entry, &parent)
            }
        }
    }
}

/// Push-only or pull-only: existence mismatch always flows toward the
/// passive side; otherwise a change on the active side does, except for
/// directories that already exist on both sides.
fn one_way(entry: &FileHistory, is_dir: bool, toward: SyncDirection) -> SyncDirection {
    let (source, target) = match toward {
        SyncDirection::PushLocal => (&entry.local, &entry.remote),
        _ => (&entry.remote, &entry.local),
    };

    if entry.local.seen != entry.remote.seen {
        toward
    } else if source.changed && (!is_dir || !target.seen) {
        toward
    } else {
        SyncDirection::NoOp
    }
}

fn both_ways_file(entry: &FileHistory, parent: &FileHistory) -> SyncDirection {
    match entry.presence() {
        // Deleted remotely (the remote folder moved after our last local
        // sighting and the file was known remotely), or new locally
        Presence::LocalOnly => {
            if parent.remote.write_time > entry.local.write_time && entry.remote.write_time.is_known() {
                SyncDirection::PullRemote
            } else {
                SyncDirection::PushLocal
            }
        }
        Presence::RemoteOnly => {
            if parent.local.write_time > entry.remote.write_time && entry.local.write_time.is_known() {
                SyncDirection::PushLocal
            } else {
                SyncDirection::PullRemote
            }
        }
        Presence::Both => {
            if entry.any_changed() && entry.local.write_time != entry.remote.write_time {
                if entry.local.write_time > entry.remote.write_time {
                    SyncDirection::PushLocal
                } else {
                    SyncDirection::PullRemote
                }
            } else {
                SyncDirection::NoOp
            }
        }
        Presence::Neither => SyncDirection::NoOp,
    }
}

/// Directories compare the parent's activity on the missing side against the
/// youngest write time anywhere in the subtree on the existing side.
fn both_ways_dir(key: &str, entry: &FileHistory, parent: &FileHistory, store: &HistoryStore) -> SyncDirection {
    let youngest = store.youngest_write_times(key);
    match entry.presence() {
        Presence::LocalOnly => {
            if parent.remote.changed
                && parent.remote.write_time > youngest.local
                && entry.remote.write_time.is_known()
            {
                SyncDirection::PullRemote
            } else {
                SyncDirection::PushLocal
            }
        }
        Presence::RemoteOnly => {
            if parent.local.changed
                && parent.local.write_time > youngest.remote
                && entry.local.write_time.is_known()
            {
                SyncDirection::PushLocal
            } else {
                SyncDirection::PullRemote
            }
        }
        // Only descendant activity signals a change; the descendants carry it
        Presence::Both | Presence::Neither => SyncDirection::NoOp,
    }
}
