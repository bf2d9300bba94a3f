//! Configuration file round trips and locking.

use chrono::{TimeZone, Utc};
use sync_cli::{AccountSession, ConfigFile, ConfigStore};
use sync_core::{SyncMode, WriteTime};
use tempfile::TempDir;

fn session() -> AccountSession {
    AccountSession {
        access_token: "at".into(),
        token_type: "Bearer".into(),
        refresh_token: Some("rt".into()),
        expires_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    }
}

#[test]
fn test_missing_file_loads_empty_config() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json")).unwrap();

    assert!(!store.exists());
    let config = store.load().unwrap();
    assert_eq!(config, ConfigFile::default());
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    let key = "/data/photos/a.jpg";

    let mut config = ConfigFile::default();
    config.authentication = Some(session());
    config.options.local_dir = "/data/photos/".into();
    config.options.remote_dir = "/Pictures/".into();
    config.options.mode = SyncMode::Both;
    config.options.exclude = Some(r"\.tmp$".into());
    config.files.observe_local(
        key,
        WriteTime::at(Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()),
        Some("abc123".into()),
    );
    config.files.observe_remote(
        key,
        WriteTime::at(Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap()),
        Some("c:{1},3".into()),
    );

    {
        let store = ConfigStore::open(&path).unwrap();
        store.save(&config).unwrap();
    }

    let store = ConfigStore::open(&path).unwrap();
    let loaded = store.load().unwrap();

    assert_eq!(loaded.authentication, Some(session()));
    assert_eq!(loaded.options, config.options);

    let entry = loaded.files.get(key).unwrap();
    assert_eq!(entry.local.write_time, config.files.get(key).unwrap().local.write_time);
    assert_eq!(entry.local.tag.as_deref(), Some("abc123"));
    assert_eq!(entry.remote.tag.as_deref(), Some("c:{1},3"));
    // Per-run flags are not persisted
    assert!(!entry.local.seen);
    assert!(!entry.local.changed);
    assert!(!entry.remote.seen);
}

#[test]
fn test_save_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json")).unwrap();
    store.save(&ConfigFile::default()).unwrap();
    store.save(&ConfigFile::default()).unwrap();

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["config.json", "config.json.lock"]);
}

#[test]
fn test_second_open_is_refused_while_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");

    let first = ConfigStore::open(&path).unwrap();
    assert!(ConfigStore::open(&path).is_err());

    drop(first);
    assert!(ConfigStore::open(&path).is_ok());
}

#[test]
fn test_corrupt_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = ConfigStore::open(&path).unwrap();
    let err = store.load().unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse"));
}
