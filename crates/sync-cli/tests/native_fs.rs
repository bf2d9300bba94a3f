//! NativeFs against a real temporary directory.

use chrono::{TimeZone, Utc};
use std::path::MAIN_SEPARATOR;
use sync_cli::NativeFs;
use sync_core::{FileSystem, FsError, HistoryStore, PathMapper};
use tempfile::TempDir;

fn root(dir: &TempDir) -> String {
    format!("{}{}", dir.path().display(), MAIN_SEPARATOR)
}

fn join(dir: &TempDir, relative: &str) -> String {
    format!("{}{}", root(dir), relative.replace('/', &MAIN_SEPARATOR.to_string()))
}

#[tokio::test]
async fn test_write_creates_parents_and_reads_back() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    let path = join(&dir, "a/b/c.txt");

    fs.write(&path, b"hello").await.unwrap();

    assert_eq!(fs.read(&path).await.unwrap(), b"hello");
    let stat = fs.stat(&path).await.unwrap();
    assert_eq!(stat.size, 5);
    assert!(!stat.is_dir);
    assert!(fs.stat(&join(&dir, "a/b/")).await.unwrap().is_dir);
}

#[tokio::test]
async fn test_missing_paths_map_to_not_found() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    let path = join(&dir, "nope.txt");

    assert!(matches!(fs.read(&path).await, Err(FsError::NotFound(_))));
    assert!(matches!(fs.stat(&path).await, Err(FsError::NotFound(_))));
    assert!(!fs.exists(&path).await.unwrap());
}

#[tokio::test]
async fn test_list_reports_kinds() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    fs.write(&join(&dir, "file.txt"), b"x").await.unwrap();
    fs.mkdir(&join(&dir, "sub/")).await.unwrap();

    let mut entries = fs.list(&root(&dir)).await.unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "file.txt");
    assert!(!entries[0].is_dir);
    assert_eq!(entries[1].name, "sub");
    assert!(entries[1].is_dir);
}

#[cfg(unix)]
#[tokio::test]
async fn test_list_skips_symbolic_links() {
    use std::os::unix::fs::symlink;

    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    fs.write(&join(&dir, "sub/file.txt"), b"x").await.unwrap();
    // A link back to the root would make the walk endless
    symlink(dir.path(), dir.path().join("sub").join("loop")).unwrap();
    symlink(dir.path().join("sub").join("file.txt"), dir.path().join("alias.txt")).unwrap();

    let names: Vec<String> = fs.list(&root(&dir)).await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["sub".to_string()]);

    let mapper = PathMapper::new(root(&dir), "/");
    let mut store = HistoryStore::new();
    let summary = sync_core::scan::scan_local(&fs, &mapper, &mut store).await.unwrap();

    // root, sub/, sub/file.txt
    assert_eq!(summary.visited, 3);
    assert!(!store.contains(&join(&dir, "sub/loop/")));
    assert!(!store.contains(&join(&dir, "alias.txt")));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_list_skips_names_that_are_not_utf8() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    fs.write(&join(&dir, "good.txt"), b"g").await.unwrap();
    std::fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"b").unwrap();

    let names: Vec<String> = fs.list(&root(&dir)).await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["good.txt".to_string()]);

    // The scan completes instead of failing to stat a mangled name
    let mapper = PathMapper::new(root(&dir), "/");
    let mut store = HistoryStore::new();
    let summary = sync_core::scan::scan_local(&fs, &mapper, &mut store).await.unwrap();
    assert_eq!(summary.visited, 2);
}

#[tokio::test]
async fn test_set_modified_on_file_and_directory() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    let file = join(&dir, "photo.jpg");
    let folder = join(&dir, "album/");
    fs.write(&file, b"jpg").await.unwrap();
    fs.mkdir(&folder).await.unwrap();

    let when = Utc.with_ymd_and_hms(2020, 6, 1, 12, 30, 0).unwrap();
    fs.set_modified(&file, when).await.unwrap();
    fs.set_modified(&folder, when).await.unwrap();

    assert_eq!(fs.stat(&file).await.unwrap().modified, when);
    assert_eq!(fs.stat(&folder).await.unwrap().modified, when);
}

#[tokio::test]
async fn test_remove_dir_all_removes_nested_tree() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    fs.write(&join(&dir, "tree/a.txt"), b"a").await.unwrap();
    fs.write(&join(&dir, "tree/deep/b.txt"), b"b").await.unwrap();
    fs.mkdir(&join(&dir, "tree/deep/empty/")).await.unwrap();
    fs.write(&join(&dir, "keep.txt"), b"k").await.unwrap();

    fs.remove_dir_all(&join(&dir, "tree/")).await.unwrap();

    assert!(!fs.exists(&join(&dir, "tree/")).await.unwrap());
    assert!(fs.exists(&join(&dir, "keep.txt")).await.unwrap());
}

#[tokio::test]
async fn test_remove_file() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    let path = join(&dir, "gone.txt");
    fs.write(&path, b"x").await.unwrap();

    fs.remove_file(&path).await.unwrap();
    assert!(!fs.exists(&path).await.unwrap());
    assert!(matches!(fs.remove_file(&path).await, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn test_local_scan_over_native_tree() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new();
    fs.write(&join(&dir, "docs/readme.md"), b"# hi").await.unwrap();
    fs.write(&join(&dir, "notes.txt"), b"n").await.unwrap();

    let mapper = PathMapper::new(root(&dir), "/");
    let mut store = HistoryStore::new();
    let summary = sync_core::scan::scan_local(&fs, &mapper, &mut store).await.unwrap();

    assert_eq!(summary.changed, summary.visited);
    assert!(store.contains(&join(&dir, "docs/")));
    assert!(store.contains(&join(&dir, "docs/readme.md")));
    assert!(store.contains(&join(&dir, "notes.txt")));

    let readme = store.get(&join(&dir, "docs/readme.md")).unwrap();
    assert_eq!(readme.local.tag.as_deref(), Some(sync_core::content_fingerprint(b"# hi").as_str()));
}
