//! Remote tree scan.

use tracing::warn;

use super::{log_observation, ScanSummary};
use crate::history::{HistoryStore, Side, WriteTime};
use crate::paths::PathMapper;
use crate::remote::{ItemKind, RemoteItem, RemoteStorage, Result};

/// Walk the remote tree below `root` (the item at the mapper's remote root)
/// and record every folder and file that passes the filter.
///
/// Listings are followed page by page until the service reports no
/// continuation. Package items and items of unknown type are skipped.
pub async fn scan_remote<R>(
    remote: &R,
    root: &RemoteItem,
    mapper: &PathMapper,
    store: &mut HistoryStore,
) -> Result<ScanSummary>
where
    R: RemoteStorage + ?Sized,
{
    store.begin_scan(Side::Remote);
    let mut summary = ScanSummary::default();
    let mut pending = vec![(mapper.remote_root().to_string(), root.clone())];

    while let Some((folder_path, folder)) = pending.pop() {
        if !mapper.matches(&folder_path, false) {
            summary.filtered += 1;
            continue;
        }

        let key = mapper.to_local(&folder_path);
        let write_time = WriteTime::at(folder.modified);
        let observation = store.observe_remote(&key, write_time, None);
        summary.record(observation);
        log_observation(Side::Remote, true, mapper.display_path(&key), observation, write_time, None);

        let mut subfolders = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let listing = remote.list_children(&folder.id, page.as_deref()).await?;

            for item in listing.items {
                let path = format!("{}{}", folder_path, item.name);
                match &item.kind {
                    ItemKind::Folder => {
                        subfolders.push((format!("{}/", path), item));
                    }
                    _ if !mapper.matches(&path, false) => {
                        summary.filtered += 1;
                    }
                    ItemKind::File { c_tag } => {
                        let key = mapper.to_local(&path);
                        let write_time = WriteTime::at(item.modified);
                        let observation = store.observe_remote(&key, write_time, c_tag.clone());
                        summary.record(observation);
                        log_observation(
                            Side::Remote,
                            false,
                            mapper.display_path(&key),
                            observation,
                            write_time,
                            c_tag.as_deref(),
                        );
                    }
                    ItemKind::Package { package_type } => {
                        summary.unsupported += 1;
                        warn!("Skipping \"{}\": {} packages cannot be synchronized", path, package_type);
                    }
                    ItemKind::Other => {
                        summary.unsupported += 1;
                        warn!("Skipping \"{}\": unknown content type", path);
                    }
                }
            }

            match listing.next_page {
                Some(next) => page = Some(next),
                None => break,
            }
        }

        pending.extend(subfolders.into_iter().rev());
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::MAIN_SEPARATOR;

    fn key(path: &str) -> String {
        format!("{}l{}{}", MAIN_SEPARATOR, MAIN_SEPARATOR, path.replace('/', &MAIN_SEPARATOR.to_string()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn mapper() -> PathMapper {
        PathMapper::new(key(""), "/Bilder")
    }

    async fn tree() -> InMemoryRemote {
        let remote = InMemoryRemote::with_page_size(2);
        remote.set_clock(at(1_000));
        for path in [
            "/Bilder/a.jpg",
            "/Bilder/b.jpg",
            "/Bilder/c.jpg",
            "/Bilder/2024/d.jpg",
            "/Bilder/tmp/e.jpg",
            "/Other/outside.jpg",
        ] {
            remote.put_content(path, path.as_bytes().to_vec()).await.unwrap();
        }
        remote
    }

    async fn scan(remote: &InMemoryRemote, mapper: &PathMapper, store: &mut HistoryStore) -> ScanSummary {
        let root = remote.get_item(mapper.remote_root()).await.unwrap();
        scan_remote(remote, &root, mapper, store).await.unwrap()
    }

    #[tokio::test]
    async fn test_scan_follows_every_page() {
        let remote = tree().await;
        let mut store = HistoryStore::new();

        let summary = scan(&remote, &mapper(), &mut store).await;

        // root, 2024/, d.jpg, a.jpg, b.jpg, c.jpg, tmp/, e.jpg
        assert_eq!(summary.visited, 8);
        for path in ["", "a.jpg", "b.jpg", "c.jpg", "2024/", "2024/d.jpg", "tmp/e.jpg"] {
            let entry = store.get(&key(path)).unwrap();
            assert!(entry.remote.seen, "{} not seen", path);
            assert!(!entry.local.seen);
        }
        assert!(!store.iter().any(|(k, _)| k.contains("outside")));
    }

    #[tokio::test]
    async fn test_file_tags_are_recorded() {
        let remote = tree().await;
        let mut store = HistoryStore::new();
        scan(&remote, &mapper(), &mut store).await;

        let entry = store.get(&key("a.jpg")).unwrap();
        let item = remote.get_item("/Bilder/a.jpg").await.unwrap();
        assert_eq!(entry.remote.tag.as_deref(), item.c_tag());
        assert_eq!(entry.remote.write_time, WriteTime::at(at(1_000)));
        assert!(store.get(&key("2024/")).unwrap().remote.tag.is_none());
    }

    #[tokio::test]
    async fn test_timestamp_only_bump_is_not_a_change() {
        let remote = tree().await;
        let mapper = mapper();
        let mut store = HistoryStore::new();
        scan(&remote, &mapper, &mut store).await;

        remote.set_modified("/Bilder/a.jpg", at(5_000));
        remote.set_clock(at(6_000));
        remote.put_content("/Bilder/b.jpg", b"edited".to_vec()).await.unwrap();
        let summary = scan(&remote, &mapper, &mut store).await;

        assert_eq!(summary.changed, 1);
        let touched = store.get(&key("a.jpg")).unwrap();
        assert!(!touched.remote.changed);
        assert_eq!(touched.remote.write_time, WriteTime::at(at(5_000)));
        assert!(store.get(&key("b.jpg")).unwrap().remote.changed);
    }

    #[tokio::test]
    async fn test_packages_are_skipped() {
        let remote = tree().await;
        remote.insert_package("/Bilder/Notizbuch", "oneNote");
        let mut store = HistoryStore::new();

        let summary = scan(&remote, &mapper(), &mut store).await;

        assert_eq!(summary.unsupported, 1);
        assert!(!store.contains(&key("Notizbuch")));
        assert!(!store.contains(&key("Notizbuch/")));
    }

    #[tokio::test]
    async fn test_excluded_package_is_filtered_not_unsupported() {
        let remote = tree().await;
        remote.insert_package("/Bilder/tmp/Notizbuch", "oneNote");
        remote.insert_package("/Bilder/Skizzen", "oneNote");
        let mapper = mapper().with_exclude(Some("^/(tmp/|Skizzen$)")).unwrap();
        let mut store = HistoryStore::new();

        let summary = scan(&remote, &mapper, &mut store).await;

        // tmp/ is dropped as a folder, Skizzen by name
        assert_eq!(summary.unsupported, 0);
        assert_eq!(summary.filtered, 2);
    }

    #[tokio::test]
    async fn test_excluded_folder_is_not_listed() {
        let remote = tree().await;
        remote.fail_on("/Bilder/tmp");
        let mapper = mapper().with_exclude(Some("^/tmp/")).unwrap();
        let mut store = HistoryStore::new();

        // Listing tmp/ would fail, so reaching the end proves it was skipped
        let summary = scan(&remote, &mapper, &mut store).await;

        assert_eq!(summary.filtered, 1);
        assert!(!store.contains(&key("tmp/")));
    }

    #[tokio::test]
    async fn test_listing_failure_aborts() {
        let remote = tree().await;
        remote.fail_on("/Bilder/2024");
        let mapper = mapper();
        let root = remote.get_item(mapper.remote_root()).await.unwrap();
        let mut store = HistoryStore::new();

        assert!(scan_remote(&remote, &root, &mapper, &mut store).await.is_err());
    }
}
