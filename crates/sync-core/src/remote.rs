//! RemoteStorage trait abstraction for the cloud side of a sync run.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `GraphClient` (in sync-cli) - OneDrive via Microsoft Graph
//!
//! Remote paths are forward-slash separated and rooted at `/`; folder paths
//! may carry a trailing `/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote item not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Remote request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// What a remote item is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Folder,
    /// Regular file; `c_tag` changes iff the content changes
    File { c_tag: Option<String> },
    /// Provider-specific composite document (e.g. a OneNote notebook)
    Package { package_type: String },
    Other,
}

/// Metadata of one remote item.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub modified: DateTime<Utc>,
    pub kind: ItemKind,
}

impl RemoteItem {
    pub fn c_tag(&self) -> Option<&str> {
        match &self.kind {
            ItemKind::File { c_tag } => c_tag.as_deref(),
            _ => None,
        }
    }
}

/// One page of a child listing.
#[derive(Debug, Clone, Default)]
pub struct ChildPage {
    pub items: Vec<RemoteItem>,
    /// Continuation token, `None` once the listing is exhausted
    pub next_page: Option<String>,
}

/// Remote storage API consumed by the scanners and the executor.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Metadata of the item at `path`
    async fn get_item(&self, path: &str) -> Result<RemoteItem>;

    /// One page of the children of `item_id`; pass the previous page's
    /// `next_page` to continue
    async fn list_children(&self, item_id: &str, page: Option<&str>) -> Result<ChildPage>;

    /// Full content of the file at `path`
    async fn get_content(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace the file at `path`
    async fn put_content(&self, path: &str, content: Vec<u8>) -> Result<RemoteItem>;

    /// Create the folder at `path`, returning the existing one if present
    async fn create_folder(&self, path: &str) -> Result<RemoteItem>;

    /// Delete the item at `path` (folders recursively)
    async fn delete(&self, path: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteStorage + Send + Sync> RemoteStorage for std::sync::Arc<T> {
    async fn get_item(&self, path: &str) -> Result<RemoteItem> {
        (**self).get_item(path).await
    }

    async fn list_children(&self, item_id: &str, page: Option<&str>) -> Result<ChildPage> {
        (**self).list_children(item_id, page).await
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        (**self).get_content(path).await
    }

    async fn put_content(&self, path: &str, content: Vec<u8>) -> Result<RemoteItem> {
        (**self).put_content(path, content).await
    }

    async fn create_folder(&self, path: &str) -> Result<RemoteItem> {
        (**self).create_folder(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Folder,
    File { content: Vec<u8>, version: u64 },
    Package(String),
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    modified: DateTime<Utc>,
    kind: NodeKind,
}

/// A mutating call observed by `InMemoryRemote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Put(String),
    CreateFolder(String),
    Delete(String),
}

/// In-memory remote store for testing.
///
/// Children are listed in name order, `page_size` at a time. Like OneDrive,
/// adding or removing a child touches the parent folder's modification time.
pub struct InMemoryRemote {
    nodes: RwLock<BTreeMap<String, Node>>,
    next_id: Mutex<u64>,
    clock: RwLock<Option<DateTime<Utc>>>,
    page_size: usize,
    failing: RwLock<HashSet<String>>,
    ops: Mutex<Vec<RemoteOp>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_page_size(200)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node {
                id: "root".to_string(),
                modified: DateTime::<Utc>::UNIX_EPOCH,
                kind: NodeKind::Folder,
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            next_id: Mutex::new(1),
            clock: RwLock::new(None),
            page_size: page_size.max(1),
            failing: RwLock::new(HashSet::new()),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Pin the clock used for every subsequent mutation.
    pub fn set_clock(&self, now: DateTime<Utc>) {
        *self.clock.write().unwrap() = Some(now);
    }

    /// Override the modification time of an existing item.
    pub fn set_modified(&self, path: &str, modified: DateTime<Utc>) {
        let path = Self::normalize_path(path);
        if let Some(node) = self.nodes.write().unwrap().get_mut(&path) {
            node.modified = modified;
        }
    }

    /// Make every call addressing `path` (or listing it) fail.
    pub fn fail_on(&self, path: &str) {
        self.failing
            .write()
            .unwrap()
            .insert(Self::normalize_path(path));
    }

    /// Add a provider-specific package item (never synced).
    pub fn insert_package(&self, path: &str, package_type: &str) {
        let path = Self::normalize_path(path);
        self.ensure_parents(&path);
        let node = Node {
            id: self.allocate_id(),
            modified: self.now(),
            kind: NodeKind::Package(package_type.to_string()),
        };
        self.nodes.write().unwrap().insert(path, node);
    }

    /// Mutating calls received so far, in order.
    pub fn operations(&self) -> Vec<RemoteOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes
            .read()
            .unwrap()
            .contains_key(&Self::normalize_path(path))
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.read().unwrap().get(&Self::normalize_path(path)) {
            Some(Node {
                kind: NodeKind::File { content, .. },
                ..
            }) => Some(content.clone()),
            _ => None,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.read().unwrap().unwrap_or_else(Utc::now)
    }

    fn allocate_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap();
        let id = format!("item-{}", *next);
        *next += 1;
        id
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        if path.is_empty() {
            None
        } else {
            match path.rfind('/') {
                Some(pos) => Some(path[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn name_of(path: &str) -> String {
        path.rsplit('/').next().unwrap_or_default().to_string()
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.failing.read().unwrap().contains(path) {
            return Err(RemoteError::Http {
                status: 500,
                message: format!("injected failure for /{}", path),
            });
        }
        Ok(())
    }

    fn touch_parent(&self, path: &str) {
        if let Some(parent) = Self::parent_path(path) {
            let now = self.now();
            if let Some(node) = self.nodes.write().unwrap().get_mut(&parent) {
                node.modified = now;
            }
        }
    }

    fn ensure_parents(&self, path: &str) {
        let Some(parent) = Self::parent_path(path) else {
            return;
        };
        if self.nodes.read().unwrap().contains_key(&parent) {
            return;
        }
        self.ensure_parents(&parent);
        let node = Node {
            id: self.allocate_id(),
            modified: self.now(),
            kind: NodeKind::Folder,
        };
        self.nodes.write().unwrap().insert(parent.clone(), node);
        self.touch_parent(&parent);
    }

    fn to_item(path: &str, node: &Node) -> RemoteItem {
        let kind = match &node.kind {
            NodeKind::Folder => ItemKind::Folder,
            NodeKind::File { version, .. } => ItemKind::File {
                c_tag: Some(format!("{{{}}},{}", node.id, version)),
            },
            NodeKind::Package(package_type) => ItemKind::Package {
                package_type: package_type.clone(),
            },
        };
        RemoteItem {
            id: node.id.clone(),
            name: Self::name_of(path),
            modified: node.modified,
            kind,
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStorage for InMemoryRemote {
    async fn get_item(&self, path: &str) -> Result<RemoteItem> {
        let path = Self::normalize_path(path);
        self.check(&path)?;
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&path)
            .map(|node| Self::to_item(&path, node))
            .ok_or_else(|| RemoteError::NotFound(format!("/{}", path)))
    }

    async fn list_children(&self, item_id: &str, page: Option<&str>) -> Result<ChildPage> {
        let nodes = self.nodes.read().unwrap();
        let (folder, _) = nodes
            .iter()
            .find(|(_, node)| node.id == item_id)
            .ok_or_else(|| RemoteError::NotFound(item_id.to_string()))?;
        self.check(folder)?;

        let prefix = if folder.is_empty() {
            String::new()
        } else {
            format!("{}/", folder)
        };
        let children: Vec<RemoteItem> = nodes
            .iter()
            .filter(|(path, _)| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(path, node)| Self::to_item(path, node))
            .collect();

        let offset: usize = match page {
            Some(token) => token
                .parse()
                .map_err(|_| RemoteError::Decode(format!("bad page token: {}", token)))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(children.len());
        let next_page = (end < children.len()).then(|| end.to_string());

        Ok(ChildPage {
            items: children.get(offset..end).unwrap_or_default().to_vec(),
            next_page,
        })
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        self.check(&path)?;
        self.content(&path)
            .ok_or_else(|| RemoteError::NotFound(format!("/{}", path)))
    }

    async fn put_content(&self, path: &str, content: Vec<u8>) -> Result<RemoteItem> {
        let path = Self::normalize_path(path);
        self.ops.lock().unwrap().push(RemoteOp::Put(format!("/{}", path)));
        self.check(&path)?;
        self.ensure_parents(&path);

        let now = self.now();
        let existing = self.nodes.read().unwrap().get(&path).cloned();
        let node = match existing {
            Some(Node {
                kind: NodeKind::Folder,
                ..
            }) => {
                return Err(RemoteError::Http {
                    status: 409,
                    message: format!("/{} is a folder", path),
                });
            }
            Some(Node {
                id,
                kind: NodeKind::File {
                    content: old,
                    version,
                },
                ..
            }) => Node {
                id,
                modified: now,
                kind: NodeKind::File {
                    version: if old == content { version } else { version + 1 },
                    content,
                },
            },
            _ => Node {
                id: self.allocate_id(),
                modified: now,
                kind: NodeKind::File {
                    content,
                    version: 1,
                },
            },
        };
        let item = Self::to_item(&path, &node);
        let created = self.nodes.write().unwrap().insert(path.clone(), node).is_none();
        if created {
            self.touch_parent(&path);
        }
        Ok(item)
    }

    async fn create_folder(&self, path: &str) -> Result<RemoteItem> {
        let path = Self::normalize_path(path);
        self.ops
            .lock()
            .unwrap()
            .push(RemoteOp::CreateFolder(format!("/{}/", path)));
        self.check(&path)?;

        if let Some(node) = self.nodes.read().unwrap().get(&path) {
            return Ok(Self::to_item(&path, node));
        }
        self.ensure_parents(&path);
        let node = Node {
            id: self.allocate_id(),
            modified: self.now(),
            kind: NodeKind::Folder,
        };
        let item = Self::to_item(&path, &node);
        self.nodes.write().unwrap().insert(path.clone(), node);
        self.touch_parent(&path);
        Ok(item)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        self.ops
            .lock()
            .unwrap()
            .push(RemoteOp::Delete(format!("/{}", path)));
        self.check(&path)?;
        if path.is_empty() || !self.nodes.read().unwrap().contains_key(&path) {
            return Err(RemoteError::NotFound(format!("/{}", path)));
        }

        let prefix = format!("{}/", path);
        self.nodes
            .write()
            .unwrap()
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
        self.touch_parent(&path);
        Ok(())
    }
}
