//! OneDrive access through the Microsoft Graph REST API.
//!
//! Items are addressed by path (`/root:/a/b:`) relative to the signed-in
//! user's drive, except child listings, which go by item id and continue
//! through `@odata.nextLink`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_RANGE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use sync_core::remote::{ChildPage, ItemKind, RemoteError, RemoteItem, RemoteStorage, Result};
use tracing::debug;

use crate::auth::TokenHolder;

pub const GRAPH_DRIVE_URL: &str = "https://graph.microsoft.com/v1.0/me/drive";

/// Largest file sent in a single PUT
const SIMPLE_UPLOAD_LIMIT: usize = 4 * 1024 * 1024;

/// Upload session chunk size, a multiple of 320 KiB
const UPLOAD_CHUNK_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    last_modified_date_time: DateTime<Utc>,
    #[serde(default)]
    c_tag: Option<String>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(default)]
    root: Option<serde_json::Value>,
    #[serde(default)]
    file: Option<serde_json::Value>,
    #[serde(default)]
    package: Option<PackageFacet>,
}

#[derive(Debug, Deserialize)]
struct PackageFacet {
    #[serde(rename = "type", default)]
    package_type: String,
}

impl From<DriveItem> for RemoteItem {
    fn from(item: DriveItem) -> Self {
        let kind = if let Some(package) = item.package {
            ItemKind::Package {
                package_type: package.package_type,
            }
        } else if item.folder.is_some() || item.root.is_some() {
            ItemKind::Folder
        } else if item.file.is_some() {
            ItemKind::File { c_tag: item.c_tag }
        } else {
            ItemKind::Other
        };

        RemoteItem {
            id: item.id,
            name: item.name,
            modified: item.last_modified_date_time,
            kind,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

/// Graph-backed `RemoteStorage`.
pub struct GraphClient {
    http: reqwest::Client,
    tokens: Arc<TokenHolder>,
    base_url: String,
}

impl GraphClient {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenHolder>) -> Self {
        Self {
            http,
            tokens,
            base_url: GRAPH_DRIVE_URL.to_string(),
        }
    }

    /// Point at a different drive endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Address of the item at `path`, with each segment percent-encoded.
    fn item_url(&self, path: &str) -> String {
        let segments: Vec<String> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();

        if segments.is_empty() {
            format!("{}/root", self.base_url)
        } else {
            format!("{}/root:/{}:", self.base_url, segments.join("/"))
        }
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response> {
        let request = self
            .tokens
            .authenticate(request)
            .await
            .map_err(|e| RemoteError::Auth(e.to_string()))?;
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        check_status(path, response).await
    }

    async fn upload_session(&self, path: &str, content: Vec<u8>) -> Result<RemoteItem> {
        let response = self
            .send(
                path,
                self.http
                    .post(format!("{}/createUploadSession", self.item_url(path)))
                    .json(&json!({ "item": { "@microsoft.graph.conflictBehavior": "replace" } })),
            )
            .await?;
        let session: UploadSession = decode(response).await?;

        let total = content.len();
        let mut last = None;
        for (index, chunk) in content.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
            let start = index * UPLOAD_CHUNK_SIZE;
            let end = start + chunk.len() - 1;
            debug!("Uploading {} bytes {}-{}/{}", path, start, end, total);

            // The upload URL carries its own authorization
            let response = self
                .http
                .put(&session.upload_url)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))
                .body(chunk.to_vec())
                .send()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            last = Some(check_status(path, response).await?);
        }

        match last {
            Some(response) => decode::<DriveItem>(response).await.map(RemoteItem::from),
            None => Err(RemoteError::Decode(format!("Empty upload session for {}", path))),
        }
    }
}

async fn check_status(path: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);
    Err(match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED => RemoteError::Auth(message),
        _ => RemoteError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

/// `code: message` from a Graph error body, or the raw body.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => format!("{}: {}", parsed.error.code, parsed.error.message),
        Err(_) => body.trim().to_string(),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteStorage for GraphClient {
    async fn get_item(&self, path: &str) -> Result<RemoteItem> {
        let response = self.send(path, self.http.get(self.item_url(path))).await?;
        decode::<DriveItem>(response).await.map(RemoteItem::from)
    }

    async fn list_children(&self, item_id: &str, page: Option<&str>) -> Result<ChildPage> {
        let url = match page {
            Some(next) => next.to_string(),
            None => format!("{}/items/{}/children", self.base_url, urlencoding::encode(item_id)),
        };
        let response = self.send(item_id, self.http.get(url)).await?;
        let listing: ChildrenResponse = decode(response).await?;

        Ok(ChildPage {
            items: listing.value.into_iter().map(RemoteItem::from).collect(),
            next_page: listing.next_link,
        })
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/content", self.item_url(path));
        let response = self.send(path, self.http.get(url)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn put_content(&self, path: &str, content: Vec<u8>) -> Result<RemoteItem> {
        if content.len() > SIMPLE_UPLOAD_LIMIT {
            return self.upload_session(path, content).await;
        }

        let url = format!("{}/content", self.item_url(path));
        let response = self.send(path, self.http.put(url).body(content)).await?;
        decode::<DriveItem>(response).await.map(RemoteItem::from)
    }

    async fn create_folder(&self, path: &str) -> Result<RemoteItem> {
        let trimmed = path.trim_matches('/');
        let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));

        let request = self
            .http
            .post(format!("{}/children", self.item_url(parent)))
            .json(&json!({
                "name": name,
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail",
            }));

        match self.send(path, request).await {
            Ok(response) => decode::<DriveItem>(response).await.map(RemoteItem::from),
            Err(RemoteError::Http { status: 409, .. }) => {
                debug!("Folder {} already exists", path);
                self.get_item(path).await
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send(path, self.http.delete(self.item_url(path))).await?;
        Ok(())
    }
}
