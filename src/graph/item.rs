//! The DriveItem resource and its typed operations.
//!
//! DriveItem is the Graph API's representation of a file or folder and
//! doubles as our persisted inode metadata. Items are directories
//! exactly when the `folder` facet is present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ConflictKind, Error, Result};
use crate::graph::client::GraphClient;

/// Sequential download chunk size for large files.
const DOWNLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Account flavor; selects the content-hash algorithm and quota
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriveType {
    Personal,
    Business,
    DocumentLibrary,
    #[serde(other)]
    Unknown,
}

impl Default for DriveType {
    fn default() -> Self {
        DriveType::Unknown
    }
}

/// Reference to an item's parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveItemParent {
    pub id: String,
    pub drive_id: String,
    pub drive_type: DriveType,
}

/// Folder facet; presence marks an item as a directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Folder {
    pub child_count: u32,
}

/// Integrity hashes used to validate cached content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hashes {
    pub sha1_hash: String,
    pub quick_xor_hash: String,
}

/// File facet carrying the content hashes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct File {
    pub hashes: Hashes,
}

/// Tombstone facet on items removed server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Deleted {
    pub state: String,
}

/// A file or folder as the Graph API describes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    /// Business drives occasionally report negative directory sizes;
    /// those are clamped to zero rather than failing the whole parse.
    #[serde(deserialize_with = "deserialize_size")]
    pub size: u64,
    #[serde(rename = "lastModifiedDateTime")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(rename = "parentReference")]
    pub parent: Option<DriveItemParent>,
    pub folder: Option<Folder>,
    pub file: Option<File>,
    pub deleted: Option<Deleted>,
    #[serde(rename = "eTag")]
    pub etag: String,
}

impl DriveItem {
    pub fn is_dir(&self) -> bool {
        self.folder.is_some()
    }

    pub fn parent_id(&self) -> &str {
        self.parent.as_ref().map(|p| p.id.as_str()).unwrap_or("")
    }
}

fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let raw = i64::deserialize(deserializer)?;
    Ok(raw.max(0) as u64)
}

/// Drive quota as reported by the API. Unavailable fields default to 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveQuota {
    pub deleted: u64,
    pub file_count: u64,
    pub remaining: u64,
    pub state: String,
    pub total: u64,
    pub used: u64,
}

/// General information about the mounted drive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Drive {
    pub id: String,
    pub drive_type: DriveType,
    pub quota: DriveQuota,
}

// Paging envelope for children listings.
#[derive(Debug, Deserialize)]
struct DriveChildren {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Resource path of an item addressed by ID.
pub fn id_path(id: &str) -> String {
    format!("/me/drive/items/{}", id)
}

/// Resource path of an item addressed by absolute path.
pub fn resource_path(path: &str) -> String {
    if path == "/" {
        "/me/drive/root".to_string()
    } else {
        format!("/me/drive/root:{}", path)
    }
}

fn children_path_id(id: &str) -> String {
    format!("/me/drive/items/{}/children", id)
}

async fn fetch_item(client: &GraphClient, resource: &str) -> Result<DriveItem> {
    let body = client.get(resource).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Fetch a DriveItem by ID. `"root"` addresses the drive root.
pub async fn get_item(client: &GraphClient, id: &str) -> Result<DriveItem> {
    fetch_item(client, &id_path(id)).await
}

/// Fetch a DriveItem by absolute path. Only used for the root item and
/// by the end-to-end tests.
pub async fn get_item_path(client: &GraphClient, path: &str) -> Result<DriveItem> {
    fetch_item(client, &resource_path(path)).await
}

/// Fetch the named child of an item.
pub async fn get_item_child(client: &GraphClient, id: &str, name: &str) -> Result<DriveItem> {
    fetch_item(client, &format!("{}:/{}", id_path(id), urlencoding::encode(name))).await
}

/// Fetch all children of an item, following pagination.
pub async fn get_children(client: &GraphClient, id: &str) -> Result<Vec<DriveItem>> {
    let mut fetched = Vec::new();
    let mut resource = children_path_id(id);
    loop {
        let body = client.get(&resource).await?;
        let page: DriveChildren = serde_json::from_slice(&body)?;
        fetched.extend(page.value);
        match page.next_link {
            Some(next) => {
                resource = next
                    .strip_prefix(crate::graph::client::GRAPH_URL)
                    .unwrap_or(&next)
                    .to_string()
            }
            None => return Ok(fetched),
        }
    }
}

/// Download an item's content. Items larger than the chunk size are
/// fetched sequentially by byte range and concatenated.
pub async fn get_content(client: &GraphClient, id: &str) -> Result<Vec<u8>> {
    let item = get_item(client, id).await?;
    let resource = format!("{}/content", id_path(id));

    if item.size <= DOWNLOAD_CHUNK_SIZE {
        return client.get(&resource).await;
    }

    let mut content = Vec::with_capacity(item.size as usize);
    let mut start = 0u64;
    while start < item.size {
        let end = (start + DOWNLOAD_CHUNK_SIZE - 1).min(item.size - 1);
        log::info!(
            "Downloading bytes {}-{}/{} of item {}.",
            start,
            end,
            item.size,
            item.id
        );
        let chunk = client
            .request_with_headers(
                reqwest::Method::GET,
                &resource,
                None,
                &[("Range", format!("bytes={}-{}", start, end))],
            )
            .await?;
        content.extend_from_slice(&chunk);
        start = end + 1;
    }
    Ok(content)
}

/// Delete a file or directory by ID.
pub async fn remove(client: &GraphClient, id: &str) -> Result<()> {
    client.delete(&id_path(id)).await
}

/// Create a directory under the given parent on the server.
pub async fn mkdir(client: &GraphClient, name: &str, parent_id: &str) -> Result<DriveItem> {
    let payload = serde_json::json!({ "name": name, "folder": {} });
    let body = client
        .post(&children_path_id(parent_id), &serde_json::to_vec(&payload)?)
        .await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Move and/or rename an item on the server. `name` and `parent_id`
/// are the item's *new* basename and parent.
pub async fn rename(
    client: &GraphClient,
    id: &str,
    name: &str,
    parent_id: &str,
) -> Result<()> {
    let payload = serde_json::to_vec(&serde_json::json!({
        "@microsoft.graph.conflictBehavior": "replace",
        "name": name,
        "parentReference": { "id": parent_id },
    }))?;

    match client.patch(&id_path(id), &payload).await {
        Err(Error::Conflict(ConflictKind::ResourceModified)) => {
            // Freshly created items sometimes aren't visible to PATCH
            // for a second or so.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            client.patch(&id_path(id), &payload).await.map(|_| ())
        }
        other => other.map(|_| ()),
    }
}

/// Fetch details of the mounted drive, including quota.
pub async fn get_drive(client: &GraphClient) -> Result<Drive> {
    let body = client.get("/me/drive").await?;
    Ok(serde_json::from_slice(&body)?)
}
