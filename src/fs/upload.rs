//! A single upload of one file's content to the server.
//!
//! Sessions snapshot the inode's content at creation time so writes
//! landing mid-upload can't corrupt the bytes in flight. Files at or
//! under 4 MiB go up in one PUT; anything larger registers a formal
//! upload session with the API and streams 10 MiB chunks to the
//! pre-signed URL it returns.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Notify;

use crate::error::{ConflictKind, Error, Result};
use crate::fs::content::ContentCache;
use crate::fs::inode::{is_local_id, Inode};
use crate::graph::item::DriveItem;
use crate::graph::GraphClient;

/// Upload chunk size recommended by the API documentation.
pub const CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Largest content that still goes through the single-request path.
pub const SMALL_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    Started,
    Complete,
    Errored,
}

/// Response to registering a formal upload session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    #[serde(default)]
    expiration_date_time: Option<DateTime<Utc>>,
}

/// Resource path content is PUT to. Items the server doesn't know yet
/// upload by parent-relative path; the response tells us their real ID.
fn content_path(id: &str, parent_id: &str, name: &str) -> String {
    if is_local_id(id) {
        format!(
            "/me/drive/items/{}:/{}:/content",
            parent_id,
            urlencoding::encode(name)
        )
    } else {
        format!("/me/drive/items/{}/content", id)
    }
}

/// Resource path for registering a formal upload session.
fn session_path(id: &str, parent_id: &str, name: &str) -> String {
    if is_local_id(id) {
        format!(
            "/me/drive/items/{}:/{}:/createUploadSession",
            parent_id,
            urlencoding::encode(name)
        )
    } else {
        format!("/me/drive/items/{}/createUploadSession", id)
    }
}

/// Aligned chunk ranges covering `size` bytes.
fn chunk_ranges(size: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        ranges.push((start, (start + CHUNK_SIZE).min(size)));
        start += CHUNK_SIZE;
    }
    ranges
}

pub struct UploadSession {
    /// Item ID at snapshot time; local for first-time uploads.
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    data: Vec<u8>,
    upload_url: Mutex<Option<String>>,
    expiration: Mutex<Option<DateTime<Utc>>>,
    state: Mutex<UploadState>,
    done: Notify,
}

impl UploadSession {
    /// Snapshot an inode's content for upload. The buffer is copied;
    /// if the file was already flushed, the disk cache supplies the
    /// bytes instead. A local item with neither has nothing to upload.
    pub fn new(inode: &Inode, cache: &ContentCache) -> Result<Self> {
        let state = inode.read_state();
        let data = match state.data.as_ref() {
            Some(data) => data.clone(),
            None => cache
                .get_content(&state.item.id)?
                .ok_or(Error::NoData)?,
        };
        Ok(Self {
            id: state.item.id.clone(),
            name: state.item.name.clone(),
            parent_id: state.item.parent_id().to_string(),
            size: data.len() as u64,
            mtime: state.item.mtime.unwrap_or_else(Utc::now),
            data,
            upload_url: Mutex::new(None),
            expiration: Mutex::new(None),
            state: Mutex::new(UploadState::NotStarted),
            done: Notify::new(),
        })
    }

    pub fn is_large(&self) -> bool {
        self.size > SMALL_UPLOAD_LIMIT
    }

    pub fn state(&self) -> UploadState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, new: UploadState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = new;
        if matches!(new, UploadState::Complete | UploadState::Errored) {
            self.done.notify_waiters();
        }
    }

    /// Block until the session reaches a terminal state.
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if matches!(self.state(), UploadState::Complete | UploadState::Errored) {
                return;
            }
            notified.await;
        }
    }

    /// Cancel the session. Large sessions politely DELETE their
    /// server-side staging area; small ones have nothing to clean up.
    pub async fn cancel(&self, client: &GraphClient) {
        let url = self.upload_url.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(url) = url {
            if let Err(err) = client.http().delete(&url).send().await {
                log::debug!("Best-effort upload session delete failed: {}", err);
            }
        }
        self.set_state(UploadState::Errored);
    }

    /// Register a formal upload session and remember its pre-signed
    /// URL and expiration.
    async fn register(&self, client: &GraphClient) -> Result<()> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "@microsoft.graph.conflictBehavior": "replace",
            "fileSystemInfo": { "lastModifiedDateTime": self.mtime.to_rfc3339() },
        }))?;
        let body = client
            .post(&session_path(&self.id, &self.parent_id, &self.name), &payload)
            .await?;
        let response: UploadSessionResponse = serde_json::from_slice(&body)?;
        *self.upload_url.lock().unwrap_or_else(|e| e.into_inner()) = Some(response.upload_url);
        *self.expiration.lock().unwrap_or_else(|e| e.into_inner()) =
            response.expiration_date_time;
        Ok(())
    }

    /// When the server will discard the registered session.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        *self.expiration.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// PUT one chunk to the pre-signed URL. These requests must not
    /// carry the Authorization header or the server rejects them.
    async fn upload_chunk(&self, client: &GraphClient, start: u64, end: u64) -> Result<(u16, Vec<u8>)> {
        let url = self
            .upload_url
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::InvalidArgument)?;

        let range = format!("bytes {}-{}/{}", start, end - 1, self.size);
        log::info!("Uploading {} of item {}.", range, self.id);
        let response = client
            .http()
            .put(&url)
            .header("Content-Range", range)
            .header("Content-Length", (end - start).to_string())
            .body(self.data[start as usize..end as usize].to_vec())
            .send()
            .await
            .map_err(|e| crate::graph::client::classify_transport(&e))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .unwrap_or_default();
        Ok((status, body))
    }

    /// Copy the snapshot to the server. Runs on the upload worker; can
    /// block for a long time on large files. The caller moves the
    /// session to its terminal state once the result (including any ID
    /// exchange) has been applied, so waiters never observe a finished
    /// session with stale bookkeeping.
    pub async fn upload(&self, client: &GraphClient) -> Result<DriveItem> {
        self.set_state(UploadState::Started);
        if self.is_large() {
            self.upload_large(client).await
        } else {
            self.upload_small(client).await
        }
    }

    async fn upload_small(&self, client: &GraphClient) -> Result<DriveItem> {
        let path = content_path(&self.id, &self.parent_id, &self.name);
        let body = match client.put(&path, &self.data).await {
            Err(Error::Conflict(ConflictKind::ResourceModified)) => {
                // The server can trail reality by a moment for items it
                // only just learned about.
                tokio::time::sleep(Duration::from_secs(1)).await;
                client.put(&path, &self.data).await?
            }
            other => other?,
        };
        Ok(serde_json::from_slice(&body)?)
    }

    async fn upload_large(&self, client: &GraphClient) -> Result<DriveItem> {
        self.register(client).await?;
        if let Some(expires) = self.expiration() {
            log::debug!("Upload session for {} expires at {}.", self.id, expires);
        }

        let mut last_response = Vec::new();
        for (index, (start, end)) in chunk_ranges(self.size).iter().enumerate() {
            if self.state() == UploadState::Errored {
                log::warn!("Upload session for {} was cancelled mid-flight.", self.id);
                return Err(Error::RemoteIO);
            }

            let (mut status, mut body) = match self.upload_chunk(client, *start, *end).await {
                Ok(result) => result,
                Err(err) => {
                    log::error!(
                        "Transport error during chunk {} of item {}, cancelling upload session.",
                        index,
                        self.id
                    );
                    self.cancel(client).await;
                    return Err(err);
                }
            };

            // Server-side failures retry with exponential backoff until
            // the server produces a real answer.
            let mut backoff = 1u64;
            while status >= 500 {
                log::error!(
                    "The server is having issues, retrying chunk {} of item {} in {}s.",
                    index,
                    self.id,
                    backoff
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
                (status, body) = match self.upload_chunk(client, *start, *end).await {
                    Ok(result) => result,
                    Err(err) => {
                        log::error!("Failed while retrying upload, killing upload session.");
                        self.cancel(client).await;
                        return Err(err);
                    }
                };
            }

            if status == 404 {
                // The session vanished server-side; nothing to delete.
                log::error!("Upload session for item {} expired.", self.id);
                return Err(Error::Expired);
            } else if status >= 400 {
                log::error!(
                    "Error code {} during upload of item {}.",
                    status,
                    self.id
                );
                return Err(Error::Other(
                    status,
                    String::from_utf8_lossy(&body).into_owned(),
                ));
            }

            last_response = body;
        }

        // The final chunk's response carries the item's new metadata.
        Ok(serde_json::from_slice(&last_response)?)
    }
}
