//! Queue and worker for deferred uploads.
//!
//! fsync/flush enqueue a session and return immediately; the worker
//! drains the queue one session at a time. Sessions snapshot content
//! at queue time, and the registry holds at most one session per item:
//! a second request while one is queued or running coalesces into a
//! deferred re-snapshot that happens once the current session ends.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::{ConflictKind, Error, Result};
use crate::fs::content::ContentCache;
use crate::fs::inode::{is_local_id, Inode};
use crate::fs::table::InodeTable;
use crate::fs::upload::{UploadSession, UploadState};
use crate::graph::{item, GraphClient};

pub struct UploadManager {
    table: Arc<InodeTable>,
    cache: Arc<ContentCache>,
    client: Arc<GraphClient>,
    /// Queued or in-flight sessions, keyed by the item ID at snapshot
    /// time. At most one entry per inode.
    sessions: Mutex<HashMap<String, Arc<UploadSession>>>,
    /// IDs whose upload request arrived while a session was already
    /// running; re-snapshotted and re-queued when that session ends.
    pending: Mutex<HashSet<String>>,
    queue: mpsc::UnboundedSender<Arc<UploadSession>>,
}

impl UploadManager {
    /// Build the manager and spawn its worker on the runtime.
    pub fn start(
        table: Arc<InodeTable>,
        cache: Arc<ContentCache>,
        client: Arc<GraphClient>,
        rt: &tokio::runtime::Handle,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            table,
            cache,
            client,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            queue: tx,
        });
        rt.spawn(Self::worker(manager.clone(), rx));
        manager
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<UploadSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot the inode's content and enqueue its upload.
    /// Non-blocking; if a session for this inode is already queued or
    /// running, the request coalesces into a deferred fresh snapshot.
    pub fn queue_upload(&self, inode: &Arc<Inode>) -> Result<()> {
        let mut sessions = self.lock_sessions();
        let id = inode.id();
        if sessions.contains_key(&id) {
            self.lock_pending().insert(id);
            return Ok(());
        }
        let session = Arc::new(UploadSession::new(inode, &self.cache)?);
        sessions.insert(id.clone(), session.clone());
        drop(sessions);
        if self.queue.send(session).is_err() {
            log::error!("Upload queue is gone; dropping upload of {}.", id);
            self.lock_sessions().remove(&id);
        }
        Ok(())
    }

    /// Whether an upload for this item ID is queued or in flight.
    pub fn in_flight(&self, id: &str) -> bool {
        self.lock_sessions().contains_key(id)
    }

    /// Number of sessions queued or in flight.
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Cancel the session for this ID, if any. Large sessions get a
    /// best-effort DELETE of their server-side staging area.
    pub async fn cancel(&self, id: &str) {
        let session = self.lock_sessions().get(id).cloned();
        if let Some(session) = session {
            session.cancel(&self.client).await;
        }
    }

    async fn worker(manager: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Arc<UploadSession>>) {
        while let Some(session) = rx.recv().await {
            manager.execute(session).await;
        }
    }

    /// Run one session to completion, apply its outcome, and re-queue
    /// a fresh snapshot if more requests coalesced behind it.
    async fn execute(&self, session: Arc<UploadSession>) {
        // Cancelled while still queued, or inode gone entirely.
        let inode = self.table.get_by_id(&session.id);
        let outcome = match (&inode, session.state()) {
            (_, UploadState::Errored) => Err(Error::RemoteIO),
            (None, _) => {
                log::debug!("Item {} disappeared before upload, dropping session.", session.id);
                self.lock_sessions().remove(&session.id);
                self.lock_pending().remove(&session.id);
                session.set_state(UploadState::Errored);
                return;
            }
            (Some(inode), _) => match session.upload(&self.client).await {
                Ok(item) => self.finalize(inode, &session.id, item),
                Err(Error::Conflict(ConflictKind::NameAlreadyExists))
                    if is_local_id(&session.id) =>
                {
                    self.adopt_existing(inode, &session.id).await
                }
                Err(err) => Err(err),
            },
        };

        self.lock_sessions().remove(&session.id);
        match &outcome {
            Ok(new_id) => {
                session.set_state(UploadState::Complete);
                let coalesced = {
                    let mut pending = self.lock_pending();
                    pending.remove(&session.id) | pending.remove(new_id)
                };
                if coalesced {
                    if let Some(inode) = self.table.get_by_id(new_id) {
                        if let Err(err) = self.queue_upload(&inode) {
                            log::error!("Could not re-queue coalesced upload of {}: {}", new_id, err);
                        }
                    }
                }
            }
            Err(err) => {
                session.set_state(UploadState::Errored);
                self.lock_pending().remove(&session.id);
                // Terminal failure: back to dirty so a future sync retries.
                if let Some(inode) = &inode {
                    inode.write_state().has_changes = true;
                }
                log::error!("Upload of {} failed: {}", session.id, err);
            }
        }
    }

    /// Block until the inode has a server-assigned ID, driving an
    /// upload if it is still local. Directories always have one.
    pub async fn obtain_remote_id(&self, inode: &Arc<Inode>) -> Result<String> {
        loop {
            let id = inode.id();
            if !is_local_id(&id) {
                return Ok(id);
            }
            let session = match self.lock_sessions().get(&id).cloned() {
                Some(session) => session,
                None => {
                    self.queue_upload(inode)?;
                    match self.lock_sessions().get(&inode.id()).cloned() {
                        Some(session) => session,
                        // Finished in the window between queue and here.
                        None => continue,
                    }
                }
            };
            session.wait().await;
            if session.state() == UploadState::Errored {
                return Err(Error::RemoteIO);
            }
        }
    }

    /// Apply a successful upload's response: clear the dirty flag,
    /// take the server's etag/hashes/mtime, and exchange a local ID
    /// for the server-assigned one across the table and cache.
    fn finalize(
        &self,
        inode: &Arc<Inode>,
        old_id: &str,
        item: crate::graph::DriveItem,
    ) -> Result<String> {
        {
            let mut state = inode.write_state();
            state.has_changes = false;
            state.item.etag = item.etag.clone();
            if item.file.is_some() {
                state.item.file = item.file.clone();
            }
            if let Some(mtime) = item.mtime {
                state.item.mtime = Some(mtime);
            }
        }

        let new_id = if item.id.is_empty() {
            old_id.to_string()
        } else {
            item.id
        };
        if is_local_id(old_id) && new_id != old_id {
            self.table.move_id(old_id, &new_id)?;
            self.cache.move_id(old_id, &new_id)?;
            log::info!("Exchanged ID {} -> {}.", old_id, new_id);
        }

        self.cache.insert_meta(&new_id, &inode.to_record())?;
        log::info!("Upload of {} completed.", new_id);
        Ok(new_id)
    }

    /// A file by this name already exists remotely: it is almost
    /// certainly the same file uploaded out-of-band, so take over its
    /// identity. The local bytes are dropped so the next open fetches
    /// the authoritative remote content.
    async fn adopt_existing(&self, inode: &Arc<Inode>, old_id: &str) -> Result<String> {
        let (parent_id, name) = (inode.parent_id(), inode.name());
        let children = item::get_children(&self.client, &parent_id).await?;
        let existing = children
            .into_iter()
            .find(|child| child.name.eq_ignore_ascii_case(&name))
            .ok_or(Error::RemoteIO)?;
        let new_id = existing.id.clone();

        self.cache.delete_content(old_id)?;
        {
            let mut state = inode.write_state();
            state.data = None;
            state.has_changes = false;
            state.item = existing;
        }
        self.table.move_id(old_id, &new_id)?;
        self.cache.delete_meta(old_id)?;
        self.cache.insert_meta(&new_id, &inode.to_record())?;

        log::info!("Adopted existing remote item {} for {}.", new_id, name);
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<InodeTable>, Arc<ContentCache>, Arc<GraphClient>) {
        let root = Arc::new(Inode::from_item(crate::graph::DriveItem {
            id: "ROOT!0".into(),
            name: "root".into(),
            folder: Some(Default::default()),
            ..Default::default()
        }));
        root.write_state().children = Some(Vec::new());
        (
            Arc::new(InodeTable::new(root)),
            Arc::new(ContentCache::open_in_memory().unwrap()),
            Arc::new(GraphClient::new(Default::default())),
        )
    }

    fn manager(
        table: &Arc<InodeTable>,
        cache: &Arc<ContentCache>,
        client: &Arc<GraphClient>,
    ) -> Arc<UploadManager> {
        UploadManager::start(
            table.clone(),
            cache.clone(),
            client.clone(),
            &tokio::runtime::Handle::current(),
        )
    }

    fn dirty_file(table: &Arc<InodeTable>, name: &str) -> Arc<Inode> {
        let inode = Arc::new(Inode::new(name, libc::S_IFREG | 0o644, "ROOT!0"));
        inode.write(0, b"payload").unwrap();
        table.insert_child("ROOT!0", &inode);
        inode
    }

    // The worker runs on the test's current-thread runtime, so as long
    // as these tests don't await, queued sessions sit untouched and no
    // network I/O happens.

    #[tokio::test]
    async fn test_queue_registers_exactly_one_session_per_inode() {
        let (table, cache, client) = setup();
        let manager = manager(&table, &cache, &client);
        let inode = dirty_file(&table, "a.txt");
        let id = inode.id();

        manager.queue_upload(&inode).unwrap();
        assert!(manager.in_flight(&id));
        assert_eq!(manager.session_count(), 1);

        // A second request while one is queued coalesces.
        manager.queue_upload(&inode).unwrap();
        assert_eq!(manager.session_count(), 1);
        assert!(manager.lock_pending().contains(&id));
    }

    #[tokio::test]
    async fn test_queue_without_content_is_nodata() {
        let (table, cache, client) = setup();
        let manager = manager(&table, &cache, &client);

        let inode = Arc::new(Inode::new("empty.txt", libc::S_IFREG | 0o644, "ROOT!0"));
        inode.write_state().data = None;
        table.insert_child("ROOT!0", &inode);

        assert!(matches!(
            manager.queue_upload(&inode),
            Err(Error::NoData)
        ));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_marks_queued_session_errored() {
        let (table, cache, client) = setup();
        let manager = manager(&table, &cache, &client);
        let inode = dirty_file(&table, "b.txt");
        let id = inode.id();

        manager.queue_upload(&inode).unwrap();
        let session = manager.lock_sessions().get(&id).cloned().unwrap();
        manager.cancel(&id).await;
        assert_eq!(session.state(), UploadState::Errored);
    }

    #[tokio::test]
    async fn test_obtain_remote_id_is_immediate_for_remote_items() {
        let (table, cache, client) = setup();
        let manager = manager(&table, &cache, &client);

        let inode = Arc::new(Inode::from_item(crate::graph::DriveItem {
            id: "REMOTE!7".into(),
            name: "existing.txt".into(),
            ..Default::default()
        }));
        table.insert_child("ROOT!0", &inode);

        let id = manager.obtain_remote_id(&inode).await.unwrap();
        assert_eq!(id, "REMOTE!7");
    }

    #[tokio::test]
    async fn test_finalize_exchanges_local_id_everywhere() {
        let (table, cache, client) = setup();
        let manager = manager(&table, &cache, &client);
        let inode = dirty_file(&table, "c.txt");
        let old_id = inode.id();
        cache.insert_content(&old_id, b"payload").unwrap();

        let response = crate::graph::DriveItem {
            id: "REMOTE!new".into(),
            name: "c.txt".into(),
            size: 7,
            etag: "tag-1".into(),
            mtime: Some(chrono::Utc::now()),
            file: Some(Default::default()),
            ..Default::default()
        };
        let new_id = manager.finalize(&inode, &old_id, response).unwrap();

        assert_eq!(new_id, "REMOTE!new");
        assert!(!inode.has_changes());
        assert_eq!(inode.id(), "REMOTE!new");
        assert_eq!(inode.read_state().item.etag, "tag-1");
        assert!(table.get_by_id(&old_id).is_none());
        assert!(table.get_by_id("REMOTE!new").is_some());
        assert_eq!(cache.get_content("REMOTE!new").unwrap().unwrap(), b"payload");
        assert!(cache.get_content(&old_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_session_leaves_inode_dirty_for_retry() {
        let (table, cache, client) = setup();
        let manager = manager(&table, &cache, &client);
        let inode = dirty_file(&table, "d.txt");
        let id = inode.id();

        manager.queue_upload(&inode).unwrap();
        // fsync clears the flag once the snapshot is queued.
        inode.write_state().has_changes = false;

        let session = manager.lock_sessions().get(&id).cloned().unwrap();
        manager.cancel(&id).await;
        manager.execute(session.clone()).await;

        assert_eq!(session.state(), UploadState::Errored);
        assert_eq!(manager.session_count(), 0);
        assert!(inode.has_changes());
    }
}
