//! The filesystem engine.
//!
//! `DriveBoxFS` ties the inode table, content cache, Graph client, and
//! upload manager together and owns the mount-wide state: the offline
//! flag and the drive type. The FUSE handler implementation lives in
//! `operations`; everything it needs from the engine is here.

pub mod content;
pub mod inode;
pub mod operations;
pub mod table;
pub mod upload;
pub mod upload_manager;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::graph::{hash, item, DriveType, GraphClient};
use self::content::ContentCache;
use self::inode::{is_local_id, Inode, InodeRecord};
use self::table::InodeTable;
use self::upload_manager::UploadManager;

pub struct DriveBoxFS {
    pub table: Arc<InodeTable>,
    pub content: Arc<ContentCache>,
    pub uploads: Arc<UploadManager>,
    pub client: Arc<GraphClient>,
    pub rt: tokio::runtime::Handle,
    offline: Arc<AtomicBool>,
    drive_type: Arc<Mutex<Option<DriveType>>>,
}

impl DriveBoxFS {
    /// Bring the engine up: fetch the drive and root item, or fall
    /// back to the persisted inode snapshot when the network is down.
    pub fn new(
        client: Arc<GraphClient>,
        content: Arc<ContentCache>,
        rt: tokio::runtime::Handle,
    ) -> Result<Self> {
        let offline = Arc::new(AtomicBool::new(false));
        let drive_type = Arc::new(Mutex::new(None));

        match rt.block_on(item::get_drive(&client)) {
            Ok(drive) => {
                *drive_type.lock().unwrap_or_else(|e| e.into_inner()) = Some(drive.drive_type);
            }
            Err(err) if err.is_offline() => {
                log::warn!("Network unreachable, starting in offline mode.");
                offline.store(true, Ordering::SeqCst);
            }
            Err(err) => return Err(err),
        }

        let table = if offline.load(Ordering::SeqCst) {
            Self::rebuild_from_cache(&content)?
        } else {
            let root = rt.block_on(item::get_item_path(&client, "/"))?;
            Arc::new(InodeTable::new(Arc::new(Inode::from_item(root))))
        };

        let uploads = UploadManager::start(table.clone(), content.clone(), client.clone(), &rt);

        Ok(Self {
            table,
            content,
            uploads,
            client,
            rt,
            offline,
            drive_type,
        })
    }

    /// Rebuild the inode graph from the metadata bucket so an offline
    /// mount still serves everything it has cached.
    fn rebuild_from_cache(content: &ContentCache) -> Result<Arc<InodeTable>> {
        let records = content.all_meta()?;
        let root_record = records
            .iter()
            .find(|record| record.item.parent_id().is_empty())
            .cloned()
            .ok_or(Error::Offline)?;
        let root_id = root_record.item.id.clone();
        let table = Arc::new(InodeTable::new(Arc::new(Inode::from_record(root_record))));

        let mut by_parent: HashMap<String, Vec<InodeRecord>> = HashMap::new();
        for record in records {
            if record.item.id != root_id {
                by_parent
                    .entry(record.item.parent_id().to_string())
                    .or_default()
                    .push(record);
            }
        }

        let mut queue = vec![root_id];
        while let Some(parent_id) = queue.pop() {
            for record in by_parent.remove(&parent_id).unwrap_or_default() {
                let inode = Arc::new(Inode::from_record(record));
                let id = inode.id();
                table.insert_child(&parent_id, &inode);
                if inode.is_dir() {
                    queue.push(id);
                }
            }
        }
        for orphans in by_parent.values() {
            for orphan in orphans {
                log::warn!(
                    "Discarding cached inode {} with unreachable parent.",
                    orphan.item.id
                );
            }
        }
        Ok(table)
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn set_offline(&self, offline: bool) {
        let was = self.offline.swap(offline, Ordering::SeqCst);
        if was != offline {
            if offline {
                log::warn!("Network lost, filesystem is now read-only from cache.");
            } else {
                log::info!("Network restored.");
            }
        }
    }

    /// Record what a remote call told us about connectivity.
    fn note_connectivity<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.set_offline(false),
            Err(err) if err.is_offline() => self.set_offline(true),
            Err(_) => {}
        }
    }

    pub fn drive_type(&self) -> Option<DriveType> {
        *self.drive_type.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Content hash of `data` under this mount's drive type.
    pub fn content_hash(&self, data: &[u8]) -> crate::graph::Hashes {
        match self.drive_type() {
            Some(DriveType::Personal) | None => crate::graph::Hashes {
                sha1_hash: hash::sha1_hash(data),
                quick_xor_hash: String::new(),
            },
            _ => crate::graph::Hashes {
                sha1_hash: String::new(),
                quick_xor_hash: hash::quickxor_hash(data),
            },
        }
    }

    /// Find a child by name: the local index first, then the server.
    /// Successful remote lookups populate the table.
    pub fn get_child(&self, parent_id: &str, name: &str) -> Result<Option<Arc<Inode>>> {
        if let Some(child) = self.table.get_child(parent_id, name) {
            return Ok(Some(child));
        }
        if self.is_offline() {
            return Ok(None);
        }
        let fetched = self
            .rt
            .block_on(item::get_item_child(&self.client, parent_id, name));
        self.note_connectivity(&fetched);
        match fetched {
            Ok(item) => {
                if item.deleted.is_some() {
                    return Ok(None);
                }
                let inode = Arc::new(Inode::from_item(item));
                self.table.insert_child(parent_id, &inode);
                Ok(Some(inode))
            }
            Err(Error::NotFound) => Ok(None),
            Err(err) if err.is_offline() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// All children of a directory, fetching and caching the listing
    /// on first use. Locally created entries that predate the first
    /// listing are merged in.
    pub fn get_children(&self, dir: &Arc<Inode>) -> Result<Vec<Arc<Inode>>> {
        let dir_id = dir.id();
        let listed = dir.read_state().children.clone();
        let ids = match listed {
            Some(ids) => ids,
            None => {
                if self.is_offline() {
                    return Err(Error::Offline);
                }
                let fetched = self.rt.block_on(item::get_children(&self.client, &dir_id));
                self.note_connectivity(&fetched);
                let mut ids = Vec::new();
                for item in fetched? {
                    if item.deleted.is_some() {
                        continue;
                    }
                    if self.table.get_by_id(&item.id).is_some() {
                        ids.push(item.id);
                        continue;
                    }
                    let inode = Arc::new(Inode::from_item(item));
                    let id = inode.id();
                    self.table.insert_child(&dir_id, &inode);
                    ids.push(id);
                }
                for local in self.table.children_of(&dir_id) {
                    if !ids.contains(&local) {
                        ids.push(local);
                    }
                }
                dir.write_state().children = Some(ids.clone());
                ids
            }
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.table.get_by_id(id))
            .collect())
    }

    /// Make sure the inode has its content buffer loaded, applying the
    /// cache policy: reuse an existing buffer, else validate and adopt
    /// the disk copy, else fetch from the server.
    pub fn open_content(&self, inode: &Arc<Inode>) -> Result<()> {
        if inode.has_content() {
            return Ok(());
        }
        let id = inode.id();

        if let Some(cached) = self.content.get_content(&id)? {
            let never_uploaded = is_local_id(&id) && inode.read_state().item.file.is_none();
            let hash_match = if never_uploaded {
                true
            } else {
                match self.drive_type() {
                    Some(DriveType::Personal) => inode.verify_checksum(&hash::sha1_hash(&cached)),
                    Some(DriveType::Business) | Some(DriveType::DocumentLibrary) => {
                        inode.verify_checksum(&hash::quickxor_hash(&cached))
                    }
                    _ => {
                        log::warn!("Could not determine drive type, not checking hashes.");
                        true
                    }
                }
            };
            if hash_match {
                log::info!("Found content for {} in cache.", id);
                let mut state = inode.write_state();
                state.item.size = cached.len() as u64;
                state.data = Some(cached);
                return Ok(());
            }
            log::info!("Not using cached content for {} due to hash mismatch.", id);
            self.content.delete_content(&id)?;
        }

        if is_local_id(&id) {
            log::error!(
                "Item {} has a local ID and no cached content anywhere.",
                id
            );
            return Err(Error::NoData);
        }

        log::info!("Fetching remote content for {}.", id);
        let fetched = self.rt.block_on(item::get_content(&self.client, &id));
        self.note_connectivity(&fetched);
        let body = fetched?;

        let mut state = inode.write_state();
        // The advertised size is wrong often enough that the fetched
        // length is authoritative.
        state.item.size = body.len() as u64;
        state.data = Some(body);
        Ok(())
    }

    /// A copy of the inode's bytes: the open buffer if present, else
    /// the disk cache.
    pub fn content_snapshot(&self, inode: &Arc<Inode>) -> Result<Vec<u8>> {
        if let Some(data) = inode.read_state().data.clone() {
            return Ok(data);
        }
        self.content
            .get_content(&inode.id())?
            .ok_or(Error::NoData)
    }

    /// Block until this inode has a server-assigned ID, driving an
    /// upload if it is still local.
    pub fn remote_id(&self, inode: &Arc<Inode>) -> Result<String> {
        self.rt.block_on(self.uploads.obtain_remote_id(inode))
    }

    /// Persist one inode's metadata for offline resume.
    pub fn persist(&self, inode: &Arc<Inode>) {
        let record = inode.to_record();
        if let Err(err) = self.content.insert_meta(&record.item.id, &record) {
            log::warn!("Could not persist metadata for {}: {}", record.item.id, err);
        }
    }

    /// Snapshot the whole inode graph to the metadata bucket.
    pub fn serialize_all(&self) {
        for inode in self.table.all() {
            self.persist(&inode);
        }
    }

    /// Spawn the connectivity poller: probes the drive resource at the
    /// configured interval, flips the offline flag, and re-queues dirty
    /// inodes once the network comes back.
    pub fn start_poller(&self, interval: Duration) {
        let client = self.client.clone();
        let table = self.table.clone();
        let uploads = self.uploads.clone();
        let offline = self.offline.clone();
        let drive_type = self.drive_type.clone();

        self.rt.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match item::get_drive(&client).await {
                    Ok(drive) => {
                        *drive_type.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(drive.drive_type);
                        let was_offline = offline.swap(false, Ordering::SeqCst);
                        if was_offline {
                            log::info!("Network restored, resuming pending uploads.");
                            for inode in table.all() {
                                if inode.has_changes() && !inode.is_dir() {
                                    if let Err(err) = uploads.queue_upload(&inode) {
                                        log::warn!(
                                            "Could not resume upload of {}: {}",
                                            inode.id(),
                                            err
                                        );
                                    }
                                }
                            }
                        }
                    }
                    Err(err) if err.is_offline() => {
                        if !offline.swap(true, Ordering::SeqCst) {
                            log::warn!("Network lost, filesystem is now read-only from cache.");
                        }
                    }
                    Err(err) => log::debug!("Connectivity probe failed: {}", err),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_from_cache_restores_the_tree() {
        let cache = ContentCache::open_in_memory().unwrap();

        let root = Inode::from_item(crate::graph::DriveItem {
            id: "ROOT!0".into(),
            name: "root".into(),
            folder: Some(Default::default()),
            ..Default::default()
        });
        cache.insert_meta("ROOT!0", &root.to_record()).unwrap();

        let docs = Inode::from_item(crate::graph::DriveItem {
            id: "DIR!1".into(),
            name: "docs".into(),
            folder: Some(Default::default()),
            parent: Some(crate::graph::DriveItemParent {
                id: "ROOT!0".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        cache.insert_meta("DIR!1", &docs.to_record()).unwrap();

        let file = Inode::new("pending.txt", libc::S_IFREG | 0o644, "DIR!1");
        let file_id = file.id();
        cache.insert_meta(&file_id, &file.to_record()).unwrap();

        let table = DriveBoxFS::rebuild_from_cache(&cache).unwrap();
        assert!(table.get_by_id("ROOT!0").is_some());
        assert_eq!(table.get_child("ROOT!0", "docs").unwrap().id(), "DIR!1");
        let restored = table.get_child("DIR!1", "pending.txt").unwrap();
        assert_eq!(restored.id(), file_id);
        assert!(restored.has_changes());
    }

    #[test]
    fn test_rebuild_without_root_record_fails_offline() {
        let cache = ContentCache::open_in_memory().unwrap();
        assert!(matches!(
            DriveBoxFS::rebuild_from_cache(&cache),
            Err(Error::Offline)
        ));
    }
}
