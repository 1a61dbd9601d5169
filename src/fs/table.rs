//! The inode table: every mapping the engine keeps between IDs, names,
//! and kernel node IDs.
//!
//! Lock ordering is fixed: table indices before any inode's own lock.
//! Methods here that touch several indices take them together so
//! callers never observe a half-applied rename or ID exchange. Child
//! names are indexed lowercased because the remote is case-insensitive;
//! display names keep their original case on the inode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::inode::Inode;

/// Kernel node ID of the mount root.
pub const ROOT_NODE_ID: u64 = 1;

pub struct InodeTable {
    /// Authoritative ID → inode mapping.
    inodes: RwLock<HashMap<String, Arc<Inode>>>,
    /// (parent ID, lowercased child name) → child ID.
    children: RwLock<HashMap<(String, String), String>>,
    /// ID → kernel node ID and its inverse; a bijection, stable for an
    /// inode's lifetime.
    nodes_by_id: RwLock<HashMap<String, u64>>,
    ids_by_node: RwLock<HashMap<u64, String>>,
    /// Directory snapshots captured at opendir time, keyed by node ID.
    opendirs: RwLock<HashMap<u64, Arc<Vec<Arc<Inode>>>>>,
    next_node_id: AtomicU64,
}

fn lock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn lock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl InodeTable {
    /// Build a table around the root inode, which always gets kernel
    /// node ID 1.
    pub fn new(root: Arc<Inode>) -> Self {
        let root_id = root.id();
        root.write_state().node_id = ROOT_NODE_ID;

        let mut inodes = HashMap::new();
        inodes.insert(root_id.clone(), root);
        let mut nodes_by_id = HashMap::new();
        nodes_by_id.insert(root_id.clone(), ROOT_NODE_ID);
        let mut ids_by_node = HashMap::new();
        ids_by_node.insert(ROOT_NODE_ID, root_id);

        Self {
            inodes: RwLock::new(inodes),
            children: RwLock::new(HashMap::new()),
            nodes_by_id: RwLock::new(nodes_by_id),
            ids_by_node: RwLock::new(ids_by_node),
            opendirs: RwLock::new(HashMap::new()),
            next_node_id: AtomicU64::new(ROOT_NODE_ID + 1),
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Inode>> {
        lock_read(&self.inodes).get(id).cloned()
    }

    /// Translate a kernel node ID back to an item ID.
    pub fn translate(&self, node_id: u64) -> Option<String> {
        lock_read(&self.ids_by_node).get(&node_id).cloned()
    }

    pub fn get_by_node_id(&self, node_id: u64) -> Option<Arc<Inode>> {
        let id = self.translate(node_id)?;
        self.get_by_id(&id)
    }

    /// Assign a kernel node ID to an inode if it doesn't have one yet.
    /// IDs are handed out lazily and monotonically.
    pub fn assign_node_id(&self, inode: &Arc<Inode>) -> u64 {
        let mut nodes_by_id = lock_write(&self.nodes_by_id);
        let mut ids_by_node = lock_write(&self.ids_by_node);
        let id = { inode.read_state().item.id.clone() };
        if let Some(&node_id) = nodes_by_id.get(&id) {
            return node_id;
        }
        let node_id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        nodes_by_id.insert(id.clone(), node_id);
        ids_by_node.insert(node_id, id);
        inode.write_state().node_id = node_id;
        node_id
    }

    /// Look up a child by name in the local index only.
    pub fn get_child(&self, parent_id: &str, name: &str) -> Option<Arc<Inode>> {
        let id = lock_read(&self.children)
            .get(&(parent_id.to_string(), name.to_lowercase()))
            .cloned()?;
        self.get_by_id(&id)
    }

    /// Insert an inode as a child of `parent_id`, updating the ID map,
    /// the child index, and the parent's child list. Returns the
    /// inode's kernel node ID, allocating one if needed.
    pub fn insert_child(&self, parent_id: &str, inode: &Arc<Inode>) -> u64 {
        {
            let mut inodes = lock_write(&self.inodes);
            let mut children = lock_write(&self.children);

            let (id, name) = {
                let state = inode.read_state();
                (state.item.id.clone(), state.item.name.clone())
            };
            inodes.insert(id.clone(), inode.clone());
            children.insert((parent_id.to_string(), name.to_lowercase()), id.clone());

            if let Some(parent) = inodes.get(parent_id) {
                let mut parent_state = parent.write_state();
                // A `None` list means the directory was never listed;
                // the merge happens at listing time instead.
                if let Some(list) = parent_state.children.as_mut() {
                    if !list.contains(&id) {
                        list.push(id);
                    }
                }
            }
        }
        self.assign_node_id(inode)
    }

    /// Exchange an inode's ID, atomically across every index. Used
    /// after an upload trades a local ID for the server-assigned one.
    /// The kernel node ID is preserved.
    pub fn move_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut inodes = lock_write(&self.inodes);
        let mut children = lock_write(&self.children);
        let mut nodes_by_id = lock_write(&self.nodes_by_id);
        let mut ids_by_node = lock_write(&self.ids_by_node);

        let inode = inodes.remove(old_id).ok_or(Error::NotFound)?;
        inodes.insert(new_id.to_string(), inode.clone());

        let (parent_id, name) = {
            let state = inode.read_state();
            (
                state.item.parent_id().to_string(),
                state.item.name.clone(),
            )
        };
        children.insert((parent_id.clone(), name.to_lowercase()), new_id.to_string());

        // Re-key any children of the moved item itself.
        let stale: Vec<(String, String)> = children
            .keys()
            .filter(|(parent, _)| parent == old_id)
            .cloned()
            .collect();
        for key in stale {
            if let Some(child_id) = children.remove(&key) {
                if let Some(child) = inodes.get(&child_id) {
                    let mut child_state = child.write_state();
                    if let Some(parent) = child_state.item.parent.as_mut() {
                        parent.id = new_id.to_string();
                    }
                }
                children.insert((new_id.to_string(), key.1), child_id);
            }
        }

        if let Some(node_id) = nodes_by_id.remove(old_id) {
            nodes_by_id.insert(new_id.to_string(), node_id);
            ids_by_node.insert(node_id, new_id.to_string());
        }

        if let Some(parent) = inodes.get(&parent_id) {
            let mut parent_state = parent.write_state();
            if let Some(list) = parent_state.children.as_mut() {
                for entry in list.iter_mut() {
                    if entry == old_id {
                        *entry = new_id.to_string();
                    }
                }
            }
        }

        inode.write_state().item.id = new_id.to_string();
        Ok(())
    }

    /// Move a child between directories and/or rename it, updating the
    /// child index and the inode's own parent/name fields together.
    pub fn move_path(
        &self,
        old_parent: &str,
        new_parent: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        let inodes = lock_read(&self.inodes);
        let mut children = lock_write(&self.children);

        let id = children
            .remove(&(old_parent.to_string(), old_name.to_lowercase()))
            .ok_or(Error::NotFound)?;
        children.insert((new_parent.to_string(), new_name.to_lowercase()), id.clone());

        if old_parent != new_parent {
            if let Some(parent) = inodes.get(old_parent) {
                let mut state = parent.write_state();
                if let Some(list) = state.children.as_mut() {
                    list.retain(|entry| entry != &id);
                }
            }
            if let Some(parent) = inodes.get(new_parent) {
                let mut state = parent.write_state();
                if let Some(list) = state.children.as_mut() {
                    if !list.contains(&id) {
                        list.push(id.clone());
                    }
                }
            }
        }

        if let Some(inode) = inodes.get(&id) {
            let mut state = inode.write_state();
            state.item.name = new_name.to_string();
            match state.item.parent.as_mut() {
                Some(parent) => parent.id = new_parent.to_string(),
                None => {
                    state.item.parent = Some(crate::graph::DriveItemParent {
                        id: new_parent.to_string(),
                        ..Default::default()
                    })
                }
            }
        }
        Ok(())
    }

    /// Remove an inode and its entire subtree from every index.
    /// Returns the removed IDs so the caller can clear cached content.
    /// No remote calls happen here; a remote delete of the parent
    /// cascades server-side.
    pub fn delete_id(&self, id: &str) -> Vec<String> {
        let mut inodes = lock_write(&self.inodes);
        let mut children = lock_write(&self.children);
        let mut nodes_by_id = lock_write(&self.nodes_by_id);
        let mut ids_by_node = lock_write(&self.ids_by_node);

        let target = match inodes.get(id) {
            Some(inode) => inode.clone(),
            None => return Vec::new(),
        };

        // Detach from the parent first.
        let (parent_id, name) = {
            let state = target.read_state();
            (
                state.item.parent_id().to_string(),
                state.item.name.clone(),
            )
        };
        children.remove(&(parent_id.clone(), name.to_lowercase()));
        if let Some(parent) = inodes.get(&parent_id) {
            let mut state = parent.write_state();
            if let Some(list) = state.children.as_mut() {
                list.retain(|entry| entry != id);
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let inode = match inodes.remove(&current) {
                Some(inode) => inode,
                None => continue,
            };
            {
                let state = inode.read_state();
                if let Some(kids) = state.children.as_ref() {
                    stack.extend(kids.iter().cloned());
                }
            }
            // Children known only to the index (never-listed dirs).
            let indexed: Vec<String> = children
                .iter()
                .filter(|((parent, _), _)| parent == &current)
                .map(|(_, child_id)| child_id.clone())
                .collect();
            children.retain(|(parent, _), _| parent != &current);
            for child_id in indexed {
                if !stack.contains(&child_id) {
                    stack.push(child_id);
                }
            }

            if let Some(node_id) = nodes_by_id.remove(&current) {
                ids_by_node.remove(&node_id);
            }
            removed.push(current);
        }
        removed
    }

    /// Bind a directory snapshot to an open directory handle.
    pub fn open_dir(&self, node_id: u64, entries: Vec<Arc<Inode>>) -> Arc<Vec<Arc<Inode>>> {
        let entries = Arc::new(entries);
        lock_write(&self.opendirs).insert(node_id, entries.clone());
        entries
    }

    /// The snapshot captured when this handle was opened, if any.
    pub fn read_dir(&self, node_id: u64) -> Option<Arc<Vec<Arc<Inode>>>> {
        lock_read(&self.opendirs).get(&node_id).cloned()
    }

    pub fn release_dir(&self, node_id: u64) {
        lock_write(&self.opendirs).remove(&node_id);
    }

    /// IDs of every child the index knows under a parent. Used to
    /// merge locally created entries into a directory's first listing.
    pub fn children_of(&self, parent_id: &str) -> Vec<String> {
        lock_read(&self.children)
            .iter()
            .filter(|((parent, _), _)| parent == parent_id)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Absolute path of an item, for logs and diagnostics.
    pub fn path_for(&self, id: &str) -> String {
        let inodes = lock_read(&self.inodes);
        let mut parts = Vec::new();
        let mut current = id.to_string();
        while let Some(inode) = inodes.get(&current) {
            let state = inode.read_state();
            let parent = state.item.parent_id().to_string();
            if parent.is_empty() || !inodes.contains_key(&parent) {
                break;
            }
            parts.push(state.item.name.clone());
            drop(state);
            current = parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Every inode currently in the table.
    pub fn all(&self) -> Vec<Arc<Inode>> {
        lock_read(&self.inodes).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_root() -> (InodeTable, String) {
        let root = Arc::new(Inode::from_item(crate::graph::DriveItem {
            id: "ROOT!0".into(),
            name: "root".into(),
            folder: Some(Default::default()),
            ..Default::default()
        }));
        root.write_state().children = Some(Vec::new());
        let table = InodeTable::new(root);
        (table, "ROOT!0".to_string())
    }

    fn file(name: &str, parent: &str) -> Arc<Inode> {
        Arc::new(Inode::new(name, libc::S_IFREG | 0o644, parent))
    }

    fn dir(name: &str, parent: &str) -> Arc<Inode> {
        Arc::new(Inode::new(name, libc::S_IFDIR | 0o755, parent))
    }

    #[test]
    fn test_root_gets_node_id_one() {
        let (table, root_id) = table_with_root();
        assert_eq!(table.translate(ROOT_NODE_ID), Some(root_id.clone()));
        assert!(table.get_by_node_id(ROOT_NODE_ID).is_some());
        assert_eq!(table.get_by_id(&root_id).unwrap().node_id(), ROOT_NODE_ID);
    }

    #[test]
    fn test_node_ids_are_monotonic_and_stable() {
        let (table, root_id) = table_with_root();
        let a = file("a.txt", &root_id);
        let b = file("b.txt", &root_id);
        let nid_a = table.insert_child(&root_id, &a);
        let nid_b = table.insert_child(&root_id, &b);
        assert!(nid_b > nid_a);
        assert!(nid_a > ROOT_NODE_ID);
        // Re-assigning doesn't churn the ID.
        assert_eq!(table.assign_node_id(&a), nid_a);
    }

    #[test]
    fn test_child_lookup_is_case_insensitive() {
        let (table, root_id) = table_with_root();
        let inode = file("Report.TXT", &root_id);
        table.insert_child(&root_id, &inode);

        let found = table.get_child(&root_id, "report.txt").unwrap();
        assert_eq!(found.name(), "Report.TXT"); // case preserved for display
        assert!(table.get_child(&root_id, "REPORT.txt").is_some());
        assert!(table.get_child(&root_id, "other.txt").is_none());
    }

    #[test]
    fn test_siblings_never_share_a_lowercased_name() {
        let (table, root_id) = table_with_root();
        table.insert_child(&root_id, &file("data.bin", &root_id));
        table.insert_child(&root_id, &file("DATA.BIN", &root_id));
        // The index resolves to exactly one child for that name.
        let hit = table.get_child(&root_id, "data.bin").unwrap();
        assert_eq!(hit.name(), "DATA.BIN");
    }

    #[test]
    fn test_move_id_updates_every_index_and_keeps_node_id() {
        let (table, root_id) = table_with_root();
        let inode = file("a.txt", &root_id);
        let node_id = table.insert_child(&root_id, &inode);
        let old_id = inode.id();

        table.move_id(&old_id, "REMOTE!1").unwrap();

        assert!(table.get_by_id(&old_id).is_none());
        assert!(table.get_by_id("REMOTE!1").is_some());
        assert_eq!(inode.id(), "REMOTE!1");
        assert_eq!(table.translate(node_id), Some("REMOTE!1".to_string()));
        assert_eq!(table.get_child(&root_id, "a.txt").unwrap().id(), "REMOTE!1");
        assert_eq!(
            table.get_by_id(&root_id).unwrap().read_state().children,
            Some(vec!["REMOTE!1".to_string()])
        );
    }

    #[test]
    fn test_move_id_reparents_children_of_a_directory() {
        let (table, root_id) = table_with_root();
        let parent = dir("work", &root_id);
        table.insert_child(&root_id, &parent);
        let old_parent_id = parent.id();
        let child = file("notes.txt", &old_parent_id);
        table.insert_child(&old_parent_id, &child);

        table.move_id(&old_parent_id, "DIR!9").unwrap();

        assert_eq!(child.parent_id(), "DIR!9");
        assert_eq!(table.get_child("DIR!9", "notes.txt").unwrap().id(), child.id());
        assert!(table.get_child(&old_parent_id, "notes.txt").is_none());
    }

    #[test]
    fn test_move_id_of_unknown_id_fails() {
        let (table, _) = table_with_root();
        assert!(table.move_id("nope", "REMOTE!1").is_err());
    }

    #[test]
    fn test_move_path_renames_within_a_directory() {
        let (table, root_id) = table_with_root();
        let inode = file("old.txt", &root_id);
        table.insert_child(&root_id, &inode);

        table.move_path(&root_id, &root_id, "old.txt", "new.txt").unwrap();

        assert!(table.get_child(&root_id, "old.txt").is_none());
        assert_eq!(table.get_child(&root_id, "new.txt").unwrap().id(), inode.id());
        assert_eq!(inode.name(), "new.txt");
    }

    #[test]
    fn test_move_path_across_directories() {
        let (table, root_id) = table_with_root();
        let subdir = dir("sub", &root_id);
        table.insert_child(&root_id, &subdir);
        let sub_id = subdir.id();
        let inode = file("doc.md", &root_id);
        table.insert_child(&root_id, &inode);

        table.move_path(&root_id, &sub_id, "doc.md", "doc.md").unwrap();

        assert!(table.get_child(&root_id, "doc.md").is_none());
        assert!(table.get_child(&sub_id, "doc.md").is_some());
        assert_eq!(inode.parent_id(), sub_id);
        let root_children = table.get_by_id(&root_id).unwrap().read_state().children.clone();
        assert!(!root_children.unwrap().contains(&inode.id()));
    }

    #[test]
    fn test_delete_id_removes_subtree_from_all_indices() {
        let (table, root_id) = table_with_root();
        let subdir = dir("sub", &root_id);
        table.insert_child(&root_id, &subdir);
        let sub_id = subdir.id();
        let inner = file("inner.txt", &sub_id);
        let inner_nid = table.insert_child(&sub_id, &inner);

        let removed = table.delete_id(&sub_id);

        assert_eq!(removed.len(), 2);
        assert!(table.get_by_id(&sub_id).is_none());
        assert!(table.get_by_id(&inner.id()).is_none());
        assert!(table.get_child(&root_id, "sub").is_none());
        assert!(table.translate(inner_nid).is_none());
    }

    #[test]
    fn test_directory_snapshot_is_stable_under_mutation() {
        let (table, root_id) = table_with_root();
        let inode = file("a.txt", &root_id);
        table.insert_child(&root_id, &inode);

        let root = table.get_by_id(&root_id).unwrap();
        table.open_dir(ROOT_NODE_ID, vec![root.clone(), root.clone(), inode.clone()]);

        // Delete after the snapshot was taken.
        table.delete_id(&inode.id());

        let entries = table.read_dir(ROOT_NODE_ID).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].name(), "a.txt");

        table.release_dir(ROOT_NODE_ID);
        assert!(table.read_dir(ROOT_NODE_ID).is_none());
    }

    #[test]
    fn test_path_for_walks_to_root() {
        let (table, root_id) = table_with_root();
        let subdir = dir("docs", &root_id);
        table.insert_child(&root_id, &subdir);
        let inode = file("a.txt", &subdir.id());
        table.insert_child(&subdir.id(), &inode);

        assert_eq!(table.path_for(&inode.id()), "/docs/a.txt");
        assert_eq!(table.path_for(&root_id), "/");
    }
}
