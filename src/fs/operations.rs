//! FUSE callback implementation for the engine.
//!
//! FUSE requires synchronous replies, so remote calls run on the tokio
//! runtime via block_on. Handlers never hold an inode's write lock
//! across a remote call: they snapshot what they need, release, then
//! call. Long-running upload work is queued to the upload worker, not
//! run on kernel threads.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};

use crate::error::{Error, Result};
use crate::fs::inode::{is_local_id, Inode, BLOCK_SIZE};
use crate::fs::DriveBoxFS;
use crate::graph::{item, DriveType, File};

/// TTL for attribute/entry cache replies.
const FUSE_TTL: Duration = Duration::from_secs(1);

/// Reported when the drive doesn't advertise a quota.
const SYNTHETIC_QUOTA: u64 = 5 * 1024 * 1024 * 1024 * 1024;

fn name_str<'a>(name: &'a OsStr) -> Option<&'a str> {
    name.to_str()
}

impl DriveBoxFS {
    /// fsync body: recompute the content hash, stamp a fresh file
    /// facet, clear the dirty flag, and hand the inode to the upload
    /// queue. Returns as soon as the session is queued; the transfer
    /// itself happens on the upload worker.
    fn sync_inode(&self, inode: &Arc<Inode>) -> Result<()> {
        if !inode.has_changes() {
            return Ok(());
        }
        let data = self.content_snapshot(inode)?;
        let hashes = self.content_hash(&data);
        {
            let mut state = inode.write_state();
            state.item.file = Some(File { hashes });
            state.has_changes = false;
        }
        if let Err(err) = self.uploads.queue_upload(inode) {
            inode.write_state().has_changes = true;
            return Err(err);
        }
        Ok(())
    }

    /// Shared unlink/rmdir tail: remote delete for server-known items,
    /// then removal from the table and both cache buckets.
    fn remove_local_and_remote(&self, child: &Arc<Inode>) -> Result<()> {
        let id = child.id();
        if !is_local_id(&id) {
            let deleted = self.rt.block_on(item::remove(&self.client, &id));
            self.note_connectivity(&deleted);
            deleted?;
        }
        self.rt.block_on(self.uploads.cancel(&id));
        for removed in self.table.delete_id(&id) {
            if let Err(err) = self.content.delete_content(&removed) {
                log::warn!("Could not drop cached content for {}: {}", removed, err);
            }
            let _ = self.content.delete_meta(&removed);
        }
        Ok(())
    }

    /// Build (and register) the directory snapshot for an open handle:
    /// the directory itself, its parent, then the children.
    fn snapshot_dir(&self, node_id: u64) -> Result<Arc<Vec<Arc<Inode>>>> {
        let dir = self
            .table
            .get_by_node_id(node_id)
            .ok_or(Error::NotFound)?;
        if !dir.is_dir() {
            return Err(Error::InvalidArgument);
        }
        let children = self.get_children(&dir)?;
        // The parent of the mount root is the root itself; the kernel
        // discards what we report there anyway.
        let parent = self
            .table
            .get_by_id(&dir.parent_id())
            .unwrap_or_else(|| dir.clone());

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(dir);
        entries.push(parent);
        entries.extend(children);
        Ok(self.table.open_dir(node_id, entries))
    }

    /// Fetch the snapshot for a readdir, forcing an opendir if the
    /// kernel skipped it.
    fn dir_entries(&self, node_id: u64) -> Result<Arc<Vec<Arc<Inode>>>> {
        match self.table.read_dir(node_id) {
            Some(entries) => Ok(entries),
            None => self.snapshot_dir(node_id),
        }
    }
}

impl Filesystem for DriveBoxFS {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        log::info!(
            "Filesystem ready{}.",
            if self.is_offline() { " (offline)" } else { "" }
        );
        Ok(())
    }

    fn destroy(&mut self) {
        log::info!("Unmounting, snapshotting inode metadata.");
        self.serialize_all();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_id = match self.table.translate(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = match name_str(name) {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        log::trace!("lookup {} in {}", name, parent_id);

        match self.get_child(&parent_id, name) {
            Ok(Some(child)) => reply.entry(&FUSE_TTL, &child.attr(), 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.table.get_by_node_id(ino) {
            Some(inode) => reply.attr(&FUSE_TTL, &inode.attr()),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let inode = match self.table.get_by_node_id(ino) {
            Some(inode) => inode,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        // A truncate needs the content buffer; load it before taking
        // the write lock, since the fetch may hit the network.
        if size.is_some() && !inode.has_content() {
            if let Err(err) = self.open_content(&inode) {
                reply.error(err.errno());
                return;
            }
        }

        // All provided fields apply under one write lock.
        {
            let mut state = inode.write_state();

            // utimens
            if let Some(mtime) = mtime {
                let when = match mtime {
                    TimeOrNow::SpecificTime(time) => time,
                    TimeOrNow::Now => SystemTime::now(),
                };
                state.item.mtime = Some(when.into());
            }

            // chmod (chown is not implemented, the mount is single-user)
            if let Some(mode) = mode {
                let kind = if state.item.is_dir() {
                    libc::S_IFDIR
                } else {
                    libc::S_IFREG
                };
                state.mode = kind | (mode & 0o777);
            }

            // truncate
            if let Some(new_size) = size {
                match state.data.as_mut() {
                    Some(data) => {
                        data.resize(new_size as usize, 0);
                        state.item.size = new_size;
                        state.has_changes = true;
                    }
                    None => {
                        reply.error(libc::ENODATA);
                        return;
                    }
                }
            }
        }

        reply.attr(&FUSE_TTL, &inode.attr());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_id = match self.table.translate(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = match name_str(name) {
            Some(name) => name,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        log::debug!("mkdir {} in {}", name, self.table.path_for(&parent_id));

        let created = self
            .rt
            .block_on(item::mkdir(&self.client, name, &parent_id));
        self.note_connectivity(&created);
        let item = match created {
            Ok(item) => item,
            Err(err) => {
                log::error!("Error during remote directory creation: {}", err);
                reply.error(libc::EREMOTEIO);
                return;
            }
        };

        let inode = Arc::new(Inode::from_item(item));
        inode.set_mode(mode);
        self.table.insert_child(&parent_id, &inode);
        reply.entry(&FUSE_TTL, &inode.attr(), 0);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_id = match self.table.translate(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let name = match name_str(name) {
            Some(name) => name,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        if self.is_offline() {
            log::warn!(
                "Offline, refusing mknod of {} to avoid data loss later.",
                name
            );
            reply.error(libc::EROFS);
            return;
        }

        match self.get_child(&parent_id, name) {
            Ok(Some(_)) => {
                reply.error(libc::EEXIST);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        }

        let inode = Arc::new(Inode::new(name, mode, &parent_id));
        log::debug!(
            "Creating inode {} at {}/{}",
            inode.id(),
            self.table.path_for(&parent_id),
            name
        );
        self.table.insert_child(&parent_id, &inode);
        reply.entry(&FUSE_TTL, &inode.attr(), 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_id = match self.table.translate(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let name = match name_str(name) {
            Some(name) => name,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        if self.is_offline() {
            reply.error(libc::EROFS);
            return;
        }

        match self.get_child(&parent_id, name) {
            Ok(Some(existing)) => {
                // Per creat(2): truncate the existing file and hand it
                // back, keeping its node ID.
                log::debug!("create: {} already exists, truncating.", name);
                {
                    let mut state = existing.write_state();
                    state.data = Some(Vec::new());
                    state.item.size = 0;
                    state.has_changes = true;
                }
                reply.created(&FUSE_TTL, &existing.attr(), 0, 0, 0);
            }
            Ok(None) => {
                let inode = Arc::new(Inode::new(name, mode, &parent_id));
                self.table.insert_child(&parent_id, &inode);
                reply.created(&FUSE_TTL, &inode.attr(), 0, 0, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let inode = match self.table.get_by_node_id(ino) {
            Some(inode) => inode,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let wants_write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if wants_write && self.is_offline() {
            log::debug!(
                "Refusing open with write flag for {}, filesystem is offline.",
                inode.id()
            );
            reply.error(libc::EROFS);
            return;
        }

        log::debug!("Opening {} for I/O.", self.table.path_for(&inode.id()));
        match self.open_content(&inode) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => {
                log::error!("Failed to open content for {}: {}", inode.id(), err);
                reply.error(err.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let inode = match self.table.get_by_node_id(ino) {
            Some(inode) => inode,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if !inode.has_content() {
            log::warn!("Read on a flushed file, reopening {} for op.", inode.id());
            if let Err(err) = self.open_content(&inode) {
                reply.error(err.errno());
                return;
            }
        }

        match inode.read(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            // Flushed between the reopen and the read; let the kernel retry.
            Err(Error::NoData) => reply.error(libc::EAGAIN),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let inode = match self.table.get_by_node_id(ino) {
            Some(inode) => inode,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if !inode.has_content() {
            log::warn!("Write on a flushed file, reopening {} for op.", inode.id());
            if let Err(err) = self.open_content(&inode) {
                reply.error(err.errno());
                return;
            }
        }

        match inode.write(offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let inode = match self.table.get_by_node_id(ino) {
            Some(inode) => inode,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        match self.sync_inode(&inode) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::error!("Error queueing upload for {}: {}", inode.id(), err);
                reply.error(libc::EREMOTEIO);
            }
        }
    }

    /// Called when a file descriptor closes: trigger the upload, then
    /// move the memory buffer down to the disk cache.
    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let inode = match self.table.get_by_node_id(ino) {
            Some(inode) => inode,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if let Err(err) = self.sync_inode(&inode) {
            log::error!("Error queueing upload for {}: {}", inode.id(), err);
        }

        // Wipe the buffer from memory to keep the resident set flat.
        {
            let mut state = inode.write_state();
            if let Some(data) = state.data.take() {
                let id = state.item.id.clone();
                if let Err(err) = self.content.insert_content(&id, &data) {
                    log::error!("Could not persist content for {}: {}", id, err);
                    // Keep the buffer rather than dropping bytes.
                    state.data = Some(data);
                }
            }
        }
        self.persist(&inode);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // All cleanup already happened in flush().
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_id = match self.table.translate(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = match name_str(name) {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        // Only consult the local index; a file we never saw never existed.
        let child = match self.table.get_child(&parent_id, name) {
            Some(child) => child,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if self.is_offline() {
            reply.error(libc::EROFS);
            return;
        }

        log::debug!("Unlinking {}.", self.table.path_for(&child.id()));
        match self.remove_local_and_remote(&child) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::error!("Failed to delete {} on server: {}", child.id(), err);
                reply.error(libc::EREMOTEIO);
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_id = match self.table.translate(parent) {
            Some(id) => id,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let name = match name_str(name) {
            Some(name) => name,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let child = match self.get_child(&parent_id, name) {
            Ok(Some(child)) => child,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        let empty = if self.is_offline() {
            self.table.children_of(&child.id()).is_empty()
        } else {
            match self.get_children(&child) {
                Ok(children) => children.is_empty(),
                Err(err) => {
                    reply.error(err.errno());
                    return;
                }
            }
        };
        if !empty {
            reply.error(libc::ENOTEMPTY);
            return;
        }
        if self.is_offline() {
            reply.error(libc::EROFS);
            return;
        }

        match self.remove_local_and_remote(&child) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::error!("Failed to delete {} on server: {}", child.id(), err);
                reply.error(libc::EREMOTEIO);
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_parent_id, new_parent_id) =
            match (self.table.translate(parent), self.table.translate(newparent)) {
                (Some(old), Some(new)) => (old, new),
                _ => {
                    reply.error(libc::EBADF);
                    return;
                }
            };
        let (name, new_name) = match (name_str(name), name_str(newname)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        log::debug!(
            "Renaming {}/{} -> {}/{}",
            self.table.path_for(&old_parent_id),
            name,
            self.table.path_for(&new_parent_id),
            new_name
        );

        let child = match self.get_child(&old_parent_id, name) {
            Ok(Some(child)) => child,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        // Uploads fail without a server-assigned ID, so drive one now.
        let id = match self.remote_id(&child) {
            Ok(id) if !is_local_id(&id) => id,
            Ok(id) => {
                log::error!("Could not obtain a remote ID for {} before rename.", id);
                reply.error(libc::EREMOTEIO);
                return;
            }
            Err(err) => {
                log::error!("Could not obtain a remote ID before rename: {}", err);
                reply.error(libc::EREMOTEIO);
                return;
            }
        };

        // Note a destination this rename will replace. Its local entry
        // is only removed once the server has actually overwritten it;
        // until then a failed rename must leave it untouched.
        let replaced = match self.get_child(&new_parent_id, new_name) {
            Ok(Some(dest)) if dest.id() != id => Some(dest),
            _ => None,
        };

        let renamed = self
            .rt
            .block_on(item::rename(&self.client, &id, new_name, &new_parent_id));
        self.note_connectivity(&renamed);
        if let Err(err) = renamed {
            log::error!("Failed to rename remote item {}: {}", id, err);
            reply.error(libc::EREMOTEIO);
            return;
        }

        if let Some(dest) = replaced {
            for removed in self.table.delete_id(&dest.id()) {
                let _ = self.content.delete_content(&removed);
                let _ = self.content.delete_meta(&removed);
            }
        }

        if let Err(err) = self
            .table
            .move_path(&old_parent_id, &new_parent_id, name, new_name)
        {
            log::error!("Failed to rename local item {}: {}", id, err);
            reply.error(libc::EIO);
            return;
        }
        self.persist(&child);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.snapshot_dir(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(Error::InvalidArgument) => reply.error(libc::ENOTDIR),
            Err(Error::NotFound) => reply.error(libc::ENOENT),
            Err(err) => {
                log::error!("Could not list directory for handle {}: {}", ino, err);
                reply.error(libc::EREMOTEIO);
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
            let kind = if entry.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            let name = match index {
                0 => ".".to_string(),
                1 => "..".to_string(),
                _ => entry.name(),
            };
            if reply.add(entry.node_id(), (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
            let name = match index {
                0 => ".".to_string(),
                1 => "..".to_string(),
                _ => entry.name(),
            };
            if reply.add(
                entry.node_id(),
                (index + 1) as i64,
                name,
                &FUSE_TTL,
                &entry.attr(),
                0,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.table.release_dir(ino);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let fetched = self.rt.block_on(item::get_drive(&self.client));
        self.note_connectivity(&fetched);
        let mut drive = match fetched {
            Ok(drive) => drive,
            Err(err) => {
                log::error!("Could not fetch drive quota: {}", err);
                reply.error(libc::EREMOTEIO);
                return;
            }
        };

        if drive.drive_type == DriveType::Personal {
            log::warn!(
                "Personal accounts do not report file counts, inode numbers will be bogus."
            );
        } else if drive.quota.total == 0 {
            log::warn!(
                "This account does not report quotas, pretending it has 5TB free."
            );
            drive.quota.total = SYNTHETIC_QUOTA;
            drive.quota.remaining = SYNTHETIC_QUOTA;
            drive.quota.file_count = 0;
        }

        let block_size = BLOCK_SIZE as u64;
        reply.statfs(
            drive.quota.total / block_size,
            drive.quota.remaining / block_size,
            drive.quota.remaining / block_size,
            100_000,
            100_000u64.saturating_sub(drive.quota.file_count),
            BLOCK_SIZE,
            260,
            BLOCK_SIZE,
        );
    }
}
