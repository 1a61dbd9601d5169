//! In-memory inode: identity, metadata, dirty flag, and the content
//! buffer held while a file is open.
//!
//! Each inode carries its own reader-writer lock. Metadata reads take
//! the read side, mutations the write side; content reads operate on an
//! immutable view of the buffer while writes hold the write side. An
//! inode's ID is either the remote item ID or a locally generated
//! placeholder recognizable by its prefix.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use chrono::Utc;
use fuser::{FileAttr, FileType};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{DriveItem, Folder};

/// Prefix marking IDs that have not been assigned by the server yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Block size reported in file attributes and statfs.
pub const BLOCK_SIZE: u32 = 4096;

/// Generate a fresh placeholder ID for a locally created item.
pub fn new_local_id() -> String {
    format!("{}{:016x}", LOCAL_ID_PREFIX, rand::random::<u64>())
}

/// Cheap test distinguishing placeholder IDs from remote ones.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Mutable inode state, only accessible through the inode's lock.
#[derive(Debug)]
pub struct InodeState {
    /// Remote-facing metadata; also what we persist for offline resume.
    pub item: DriveItem,
    /// Unix mode: file-type bits plus permissions.
    pub mode: u32,
    /// Set on local mutation, cleared by a successful upload.
    pub has_changes: bool,
    /// Kernel node ID; 0 until assigned by the table.
    pub node_id: u64,
    /// IDs of this directory's children, `None` until first listing.
    pub children: Option<Vec<String>>,
    /// Content buffer, present while the file is open.
    pub data: Option<Vec<u8>>,
}

/// Serialized inode metadata for the on-disk snapshot bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeRecord {
    pub item: DriveItem,
    pub mode: u32,
    pub has_changes: bool,
}

/// A file or directory in the mounted tree.
#[derive(Debug)]
pub struct Inode {
    state: RwLock<InodeState>,
}

impl Inode {
    /// Create a local-only inode with a placeholder ID. Files start
    /// with an empty content buffer; new local inodes are dirty until
    /// their first successful upload.
    pub fn new(name: &str, mode: u32, parent_id: &str) -> Self {
        let is_dir = mode & libc::S_IFDIR != 0;
        let item = DriveItem {
            id: new_local_id(),
            name: name.to_string(),
            mtime: Some(Utc::now()),
            parent: Some(crate::graph::DriveItemParent {
                id: parent_id.to_string(),
                ..Default::default()
            }),
            folder: is_dir.then(Folder::default),
            ..Default::default()
        };
        Self {
            state: RwLock::new(InodeState {
                item,
                mode,
                has_changes: true,
                node_id: 0,
                children: is_dir.then(Vec::new),
                data: (!is_dir).then(Vec::new),
            }),
        }
    }

    /// Wrap an item fetched from the server.
    pub fn from_item(item: DriveItem) -> Self {
        let mode = if item.is_dir() {
            libc::S_IFDIR | 0o755
        } else {
            libc::S_IFREG | 0o644
        };
        Self {
            state: RwLock::new(InodeState {
                mode,
                has_changes: false,
                node_id: 0,
                children: None,
                data: None,
                item,
            }),
        }
    }

    /// Rebuild an inode from a persisted metadata record.
    pub fn from_record(record: InodeRecord) -> Self {
        let children = record.item.is_dir().then(Vec::new);
        Self {
            state: RwLock::new(InodeState {
                item: record.item,
                mode: record.mode,
                has_changes: record.has_changes,
                node_id: 0,
                children,
                data: None,
            }),
        }
    }

    /// Snapshot the metadata that survives a remount.
    pub fn to_record(&self) -> InodeRecord {
        let state = self.read_state();
        InodeRecord {
            item: state.item.clone(),
            mode: state.mode,
            has_changes: state.has_changes,
        }
    }

    pub fn read_state(&self) -> RwLockReadGuard<'_, InodeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write_state(&self) -> RwLockWriteGuard<'_, InodeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> String {
        self.read_state().item.id.clone()
    }

    pub fn name(&self) -> String {
        self.read_state().item.name.clone()
    }

    pub fn parent_id(&self) -> String {
        self.read_state().item.parent_id().to_string()
    }

    pub fn size(&self) -> u64 {
        self.read_state().item.size
    }

    pub fn node_id(&self) -> u64 {
        self.read_state().node_id
    }

    pub fn is_dir(&self) -> bool {
        self.read_state().item.is_dir()
    }

    pub fn has_changes(&self) -> bool {
        self.read_state().has_changes
    }

    pub fn has_content(&self) -> bool {
        self.read_state().data.is_some()
    }

    /// Modification time as a `SystemTime`, defaulting to the epoch for
    /// items the server never stamped.
    pub fn mtime(&self) -> SystemTime {
        self.read_state()
            .item
            .mtime
            .map(SystemTime::from)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Read up to `len` bytes at `offset` from the content buffer.
    ///
    /// Reads overlapping the end of the file are clipped; reads from an
    /// offset strictly past the end are invalid.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.read_state();
        let data = state.data.as_ref().ok_or(Error::NoData)?;
        let offset = offset as usize;
        if offset > data.len() {
            return Err(Error::InvalidArgument);
        }
        let end = (offset + len).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    /// Write `buf` at `offset`. Writes past the current end extend the
    /// buffer (zero-padding any gap); writes inside it overwrite in
    /// place. Size tracks the buffer length and the inode goes dirty.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut state = self.write_state();
        let data = state.data.as_mut().ok_or(Error::NoData)?;
        let offset = offset as usize;

        if offset + buf.len() > data.len() {
            if offset > data.len() {
                data.resize(offset, 0);
            } else {
                data.truncate(offset);
            }
            data.extend_from_slice(buf);
        } else {
            data[offset..offset + buf.len()].copy_from_slice(buf);
        }

        state.item.size = state.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        state.item.mtime = Some(Utc::now());
        state.has_changes = true;
        Ok(buf.len())
    }

    /// Grow (zero-padded) or shrink the content buffer to `new_size`.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let mut state = self.write_state();
        let data = state.data.as_mut().ok_or(Error::NoData)?;
        data.resize(new_size as usize, 0);
        state.item.size = new_size;
        state.has_changes = true;
        Ok(())
    }

    pub fn set_mtime(&self, mtime: SystemTime) {
        self.write_state().item.mtime = Some(mtime.into());
    }

    pub fn set_mode(&self, mode: u32) {
        let mut state = self.write_state();
        let kind = if state.item.is_dir() {
            libc::S_IFDIR
        } else {
            libc::S_IFREG
        };
        state.mode = kind | (mode & 0o777);
    }

    /// Compare a freshly computed content hash against the recorded
    /// one. Items that have never been hashed (fresh local files, or a
    /// cache that predates validation) pass unconditionally.
    pub fn verify_checksum(&self, actual: &str) -> bool {
        let state = self.read_state();
        let hashes = match state.item.file.as_ref() {
            Some(file) => &file.hashes,
            None => return true,
        };
        if hashes.sha1_hash.is_empty() && hashes.quick_xor_hash.is_empty() {
            return true;
        }
        hashes.sha1_hash.eq_ignore_ascii_case(actual)
            || hashes.quick_xor_hash.eq_ignore_ascii_case(actual)
    }

    /// Build the kernel-facing attribute record.
    pub fn attr(&self) -> FileAttr {
        let state = self.read_state();
        let kind = if state.item.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = state
            .item
            .mtime
            .map(SystemTime::from)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        FileAttr {
            ino: state.node_id,
            size: state.item.size,
            blocks: (state.item.size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: (state.mode & 0o777) as u16,
            nlink: if state.item.is_dir() { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{File, Hashes};

    fn open_file(content: &[u8]) -> Inode {
        let inode = Inode::new("test.txt", libc::S_IFREG | 0o644, "parent");
        inode.write_state().data = Some(content.to_vec());
        inode.write_state().item.size = content.len() as u64;
        inode
    }

    #[test]
    fn test_local_ids_have_prefix_and_are_unique() {
        let a = new_local_id();
        let b = new_local_id();
        assert!(is_local_id(&a));
        assert!(is_local_id(&b));
        assert_ne!(a, b);
        assert!(!is_local_id("01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K"));
    }

    #[test]
    fn test_new_local_file_is_dirty_with_empty_buffer() {
        let inode = Inode::new("a.txt", libc::S_IFREG | 0o644, "parent");
        assert!(inode.has_changes());
        assert!(inode.has_content());
        assert_eq!(inode.size(), 0);
        assert!(!inode.is_dir());
        assert_eq!(inode.parent_id(), "parent");
    }

    #[test]
    fn test_read_clips_at_end_of_file() {
        let inode = open_file(b"hello world");
        assert_eq!(inode.read(6, 100).unwrap(), b"world");
        assert_eq!(inode.read(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_read_at_exact_end_is_empty_success() {
        let inode = open_file(b"hello");
        assert_eq!(inode.read(5, 10).unwrap(), b"");
    }

    #[test]
    fn test_read_past_end_is_invalid() {
        let inode = open_file(b"hello");
        assert!(matches!(inode.read(6, 1), Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_read_without_buffer_is_nodata() {
        let inode = Inode::from_item(DriveItem {
            id: "X!1".into(),
            name: "remote.txt".into(),
            ..Default::default()
        });
        assert!(matches!(inode.read(0, 1), Err(Error::NoData)));
    }

    #[test]
    fn test_write_in_place() {
        let inode = open_file(b"hello world");
        assert_eq!(inode.write(0, b"jello").unwrap(), 5);
        assert_eq!(inode.read(0, 64).unwrap(), b"jello world");
        assert_eq!(inode.size(), 11);
        assert!(inode.has_changes());
    }

    #[test]
    fn test_write_overlapping_end_appends() {
        let inode = open_file(b"hello world");
        inode.write(6, b"wonderful").unwrap();
        assert_eq!(inode.read(0, 64).unwrap(), b"hello wonderful");
        assert_eq!(inode.size(), 15);
    }

    #[test]
    fn test_write_filling_file_exactly_stays_in_place() {
        // offset + n == size is an in-place overwrite, not an append.
        let inode = open_file(b"abcdef");
        inode.write(3, b"xyz").unwrap();
        assert_eq!(inode.read(0, 64).unwrap(), b"abcxyz");
        assert_eq!(inode.size(), 6);
    }

    #[test]
    fn test_write_past_end_zero_pads_gap() {
        let inode = open_file(b"ab");
        inode.write(5, b"cd").unwrap();
        assert_eq!(inode.read(0, 64).unwrap(), b"ab\0\0\0cd");
        assert_eq!(inode.size(), 7);
    }

    #[test]
    fn test_truncate_grows_and_shrinks() {
        let inode = open_file(b"hello");
        inode.truncate(8).unwrap();
        assert_eq!(inode.read(0, 64).unwrap(), b"hello\0\0\0");
        inode.truncate(2).unwrap();
        assert_eq!(inode.read(0, 64).unwrap(), b"he");
        assert_eq!(inode.size(), 2);
        assert!(inode.has_changes());
    }

    #[test]
    fn test_verify_checksum_without_recorded_hash_passes() {
        let inode = open_file(b"never hashed");
        assert!(inode.verify_checksum("ANYTHING"));
    }

    #[test]
    fn test_verify_checksum_is_case_insensitive() {
        let inode = open_file(b"x");
        inode.write_state().item.file = Some(File {
            hashes: Hashes {
                sha1_hash: "ABCDEF0123".into(),
                quick_xor_hash: String::new(),
            },
        });
        assert!(inode.verify_checksum("abcdef0123"));
        assert!(!inode.verify_checksum("0000000000"));
    }

    #[test]
    fn test_attr_reflects_kind_and_perm() {
        let dir = Inode::new("docs", libc::S_IFDIR | 0o755, "root");
        let attr = dir.attr();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);

        let file = open_file(b"abc");
        let attr = file.attr();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn test_record_round_trip_drops_volatile_state() {
        let inode = open_file(b"persist me");
        inode.write_state().node_id = 17;

        let record = inode.to_record();
        assert!(record.has_changes);

        let rebuilt = Inode::from_record(record);
        assert_eq!(rebuilt.name(), "test.txt");
        assert_eq!(rebuilt.size(), 10);
        assert!(rebuilt.has_changes());
        assert!(!rebuilt.has_content());
        assert_eq!(rebuilt.node_id(), 0);
    }
}
