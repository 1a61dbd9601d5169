//! On-disk cache: file content and inode metadata, keyed by item ID.
//!
//! One SQLite database per mount, opened at mount and closed at
//! unmount. The `content` table is the byte-blob store backing closed
//! files; the `inodes` table holds serialized inode metadata so a
//! mount can come up offline. Single-key writes are transactional,
//! which is all the engine requires.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::fs::inode::InodeRecord;

pub struct ContentCache {
    conn: Mutex<Connection>,
}

impl ContentCache {
    /// Open (or create) the cache database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS content (
                id   TEXT PRIMARY KEY,
                data BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS inodes (
                id   TEXT PRIMARY KEY,
                meta TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS content (id TEXT PRIMARY KEY, data BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS inodes (id TEXT PRIMARY KEY, meta TEXT NOT NULL);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store (or replace) the content blob for an item.
    pub fn insert_content(&self, id: &str, data: &[u8]) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO content (id, data) VALUES (?1, ?2)",
            params![id, data],
        )?;
        Ok(())
    }

    /// Fetch the content blob for an item, if cached.
    pub fn get_content(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT data FROM content WHERE id = ?1",
                params![id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_content(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM content WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Re-key both buckets after an upload exchanges a local ID for the
    /// server-assigned one.
    pub fn move_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE OR REPLACE content SET id = ?2 WHERE id = ?1",
            params![old_id, new_id],
        )?;
        tx.execute(
            "UPDATE OR REPLACE inodes SET id = ?2 WHERE id = ?1",
            params![old_id, new_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist an inode's metadata record.
    pub fn insert_meta(&self, id: &str, record: &InodeRecord) -> Result<()> {
        let meta = serde_json::to_string(record)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO inodes (id, meta) VALUES (?1, ?2)",
            params![id, meta],
        )?;
        Ok(())
    }

    pub fn delete_meta(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM inodes WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Every persisted inode record; used to resume a mount offline.
    pub fn all_meta(&self) -> Result<Vec<InodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT meta FROM inodes")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            match serde_json::from_str::<InodeRecord>(&row?) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!("Discarding unreadable inode record: {}", err),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::Inode;

    #[test]
    fn test_content_round_trip() {
        let cache = ContentCache::open_in_memory().unwrap();
        cache.insert_content("X!1", b"some bytes").unwrap();
        assert_eq!(cache.get_content("X!1").unwrap().unwrap(), b"some bytes");
        assert!(cache.get_content("X!2").unwrap().is_none());
    }

    #[test]
    fn test_insert_replaces_existing_content() {
        let cache = ContentCache::open_in_memory().unwrap();
        cache.insert_content("X!1", b"first").unwrap();
        cache.insert_content("X!1", b"second").unwrap();
        assert_eq!(cache.get_content("X!1").unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_delete_content() {
        let cache = ContentCache::open_in_memory().unwrap();
        cache.insert_content("X!1", b"bytes").unwrap();
        cache.delete_content("X!1").unwrap();
        assert!(cache.get_content("X!1").unwrap().is_none());
        // Deleting a missing key is not an error.
        cache.delete_content("X!1").unwrap();
    }

    #[test]
    fn test_move_id_rekeys_content_and_meta() {
        let cache = ContentCache::open_in_memory().unwrap();
        cache.insert_content("local-abc", b"payload").unwrap();
        let inode = Inode::new("a.txt", libc::S_IFREG | 0o644, "parent");
        cache.insert_meta("local-abc", &inode.to_record()).unwrap();

        cache.move_id("local-abc", "REMOTE!1").unwrap();

        assert!(cache.get_content("local-abc").unwrap().is_none());
        assert_eq!(cache.get_content("REMOTE!1").unwrap().unwrap(), b"payload");
        let metas = cache.all_meta().unwrap();
        assert_eq!(metas.len(), 1);
    }

    #[test]
    fn test_meta_round_trip() {
        let cache = ContentCache::open_in_memory().unwrap();
        let inode = Inode::new("b.txt", libc::S_IFREG | 0o644, "parent");
        let record = inode.to_record();
        cache.insert_meta(&record.item.id, &record).unwrap();

        let restored = cache.all_meta().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].item.name, "b.txt");
        assert!(restored[0].has_changes);

        cache.delete_meta(&record.item.id).unwrap();
        assert!(cache.all_meta().unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = ContentCache::open(&path).unwrap();
            cache.insert_content("X!1", b"durable").unwrap();
        }
        let cache = ContentCache::open(&path).unwrap();
        assert_eq!(cache.get_content("X!1").unwrap().unwrap(), b"durable");
    }
}
