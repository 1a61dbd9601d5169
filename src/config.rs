//! Runtime configuration.
//!
//! Everything is read from the environment with sensible defaults; the
//! mount point is the one required piece and must be an existing empty
//! directory so we never shadow real files.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default interval between connectivity probes.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Mount-scoped configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the cache database and auth tokens.
    pub cache_dir: PathBuf,
    /// Where the filesystem gets mounted.
    pub mount_point: PathBuf,
    /// Log filter passed to env_logger ("info", "debug", ...).
    pub log_level: String,
    /// How often the background poller probes the drive resource.
    pub poll_interval: Duration,
}

impl Config {
    /// Build a config from the environment for the given mount point.
    ///
    /// Honors `DRIVEBOX_CACHE_DIR`, `DRIVEBOX_LOG`, and
    /// `DRIVEBOX_POLL_INTERVAL` (seconds).
    pub fn from_env(mount_point: PathBuf) -> Result<Self> {
        validate_mount_point(&mount_point)?;

        let cache_dir = match env::var_os("DRIVEBOX_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    Error::Io(std::io::Error::other("could not determine home directory"))
                })?
                .join(".cache")
                .join("drivebox"),
        };
        std::fs::create_dir_all(&cache_dir)?;

        let log_level = env::var("DRIVEBOX_LOG").unwrap_or_else(|_| "info".to_string());

        let poll_interval = env::var("DRIVEBOX_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        Ok(Self {
            cache_dir,
            mount_point,
            log_level,
            poll_interval,
        })
    }

    /// Path of the OAuth2 token file (stored at mode 0600).
    pub fn auth_file(&self) -> PathBuf {
        self.cache_dir.join("auth_tokens.json")
    }

    /// Path of the content/metadata cache database.
    pub fn db_file(&self) -> PathBuf {
        self.cache_dir.join("drivebox.db")
    }
}

/// The mount point must exist, be a directory, and be empty.
fn validate_mount_point(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|_| Error::NotFound)?;
    if !meta.is_dir() {
        return Err(Error::InvalidArgument);
    }
    if std::fs::read_dir(path)?.next().is_some() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_point_must_exist() {
        let missing = PathBuf::from("/definitely/not/a/real/mount/point");
        assert!(matches!(
            validate_mount_point(&missing),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_mount_point_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            validate_mount_point(file.path()),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn test_mount_point_must_be_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("occupied"), b"x").unwrap();
        assert!(matches!(
            validate_mount_point(dir.path()),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn test_empty_directory_is_a_valid_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_mount_point(dir.path()).is_ok());
    }
}
