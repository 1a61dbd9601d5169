//! Crate-wide error type.
//!
//! Two families live in one enum: the kinds surfaced to the kernel as
//! errno values, and the internal kinds produced by the Graph client
//! and upload machinery. Internal kinds that reach the FUSE boundary
//! unrecovered collapse to EREMOTEIO.

use thiserror::Error;

/// Server-side conflict subtypes decoded from Graph error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The resource changed under us ("resourceModified"). Retryable
    /// after a short wait.
    ResourceModified,
    /// A sibling with this name already exists ("nameAlreadyExists").
    /// Recoverable by adopting the existing item's ID.
    NameAlreadyExists,
}

#[derive(Debug, Error)]
pub enum Error {
    // Kernel-visible kinds.
    #[error("not found")]
    NotFound,
    #[error("directory not empty")]
    NotEmpty,
    #[error("already exists")]
    Exists,
    #[error("filesystem is read-only while offline")]
    ReadOnly,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no cached data for item")]
    NoData,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("remote I/O error")]
    RemoteIO,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal kinds, recovered or remapped before reaching the kernel.
    #[error("network unreachable")]
    Offline,
    #[error("authentication expired")]
    AuthExpired,
    #[error("server conflict: {0:?}")]
    Conflict(ConflictKind),
    #[error("server busy (HTTP {0})")]
    ServerBusy(u16),
    #[error("upload session expired")]
    Expired,
    #[error("HTTP {0}: {1}")]
    Other(u16, String),

    // Ambient failures from the persistence and serialization layers.
    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Map to the errno reported through the FUSE reply.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::Exists => libc::EEXIST,
            Error::ReadOnly => libc::EROFS,
            Error::InvalidArgument => libc::EINVAL,
            Error::NoData => libc::ENODATA,
            Error::BadFileDescriptor => libc::EBADF,
            Error::Io(_) | Error::Database(_) | Error::Serde(_) => libc::EIO,
            // Anything unrecovered from the remote side.
            Error::RemoteIO
            | Error::Offline
            | Error::AuthExpired
            | Error::Conflict(_)
            | Error::ServerBusy(_)
            | Error::Expired
            | Error::Other(..) => libc::EREMOTEIO,
        }
    }

    /// Whether this error indicates the network is unreachable.
    pub fn is_offline(&self) -> bool {
        matches!(self, Error::Offline)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_kinds_map_to_expected_errno() {
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(Error::Exists.errno(), libc::EEXIST);
        assert_eq!(Error::ReadOnly.errno(), libc::EROFS);
        assert_eq!(Error::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(Error::NoData.errno(), libc::ENODATA);
        assert_eq!(Error::BadFileDescriptor.errno(), libc::EBADF);
    }

    #[test]
    fn test_internal_kinds_collapse_to_eremoteio() {
        assert_eq!(Error::Offline.errno(), libc::EREMOTEIO);
        assert_eq!(Error::AuthExpired.errno(), libc::EREMOTEIO);
        assert_eq!(
            Error::Conflict(ConflictKind::ResourceModified).errno(),
            libc::EREMOTEIO
        );
        assert_eq!(Error::ServerBusy(503).errno(), libc::EREMOTEIO);
        assert_eq!(Error::Expired.errno(), libc::EREMOTEIO);
        assert_eq!(Error::Other(418, "teapot".into()).errno(), libc::EREMOTEIO);
    }

    #[test]
    fn test_io_errors_map_to_eio() {
        let err = Error::from(std::io::Error::other("disk on fire"));
        assert_eq!(err.errno(), libc::EIO);
    }
}
