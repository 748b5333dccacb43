use std::io;
use thiserror::Error;

/// Crate-wide error classification.
///
/// Managers distinguish *transient* failures (retryable with back-off)
/// from *permanent* ones via [`Error::is_transient`]. `Cancelled` is
/// never retried and never counted as a failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("already exists: {name}")]
    AlreadyExists { name: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("authentication error: {reason}")]
    Auth { reason: String },

    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("content cache is full")]
    CacheFull,

    #[error("request queue is full")]
    QueueFull,

    #[error("conflicting change on {id}")]
    Conflict { id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("store error: {source}")]
    Store {
        #[from]
        source: sled::Error,
    },

    #[error("corrupt record: {reason}")]
    Corruption { reason: String },
}

impl Error {
    pub fn not_found(id: impl ToString) -> Self {
        Error::NotFound { id: id.to_string() }
    }

    pub fn network(reason: impl ToString) -> Self {
        Error::Network {
            reason: reason.to_string(),
        }
    }

    pub fn validation(reason: impl ToString) -> Self {
        Error::Validation {
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: impl ToString) -> Self {
        Error::InvalidArgument {
            reason: reason.to_string(),
        }
    }

    pub fn corruption(reason: impl ToString) -> Self {
        Error::Corruption {
            reason: reason.to_string(),
        }
    }

    /// Transient failures consume retry budget; everything else is
    /// reported to the status publisher and surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Io { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// POSIX mapping for the kernel boundary.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound { .. } => libc::ENOENT,
            Error::AlreadyExists { .. } => libc::EEXIST,
            Error::InvalidArgument { .. } => libc::EINVAL,
            Error::CacheFull => libc::ENOSPC,
            Error::QueueFull => libc::EAGAIN,
            Error::Auth { .. } => libc::EACCES,
            Error::Cancelled => libc::EINTR,
            Error::Network { .. }
            | Error::Validation { .. }
            | Error::Conflict { .. }
            | Error::Io { .. }
            | Error::Store { .. }
            | Error::Corruption { .. } => libc::EIO,
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::corruption(e)
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::corruption(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::network("operation timed out")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transience() {
        assert!(Error::network("conn reset").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::validation("hash mismatch").is_transient());
    }

    #[test]
    fn posix_mapping() {
        assert_eq!(Error::not_found("x").errno(), libc::ENOENT);
        assert_eq!(Error::CacheFull.errno(), libc::ENOSPC);
        assert_eq!(Error::invalid("bad name").errno(), libc::EINVAL);
        assert_eq!(Error::network("offline").errno(), libc::EIO);
    }
}
