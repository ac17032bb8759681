//! Error types for bridgefs
//!
//! Every error knows the POSIX errno the kernel should see for it, and
//! whether the persistence layer may succeed if the call is repeated.

use libc::c_int;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// I/O against the backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw errno from a system call made through nix
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Metadata database error
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// A concurrent writer raced a metadata mutation
    #[error("conflicting update: {0}")]
    Conflict(String),

    /// Gateway mutation still failing after the retry budget was spent
    #[error("{op} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Failed to encode a record
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failed to decode a record
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Could not read or write the configuration file
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration was readable but not usable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A project or user segment that is not an integer id
    #[error("bad id in path: {0}")]
    BadId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("operation not permitted: {0}")]
    PermissionDenied(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// File handle unknown or already released
    #[error("bad file handle for {0}")]
    BadHandle(String),

    /// Release of a writable handle whose path is not tracked
    #[error("no in-flight upload for {0}")]
    NotTracked(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errno reported to the kernel for this error
    pub fn errno(&self) -> c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Sys(errno) => *errno as c_int,
            Error::BadId(_) | Error::InvalidArgument(_) => libc::EINVAL,
            Error::NotFound(_) | Error::NotTracked(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::PermissionDenied(_) => libc::EPERM,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::BadHandle(_) => libc::EBADF,
            Error::Database(_)
            | Error::Conflict(_)
            | Error::RetriesExhausted { .. }
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether repeating the same gateway call could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Database(sled::Error::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(inner) => Error::Database(inner),
        }
    }
}
