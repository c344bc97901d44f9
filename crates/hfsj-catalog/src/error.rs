//! Error types for catalog and directory operations.

use thiserror::Error;

use crate::types::Cnid;

/// Result type alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Error variants surfaced by the catalog engine.
///
/// Storage and transaction failures are passed through unchanged; the logical
/// variants are produced by validation before any catalog mutation.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No catalog entry exists under the requested key.
    #[error("entry '{name}' not found in directory {parent}")]
    NotFound {
        /// Parent directory of the missing entry.
        parent: Cnid,
        /// Name that was looked up.
        name: String,
    },

    /// The object is neither cached in-core nor reachable through its thread record.
    #[error("object {0} not found")]
    ObjectNotFound(Cnid),

    /// A live record already occupies the key.
    #[error("entry '{name}' already exists in directory {parent}")]
    AlreadyExists {
        /// Parent directory of the existing entry.
        parent: Cnid,
        /// Colliding name.
        name: String,
    },

    /// Directory still has entries besides `.` and `..`.
    #[error("directory {0} is not empty")]
    NotEmpty(Cnid),

    /// A directory was required.
    #[error("object {0} is not a directory")]
    NotADirectory(Cnid),

    /// A non-directory was required.
    #[error("object {0} is a directory")]
    IsADirectory(Cnid),

    /// Malformed record, record type or length.
    #[error("corrupt catalog: {detail}")]
    CorruptCatalog {
        /// What was wrong with the record.
        detail: String,
    },

    /// Identifier space or link-id space exhausted.
    #[error("no space left on volume")]
    NoSpace,

    /// Operation disallowed on this object (resource fork, non-regular target, reserved folder).
    #[error("operation not permitted: {op}")]
    PermissionDenied {
        /// The rejected operation.
        op: &'static str,
    },

    /// Name cannot be stored: it collates equal to the thread-record name.
    #[error("invalid name {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Name does not fit in a catalog key.
    #[error("name too long: {len} UTF-16 units")]
    NameTooLong {
        /// Encoded length of the rejected name.
        len: usize,
    },

    /// Opaque failure from the storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage-layer failure that is not an OS error (lock poisoning, frame encoding).
    #[error("storage error: {0}")]
    Storage(String),

    /// A transaction scope could not begin or commit.
    #[error("transaction error: {detail}")]
    Transaction {
        /// Reason reported by the journal.
        detail: String,
    },
}

impl CatalogError {
    /// Builds a [`CatalogError::CorruptCatalog`].
    pub fn corrupt(detail: impl Into<String>) -> Self {
        CatalogError::CorruptCatalog {
            detail: detail.into(),
        }
    }

    /// Builds a [`CatalogError::Transaction`].
    pub fn transaction(detail: impl Into<String>) -> Self {
        CatalogError::Transaction {
            detail: detail.into(),
        }
    }

    /// Maps the error onto the errno a VFS dispatcher should return.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            CatalogError::NotFound { .. } => ENOENT,
            CatalogError::ObjectNotFound(_) => ENOENT,
            CatalogError::AlreadyExists { .. } => EEXIST,
            CatalogError::NotEmpty(_) => ENOTEMPTY,
            CatalogError::NotADirectory(_) => ENOTDIR,
            CatalogError::IsADirectory(_) => EISDIR,
            CatalogError::CorruptCatalog { .. } => EIO,
            CatalogError::NoSpace => ENOSPC,
            CatalogError::PermissionDenied { .. } => EPERM,
            CatalogError::NameTooLong { .. } => ENAMETOOLONG,
            CatalogError::InvalidName { .. } => EINVAL,
            CatalogError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            CatalogError::Storage(_) => EIO,
            CatalogError::Transaction { .. } => EIO,
        }
    }
}
