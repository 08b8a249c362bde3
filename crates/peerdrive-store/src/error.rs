use std::path::PathBuf;

use peerdrive_shared::error::ProtocolError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (blob files, storage directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage directory or its database does not exist.
    #[error("Drive storage missing at {0}")]
    Missing(PathBuf),

    /// Storage exists but its metadata is unusable.
    #[error("Drive storage corrupt: {0}")]
    Corrupt(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Local write attempted on a store without the writer key.
    #[error("Drive is read-only")]
    ReadOnly,

    /// The store has been closed.
    #[error("Drive store is closed")]
    Closed,

    /// Blob bytes do not match the hash recorded in the op.
    #[error("Blob integrity check failed for {0}")]
    Integrity(String),

    /// Entry path is not absolute or carries empty, `.` or `..` segments.
    #[error("Invalid entry path: {0:?}")]
    InvalidPath(String),

    /// Op signing, verification or encoding failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Op log encoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Hex decoding error.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
