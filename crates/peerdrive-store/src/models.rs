//! Records returned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use peerdrive_shared::protocol::BlobRef;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One node of the drive's file tree. Only leaves exist; folders are implied
/// by path prefixes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Absolute drive path, always starting with `/`.
    pub path: String,
    /// Content reference; `None` for zero-length entries such as folder markers.
    pub blob: Option<BlobRef>,
    /// Log sequence number of the op that wrote this entry.
    pub seq: u64,
    pub modified_at: DateTime<Utc>,
}

impl Entry {
    pub fn size(&self) -> u64 {
        self.blob.map(|b| b.size).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Storage info
// ---------------------------------------------------------------------------

/// Read-only diagnostic snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    /// Bytes held by blobs present on local disk.
    pub blob_bytes: u64,
    /// Length of the op log.
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Mutation feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Del,
}

/// Emitted on the store's watch feed after every applied op, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub seq: u64,
    pub path: String,
    pub kind: ChangeKind,
}

/// Outcome of applying an op received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The op extended the log.
    Applied { seq: u64 },
    /// Already had it.
    Duplicate,
    /// Ops are missing before this one; resync from `have`.
    Gap { have: u64 },
}
