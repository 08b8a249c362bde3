//! v001 -- Initial schema creation.
//!
//! Creates `meta`, `log`, `entries` and `blobs`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Drive metadata (public key, optional secret key, creation time)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Append-only op log
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS log (
    seq INTEGER PRIMARY KEY NOT NULL,   -- contiguous, starts at 1
    op  BLOB NOT NULL                   -- bincode SignedOp
);

-- ----------------------------------------------------------------
-- Current file tree (materialized from the log)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS entries (
    path        TEXT PRIMARY KEY NOT NULL,
    blob_hash   TEXT,                   -- hex BLAKE3, NULL for byte-less entries
    blob_size   INTEGER,
    seq         INTEGER NOT NULL,
    modified_at TEXT NOT NULL           -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_entries_blob_hash ON entries(blob_hash);

-- ----------------------------------------------------------------
-- Blobs present on local disk
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blobs (
    hash TEXT PRIMARY KEY NOT NULL,
    size INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
