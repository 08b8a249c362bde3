//! Op log, file tree and blob bookkeeping queries.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use peerdrive_shared::protocol::{BlobRef, DriveOp, SignedOp};

use crate::database::Database;
use crate::error::Result;
use crate::models::Entry;

impl Database {
    // ------------------------------------------------------------------
    // Log
    // ------------------------------------------------------------------

    /// Highest sequence number in the log (0 when empty).
    pub fn head_seq(&self) -> Result<u64> {
        let head: Option<i64> =
            self.conn()
                .query_row("SELECT MAX(seq) FROM log", [], |row| row.get(0))?;
        Ok(head.unwrap_or(0) as u64)
    }

    /// Append a signed op and apply it to the tree in one transaction.
    pub fn commit_op(&mut self, signed: &SignedOp) -> Result<()> {
        let encoded = signed.to_bytes()?;
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO log (seq, op) VALUES (?1, ?2)",
            params![signed.op.seq() as i64, encoded],
        )?;

        match &signed.op {
            DriveOp::Put {
                seq,
                path,
                blob,
                modified_at,
            } => {
                tx.execute(
                    "INSERT INTO entries (path, blob_hash, blob_size, seq, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(path) DO UPDATE SET
                        blob_hash = excluded.blob_hash,
                        blob_size = excluded.blob_size,
                        seq = excluded.seq,
                        modified_at = excluded.modified_at",
                    params![
                        path,
                        blob.map(|b| b.hash_hex()),
                        blob.map(|b| b.size as i64),
                        *seq as i64,
                        modified_at.to_rfc3339(),
                    ],
                )?;
            }
            DriveOp::Del { path, .. } => {
                tx.execute("DELETE FROM entries WHERE path = ?1", params![path])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Ops with `seq > since`, in log order.
    pub fn ops_since(&self, since: u64) -> Result<Vec<SignedOp>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT op FROM log WHERE seq > ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![since as i64], |row| row.get::<_, Vec<u8>>(0))?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(SignedOp::from_bytes(&row?)?);
        }
        Ok(ops)
    }

    // ------------------------------------------------------------------
    // Tree
    // ------------------------------------------------------------------

    pub fn get_entry(&self, path: &str) -> Result<Option<Entry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT path, blob_hash, blob_size, seq, modified_at
                 FROM entries WHERE path = ?1",
                params![path],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every entry of the tree, ordered by path.
    pub fn list_entries(&self) -> Result<Vec<Entry>> {
        let mut stmt = self.conn().prepare(
            "SELECT path, blob_hash, blob_size, seq, modified_at
             FROM entries
             ORDER BY path ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Number of tree entries still pointing at a blob.
    pub fn blob_refcount(&self, blob: &BlobRef) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM entries WHERE blob_hash = ?1",
            params![blob.hash_hex()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Local blobs
    // ------------------------------------------------------------------

    pub fn insert_blob(&self, blob: &BlobRef) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blobs (hash, size) VALUES (?1, ?2)",
            params![blob.hash_hex(), blob.size as i64],
        )?;
        Ok(())
    }

    pub fn blob_present(&self, blob: &BlobRef) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM blobs WHERE hash = ?1",
                params![blob.hash_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // only removes the bookkeeping row, not the file on disk
    pub fn delete_blob(&self, blob: &BlobRef) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM blobs WHERE hash = ?1", params![blob.hash_hex()])?;
        Ok(affected > 0)
    }

    /// Local blobs no tree entry references any more.
    pub fn orphan_blobs(&self) -> Result<Vec<BlobRef>> {
        let mut stmt = self.conn().prepare(
            "SELECT hash, size FROM blobs
             WHERE hash NOT IN (SELECT blob_hash FROM entries WHERE blob_hash IS NOT NULL)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut orphans = Vec::new();
        for row in rows {
            let (hash_hex, size) = row?;
            orphans.push(blob_ref_from_hex(&hash_hex, size)?);
        }
        Ok(orphans)
    }

    pub fn total_blob_bytes(&self) -> Result<u64> {
        let total: Option<i64> =
            self.conn()
                .query_row("SELECT SUM(size) FROM blobs", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn blob_ref_from_hex(hash_hex: &str, size: i64) -> Result<BlobRef> {
    let bytes = hex::decode(hash_hex)?;
    let mut hash = [0u8; 32];
    if bytes.len() == 32 {
        hash.copy_from_slice(&bytes);
    }
    Ok(BlobRef {
        hash,
        size: size as u64,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let path: String = row.get(0)?;
    let blob_hash: Option<String> = row.get(1)?;
    let blob_size: Option<i64> = row.get(2)?;
    let seq: i64 = row.get(3)?;
    let modified_str: String = row.get(4)?;

    let blob = match blob_hash {
        Some(hash_hex) => Some(
            blob_ref_from_hex(&hash_hex, blob_size.unwrap_or(0)).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
            })?,
        ),
        None => None,
    };

    let modified_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&modified_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Entry {
        path,
        blob,
        seq: seq as u64,
        modified_at,
    })
}
