//! Content-addressed blob files.
//!
//! Blobs live under `<storage>/blobs/<first two hex chars>/<hash hex>`. The
//! file name is derived from the BLAKE3 hash only, so callers can never steer
//! a write outside the blob directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use peerdrive_shared::protocol::BlobRef;

use crate::error::Result;

pub const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone)]
pub struct BlobFiles {
    base_path: PathBuf,
}

impl BlobFiles {
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            base_path: storage_dir.join(BLOBS_DIR),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        let hash_hex = blob.hash_hex();
        self.base_path.join(&hash_hex[..2]).join(hash_hex)
    }

    /// Write blob bytes unless an identical blob is already on disk.
    pub async fn write(&self, blob: &BlobRef, data: &[u8]) -> Result<()> {
        let path = self.blob_path(blob);
        if fs::metadata(&path).await.is_ok() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // a file named by its hash is always complete
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(hash = %blob.hash_hex(), size = data.len(), "Stored blob");
        Ok(())
    }

    /// Read a whole blob. `None` if the file is absent or has the wrong length.
    pub async fn read(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(blob)).await {
            Ok(data) if data.len() as u64 == blob.size => Ok(Some(data)),
            Ok(data) => {
                debug!(
                    hash = %blob.hash_hex(),
                    expected = blob.size,
                    actual = data.len(),
                    "Blob length mismatch"
                );
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn open(&self, blob: &BlobRef) -> Result<Option<fs::File>> {
        match fs::File::open(self.blob_path(blob)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob file. Returns `false` if it was already gone.
    pub async fn remove(&self, blob: &BlobRef) -> Result<bool> {
        match fs::remove_file(self.blob_path(blob)).await {
            Ok(()) => {
                debug!(hash = %blob.hash_hex(), "Deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
