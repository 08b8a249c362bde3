//! Durable catalog of drives, stored as one JSON document.
//!
//! Reads never fail: a missing or unparsable document is an empty registry,
//! so a first run (or a damaged file) never blocks startup.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use peerdrive_shared::{DriveId, DriveKind};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveRecord {
    pub id: DriveId,
    pub name: String,
    pub storage_dir: PathBuf,
    /// Hex-encoded drive public key.
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: DriveKind,
    /// Key of the party that owns a joined drive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<String>,
}

/// On-disk shape; `type` may be missing in documents written before drive
/// kinds existed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    id: DriveId,
    name: String,
    storage_dir: PathBuf,
    public_key: String,
    #[serde(default)]
    content_key: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(rename = "type", default)]
    kind: Option<DriveKind>,
    #[serde(default)]
    owner_key: Option<String>,
}

impl From<StoredRecord> for DriveRecord {
    fn from(stored: StoredRecord) -> Self {
        Self {
            id: stored.id,
            name: stored.name,
            storage_dir: stored.storage_dir,
            public_key: stored.public_key,
            content_key: stored.content_key,
            created_at: stored.created_at,
            kind: stored.kind.unwrap_or(DriveKind::Owned),
            owner_key: stored.owner_key,
        }
    }
}

pub struct DriveRegistry {
    path: PathBuf,
    /// Serializes read-modify-write cycles within the process.
    lock: Mutex<()>,
}

impl DriveRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Vec<DriveRecord> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn get(&self, id: &DriveId) -> Option<DriveRecord> {
        self.read().await.into_iter().find(|r| &r.id == id)
    }

    pub async fn write(&self, records: &[DriveRecord]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save(records).await
    }

    /// Insert or replace the record with the same id.
    pub async fn upsert(&self, record: DriveRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.save(&records).await
    }

    pub async fn remove(&self, id: &DriveId) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await;
        let before = records.len();
        records.retain(|r| &r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.save(&records).await?;
        Ok(true)
    }

    // Callers hold `lock`.
    async fn load(&self) -> Vec<DriveRecord> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Registry unreadable, treating as empty");
                return Vec::new();
            }
        };

        let stored: Vec<StoredRecord> = match serde_json::from_slice(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                let err = CoreError::RegistryCorrupt(e.to_string());
                warn!(path = %self.path.display(), error = %err, "Treating registry as empty");
                return Vec::new();
            }
        };

        let needs_normalizing = stored.iter().any(|r| r.kind.is_none());
        let records: Vec<DriveRecord> = stored.into_iter().map(DriveRecord::from).collect();

        if needs_normalizing {
            info!("Normalizing registry records without a drive type");
            if let Err(e) = self.save(&records).await {
                warn!(error = %e, "Could not write back normalized registry");
            }
        }
        records
    }

    async fn save(&self, records: &[DriveRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(records)?;

        // rename is atomic, readers never see a half-written document
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(count = records.len(), "Saved drive registry");
        Ok(())
    }
}
