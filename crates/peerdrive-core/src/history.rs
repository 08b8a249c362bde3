//! Persisted log of finished downloads, newest first.

use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use peerdrive_shared::DriveId;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub drive_id: DriveId,
    pub path: String,
    pub file_name: String,
    pub download_target_path: PathBuf,
    pub file_count: usize,
    pub downloaded_at: DateTime<Utc>,
    pub status: DownloadOutcome,
}

pub struct DownloadHistoryStore {
    path: PathBuf,
    retention: Duration,
    lock: Mutex<()>,
}

impl DownloadHistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention_days: i64) -> Self {
        Self {
            path: path.into(),
            retention: Duration::days(retention_days),
            lock: Mutex::new(()),
        }
    }

    pub async fn list(&self) -> Vec<DownloadRecord> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Prepend `record`, dropping everything past the retention window.
    pub async fn add(&self, record: DownloadRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let cutoff = Utc::now() - self.retention;

        let mut records = self.load().await;
        let before = records.len();
        records.retain(|r| r.downloaded_at >= cutoff);
        if records.len() < before {
            debug!(pruned = before - records.len(), "Pruned old download records");
        }
        records.insert(0, record);
        self.save(&records).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.save(&records).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save(&[]).await
    }

    async fn load(&self) -> Vec<DownloadRecord> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Download history corrupt, treating as empty");
                Vec::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Download history unreadable");
                Vec::new()
            }
        }
    }

    async fn save(&self, records: &[DownloadRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(records)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
