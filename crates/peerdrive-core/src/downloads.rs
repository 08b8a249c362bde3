//! In-memory tracking of long-running downloads and bulk clears.
//!
//! At most one entry per `(drive, path)` may be `Downloading`; the check and
//! the insert happen under one lock, so two racing starts cannot both win.
//! Finished entries linger for a retention window so observers can see the
//! outcome, then disappear.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerdrive_shared::DriveId;

use crate::error::{CoreError, Result};
use crate::events::{DriveEvent, EventBus};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    File,
    Folder,
    /// Whole-drive content clear, tracked at `/`.
    Clear,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub current_file: String,
    pub downloaded_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDownload {
    pub id: String,
    pub drive_id: DriveId,
    pub path: String,
    pub file_name: String,
    pub start_time: DateTime<Utc>,
    pub kind: DownloadKind,
    pub status: DownloadStatus,
    pub progress: Option<DownloadProgress>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
    pub stale_after: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(5),
            failed: Duration::from_secs(10),
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

/// What to register with [`DownloadTracker::start`].
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: String,
    pub drive_id: DriveId,
    pub path: String,
    pub file_name: String,
    pub kind: DownloadKind,
}

#[derive(Clone)]
pub struct DownloadTracker {
    entries: Arc<Mutex<HashMap<String, ActiveDownload>>>,
    events: EventBus,
    retention: RetentionPolicy,
}

impl DownloadTracker {
    pub fn new(events: EventBus, retention: RetentionPolicy) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
            retention,
        }
    }

    /// Register a download and run `work` in the background. The entry moves
    /// to `Completed` or `Failed` when `work` resolves.
    ///
    /// Fails with [`CoreError::AlreadyInFlight`] if the same target is
    /// already downloading.
    pub async fn start<F, T>(&self, request: DownloadRequest, work: F) -> Result<JoinHandle<Result<T>>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        {
            let mut entries = self.entries.lock().await;
            let busy = entries.values().any(|d| {
                d.status == DownloadStatus::Downloading
                    && d.drive_id == request.drive_id
                    && d.path == request.path
            });
            if busy {
                return Err(CoreError::AlreadyInFlight {
                    drive_id: request.drive_id,
                    path: request.path,
                });
            }
            if entries.contains_key(&request.id) {
                return Err(CoreError::Validation(format!(
                    "duplicate download id {}",
                    request.id
                )));
            }

            info!(
                id = %request.id,
                drive = %request.drive_id,
                path = %request.path,
                kind = ?request.kind,
                "Download started"
            );
            entries.insert(
                request.id.clone(),
                ActiveDownload {
                    id: request.id.clone(),
                    drive_id: request.drive_id,
                    path: request.path,
                    file_name: request.file_name,
                    start_time: Utc::now(),
                    kind: request.kind,
                    status: DownloadStatus::Downloading,
                    progress: None,
                    error: None,
                },
            );
        }

        let tracker = self.clone();
        let id = request.id;
        Ok(tokio::spawn(async move {
            let result = work.await;
            match &result {
                Ok(_) => tracker.finish(&id, DownloadStatus::Completed, None).await,
                Err(e) => {
                    tracker
                        .finish(&id, DownloadStatus::Failed, Some(e.to_string()))
                        .await
                }
            }
            result
        }))
    }

    async fn finish(&self, id: &str, status: DownloadStatus, error: Option<String>) {
        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(id) else {
                // cancelled entries are already gone
                return;
            };
            if entry.status != DownloadStatus::Downloading {
                return;
            }
            entry.status = status;
            if let Some(ref error) = error {
                warn!(id, error = %error, "Download failed");
            } else {
                info!(id, "Download completed");
            }
            entry.error = error;
        }

        let linger = match status {
            DownloadStatus::Completed => self.retention.completed,
            _ => self.retention.failed,
        };
        let entries = self.entries.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let mut entries = entries.lock().await;
            if entries.get(&id).is_some_and(|d| d.status == status) {
                entries.remove(&id);
                debug!(id = %id, "Dropped finished download");
            }
        });
    }

    pub async fn is_in_flight(&self, drive_id: &DriveId, path: &str) -> bool {
        self.entries.lock().await.values().any(|d| {
            d.status == DownloadStatus::Downloading && &d.drive_id == drive_id && d.path == path
        })
    }

    /// Record progress and publish it. Ignored once the entry is no longer
    /// downloading.
    pub async fn update_progress(&self, id: &str, progress: DownloadProgress) -> bool {
        {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(id) {
                Some(entry) if entry.status == DownloadStatus::Downloading => {
                    entry.progress = Some(progress.clone());
                }
                _ => return false,
            }
        }
        self.events.emit(DriveEvent::DownloadProgress {
            download_id: id.to_string(),
            current_file: progress.current_file,
            downloaded_count: progress.downloaded_count,
            total_count: progress.total_count,
        });
        true
    }

    /// Forget a running download. The underlying work is not interrupted;
    /// it just stops being tracked.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(id) {
            Some(entry) if entry.status == DownloadStatus::Downloading => {
                entries.remove(id);
                info!(id, "Download cancelled");
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<ActiveDownload> {
        self.entries.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<ActiveDownload> {
        let mut list: Vec<ActiveDownload> = self.entries.lock().await.values().cloned().collect();
        list.sort_by_key(|d| d.start_time);
        list
    }

    /// Remove entries older than the stale age whatever their status.
    pub async fn cleanup(&self) -> usize {
        let stale_after = chrono::Duration::from_std(self.retention.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let cutoff = Utc::now() - stale_after;

        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, d| d.start_time > cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "Swept stale download entries");
        }
        removed
    }

    /// Run [`DownloadTracker::cleanup`] every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.cleanup().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn request(id: &str, path: &str) -> DownloadRequest {
        DownloadRequest {
            id: id.into(),
            drive_id: DriveId::from("drive"),
            path: path.into(),
            file_name: "f".into(),
            kind: DownloadKind::File,
        }
    }

    fn fast_tracker() -> DownloadTracker {
        DownloadTracker::new(
            EventBus::new(),
            RetentionPolicy {
                completed: Duration::from_millis(50),
                failed: Duration::from_millis(100),
                stale_after: Duration::from_secs(1800),
            },
        )
    }

    #[tokio::test]
    async fn test_second_start_for_same_target_rejected() {
        let tracker = fast_tracker();
        let (release, gate) = oneshot::channel::<()>();

        let first = tracker
            .start(request("1", "/a"), async move {
                let _ = gate.await;
                Ok(())
            })
            .await
            .unwrap();

        assert!(tracker.is_in_flight(&DriveId::from("drive"), "/a").await);
        let second = tracker.start(request("2", "/a"), async { Ok(()) }).await;
        assert!(matches!(second, Err(CoreError::AlreadyInFlight { .. })));

        // a different path is independent
        tracker
            .start(request("3", "/b"), async { Ok(()) })
            .await
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        release.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert!(!tracker.is_in_flight(&DriveId::from("drive"), "/a").await);
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_exactly_one() {
        let tracker = fast_tracker();
        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker
                        .start(request(&i.to_string(), "/same"), async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok(())
                        })
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_terminal_entries_expire() {
        let tracker = fast_tracker();
        tracker
            .start(request("ok", "/ok"), async { Ok(()) })
            .await
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        let failed = tracker
            .start(request("bad", "/bad"), async {
                Err::<(), _>(CoreError::ContentUnavailable("/bad".into()))
            })
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(failed.is_err());

        assert_eq!(tracker.get("ok").await.unwrap().status, DownloadStatus::Completed);
        let bad = tracker.get("bad").await.unwrap();
        assert_eq!(bad.status, DownloadStatus::Failed);
        assert!(bad.error.is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(tracker.get("ok").await.is_none());
        assert!(tracker.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_progress_emits_event_and_cancel_removes() {
        let tracker = fast_tracker();
        let mut events = tracker.events.subscribe();
        let (_release, gate) = oneshot::channel::<()>();
        tracker
            .start(request("p", "/p"), async move {
                let _ = gate.await;
                Ok(())
            })
            .await
            .unwrap();

        let progress = DownloadProgress {
            current_file: "a".into(),
            downloaded_count: 1,
            total_count: 2,
        };
        assert!(tracker.update_progress("p", progress).await);
        assert_eq!(
            events.recv().await.unwrap(),
            DriveEvent::DownloadProgress {
                download_id: "p".into(),
                current_file: "a".into(),
                downloaded_count: 1,
                total_count: 2,
            }
        );

        assert!(tracker.cancel("p").await);
        assert!(tracker.get("p").await.is_none());
        assert!(!tracker.is_in_flight(&DriveId::from("drive"), "/p").await);
        assert!(
            !tracker
                .update_progress(
                    "p",
                    DownloadProgress {
                        current_file: "b".into(),
                        downloaded_count: 2,
                        total_count: 2
                    }
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_old_entries() {
        let tracker = DownloadTracker::new(
            EventBus::new(),
            RetentionPolicy {
                stale_after: Duration::from_millis(10),
                ..RetentionPolicy::default()
            },
        );
        let (_release, gate) = oneshot::channel::<()>();
        tracker
            .start(request("stuck", "/s"), async move {
                let _ = gate.await;
                Ok(())
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.cleanup().await, 1);
        assert!(tracker.list().await.is_empty());
    }
}
