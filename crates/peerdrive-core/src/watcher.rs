//! Per-drive change watchers.
//!
//! One task per active drive turns the store's mutation feed into
//! `DriveChanged` events. A watcher whose feed closes removes itself and is
//! not restarted; re-activating the drive starts a new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use peerdrive_shared::DriveId;
use peerdrive_store::DriveStore;

use crate::error::{Result, SoftFailure};
use crate::events::EventBus;

struct WatcherState {
    watcher_id: u64,
    handle: JoinHandle<()>,
}

pub struct ChangeWatchBroadcaster {
    events: EventBus,
    watchers: Arc<Mutex<HashMap<DriveId, WatcherState>>>,
    next_id: AtomicU64,
}

impl ChangeWatchBroadcaster {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start watching `store`. Returns `false` if a watcher is already running
    /// for this drive.
    pub async fn start(&self, drive_id: &DriveId, store: &DriveStore) -> Result<bool> {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(drive_id) {
            return Ok(false);
        }

        let mut changes = store.watch()?;
        let watcher_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        let registry = self.watchers.clone();
        let id = drive_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        debug!(drive = %id, path = %change.path, seq = change.seq, "Drive changed");
                        events.drive_changed(&id);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(drive = %id, skipped, "Watcher lagged");
                        events.drive_changed(&id);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // the entry may already belong to a newer watcher
            let mut watchers = registry.lock().await;
            if watchers.get(&id).is_some_and(|w| w.watcher_id == watcher_id) {
                watchers.remove(&id);
            }
            debug!(drive = %id, "Watcher ended");
        });

        watchers.insert(drive_id.clone(), WatcherState { watcher_id, handle });
        debug!(drive = %drive_id, "Watcher started");
        Ok(true)
    }

    pub async fn is_running(&self, drive_id: &DriveId) -> bool {
        self.watchers.lock().await.contains_key(drive_id)
    }

    pub async fn stop(&self, drive_id: &DriveId) -> bool {
        match self.watchers.lock().await.remove(drive_id) {
            Some(watcher) => {
                watcher.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Tear down every watcher. Teardown problems are collected, not raised.
    pub async fn stop_all(&self) -> Vec<SoftFailure> {
        let drained: Vec<(DriveId, WatcherState)> = self.watchers.lock().await.drain().collect();
        let mut failures = Vec::new();

        for (drive_id, watcher) in drained {
            watcher.handle.abort();
            match watcher.handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => failures.push(SoftFailure::new(&drive_id, "watcher", e)),
            }
        }
        info!(failures = failures.len(), "Stopped all watchers");
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DriveEvent;
    use peerdrive_shared::DriveKeypair;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> DriveStore {
        DriveStore::create(&dir.path().join("d"), DriveKeypair::generate())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_emits_drive_changed_and_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let broadcaster = ChangeWatchBroadcaster::new(events);
        let id = DriveId::from("d");

        assert!(broadcaster.start(&id, &store).await.unwrap());
        assert!(!broadcaster.start(&id, &store).await.unwrap());

        store.put("/x", b"1").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DriveEvent::DriveChanged { drive_id: id.clone() });
        // exactly one watcher, so exactly one event
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_feed_removes_watcher() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let broadcaster = ChangeWatchBroadcaster::new(EventBus::new());
        let id = DriveId::from("d");

        broadcaster.start(&id, &store).await.unwrap();
        store.close().unwrap();

        for _ in 0..50 {
            if !broadcaster.is_running(&id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("watcher still registered after its feed closed");
    }

    #[tokio::test]
    async fn test_stop_all_clears_everything() {
        let dir = TempDir::new().unwrap();
        let a = store(&dir).await;
        let dir_b = TempDir::new().unwrap();
        let b = store(&dir_b).await;
        let broadcaster = ChangeWatchBroadcaster::new(EventBus::new());

        broadcaster.start(&DriveId::from("a"), &a).await.unwrap();
        broadcaster.start(&DriveId::from("b"), &b).await.unwrap();

        assert!(broadcaster.stop_all().await.is_empty());
        assert!(!broadcaster.is_running(&DriveId::from("a")).await);
        assert!(!broadcaster.is_running(&DriveId::from("b")).await);
    }
}
