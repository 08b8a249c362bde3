//! Drive lifecycle: create, join, boot and close.
//!
//! The active table is the only answer to "is this drive usable". Inserting
//! into it is a critical section: if two paths race to activate the same id
//! (a create and a boot, say) the first insert wins and the loser's store is
//! closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use peerdrive_shared::identity::derive_content_key;
use peerdrive_shared::{DriveId, DriveKeypair, DriveKind, DrivePublicKey};
use peerdrive_store::DriveStore;

use crate::config::drive_dir_in;
use crate::error::{log_soft_failures, CoreError, Result, SoftFailure};
use crate::events::{DriveEvent, EventBus};
use crate::registry::{DriveRecord, DriveRegistry};
use crate::replication::ReplicationCoordinator;
use crate::watcher::ChangeWatchBroadcaster;

/// An opened, ready-to-use drive.
#[derive(Debug)]
pub struct ActiveDrive {
    pub record: DriveRecord,
    pub store: Arc<DriveStore>,
}

impl ActiveDrive {
    pub fn id(&self) -> &DriveId {
        &self.record.id
    }

    pub fn is_writable(&self) -> bool {
        self.record.kind.is_writable()
    }
}

/// Result of re-opening every registered drive at startup.
#[derive(Debug, Default)]
pub struct BootReport {
    pub opened: Vec<Arc<ActiveDrive>>,
    pub failures: Vec<SoftFailure>,
}

pub struct DriveLifecycleManager {
    drives_dir: PathBuf,
    registry: Arc<DriveRegistry>,
    coordinator: ReplicationCoordinator,
    watchers: ChangeWatchBroadcaster,
    events: EventBus,
    active: Mutex<HashMap<DriveId, Arc<ActiveDrive>>>,
    closed: AtomicBool,
}

impl DriveLifecycleManager {
    pub fn new(
        drives_dir: impl Into<PathBuf>,
        registry: Arc<DriveRegistry>,
        coordinator: ReplicationCoordinator,
        events: EventBus,
    ) -> Self {
        Self {
            drives_dir: drives_dir.into(),
            registry,
            coordinator,
            watchers: ChangeWatchBroadcaster::new(events.clone()),
            events,
            active: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &ReplicationCoordinator {
        &self.coordinator
    }

    pub fn watchers(&self) -> &ChangeWatchBroadcaster {
        &self.watchers
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Create / join
    // ------------------------------------------------------------------

    /// Create a new writable drive under a fresh id.
    pub async fn create_drive(&self, name: &str) -> Result<Arc<ActiveDrive>> {
        self.ensure_running()?;

        let id = DriveId::new();
        let storage_dir = drive_dir_in(&self.drives_dir, &id);
        let keypair = DriveKeypair::generate();
        let public_key = keypair.public_key();

        let store = DriveStore::create(&storage_dir, keypair).await?;
        let record = DriveRecord {
            id,
            name: name.to_string(),
            storage_dir,
            public_key: public_key.to_hex(),
            content_key: Some(hex::encode(derive_content_key(&public_key))),
            created_at: Utc::now(),
            kind: DriveKind::Owned,
            owner_key: None,
        };

        let drive = self.register_and_activate(record, store).await?;
        info!(drive = %drive.id(), name, key = %public_key.short(), "Created drive");
        Ok(drive)
    }

    /// Join someone else's drive read-only. Joining a key that is already
    /// registered returns the existing drive.
    pub async fn join_drive(&self, name: &str, public_key: DrivePublicKey) -> Result<Arc<ActiveDrive>> {
        self.ensure_running()?;

        let key_hex = public_key.to_hex();
        if let Some(existing) = self.registry.read().await.into_iter().find(|r| r.public_key == key_hex) {
            if let Some(active) = self.get_active(&existing.id).await {
                debug!(drive = %existing.id, "Drive already joined");
                return Ok(active);
            }
            return self.open_record(existing).await;
        }

        let id = DriveId::new();
        let storage_dir = drive_dir_in(&self.drives_dir, &id);
        let store = DriveStore::join(&storage_dir, public_key).await?;
        let record = DriveRecord {
            id,
            name: name.to_string(),
            storage_dir,
            public_key: key_hex.clone(),
            content_key: Some(hex::encode(derive_content_key(&public_key))),
            created_at: Utc::now(),
            kind: DriveKind::Readonly,
            owner_key: Some(key_hex),
        };

        let drive = self.register_and_activate(record, store).await?;
        info!(drive = %drive.id(), name, key = %public_key.short(), "Joined drive");
        Ok(drive)
    }

    async fn register_and_activate(&self, record: DriveRecord, store: DriveStore) -> Result<Arc<ActiveDrive>> {
        if let Err(e) = self.registry.upsert(record.clone()).await {
            if let Err(close_err) = store.close() {
                warn!(drive = %record.id, error = %close_err, "Close after failed registration");
            }
            return Err(e);
        }
        self.activate(record, Arc::new(store)).await
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Insert into the active table, then wire replication, the watcher and
    /// discovery. Discovery problems never fail activation.
    async fn activate(&self, record: DriveRecord, store: Arc<DriveStore>) -> Result<Arc<ActiveDrive>> {
        let drive = {
            let mut active = self.active.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                drop(active);
                let _ = store.close();
                return Err(CoreError::ShuttingDown);
            }
            if let Some(existing) = active.get(&record.id) {
                let existing = existing.clone();
                drop(active);
                debug!(drive = %record.id, "Drive already active, closing duplicate handle");
                if let Err(e) = store.close() {
                    warn!(drive = %record.id, error = %e, "Failed to close duplicate handle");
                }
                return Ok(existing);
            }
            let drive = Arc::new(ActiveDrive { record, store });
            active.insert(drive.id().clone(), drive.clone());
            drive
        };

        if let Err(e) = self.coordinator.setup_replication(drive.id(), drive.store.clone()).await {
            warn!(drive = %drive.id(), error = %e, "Replication setup failed, drive stays local");
        }
        if let Err(e) = self.watchers.start(drive.id(), &drive.store).await {
            warn!(drive = %drive.id(), error = %e, "Watcher failed to start");
        }
        let peers = self.coordinator.join_discovery(&drive.store.public_key()).await;

        debug!(
            drive = %drive.id(),
            writable = drive.is_writable(),
            peers,
            "Drive active"
        );
        Ok(drive)
    }

    async fn open_record(&self, record: DriveRecord) -> Result<Arc<ActiveDrive>> {
        if let Some(active) = self.get_active(&record.id).await {
            return Ok(active);
        }

        let store = DriveStore::open(&record.storage_dir).await?;
        if store.public_key().to_hex() != record.public_key {
            let _ = store.close();
            return Err(CoreError::Validation(format!(
                "storage at {} belongs to another drive",
                record.storage_dir.display()
            )));
        }
        if store.is_writable() != record.kind.is_writable() {
            warn!(
                drive = %record.id,
                kind = ?record.kind,
                "Registry kind disagrees with storage keys"
            );
        }
        self.activate(record, Arc::new(store)).await
    }

    // ------------------------------------------------------------------
    // Boot / shutdown
    // ------------------------------------------------------------------

    /// Re-open every registered drive. One broken drive never stops the
    /// others; its failure lands in the report and the log.
    pub async fn initialize_all(&self) -> BootReport {
        if self.ensure_running().is_err() {
            return BootReport::default();
        }

        let records = self.registry.read().await;
        let total = records.len();
        let results = join_all(records.into_iter().map(|record| async move {
            let id = record.id.clone();
            self.open_record(record)
                .await
                .map_err(|e| SoftFailure::new(&id, "open", e))
        }))
        .await;

        let mut report = BootReport::default();
        for result in results {
            match result {
                Ok(drive) => report.opened.push(drive),
                Err(failure) => report.failures.push(failure),
            }
        }

        log_soft_failures("initialize drives", &report.failures);
        info!(total, opened = report.opened.len(), "Drives initialized");
        self.events.emit(DriveEvent::DrivesInitialized {
            count: report.opened.len(),
        });
        report
    }

    /// Close every active drive. Best effort: failures are collected and
    /// logged, never raised. The manager refuses new drives afterwards.
    pub async fn close_all(&self) -> Vec<SoftFailure> {
        self.closed.store(true, Ordering::SeqCst);

        let mut failures = self.watchers.stop_all().await;
        let drained: Vec<Arc<ActiveDrive>> = self.active.lock().await.drain().map(|(_, d)| d).collect();

        for drive in &drained {
            self.coordinator.leave(drive.id()).await;
            if let Err(e) = drive.store.close() {
                failures.push(SoftFailure::new(drive.id(), "close", e));
            }
        }

        log_soft_failures("close drives", &failures);
        info!(closed = drained.len(), "Closed all drives");
        failures
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub async fn get_active(&self, id: &DriveId) -> Option<Arc<ActiveDrive>> {
        self.active.lock().await.get(id).cloned()
    }

    /// Active drives, oldest first.
    pub async fn list_active(&self) -> Vec<Arc<ActiveDrive>> {
        let mut drives: Vec<Arc<ActiveDrive>> = self.active.lock().await.values().cloned().collect();
        drives.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        drives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> DriveLifecycleManager {
        DriveLifecycleManager::new(
            dir.path().join("drives"),
            Arc::new(DriveRegistry::new(dir.path().join("drives.json"))),
            ReplicationCoordinator::offline(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_create_and_join_record_kinds() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let owned = manager.create_drive("Mine").await.unwrap();
        assert_eq!(owned.record.kind, DriveKind::Owned);
        assert!(owned.store.is_writable());

        let foreign = DriveKeypair::generate().public_key();
        let joined = manager.join_drive("Theirs", foreign).await.unwrap();
        assert_eq!(joined.record.kind, DriveKind::Readonly);
        assert!(!joined.store.is_writable());
        assert_ne!(owned.id(), joined.id());

        assert_eq!(manager.list_active().await.len(), 2);
        assert!(manager.watchers().is_running(owned.id()).await);
        assert!(manager.coordinator().is_replicating(joined.id()).await);
    }

    #[tokio::test]
    async fn test_joining_same_key_twice_returns_existing() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let key = DriveKeypair::generate().public_key();

        let first = manager.join_drive("One", key).await.unwrap();
        let second = manager.join_drive("Two", key).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_racing_activation_keeps_one_handle() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let created = manager.create_drive("Race").await.unwrap();
        let record = created.record.clone();

        let a = DriveStore::open(&record.storage_dir).await.unwrap();
        let b = DriveStore::open(&record.storage_dir).await.unwrap();
        let (ra, rb) = tokio::join!(
            manager.activate(record.clone(), Arc::new(a)),
            manager.activate(record.clone(), Arc::new(b)),
        );
        assert!(Arc::ptr_eq(&ra.unwrap(), &created));
        assert!(Arc::ptr_eq(&rb.unwrap(), &created));
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_then_refuse_new_drives() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let drive = manager.create_drive("Bye").await.unwrap();

        assert!(manager.close_all().await.is_empty());
        assert!(manager.list_active().await.is_empty());
        assert!(drive.store.is_closed());
        assert!(matches!(
            manager.create_drive("Late").await,
            Err(CoreError::ShuttingDown)
        ));
    }
}
