//! The application-facing command surface.
//!
//! [`PeerDrive`] owns every piece of core state and exposes one async method
//! per command. Input from the caller is validated here (drive names, public
//! keys, paths) and mutations of read-only drives are rejected here, before
//! anything reaches storage.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use peerdrive_shared::constants::FOLDER_MARKER;
use peerdrive_shared::{DriveId, DrivePublicKey};
use peerdrive_store::StorageInfo;

use crate::config::CoreConfig;
use crate::downloads::{ActiveDownload, DownloadTracker, RetentionPolicy};
use crate::error::{CoreError, Result, SoftFailure};
use crate::events::{DriveEvent, EventBus};
use crate::files::{FileMutationService, FolderUploadFile, StartedTask, SyncStatus, UploadFile, UploadResult};
use crate::folder::{normalize_path, normalize_relative, FolderStats, ListEntry};
use crate::history::{DownloadHistoryStore, DownloadRecord};
use crate::manager::{ActiveDrive, BootReport, DriveLifecycleManager};
use crate::registry::{DriveRecord, DriveRegistry};
use crate::replication::ReplicationCoordinator;

const MAX_NAME_LEN: usize = 255;

pub struct PeerDrive {
    config: CoreConfig,
    events: EventBus,
    manager: Arc<DriveLifecycleManager>,
    files: FileMutationService,
    downloads: DownloadTracker,
    history: Arc<DownloadHistoryStore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PeerDrive {
    pub fn new(config: CoreConfig, coordinator: ReplicationCoordinator) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(DriveRegistry::new(config.registry_path()));
        let manager = Arc::new(DriveLifecycleManager::new(
            config.drives_dir(),
            registry,
            coordinator,
            events.clone(),
        ));
        let downloads = DownloadTracker::new(
            events.clone(),
            RetentionPolicy {
                completed: config.completed_retention,
                failed: config.failed_retention,
                stale_after: config.stale_download_age,
            },
        );
        let history = Arc::new(DownloadHistoryStore::new(
            config.history_path(),
            config.history_retention_days,
        ));
        let files = FileMutationService::new(
            manager.clone(),
            events.clone(),
            downloads.clone(),
            history.clone(),
            config.read_timeout,
        );

        Self {
            config,
            events,
            manager,
            files,
            downloads,
            history,
            sweeper: Mutex::new(None),
        }
    }

    /// Local-only instance with no peer network.
    pub fn offline(config: CoreConfig) -> Self {
        Self::new(config, ReplicationCoordinator::offline())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriveEvent> {
        self.events.subscribe()
    }

    pub fn manager(&self) -> &Arc<DriveLifecycleManager> {
        &self.manager
    }

    // ------------------------------------------------------------------
    // Startup / shutdown
    // ------------------------------------------------------------------

    /// Re-open every registered drive and start the download sweeper.
    pub async fn boot(&self) -> Result<BootReport> {
        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        tokio::fs::create_dir_all(self.config.drives_dir()).await?;

        let report = self.manager.initialize_all().await;

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            *sweeper = Some(self.downloads.spawn_sweeper(self.config.sweep_interval));
        }

        info!(
            data_dir = %self.config.data_dir.display(),
            opened = report.opened.len(),
            failed = report.failures.len(),
            "PeerDrive ready"
        );
        Ok(report)
    }

    pub async fn shutdown(&self) -> Vec<SoftFailure> {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        self.manager.close_all().await
    }

    // ------------------------------------------------------------------
    // Drives
    // ------------------------------------------------------------------

    pub async fn create_drive(&self, name: &str) -> Result<DriveRecord> {
        let name = validate_name(name)?;
        let drive = self.manager.create_drive(&name).await?;
        Ok(drive.record.clone())
    }

    pub async fn join_drive(&self, name: &str, public_key_hex: &str) -> Result<DriveRecord> {
        let name = validate_name(name)?;
        let public_key = DrivePublicKey::from_hex(public_key_hex.trim())
            .map_err(|e| CoreError::Validation(format!("public key: {e}")))?;
        let drive = self.manager.join_drive(&name, public_key).await?;
        Ok(drive.record.clone())
    }

    pub async fn list_drives(&self) -> Vec<DriveRecord> {
        self.manager
            .list_active()
            .await
            .into_iter()
            .map(|d| d.record.clone())
            .collect()
    }

    pub async fn get_drive(&self, drive_id: &DriveId) -> Result<DriveRecord> {
        Ok(self.active(drive_id).await?.record.clone())
    }

    async fn active(&self, drive_id: &DriveId) -> Result<Arc<ActiveDrive>> {
        self.manager
            .get_active(drive_id)
            .await
            .ok_or_else(|| CoreError::DriveNotFound(drive_id.clone()))
    }

    async fn ensure_writable(&self, drive_id: &DriveId) -> Result<()> {
        if !self.active(drive_id).await?.is_writable() {
            warn!(drive = %drive_id, "Rejected mutation of read-only drive");
            return Err(CoreError::ReadOnly(drive_id.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn list_folder(&self, drive_id: &DriveId, folder: &str, recursive: bool) -> Result<Vec<ListEntry>> {
        let folder = normalize_path(folder)?;
        self.files.list_folder(drive_id, &folder, recursive).await
    }

    pub async fn create_folder(&self, drive_id: &DriveId, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(CoreError::Validation("cannot create the root folder".into()));
        }
        self.ensure_writable(drive_id).await?;
        self.files.create_folder(drive_id, &path).await
    }

    pub async fn upload_files(&self, drive_id: &DriveId, folder: &str, files: Vec<UploadFile>) -> Result<UploadResult> {
        let folder = normalize_path(folder)?;
        let files = files
            .into_iter()
            .map(|f| {
                let name = validate_file_name(&f.name)?;
                Ok(UploadFile { name, bytes: f.bytes })
            })
            .collect::<Result<Vec<_>>>()?;
        self.ensure_writable(drive_id).await?;
        self.files.upload_files(drive_id, &folder, files).await
    }

    pub async fn upload_folder(
        &self,
        drive_id: &DriveId,
        folder: &str,
        files: Vec<FolderUploadFile>,
    ) -> Result<UploadResult> {
        let folder = normalize_path(folder)?;
        let files = files
            .into_iter()
            .map(|f| {
                let relative_path = normalize_relative(&f.relative_path)?;
                if relative_path.split('/').any(|part| part == FOLDER_MARKER) {
                    return Err(CoreError::Validation(format!("reserved name in {relative_path}")));
                }
                Ok(FolderUploadFile {
                    relative_path,
                    bytes: f.bytes,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.ensure_writable(drive_id).await?;
        self.files.upload_folder(drive_id, &folder, files).await
    }

    pub async fn get_file_bytes(&self, drive_id: &DriveId, path: &str) -> Result<Option<Vec<u8>>> {
        let path = normalize_path(path)?;
        self.files.get_file_bytes(drive_id, &path).await
    }

    pub async fn delete_file(&self, drive_id: &DriveId, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        self.ensure_writable(drive_id).await?;
        self.files.delete_file(drive_id, &path).await
    }

    pub async fn storage_info(&self, drive_id: &DriveId) -> Result<StorageInfo> {
        self.files.storage_info(drive_id).await
    }

    pub async fn folder_stats(&self, drive_id: &DriveId, folder: &str) -> Result<FolderStats> {
        let folder = normalize_path(folder)?;
        self.files.folder_stats(drive_id, &folder).await
    }

    pub async fn sync_status(&self, drive_id: &DriveId) -> Result<SyncStatus> {
        self.files.sync_status(drive_id).await
    }

    // ------------------------------------------------------------------
    // Downloads and clears
    // ------------------------------------------------------------------

    pub async fn download_file(
        &self,
        drive_id: &DriveId,
        path: &str,
        destination_dir: impl Into<PathBuf>,
    ) -> Result<StartedTask<DownloadRecord>> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(CoreError::Validation("not a file: /".into()));
        }
        self.files
            .download_file(drive_id, &path, destination_dir.into())
            .await
    }

    pub async fn download_folder(
        &self,
        drive_id: &DriveId,
        folder: &str,
        destination_dir: impl Into<PathBuf>,
    ) -> Result<StartedTask<DownloadRecord>> {
        let folder = normalize_path(folder)?;
        self.files
            .download_folder(drive_id, &folder, destination_dir.into())
            .await
    }

    pub async fn clear_drive_content(&self, drive_id: &DriveId) -> Result<StartedTask<usize>> {
        self.ensure_writable(drive_id).await?;
        self.files.clear_drive_content(drive_id).await
    }

    pub async fn active_downloads(&self) -> Vec<ActiveDownload> {
        self.downloads.list().await
    }

    pub async fn is_download_in_flight(&self, drive_id: &DriveId, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        Ok(self.downloads.is_in_flight(drive_id, &path).await)
    }

    pub async fn cancel_download(&self, id: &str) -> bool {
        self.downloads.cancel(id).await
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub async fn download_history(&self) -> Vec<DownloadRecord> {
        self.history.list().await
    }

    pub async fn remove_history_entry(&self, id: &str) -> Result<bool> {
        self.history.remove(id).await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.history.clear().await
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::Validation("drive name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation("drive name is too long".into()));
    }
    // the name doubles as the directory of a whole-drive download
    if name == "." || name == ".." || name.contains(&['/', '\\', '\0'][..]) {
        return Err(CoreError::Validation(format!("drive name is not a plain name: {name:?}")));
    }
    Ok(name.to_string())
}

fn validate_file_name(name: &str) -> Result<String> {
    let name = normalize_relative(name)?;
    if name.contains('/') {
        return Err(CoreError::Validation(format!("file name contains a slash: {name}")));
    }
    if name == FOLDER_MARKER {
        return Err(CoreError::Validation(format!("reserved file name: {name}")));
    }
    Ok(name)
}
