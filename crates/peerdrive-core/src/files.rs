//! File-level operations against active drives.
//!
//! Every operation first resolves the drive in the active table and fails
//! with [`CoreError::DriveNotFound`] if it is not there. Writability is the
//! caller's concern; see [`crate::PeerDrive`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use peerdrive_shared::protocol::BlobRef;
use peerdrive_shared::DriveId;
use peerdrive_store::{DriveStore, Entry, StorageInfo};

use crate::downloads::{DownloadKind, DownloadProgress, DownloadRequest, DownloadTracker};
use crate::error::{CoreError, Result};
use crate::events::{DriveEvent, EventBus};
use crate::folder::{self, folder_stats, list_folder, FolderMarker, FolderStats, ListEntry};
use crate::history::{DownloadHistoryStore, DownloadOutcome, DownloadRecord};
use crate::manager::{ActiveDrive, DriveLifecycleManager};

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A file inside an uploaded folder, addressed relative to the target folder.
#[derive(Debug, Clone)]
pub struct FolderUploadFile {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub uploaded_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub version: u64,
    pub peer_count: usize,
    pub total_files: usize,
    /// Files whose bytes are held locally.
    pub available_files: usize,
    pub synced: bool,
    /// False when this node runs without a swarm.
    pub online: bool,
}

/// A tracked background job and its handle.
pub struct StartedTask<T> {
    pub id: String,
    pub task: JoinHandle<Result<T>>,
}

impl<T> StartedTask<T> {
    /// Wait for the job, mapping a panicked task to [`CoreError::Task`].
    pub async fn wait(self) -> Result<T> {
        self.task
            .await
            .map_err(|e| CoreError::Task(e.to_string()))?
    }
}

#[derive(Clone)]
pub struct FileMutationService {
    manager: Arc<DriveLifecycleManager>,
    events: EventBus,
    downloads: DownloadTracker,
    history: Arc<DownloadHistoryStore>,
    read_timeout: Option<Duration>,
}

impl FileMutationService {
    pub fn new(
        manager: Arc<DriveLifecycleManager>,
        events: EventBus,
        downloads: DownloadTracker,
        history: Arc<DownloadHistoryStore>,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            manager,
            events,
            downloads,
            history,
            read_timeout,
        }
    }

    pub fn downloads(&self) -> &DownloadTracker {
        &self.downloads
    }

    async fn drive(&self, drive_id: &DriveId) -> Result<Arc<ActiveDrive>> {
        self.manager
            .get_active(drive_id)
            .await
            .ok_or_else(|| CoreError::DriveNotFound(drive_id.clone()))
    }

    // ------------------------------------------------------------------
    // Tree
    // ------------------------------------------------------------------

    pub async fn list_folder(&self, drive_id: &DriveId, folder: &str, recursive: bool) -> Result<Vec<ListEntry>> {
        let drive = self.drive(drive_id).await?;
        let entries = drive.store.entries()?;
        Ok(list_folder(&entries, folder, recursive))
    }

    /// Make `path` visible as a folder even while it is empty.
    pub async fn create_folder(&self, drive_id: &DriveId, path: &str) -> Result<()> {
        let drive = self.drive(drive_id).await?;
        drive.store.put(&FolderMarker::marker_path(path), &[]).await?;
        debug!(drive = %drive_id, path, "Created folder");
        self.events.drive_changed(drive_id);
        Ok(())
    }

    /// Write each file under `folder`, in order. The first failure aborts the
    /// rest; files already written stay.
    pub async fn upload_files(&self, drive_id: &DriveId, folder: &str, files: Vec<UploadFile>) -> Result<UploadResult> {
        let drive = self.drive(drive_id).await?;

        let mut uploaded_count = 0;
        for file in &files {
            let path = folder::join(folder, &file.name);
            drive.store.put(&path, &file.bytes).await?;
            uploaded_count += 1;
        }

        drive.store.expect_updates();
        self.events.drive_changed(drive_id);
        info!(drive = %drive_id, folder, uploaded_count, "Uploaded files");
        Ok(UploadResult { uploaded_count })
    }

    /// Like [`Self::upload_files`], but paths may be nested. Intermediate
    /// folders get markers so they stay visible.
    pub async fn upload_folder(
        &self,
        drive_id: &DriveId,
        folder: &str,
        files: Vec<FolderUploadFile>,
    ) -> Result<UploadResult> {
        let drive = self.drive(drive_id).await?;

        let mut uploaded_count = 0;
        for file in &files {
            let path = folder::join(folder, &file.relative_path);
            for dir in folder::folders_between(folder, &path) {
                let marker = FolderMarker::marker_path(&dir);
                if drive.store.entry(&marker)?.is_none() {
                    drive.store.put(&marker, &[]).await?;
                }
            }
            drive.store.put(&path, &file.bytes).await?;
            uploaded_count += 1;
        }

        drive.store.expect_updates();
        self.events.drive_changed(drive_id);
        info!(drive = %drive_id, folder, uploaded_count, "Uploaded folder");
        Ok(UploadResult { uploaded_count })
    }

    /// File contents, or `None` for folder markers, missing paths and bytes
    /// not held locally.
    pub async fn get_file_bytes(&self, drive_id: &DriveId, path: &str) -> Result<Option<Vec<u8>>> {
        if FolderMarker::is_marker(path) {
            return Ok(None);
        }
        let drive = self.drive(drive_id).await?;
        read_entry_bytes(&drive.store, path, self.read_timeout).await
    }

    /// Remove `path` and reclaim its blob. Succeeds when the path is already
    /// gone.
    pub async fn delete_file(&self, drive_id: &DriveId, path: &str) -> Result<bool> {
        let drive = self.drive(drive_id).await?;
        let Some(entry) = drive.store.entry(path)? else {
            debug!(drive = %drive_id, path, "Nothing to delete");
            return Ok(true);
        };

        let freed = delete_entry(&drive.store, &entry).await?;
        debug!(drive = %drive_id, path, freed, "Deleted file");
        self.events.drive_changed(drive_id);
        Ok(true)
    }

    pub async fn storage_info(&self, drive_id: &DriveId) -> Result<StorageInfo> {
        let drive = self.drive(drive_id).await?;
        Ok(drive.store.storage_info()?)
    }

    pub async fn folder_stats(&self, drive_id: &DriveId, folder: &str) -> Result<FolderStats> {
        let drive = self.drive(drive_id).await?;
        let entries = drive.store.entries()?;
        Ok(folder_stats(&entries, folder))
    }

    pub async fn sync_status(&self, drive_id: &DriveId) -> Result<SyncStatus> {
        let drive = self.drive(drive_id).await?;
        let store = &drive.store;

        let mut total_files = 0;
        let mut available_files = 0;
        for entry in store.entries()? {
            if FolderMarker::is_marker(&entry.path) {
                continue;
            }
            total_files += 1;
            let held = match &entry.blob {
                Some(blob) => store.has_blob(blob)?,
                None => true,
            };
            if held {
                available_files += 1;
            }
        }

        let coordinator = self.manager.coordinator();
        Ok(SyncStatus {
            version: store.version()?,
            peer_count: coordinator.peer_count(drive_id).await,
            total_files,
            available_files,
            synced: available_files == total_files,
            online: coordinator.is_online(),
        })
    }

    // ------------------------------------------------------------------
    // Tracked jobs
    // ------------------------------------------------------------------

    /// Copy one file out of the drive into `destination_dir`.
    pub async fn download_file(
        &self,
        drive_id: &DriveId,
        path: &str,
        destination_dir: PathBuf,
    ) -> Result<StartedTask<DownloadRecord>> {
        let drive = self.drive(drive_id).await?;
        let file_name = folder::file_name(path).to_string();
        let id = Uuid::new_v4().to_string();
        let target = destination_dir.join(&file_name);

        let request = DownloadRequest {
            id: id.clone(),
            drive_id: drive_id.clone(),
            path: path.to_string(),
            file_name: file_name.clone(),
            kind: DownloadKind::File,
        };

        let service = self.clone();
        let path = path.to_string();
        let job_id = id.clone();
        let task = self
            .downloads
            .start(request, async move {
                let result = service
                    .copy_files(&job_id, &drive.store, &[path.clone()], |_| Ok(target.clone()))
                    .await;
                service
                    .record_download(job_id, drive.id(), &path, file_name, target, result)
                    .await
            })
            .await?;

        Ok(StartedTask { id, task })
    }

    /// Copy every file under `folder` into `destination_dir/<folder name>`,
    /// keeping the folder structure.
    pub async fn download_folder(
        &self,
        drive_id: &DriveId,
        folder: &str,
        destination_dir: PathBuf,
    ) -> Result<StartedTask<DownloadRecord>> {
        let drive = self.drive(drive_id).await?;
        // drive names are free text; only a single plain component may name a directory
        let folder_name = match folder::file_name(folder) {
            "" => safe_component(&drive.record.name)
                .unwrap_or(drive.id().as_str())
                .to_string(),
            name => name.to_string(),
        };
        let id = Uuid::new_v4().to_string();
        let target = destination_dir.join(&folder_name);

        let prefix = if folder == "/" {
            "/".to_string()
        } else {
            format!("{folder}/")
        };
        let paths: Vec<String> = drive
            .store
            .entries()?
            .into_iter()
            .map(|e| e.path)
            .filter(|p| p.starts_with(&prefix) && !FolderMarker::is_marker(p))
            .collect();

        let request = DownloadRequest {
            id: id.clone(),
            drive_id: drive_id.clone(),
            path: folder.to_string(),
            file_name: folder_name.clone(),
            kind: DownloadKind::Folder,
        };

        let service = self.clone();
        let folder = folder.to_string();
        let job_id = id.clone();
        let root = target.clone();
        let task = self
            .downloads
            .start(request, async move {
                let result = service
                    .copy_files(&job_id, &drive.store, &paths, |path| {
                        local_path(&root, &path[prefix.len()..])
                    })
                    .await;
                service
                    .record_download(job_id, drive.id(), &folder, folder_name, target, result)
                    .await
            })
            .await?;

        Ok(StartedTask { id, task })
    }

    /// Delete every entry of the drive, reclaiming blobs as it goes. Runs in
    /// the background and cannot overlap itself for the same drive.
    pub async fn clear_drive_content(&self, drive_id: &DriveId) -> Result<StartedTask<usize>> {
        let drive = self.drive(drive_id).await?;
        let id = Uuid::new_v4().to_string();

        let request = DownloadRequest {
            id: id.clone(),
            drive_id: drive_id.clone(),
            path: "/".to_string(),
            file_name: drive.record.name.clone(),
            kind: DownloadKind::Clear,
        };

        let events = self.events.clone();
        let task = self
            .downloads
            .start(request, async move {
                let entries = drive.store.entries()?;
                let total_count = entries.len();

                let mut deleted_count = 0;
                for entry in &entries {
                    delete_entry(&drive.store, entry).await?;
                    deleted_count += 1;
                    events.emit(DriveEvent::ClearProgress {
                        drive_id: drive.id().clone(),
                        current_item: entry.path.clone(),
                        deleted_count,
                        total_count,
                    });
                }
                drive.store.reclaim_orphans().await?;

                events.drive_changed(drive.id());
                info!(drive = %drive.id(), deleted_count, "Cleared drive content");
                Ok::<_, CoreError>(deleted_count)
            })
            .await?;

        Ok(StartedTask { id, task })
    }

    async fn copy_files<F>(&self, job_id: &str, store: &DriveStore, paths: &[String], target_of: F) -> Result<usize>
    where
        F: Fn(&str) -> Result<PathBuf>,
    {
        let total_count = paths.len();
        for (done, path) in paths.iter().enumerate() {
            self.downloads
                .update_progress(
                    job_id,
                    DownloadProgress {
                        current_file: path.clone(),
                        downloaded_count: done,
                        total_count,
                    },
                )
                .await;

            let bytes = read_entry_bytes(store, path, self.read_timeout)
                .await?
                .ok_or_else(|| CoreError::ContentUnavailable(path.clone()))?;

            let target = target_of(path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &bytes).await?;
        }

        self.downloads
            .update_progress(
                job_id,
                DownloadProgress {
                    current_file: String::new(),
                    downloaded_count: total_count,
                    total_count,
                },
            )
            .await;
        Ok(total_count)
    }

    async fn record_download(
        &self,
        id: String,
        drive_id: &DriveId,
        path: &str,
        file_name: String,
        target: PathBuf,
        result: Result<usize>,
    ) -> Result<DownloadRecord> {
        let (status, file_count) = match &result {
            Ok(count) => (DownloadOutcome::Completed, *count),
            Err(_) => (DownloadOutcome::Failed, 0),
        };
        let record = DownloadRecord {
            id,
            drive_id: drive_id.clone(),
            path: path.to_string(),
            file_name,
            download_target_path: target,
            file_count,
            downloaded_at: Utc::now(),
            status,
        };

        if let Err(e) = self.history.add(record.clone()).await {
            warn!(id = %record.id, error = %e, "Failed to record download history");
        }
        result.map(|_| record)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Random-access read first, then a streamed read for stores that list an
/// entry before serving its bytes directly. Bytes that do not hash to the
/// entry's blob are treated as not held locally.
async fn read_entry_bytes(store: &DriveStore, path: &str, read_timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
    let Some(entry) = store.entry(path)? else {
        return Ok(None);
    };
    let Some(blob) = entry.blob else {
        return Ok(Some(Vec::new()));
    };
    if let Some(bytes) = store.read_blob(&blob).await? {
        return Ok(verified(path, &blob, bytes));
    }

    debug!(path, "Direct read missed, streaming");
    let Some(stream) = store.read_stream(path).await? else {
        return Ok(None);
    };
    let collect = stream.try_fold(Vec::with_capacity(blob.size as usize), |mut acc, chunk: Bytes| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    });

    let bytes = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, collect)
            .await
            .map_err(|_| CoreError::Timeout(format!("streamed read of {path}")))??,
        None => collect.await?,
    };
    Ok(verified(path, &blob, bytes))
}

fn verified(path: &str, blob: &BlobRef, bytes: Vec<u8>) -> Option<Vec<u8>> {
    if bytes.len() as u64 == blob.size && BlobRef::for_bytes(&bytes) == *blob {
        Some(bytes)
    } else {
        warn!(path, expected = blob.size, got = bytes.len(), "Local bytes do not match entry");
        None
    }
}

/// Delete the tree entry, then reclaim its bytes. The blob reference is taken
/// from `entry`, captured before the delete made it unreachable.
async fn delete_entry(store: &DriveStore, entry: &Entry) -> Result<u64> {
    let blob: Option<BlobRef> = entry.blob;
    store.del(&entry.path).await?;
    let freed = match blob {
        Some(blob) => store.clear_blob(&blob).await?,
        None => store.clear(&entry.path).await?,
    };
    Ok(freed)
}

/// Map a drive-relative path (`a/b.txt`) under a local directory. Fails
/// rather than produce a path outside `root`.
fn local_path(root: &Path, relative: &str) -> Result<PathBuf> {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .try_fold(root.to_path_buf(), |acc, part| {
            safe_component(part)
                .map(|part| acc.join(part))
                .ok_or_else(|| CoreError::Validation(format!("unsafe local path: {relative:?}")))
        })
}

fn safe_component(name: &str) -> Option<&str> {
    let unsafe_char = |c: char| c == '/' || c == '\\' || c == '\0';
    match name {
        "" | "." | ".." => None,
        name if name.contains(unsafe_char) => None,
        name => Some(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloads::RetentionPolicy;
    use crate::registry::DriveRegistry;
    use crate::replication::ReplicationCoordinator;
    use peerdrive_store::blobs::BlobFiles;
    use peerdrive_store::database::DB_FILE;
    use peerdrive_store::Database;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> (FileMutationService, DriveId) {
        let events = EventBus::new();
        let manager = Arc::new(DriveLifecycleManager::new(
            dir.path().join("drives"),
            Arc::new(DriveRegistry::new(dir.path().join("drives.json"))),
            ReplicationCoordinator::offline(),
            events.clone(),
        ));
        let drive = manager.create_drive("Test").await.unwrap();
        let service = FileMutationService::new(
            manager,
            events.clone(),
            DownloadTracker::new(events, RetentionPolicy::default()),
            Arc::new(DownloadHistoryStore::new(dir.path().join("history.json"), 15)),
            Some(Duration::from_secs(5)),
        );
        (service, drive.id().clone())
    }

    fn file(name: &str, bytes: &[u8]) -> UploadFile {
        UploadFile {
            name: name.into(),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_unknown_drive() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let missing = DriveId::from("missing");
        assert!(matches!(
            service.list_folder(&missing, "/", false).await,
            Err(CoreError::DriveNotFound(_))
        ));
        assert!(matches!(
            service.delete_file(&missing, "/a").await,
            Err(CoreError::DriveNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_then_read_back() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;

        let result = service
            .upload_files(&id, "/docs", vec![file("a.txt", b"alpha"), file("b.txt", b"")])
            .await
            .unwrap();
        assert_eq!(result.uploaded_count, 2);
        assert_eq!(
            service.get_file_bytes(&id, "/docs/a.txt").await.unwrap().unwrap(),
            b"alpha"
        );
        assert_eq!(
            service.get_file_bytes(&id, "/docs/b.txt").await.unwrap().unwrap(),
            Vec::<u8>::new()
        );
        assert!(service.get_file_bytes(&id, "/docs/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_markers_are_hidden() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;

        service.create_folder(&id, "/empty").await.unwrap();
        let listing = service.list_folder(&id, "/", false).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].key, "/empty");
        assert!(listing[0].is_folder());
        assert!(service.get_file_bytes(&id, "/empty/.keep").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_folder_creates_intermediate_markers() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;

        service
            .upload_folder(
                &id,
                "/",
                vec![FolderUploadFile {
                    relative_path: "photos/2024/a.jpg".into(),
                    bytes: b"jpg".to_vec(),
                }],
            )
            .await
            .unwrap();

        let stats = service.folder_stats(&id, "/").await.unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.folder_count, 2);
        assert_eq!(stats.total_bytes, 3);

        let drive = service.drive(&id).await.unwrap();
        assert!(drive.store.entry("/photos/.keep").unwrap().is_some());
        assert!(drive.store.entry("/photos/2024/.keep").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_reclaims() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        service
            .upload_files(&id, "/", vec![file("x.bin", &[7u8; 100])])
            .await
            .unwrap();

        let before = service.storage_info(&id).await.unwrap().blob_bytes;
        assert!(service.delete_file(&id, "/x.bin").await.unwrap());
        assert!(service.delete_file(&id, "/x.bin").await.unwrap());
        let after = service.storage_info(&id).await.unwrap().blob_bytes;

        assert!(after <= before);
        assert_eq!(after, 0);
        assert!(service.list_folder(&id, "/", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_blob_shared_with_other_path() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        service
            .upload_files(&id, "/", vec![file("one", b"same"), file("two", b"same")])
            .await
            .unwrap();

        service.delete_file(&id, "/one").await.unwrap();
        assert_eq!(service.get_file_bytes(&id, "/two").await.unwrap().unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_download_folder_writes_tree_and_history() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        service
            .upload_files(&id, "/music", vec![file("a.mp3", b"aaa")])
            .await
            .unwrap();
        service
            .upload_files(&id, "/music/live", vec![file("b.mp3", b"bb")])
            .await
            .unwrap();

        let started = service
            .download_folder(&id, "/music", out.path().to_path_buf())
            .await
            .unwrap();
        let record = started.wait().await.unwrap();

        assert_eq!(record.file_count, 2);
        assert_eq!(record.status, DownloadOutcome::Completed);
        assert_eq!(std::fs::read(out.path().join("music/a.mp3")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(out.path().join("music/live/b.mp3")).unwrap(), b"bb");
        assert_eq!(service.history.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_is_recorded() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;

        let started = service
            .download_file(&id, "/ghost.txt", out.path().to_path_buf())
            .await
            .unwrap();
        assert!(matches!(
            started.wait().await,
            Err(CoreError::ContentUnavailable(_))
        ));

        let history = service.history.list().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DownloadOutcome::Failed);
    }

    #[tokio::test]
    async fn test_clear_drive_content() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        let mut events = service.events.subscribe();
        service
            .upload_files(&id, "/", vec![file("a", b"1"), file("b", b"22")])
            .await
            .unwrap();
        service.create_folder(&id, "/f").await.unwrap();

        let deleted = service.clear_drive_content(&id).await.unwrap().wait().await.unwrap();
        assert_eq!(deleted, 3);
        assert!(service.list_folder(&id, "/", true).await.unwrap().is_empty());
        assert_eq!(service.storage_info(&id).await.unwrap().blob_bytes, 0);

        let mut progress = 0;
        while let Ok(event) = events.try_recv() {
            if let DriveEvent::ClearProgress { total_count, .. } = event {
                assert_eq!(total_count, 3);
                progress += 1;
            }
        }
        assert_eq!(progress, 3);
    }

    #[tokio::test]
    async fn test_sync_status_counts_files() {
        let dir = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        service
            .upload_files(&id, "/", vec![file("a", b"1")])
            .await
            .unwrap();
        service.create_folder(&id, "/f").await.unwrap();

        let status = service.sync_status(&id).await.unwrap();
        assert_eq!(status.total_files, 1);
        assert_eq!(status.available_files, 1);
        assert!(status.synced);
        assert_eq!(status.version, 2);
        assert_eq!(status.peer_count, 0);
        assert!(!status.online);
    }

    #[tokio::test]
    async fn test_stream_fallback_serves_unindexed_blob() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        let bytes = vec![42u8; 1000];
        service
            .upload_files(&id, "/", vec![file("big.bin", &bytes)])
            .await
            .unwrap();

        // drop the blob row but keep the file, so only the stream can serve it
        let drive = service.drive(&id).await.unwrap();
        let blob = drive.store.entry("/big.bin").unwrap().unwrap().blob.unwrap();
        let db = Database::open_at(&drive.store.dir().join(DB_FILE)).unwrap();
        assert!(db.delete_blob(&blob).unwrap());
        assert!(drive.store.read_blob(&blob).await.unwrap().is_none());

        assert_eq!(service.get_file_bytes(&id, "/big.bin").await.unwrap().unwrap(), bytes);

        let record = service
            .download_file(&id, "/big.bin", out.path().to_path_buf())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(record.status, DownloadOutcome::Completed);
        assert_eq!(std::fs::read(out.path().join("big.bin")).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_truncated_blob_is_not_served() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let (service, id) = service(&dir).await;
        let bytes = vec![7u8; 1000];
        service
            .upload_files(&id, "/", vec![file("big.bin", &bytes)])
            .await
            .unwrap();

        let drive = service.drive(&id).await.unwrap();
        let blob = drive.store.entry("/big.bin").unwrap().unwrap().blob.unwrap();
        let blob_file = BlobFiles::new(drive.store.dir()).blob_path(&blob);
        std::fs::write(&blob_file, &bytes[..10]).unwrap();

        assert!(service.get_file_bytes(&id, "/big.bin").await.unwrap().is_none());

        let started = service
            .download_file(&id, "/big.bin", out.path().to_path_buf())
            .await
            .unwrap();
        assert!(matches!(
            started.wait().await,
            Err(CoreError::ContentUnavailable(_))
        ));
        assert!(!out.path().join("big.bin").exists());
    }

    #[tokio::test]
    async fn test_root_download_does_not_trust_drive_name() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let drive = service.manager.create_drive("../escaped").await.unwrap();
        let id = drive.id().clone();
        service
            .upload_files(&id, "/", vec![file("a.txt", b"inside")])
            .await
            .unwrap();

        let dest = out.path().join("dest");
        let record = service
            .download_folder(&id, "/", dest.clone())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.download_target_path, dest.join(id.as_str()));
        assert_eq!(std::fs::read(dest.join(id.as_str()).join("a.txt")).unwrap(), b"inside");
        assert!(!out.path().join("escaped").exists());
    }

    #[test]
    fn test_local_path() {
        let root = Path::new("/tmp/out");
        assert_eq!(local_path(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
        assert_eq!(local_path(root, "a//b.txt").unwrap(), root.join("a").join("b.txt"));

        for bad in ["../escaped.txt", "a/../../b", "./a", "a\\..\\b"] {
            assert!(matches!(
                local_path(root, bad),
                Err(CoreError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_safe_component() {
        assert_eq!(safe_component("Holiday photos"), Some("Holiday photos"));
        assert_eq!(safe_component("..."), Some("..."));
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "a\0b"] {
            assert_eq!(safe_component(bad), None);
        }
    }
}
