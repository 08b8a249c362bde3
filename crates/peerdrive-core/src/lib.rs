//! # peerdrive-core
//!
//! Drive lifecycle and replication management.
//!
//! [`PeerDrive`] is the single service instance an application holds. It owns
//! the drive registry, the table of active drives, their replication and
//! change watchers, file operations, download tracking and history, and
//! publishes [`DriveEvent`]s for observers.

pub mod app;
pub mod config;
pub mod downloads;
pub mod error;
pub mod events;
pub mod files;
pub mod folder;
pub mod history;
pub mod manager;
pub mod registry;
pub mod replication;
pub mod watcher;

pub use app::PeerDrive;
pub use config::CoreConfig;
pub use downloads::{ActiveDownload, DownloadKind, DownloadProgress, DownloadStatus, DownloadTracker};
pub use error::{log_soft_failures, CoreError, Result, SoftFailure};
pub use events::{DriveEvent, EventBus};
pub use files::{FileMutationService, FolderUploadFile, StartedTask, SyncStatus, UploadFile, UploadResult};
pub use folder::FolderMarker;
pub use history::{DownloadHistoryStore, DownloadOutcome, DownloadRecord};
pub use manager::{ActiveDrive, BootReport, DriveLifecycleManager};
pub use registry::{DriveRecord, DriveRegistry};
pub use replication::ReplicationCoordinator;
pub use watcher::ChangeWatchBroadcaster;
