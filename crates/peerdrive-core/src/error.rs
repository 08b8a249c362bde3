use thiserror::Error;
use tracing::warn;

use peerdrive_shared::DriveId;
use peerdrive_store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The id is not in the active-drive table.
    #[error("Drive not found: {0}")]
    DriveNotFound(DriveId),

    #[error("Drive registry corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("Replication failure: {0}")]
    Replication(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Malformed key, path or name from the caller.
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Drive {0} is read-only")]
    ReadOnly(DriveId),

    #[error("Already in progress for {drive_id} at {path}")]
    AlreadyInFlight { drive_id: DriveId, path: String },

    /// The entry exists but its bytes are not held locally.
    #[error("Content not available yet: {0}")]
    ContentUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Drive manager is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// A per-item failure inside a bulk operation that was logged and skipped.
#[derive(Debug)]
pub struct SoftFailure {
    pub drive_id: DriveId,
    /// Which step failed, e.g. `"open"` or `"close"`.
    pub stage: &'static str,
    pub error: String,
}

impl SoftFailure {
    pub fn new(drive_id: &DriveId, stage: &'static str, error: impl ToString) -> Self {
        Self {
            drive_id: drive_id.clone(),
            stage,
            error: error.to_string(),
        }
    }
}

pub fn log_soft_failures(operation: &str, failures: &[SoftFailure]) {
    if failures.is_empty() {
        return;
    }
    warn!(operation, count = failures.len(), "Bulk operation finished with failures");
    for failure in failures {
        warn!(
            operation,
            drive = %failure.drive_id,
            stage = failure.stage,
            error = %failure.error,
            "Skipped drive"
        );
    }
}
