use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use peerdrive_shared::DriveId;

pub const EVENT_DRIVE_CHANGED: &str = "drive-changed";
pub const EVENT_DOWNLOAD_PROGRESS: &str = "download-progress";
pub const EVENT_CLEAR_PROGRESS: &str = "clear-content-progress";
pub const EVENT_DRIVES_INITIALIZED: &str = "drives-initialized";

const EVENT_BUS_CAPACITY: usize = 1024;

/// Notifications for the presentation layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum DriveEvent {
    DriveChanged {
        drive_id: DriveId,
    },
    DownloadProgress {
        download_id: String,
        current_file: String,
        downloaded_count: usize,
        total_count: usize,
    },
    #[serde(rename = "clear-content-progress")]
    ClearProgress {
        drive_id: DriveId,
        current_item: String,
        deleted_count: usize,
        total_count: usize,
    },
    DrivesInitialized {
        count: usize,
    },
}

impl DriveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DriveEvent::DriveChanged { .. } => EVENT_DRIVE_CHANGED,
            DriveEvent::DownloadProgress { .. } => EVENT_DOWNLOAD_PROGRESS,
            DriveEvent::ClearProgress { .. } => EVENT_CLEAR_PROGRESS,
            DriveEvent::DrivesInitialized { .. } => EVENT_DRIVES_INITIALIZED,
        }
    }
}

/// Fan-out of [`DriveEvent`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DriveEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriveEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DriveEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "No event subscribers");
        }
    }

    pub fn drive_changed(&self, drive_id: &DriveId) {
        self.emit(DriveEvent::DriveChanged {
            drive_id: drive_id.clone(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = DriveEvent::DownloadProgress {
            download_id: "d1".into(),
            current_file: "a.txt".into(),
            downloaded_count: 1,
            total_count: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], EVENT_DOWNLOAD_PROGRESS);
        assert_eq!(json["payload"]["downloadId"], "d1");
        assert_eq!(json["payload"]["totalCount"], 3);

        let clear = DriveEvent::ClearProgress {
            drive_id: DriveId::from("x"),
            current_item: "/a".into(),
            deleted_count: 1,
            total_count: 1,
        };
        assert_eq!(serde_json::to_value(&clear).unwrap()["event"], clear.name());
    }

    #[tokio::test]
    async fn test_bus_fans_out() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.drive_changed(&DriveId::from("d"));

        let expected = DriveEvent::DriveChanged {
            drive_id: DriveId::from("d"),
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }
}
