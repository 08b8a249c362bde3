//! Core configuration loaded from environment variables.
//!
//! Every setting has a default, so an embedding application can start with
//! zero configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use peerdrive_shared::constants::{
    DEFAULT_QUIC_PORT, DRIVES_DIR, HISTORY_FILE, HISTORY_RETENTION_DAYS, REGISTRY_FILE,
};
use peerdrive_shared::DriveId;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Application-owned directory holding the registry, history and drives.
    /// Env: `PEERDRIVE_DATA_DIR`
    pub data_dir: PathBuf,

    /// Whether to start the peer network at all.
    /// Env: `PEERDRIVE_NETWORK` (true/false)
    pub network_enabled: bool,

    /// QUIC listen port.
    /// Env: `PEERDRIVE_PORT`
    pub listen_port: u16,

    /// File with one bootstrap multiaddr per line.
    /// Env: `PEERDRIVE_BOOTSTRAP_PEERS`
    pub bootstrap_peers_path: Option<PathBuf>,

    /// Upper bound on waiting for a drive's initial peer flush; `None` waits
    /// for the swarm's answer.
    /// Env: `PEERDRIVE_DISCOVERY_TIMEOUT_SECS` (0 disables)
    pub discovery_timeout: Option<Duration>,

    /// Upper bound on a streamed file read; `None` waits forever.
    /// Env: `PEERDRIVE_READ_TIMEOUT_SECS` (0 disables)
    pub read_timeout: Option<Duration>,

    /// How long finished downloads stay visible.
    pub completed_retention: Duration,
    pub failed_retention: Duration,

    /// Tracked entries older than this are swept regardless of status.
    pub stale_download_age: Duration,
    pub sweep_interval: Duration,

    pub history_retention_days: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            network_enabled: true,
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_peers_path: None,
            discovery_timeout: Some(Duration::from_secs(30)),
            read_timeout: Some(Duration::from_secs(120)),
            completed_retention: Duration::from_secs(5),
            failed_retention: Duration::from_secs(10),
            stale_download_age: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            history_retention_days: HISTORY_RETENTION_DAYS,
        }
    }
}

impl CoreConfig {
    /// Defaults rooted at `data_dir`, network off. Used by tests and embedders.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            network_enabled: false,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("PEERDRIVE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(val) = std::env::var("PEERDRIVE_NETWORK") {
            config.network_enabled = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("PEERDRIVE_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid PEERDRIVE_PORT, using default"),
            }
        }

        if let Ok(path) = std::env::var("PEERDRIVE_BOOTSTRAP_PEERS") {
            if !path.is_empty() {
                config.bootstrap_peers_path = Some(PathBuf::from(path));
            }
        }

        if let Some(secs) = env_secs("PEERDRIVE_DISCOVERY_TIMEOUT_SECS") {
            config.discovery_timeout = bound(secs);
        }

        if let Some(secs) = env_secs("PEERDRIVE_READ_TIMEOUT_SECS") {
            config.read_timeout = bound(secs);
        }

        config
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_FILE)
    }

    pub fn drives_dir(&self) -> PathBuf {
        self.data_dir.join(DRIVES_DIR)
    }

    /// Per-drive storage directory, named by the drive id.
    pub fn drive_dir(&self, id: &DriveId) -> PathBuf {
        drive_dir_in(&self.drives_dir(), id)
    }
}

pub(crate) fn drive_dir_in(drives_dir: &Path, id: &DriveId) -> PathBuf {
    drives_dir.join(id.as_str())
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", "PeerDrive", "peerdrive")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./peerdrive-data"))
}

/// Zero seconds means no bound.
fn bound(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_secs(name: &str) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    match val.parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(var = name, value = %val, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.completed_retention, Duration::from_secs(5));
        assert_eq!(config.failed_retention, Duration::from_secs(10));
        assert_eq!(config.stale_download_age, Duration::from_secs(1800));
        assert_eq!(config.history_retention_days, 15);
        assert_eq!(config.discovery_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_zero_disables_a_timeout() {
        assert_eq!(bound(0), None);
        assert_eq!(bound(45), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_layout_under_data_dir() {
        let config = CoreConfig::with_data_dir("/tmp/pd");
        assert!(!config.network_enabled);
        assert_eq!(config.registry_path(), PathBuf::from("/tmp/pd/drives.json"));
        assert_eq!(config.history_path(), PathBuf::from("/tmp/pd/download-history.json"));
        assert_eq!(
            config.drive_dir(&DriveId::from("abc")),
            PathBuf::from("/tmp/pd/drives/abc")
        );
    }
}
