//! Drive replication over the shared swarm.
//!
//! Each active drive gets a GossipSub topic derived from its public key.
//! Traffic on the topic is sealed with a key derived from the same public
//! key. The coordinator:
//!
//! - announces its log version whenever a peer joins the topic,
//! - asks for missing ops when a peer announces a newer version or an op
//!   arrives out of sequence,
//! - answers sync requests from its own log (any holder can serve),
//! - publishes local writes of drives it owns as they happen.
//!
//! Network trouble never reaches callers: errors are logged and the drive
//! keeps working locally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerdrive_net::{SwarmCommand, SwarmNotification};
use peerdrive_shared::constants::INLINE_BLOB_LIMIT;
use peerdrive_shared::crypto::{derive_replication_key, SymmetricKey};
use peerdrive_shared::protocol::ReplicationMessage;
use peerdrive_shared::{DriveId, DrivePublicKey};
use peerdrive_store::{Applied, DriveStore, StoreChange, StoreError};

use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct ReplicationCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    /// `None` when running without a network.
    cmd_tx: Option<mpsc::Sender<SwarmCommand>>,
    /// `None` waits for the swarm's answer.
    discovery_timeout: Option<Duration>,
    /// Keyed by topic.
    drives: Mutex<HashMap<String, ReplicatedDrive>>,
}

struct ReplicatedDrive {
    drive_id: DriveId,
    store: Arc<DriveStore>,
    key: SymmetricKey,
    peers: HashSet<PeerId>,
    task: JoinHandle<()>,
}

impl ReplicationCoordinator {
    pub fn new(cmd_tx: mpsc::Sender<SwarmCommand>, discovery_timeout: Option<Duration>) -> Self {
        Self::build(Some(cmd_tx), discovery_timeout)
    }

    /// A coordinator with no network: drives stay purely local.
    pub fn offline() -> Self {
        Self::build(None, None)
    }

    fn build(cmd_tx: Option<mpsc::Sender<SwarmCommand>>, discovery_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cmd_tx,
                discovery_timeout,
                drives: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.cmd_tx.is_some()
    }

    /// Drain swarm notifications until the swarm goes away.
    pub fn spawn_notification_loop(
        &self,
        mut notif_rx: mpsc::Receiver<SwarmNotification>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            info!("Replication notification loop started");
            while let Some(notification) = notif_rx.recv().await {
                coordinator.handle_notification(notification).await;
            }
            info!("Replication notification loop stopped");
        })
    }

    // ------------------------------------------------------------------
    // Per-drive wiring
    // ------------------------------------------------------------------

    /// Start replicating `store`. Calling it again for the same drive key is
    /// a no-op.
    pub async fn setup_replication(&self, drive_id: &DriveId, store: Arc<DriveStore>) -> Result<()> {
        let topic = store.public_key().to_topic();
        let mut drives = self.inner.drives.lock().await;
        if drives.contains_key(&topic) {
            debug!(drive = %drive_id, "Replication already set up");
            return Ok(());
        }

        let changes = store.watch()?;
        let key = derive_replication_key(&store.public_key());
        let published = store.version()?;

        let task = tokio::spawn(self.clone().forward_local_changes(
            topic.clone(),
            key,
            store.clone(),
            changes,
            published,
        ));

        drives.insert(
            topic.clone(),
            ReplicatedDrive {
                drive_id: drive_id.clone(),
                store,
                key,
                peers: HashSet::new(),
                task,
            },
        );
        debug!(drive = %drive_id, topic = %topic, "Replication set up");
        Ok(())
    }

    /// Announce the drive on the discovery network (as provider and seeker)
    /// and wait for the initial peer flush, bounded by the discovery timeout.
    ///
    /// Never fails: with no network, a dead swarm or a timeout the drive is
    /// simply usable offline. Returns the number of peers found.
    pub async fn join_discovery(&self, public_key: &DrivePublicKey) -> usize {
        let Some(cmd_tx) = &self.inner.cmd_tx else {
            debug!(key = %public_key.short(), "Network disabled, skipping discovery");
            return 0;
        };

        let topic = public_key.to_topic();
        let (reply, flushed) = oneshot::channel();
        let command = SwarmCommand::JoinDiscovery {
            topic: topic.clone(),
            key: public_key.discovery_key().to_vec(),
            reply,
        };
        if let Err(e) = cmd_tx.send(command).await {
            let err = CoreError::Replication(e.to_string());
            warn!(topic = %topic, error = %err, "Could not join discovery");
            return 0;
        }

        let outcome = match self.inner.discovery_timeout {
            Some(limit) => tokio::time::timeout(limit, flushed).await,
            None => Ok(flushed.await),
        };
        match outcome {
            Ok(Ok(peers)) => {
                info!(topic = %topic, peers, "Discovery flushed");
                peers
            }
            Ok(Err(_)) => {
                warn!(topic = %topic, "Swarm dropped discovery request");
                0
            }
            Err(_) => {
                warn!(
                    topic = %topic,
                    timeout_secs = self.inner.discovery_timeout.map_or(0, |d| d.as_secs()),
                    "Discovery flush timed out, continuing"
                );
                0
            }
        }
    }

    /// Stop replicating a drive and leave its topic.
    pub async fn leave(&self, drive_id: &DriveId) -> bool {
        let removed = {
            let mut drives = self.inner.drives.lock().await;
            let topic = drives
                .iter()
                .find(|(_, d)| &d.drive_id == drive_id)
                .map(|(topic, _)| topic.clone());
            topic.and_then(|t| drives.remove(&t).map(|d| (t, d)))
        };
        let Some((topic, drive)) = removed else {
            return false;
        };

        drive.task.abort();
        if let Some(cmd_tx) = &self.inner.cmd_tx {
            let _ = cmd_tx
                .send(SwarmCommand::LeaveDiscovery {
                    topic,
                    key: drive.store.discovery_key().to_vec(),
                })
                .await;
        }
        debug!(drive = %drive_id, "Replication stopped");
        true
    }

    /// Peers currently known to share the drive's topic.
    pub async fn peer_count(&self, drive_id: &DriveId) -> usize {
        self.inner
            .drives
            .lock()
            .await
            .values()
            .find(|d| &d.drive_id == drive_id)
            .map(|d| d.peers.len())
            .unwrap_or(0)
    }

    pub async fn is_replicating(&self, drive_id: &DriveId) -> bool {
        self.inner
            .drives
            .lock()
            .await
            .values()
            .any(|d| &d.drive_id == drive_id)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn forward_local_changes(
        self,
        topic: String,
        key: SymmetricKey,
        store: Arc<DriveStore>,
        mut changes: broadcast::Receiver<StoreChange>,
        mut published: u64,
    ) {
        let hint = store.update_hint();
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if store.is_writable() {
                            published = self.publish_ops_after(&topic, &key, &store, published).await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = hint.notified() => {
                    if store.is_closed() {
                        break;
                    }
                    if let Ok(since) = store.version() {
                        self.publish(&topic, &key, &ReplicationMessage::SyncRequest { since }).await;
                    }
                }
            }
        }
        debug!(topic = %topic, "Change forwarding ended");
    }

    /// Publish every op after `since`; returns the last seq published.
    async fn publish_ops_after(
        &self,
        topic: &str,
        key: &SymmetricKey,
        store: &DriveStore,
        since: u64,
    ) -> u64 {
        let ops = match store.export_ops(since, INLINE_BLOB_LIMIT).await {
            Ok(ops) => ops,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Could not export ops");
                return since;
            }
        };

        let mut last = since;
        for (op, blob) in ops {
            last = op.op.seq();
            self.publish(topic, key, &ReplicationMessage::Op { op, blob }).await;
        }
        last
    }

    async fn publish(&self, topic: &str, key: &SymmetricKey, message: &ReplicationMessage) {
        let Some(cmd_tx) = &self.inner.cmd_tx else {
            return;
        };
        let data = match message.seal(key) {
            Ok(data) => data,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Could not seal replication message");
                return;
            }
        };
        let command = SwarmCommand::PublishMessage {
            topic: topic.to_string(),
            data,
        };
        if cmd_tx.send(command).await.is_err() {
            debug!(topic = %topic, "Swarm gone, dropping message");
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub async fn handle_notification(&self, notification: SwarmNotification) {
        match notification {
            SwarmNotification::PeerSubscribed { peer_id, topic } => {
                let target = {
                    let mut drives = self.inner.drives.lock().await;
                    drives.get_mut(&topic).map(|d| {
                        d.peers.insert(peer_id);
                        (d.store.clone(), d.key)
                    })
                };
                if let Some((store, key)) = target {
                    debug!(peer = %peer_id, topic = %topic, "Peer joined drive");
                    if let Ok(version) = store.version() {
                        self.publish(&topic, &key, &ReplicationMessage::Announce { version })
                            .await;
                    }
                }
            }

            SwarmNotification::PeerUnsubscribed { peer_id, topic } => {
                if let Some(drive) = self.inner.drives.lock().await.get_mut(&topic) {
                    drive.peers.remove(&peer_id);
                }
            }

            SwarmNotification::PeerDisconnected { peer_id } => {
                for drive in self.inner.drives.lock().await.values_mut() {
                    drive.peers.remove(&peer_id);
                }
            }

            SwarmNotification::MessageReceived { source, topic, data } => {
                let target = {
                    let mut drives = self.inner.drives.lock().await;
                    drives.get_mut(&topic).map(|d| {
                        if let Some(peer) = source {
                            d.peers.insert(peer);
                        }
                        (d.drive_id.clone(), d.store.clone(), d.key)
                    })
                };
                let Some((drive_id, store, key)) = target else {
                    return;
                };

                let message = match ReplicationMessage::open(&key, &data) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(drive = %drive_id, error = %e, "Dropping unreadable message");
                        return;
                    }
                };
                if let Err(e) = self.handle_message(&topic, &key, &store, message).await {
                    warn!(drive = %drive_id, error = %e, "Replication message failed");
                }
            }

            SwarmNotification::PeerConnected { .. } => {}
        }
    }

    async fn handle_message(
        &self,
        topic: &str,
        key: &SymmetricKey,
        store: &DriveStore,
        message: ReplicationMessage,
    ) -> std::result::Result<(), StoreError> {
        match message {
            ReplicationMessage::Announce { version } => {
                let local = store.version()?;
                if version > local {
                    debug!(topic = %topic, local, remote = version, "Behind peer, requesting ops");
                    self.publish(topic, key, &ReplicationMessage::SyncRequest { since: local })
                        .await;
                }
            }

            ReplicationMessage::SyncRequest { since } => {
                if store.version()? > since {
                    self.publish_ops_after(topic, key, store, since).await;
                }
            }

            ReplicationMessage::Op { op, blob } => match store.apply_remote(op, blob).await? {
                Applied::Applied { seq } => debug!(topic = %topic, seq, "Replicated op"),
                Applied::Duplicate => {}
                Applied::Gap { have } => {
                    self.publish(topic, key, &ReplicationMessage::SyncRequest { since: have })
                        .await;
                }
            },
        }
        Ok(())
    }
}
