#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::mpsc;

use peerdrive_core::{CoreConfig, PeerDrive, ReplicationCoordinator};
use peerdrive_net::{SwarmCommand, SwarmNotification};

/// An in-memory stand-in for the swarm: routes topic joins and publishes
/// between nodes without sockets.
pub struct FakeHub {
    commands: mpsc::Sender<(usize, SwarmCommand)>,
    commands_rx: Option<mpsc::Receiver<(usize, SwarmCommand)>>,
    nodes: Vec<(PeerId, mpsc::Sender<SwarmNotification>)>,
}

impl FakeHub {
    pub fn new() -> Self {
        let (commands, commands_rx) = mpsc::channel(1024);
        Self {
            commands,
            commands_rx: Some(commands_rx),
            nodes: Vec::new(),
        }
    }

    /// Add a node; returns its coordinator with the notification loop running.
    pub fn node(&mut self) -> ReplicationCoordinator {
        let index = self.nodes.len();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(1024);
        let (notif_tx, notif_rx) = mpsc::channel(1024);
        self.nodes.push((PeerId::random(), notif_tx));

        let merged = self.commands.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if merged.send((index, cmd)).await.is_err() {
                    break;
                }
            }
        });

        let coordinator = ReplicationCoordinator::new(cmd_tx, Some(Duration::from_secs(2)));
        coordinator.spawn_notification_loop(notif_rx);
        coordinator
    }

    pub fn start(mut self) {
        let Some(mut rx) = self.commands_rx.take() else {
            return;
        };
        let nodes = self.nodes;
        tokio::spawn(async move {
            let mut topics: HashMap<String, HashSet<usize>> = HashMap::new();
            while let Some((from, cmd)) = rx.recv().await {
                match cmd {
                    SwarmCommand::JoinDiscovery { topic, reply, .. } => {
                        let members = topics.entry(topic.clone()).or_default();
                        for &other in members.iter() {
                            let _ = nodes[other]
                                .1
                                .send(SwarmNotification::PeerSubscribed {
                                    peer_id: nodes[from].0,
                                    topic: topic.clone(),
                                })
                                .await;
                            let _ = nodes[from]
                                .1
                                .send(SwarmNotification::PeerSubscribed {
                                    peer_id: nodes[other].0,
                                    topic: topic.clone(),
                                })
                                .await;
                        }
                        let _ = reply.send(members.len());
                        members.insert(from);
                    }
                    SwarmCommand::LeaveDiscovery { topic, .. } => {
                        if let Some(members) = topics.get_mut(&topic) {
                            members.remove(&from);
                        }
                    }
                    SwarmCommand::PublishMessage { topic, data } => {
                        let Some(members) = topics.get(&topic) else {
                            continue;
                        };
                        for &other in members.iter().filter(|&&m| m != from) {
                            let _ = nodes[other]
                                .1
                                .send(SwarmNotification::MessageReceived {
                                    source: Some(nodes[from].0),
                                    topic: topic.clone(),
                                    data: data.clone(),
                                })
                                .await;
                        }
                    }
                    SwarmCommand::GetPeers(reply) => {
                        let _ = reply.send(Vec::new());
                    }
                    SwarmCommand::Dial(_) => {}
                    SwarmCommand::Shutdown => break,
                }
            }
        });
    }
}

pub fn offline_app(dir: &std::path::Path) -> PeerDrive {
    PeerDrive::offline(CoreConfig::with_data_dir(dir))
}

/// Poll `check` until it yields `Some`, or give up after `limit`.
pub async fn eventually<T, F, Fut>(limit: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
