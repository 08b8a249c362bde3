//! Swarm task with the tokio mpsc command/notification pattern.
//!
//! The libp2p swarm runs in its own task. The rest of the application talks
//! to it through [`SwarmCommand`]s and listens to [`SwarmNotification`]s, so
//! nothing outside this module ever touches the swarm directly.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad, multiaddr::Protocol, swarm::SwarmEvent, Multiaddr, PeerId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use peerdrive_shared::constants::DEFAULT_QUIC_PORT;

use crate::behaviour::DriveNetEvent;
use crate::discovery::{load_bootstrap_peers, provider_key};
use crate::peers::PeerTracker;
use crate::transport::build_swarm;

const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    Dial(Multiaddr),
    /// Publish on a GossipSub topic.
    PublishMessage { topic: String, data: Vec<u8> },
    /// Subscribe to `topic`, announce ourselves as a provider of `key` on the
    /// DHT and look up other providers. `reply` receives the number of peers
    /// found once the lookup finishes.
    JoinDiscovery {
        topic: String,
        key: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    /// Undo [`SwarmCommand::JoinDiscovery`].
    LeaveDiscovery { topic: String, key: Vec<u8> },
    /// Snapshot of currently connected peers.
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    Shutdown,
}

/// Notifications sent *from* the swarm task.
#[derive(Debug, Clone)]
pub enum SwarmNotification {
    PeerConnected { peer_id: PeerId, address: Multiaddr },
    PeerDisconnected { peer_id: PeerId },
    /// A remote peer joined one of our topics.
    PeerSubscribed { peer_id: PeerId, topic: String },
    PeerUnsubscribed { peer_id: PeerId, topic: String },
    MessageReceived {
        source: Option<PeerId>,
        topic: String,
        data: Vec<u8>,
    },
}

pub struct SwarmConfig {
    /// File with one bootstrap multiaddr per line.
    pub bootstrap_peers_path: Option<PathBuf>,
    pub listen_port: u16,
    /// Additional multiaddrs to dial on startup.
    pub extra_dials: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers_path: None,
            listen_port: DEFAULT_QUIC_PORT,
            extra_dials: Vec::new(),
        }
    }
}

/// In-flight provider lookup started by a `JoinDiscovery` command.
struct ProviderLookup {
    topic: String,
    reply: oneshot::Sender<usize>,
    found: HashSet<PeerId>,
}

/// Spawn the libp2p swarm in a background tokio task.
///
/// Returns `(command_tx, notification_rx, local_peer_id)`.
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    let listen_v4: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?;
    let listen_v6: Multiaddr = format!("/ip6/::/udp/{}/quic-v1", config.listen_port).parse()?;
    swarm.listen_on(listen_v4)?;
    swarm.listen_on(listen_v6)?;

    info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening");

    if let Some(ref path) = config.bootstrap_peers_path {
        let bootstrap_addrs = load_bootstrap_peers(path);
        for addr in &bootstrap_addrs {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
                continue;
            }
            if let Some(peer_id) = extract_peer_id(addr) {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
            debug!(addr = %addr, "Dialing bootstrap peer");
        }

        if !bootstrap_addrs.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(error = %e, "Kademlia bootstrap failed to start");
            }
        }
    }

    for addr in &config.extra_dials {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial extra address");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(CHANNEL_CAPACITY);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut peer_tracker = PeerTracker::new();
        let mut lookups: HashMap<kad::QueryId, ProviderLookup> = HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                error!(addr = %addr, error = %e, "Dial failed");
                            }
                        }
                        Some(SwarmCommand::PublishMessage { topic, data }) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(gossipsub_topic, data) {
                                // expected while nobody else is on the topic
                                debug!(topic = %topic, error = %e, "Publish failed");
                            }
                        }
                        Some(SwarmCommand::JoinDiscovery { topic, key, reply }) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&gossipsub_topic) {
                                error!(topic = %topic, error = %e, "Subscribe failed");
                            }

                            let record_key = provider_key(&key);
                            if let Err(e) = swarm.behaviour_mut().kademlia.start_providing(record_key.clone()) {
                                warn!(topic = %topic, error = %e, "Could not announce as provider");
                            }
                            let query_id = swarm.behaviour_mut().kademlia.get_providers(record_key);
                            debug!(topic = %topic, query = ?query_id, "Looking up drive providers");
                            lookups.insert(query_id, ProviderLookup { topic, reply, found: HashSet::new() });
                        }
                        Some(SwarmCommand::LeaveDiscovery { topic, key }) => {
                            let gossipsub_topic = gossipsub::IdentTopic::new(&topic);
                            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&gossipsub_topic);
                            swarm.behaviour_mut().kademlia.stop_providing(&provider_key(&key));
                            debug!(topic = %topic, "Left drive topic");
                        }
                        Some(SwarmCommand::GetPeers(reply)) => {
                            let _ = reply.send(peer_tracker.connected_peers());
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(DriveNetEvent::Gossipsub(
                            gossipsub::Event::Message { message, .. },
                        )) => {
                            let topic = message.topic.to_string();
                            debug!(
                                topic = %topic,
                                source = ?message.source,
                                len = message.data.len(),
                                "GossipSub message received"
                            );
                            let _ = notif_tx
                                .send(SwarmNotification::MessageReceived {
                                    source: message.source,
                                    topic,
                                    data: message.data,
                                })
                                .await;
                        }

                        SwarmEvent::Behaviour(DriveNetEvent::Gossipsub(
                            gossipsub::Event::Subscribed { peer_id, topic },
                        )) => {
                            let topic = topic.to_string();
                            peer_tracker.on_subscribed(peer_id, &topic);
                            debug!(peer = %peer_id, topic = %topic, "Peer joined topic");
                            let _ = notif_tx
                                .send(SwarmNotification::PeerSubscribed { peer_id, topic })
                                .await;
                        }

                        SwarmEvent::Behaviour(DriveNetEvent::Gossipsub(
                            gossipsub::Event::Unsubscribed { peer_id, topic },
                        )) => {
                            let topic = topic.to_string();
                            peer_tracker.on_unsubscribed(&peer_id, &topic);
                            let _ = notif_tx
                                .send(SwarmNotification::PeerUnsubscribed { peer_id, topic })
                                .await;
                        }

                        SwarmEvent::Behaviour(DriveNetEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { id, result, step, .. },
                        )) => {
                            match result {
                                kad::QueryResult::GetProviders(Ok(
                                    kad::GetProvidersOk::FoundProviders { providers, .. },
                                )) => {
                                    if let Some(lookup) = lookups.get_mut(&id) {
                                        for peer in providers {
                                            if peer == local_peer_id || !lookup.found.insert(peer) {
                                                continue;
                                            }
                                            if !peer_tracker.is_connected(&peer) {
                                                if let Err(e) = swarm.dial(peer) {
                                                    debug!(peer = %peer, error = %e, "Could not dial provider");
                                                }
                                            }
                                        }
                                    }
                                }
                                kad::QueryResult::GetProviders(Err(e)) => {
                                    debug!(error = ?e, "Provider lookup ended with error");
                                }
                                kad::QueryResult::StartProviding(Err(e)) => {
                                    debug!(error = ?e, "Provider announcement failed");
                                }
                                other => {
                                    debug!(result = ?other, "Kademlia query progressed");
                                }
                            }

                            if step.last {
                                if let Some(lookup) = lookups.remove(&id) {
                                    let mut peers = lookup.found;
                                    peers.extend(peer_tracker.topic_peers(&lookup.topic));
                                    info!(topic = %lookup.topic, peers = peers.len(), "Drive discovery flushed");
                                    let _ = lookup.reply.send(peers.len());
                                }
                            }
                        }

                        SwarmEvent::Behaviour(DriveNetEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(peer = %peer_id, protocol = ?info.protocol_version, "Identify received");
                            for addr in &info.listen_addrs {
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                            }
                        }

                        SwarmEvent::Behaviour(DriveNetEvent::RelayClient(event)) => {
                            debug!(event = ?event, "Relay client event");
                        }

                        SwarmEvent::Behaviour(DriveNetEvent::Dcutr(event)) => {
                            debug!(event = ?event, "DCUtR event");
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            let is_relayed = addr.iter().any(|p| matches!(p, Protocol::P2pCircuit));
                            peer_tracker.on_connected(peer_id, addr.clone(), is_relayed);

                            let mode = peer_tracker.connection_mode(&peer_id);
                            info!(peer = %peer_id, addr = %addr, mode = ?mode, "Peer connected");
                            let _ = notif_tx
                                .send(SwarmNotification::PeerConnected { peer_id, address: addr })
                                .await;
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                peer_tracker.on_disconnected(&peer_id);
                                info!(peer = %peer_id, "Peer disconnected");
                                let _ = notif_tx
                                    .send(SwarmNotification::PeerDisconnected { peer_id })
                                    .await;
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        }

                        SwarmEvent::IncomingConnectionError { error, .. } => {
                            warn!(error = %error, "Incoming connection error");
                        }

                        _ => {}
                    }
                }
            }
        }

        // pending lookups resolve with what they have
        for (_, lookup) in lookups.drain() {
            let _ = lookup.reply.send(lookup.found.len());
        }
        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}

fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
