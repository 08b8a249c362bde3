use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use libp2p::gossipsub::{self, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::{dcutr, identify, noise, StreamProtocol, SwarmBuilder};
use tracing::info;

use peerdrive_shared::constants::{GOSSIPSUB_HEARTBEAT_SECS, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};

use crate::behaviour::DriveBehaviour;

const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/peerdrive/kad/1.0.0");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Build the QUIC + relay swarm. Replication payloads can carry a whole
/// inline blob, so GossipSub's transmit limit is raised to `MAX_MESSAGE_SIZE`.
pub fn build_swarm(keypair: Keypair) -> anyhow::Result<libp2p::Swarm<DriveBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_relay_client(noise::Config::new, libp2p::yamux::Config::default)?
        .with_behaviour(|key, relay_client| -> Result<DriveBehaviour, BoxError> {
            let local_peer_id = key.public().to_peer_id();

            // payloads are sealed with a fresh nonce, so identical plaintexts
            // still get distinct ids
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.data.hash(&mut hasher);
                if let Some(ref source) = message.source {
                    source.hash(&mut hasher);
                }
                MessageId::from(hasher.finish().to_string())
            };

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(|e| -> BoxError { format!("GossipSub config: {e}").into() })?;

            let gossipsub =
                gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossipsub_config)
                    .map_err(|e| -> BoxError { format!("GossipSub init: {e}").into() })?;

            let mut kad_config = kad::Config::new(KAD_PROTOCOL);
            kad_config.set_query_timeout(Duration::from_secs(30));
            let mut kademlia =
                kad::Behaviour::with_config(local_peer_id, MemoryStore::new(local_peer_id), kad_config);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60)),
            );

            let dcutr = dcutr::Behaviour::new(local_peer_id);

            Ok(DriveBehaviour {
                gossipsub,
                kademlia,
                identify,
                relay_client,
                dcutr,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        "Built drive swarm with QUIC + Relay transport"
    );

    Ok(swarm)
}
