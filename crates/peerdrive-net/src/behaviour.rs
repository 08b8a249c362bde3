//! Composed libp2p `NetworkBehaviour` for drive replication.
//!
//! GossipSub carries the per-drive topics, Kademlia records which peers
//! provide a drive's discovery key, Identify feeds Kademlia with listen
//! addresses, and the relay client plus DCUtR get peers behind NAT talking.

use libp2p::{
    dcutr, gossipsub, identify,
    kad::{self, store::MemoryStore},
    relay,
    swarm::NetworkBehaviour,
};

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "DriveNetEvent")]
pub struct DriveBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
}

/// One variant per sub-behaviour.
#[derive(Debug)]
pub enum DriveNetEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
    RelayClient(relay::client::Event),
    Dcutr(dcutr::Event),
}

impl From<gossipsub::Event> for DriveNetEvent {
    fn from(event: gossipsub::Event) -> Self {
        DriveNetEvent::Gossipsub(event)
    }
}

impl From<kad::Event> for DriveNetEvent {
    fn from(event: kad::Event) -> Self {
        DriveNetEvent::Kademlia(event)
    }
}

impl From<identify::Event> for DriveNetEvent {
    fn from(event: identify::Event) -> Self {
        DriveNetEvent::Identify(event)
    }
}

impl From<relay::client::Event> for DriveNetEvent {
    fn from(event: relay::client::Event) -> Self {
        DriveNetEvent::RelayClient(event)
    }
}

impl From<dcutr::Event> for DriveNetEvent {
    fn from(event: dcutr::Event) -> Self {
        DriveNetEvent::Dcutr(event)
    }
}
