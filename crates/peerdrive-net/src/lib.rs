// P2P networking layer: one libp2p swarm carrying every drive's replication topic.

pub mod behaviour;
pub mod discovery;
pub mod peers;
pub mod swarm;
pub mod transport;

pub use behaviour::{DriveBehaviour, DriveNetEvent};
pub use discovery::{load_bootstrap_peers, parse_multiaddrs, provider_key};
pub use peers::{ConnectionInfo, PeerTracker};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::build_swarm;
