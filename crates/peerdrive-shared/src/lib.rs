//! Types, keys and wire formats shared by every PeerDrive crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use identity::DriveKeypair;
pub use types::{ConnectionMode, DriveId, DriveKind, DrivePublicKey};
