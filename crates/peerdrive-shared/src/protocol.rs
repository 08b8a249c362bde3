use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{decrypt, encrypt, SymmetricKey};
use crate::error::ProtocolError;
use crate::identity::{verify_signature, DriveKeypair};
use crate::types::DrivePublicKey;

/// Reference to a content-addressed blob (BLAKE3 of the bytes).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub hash: [u8; 32],
    pub size: u64,
}

impl BlobRef {
    pub fn for_bytes(data: &[u8]) -> Self {
        Self {
            hash: *blake3::hash(data).as_bytes(),
            size: data.len() as u64,
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// One entry in a drive's append-only log. `seq` starts at 1 and is
/// contiguous; the drive version equals the highest applied `seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DriveOp {
    Put {
        seq: u64,
        path: String,
        /// `None` for folder markers and other byte-less entries
        blob: Option<BlobRef>,
        modified_at: DateTime<Utc>,
    },
    Del {
        seq: u64,
        path: String,
    },
}

impl DriveOp {
    pub fn seq(&self) -> u64 {
        match self {
            DriveOp::Put { seq, .. } | DriveOp::Del { seq, .. } => *seq,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            DriveOp::Put { path, .. } | DriveOp::Del { path, .. } => path,
        }
    }
}

/// True for an absolute entry path with no empty, `.` or `..` segments and
/// no NUL or backslash, i.e. the form every tree entry is stored under.
pub fn is_entry_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    !rest.is_empty()
        && !path.contains('\0')
        && !path.contains('\\')
        && rest
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// A log op signed by the drive's writer key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedOp {
    pub op: DriveOp,
    pub signature: Vec<u8>,
}

impl SignedOp {
    pub fn sign(op: DriveOp, keypair: &DriveKeypair) -> Result<Self, ProtocolError> {
        let body = bincode::serialize(&op)?;
        let signature = keypair.sign(&body);
        Ok(Self {
            op,
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn verify(&self, public_key: &DrivePublicKey) -> Result<(), ProtocolError> {
        let body = bincode::serialize(&self.op)?;
        verify_signature(public_key, &body, &self.signature)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Messages exchanged on a drive's replication topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// "I hold the log up to `version`"
    Announce { version: u64 },

    /// "Send me every op after `since`"
    SyncRequest { since: u64 },

    /// A log op, with its blob bytes when small enough to travel inline
    Op {
        op: SignedOp,
        blob: Option<Vec<u8>>,
    },
}

impl ReplicationMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Encode and encrypt for publication on the drive topic.
    pub fn seal(&self, key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
        let plaintext = self.to_bytes()?;
        Ok(encrypt(key, &plaintext)?)
    }

    /// Decrypt and decode a payload received on the drive topic.
    pub fn open(key: &SymmetricKey, data: &[u8]) -> Result<Self, ProtocolError> {
        let plaintext = decrypt(key, data)?;
        Ok(Self::from_bytes(&plaintext)?)
    }
}
