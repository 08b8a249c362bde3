use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DRIVE_TOPIC_PREFIX, KDF_CONTEXT_DISCOVERY_KEY, PUBKEY_SIZE};
use crate::error::IdentityError;

/// Opaque drive identifier. Also names the drive's storage subdirectory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DriveId(pub String);

impl DriveId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DriveId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DriveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriveId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a drive was created locally (writable) or joined from someone
/// else's public key (never mutated locally).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DriveKind {
    Owned,
    Readonly,
}

impl DriveKind {
    pub fn is_writable(&self) -> bool {
        matches!(self, DriveKind::Owned)
    }
}

// Drive identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DrivePublicKey(pub [u8; 32]);

impl DrivePublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex public key, rejecting anything else.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();
        if s.len() != PUBKEY_SIZE * 2 {
            return Err(IdentityError::InvalidPublicKey(format!(
                "expected {} hex chars, got {}",
                PUBKEY_SIZE * 2,
                s.len()
            )));
        }
        let bytes =
            hex::decode(s).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// Key under which peers interested in this drive find each other.
    /// Derived so the public key itself is never published.
    pub fn discovery_key(&self) -> [u8; 32] {
        blake3::derive_key(KDF_CONTEXT_DISCOVERY_KEY, &self.0)
    }

    pub fn to_topic(&self) -> String {
        format!("{}{}", DRIVE_TOPIC_PREFIX, hex::encode(self.discovery_key()))
    }
}

impl std::fmt::Display for DrivePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionMode {
    Direct,
    Relayed,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = DrivePublicKey([7u8; 32]);
        let parsed = DrivePublicKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_public_key_rejects_bad_input() {
        assert!(DrivePublicKey::from_hex("abcd").is_err());
        assert!(DrivePublicKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_topic_hides_public_key() {
        let key = DrivePublicKey([1u8; 32]);
        let topic = key.to_topic();
        assert!(topic.starts_with(DRIVE_TOPIC_PREFIX));
        assert!(!topic.contains(&key.to_hex()));
    }

    #[test]
    fn test_drive_kind_serializes_lowercase() {
        let json = serde_json::to_string(&DriveKind::Readonly).unwrap();
        assert_eq!(json, "\"readonly\"");
    }

    #[test]
    fn test_drive_ids_are_unique() {
        assert_ne!(DriveId::new(), DriveId::new());
    }
}
