//! Persistent network identity of this node.
//!
//! The libp2p keypair is rebuilt from a 32-byte ed25519 seed kept as hex in
//! the data directory, so the peer id survives restarts.

use std::path::Path;

use anyhow::Context;
use rand::RngCore;
use tracing::info;

pub const NODE_KEY_FILE: &str = "node.key";

/// Load the node seed, creating it on first run.
pub async fn load_or_create_seed(data_dir: &Path) -> anyhow::Result<[u8; 32]> {
    let path = data_dir.join(NODE_KEY_FILE);

    if let Ok(contents) = tokio::fs::read_to_string(&path).await {
        let bytes = hex::decode(contents.trim())
            .with_context(|| format!("node key at {} is not hex", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node key at {} must be 32 bytes", path.display()))?;
        return Ok(seed);
    }

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    tokio::fs::create_dir_all(data_dir).await?;
    tokio::fs::write(&path, hex::encode(seed))
        .await
        .with_context(|| format!("writing node key to {}", path.display()))?;
    info!(path = %path.display(), "Generated new node key");
    Ok(seed)
}

pub fn libp2p_keypair(seed: [u8; 32]) -> anyhow::Result<libp2p::identity::Keypair> {
    libp2p::identity::Keypair::ed25519_from_bytes(seed)
        .map_err(|e| anyhow::anyhow!("Failed to create libp2p keypair: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_seed_is_stable_across_loads() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_seed(dir.path()).await.unwrap();
        let second = load_or_create_seed(dir.path()).await.unwrap();
        assert_eq!(first, second);

        let a = libp2p_keypair(first).unwrap().public().to_peer_id();
        let b = libp2p_keypair(second).unwrap().public().to_peer_id();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_garbage_key_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(NODE_KEY_FILE), "zz").unwrap();
        assert!(load_or_create_seed(dir.path()).await.is_err());
    }
}
