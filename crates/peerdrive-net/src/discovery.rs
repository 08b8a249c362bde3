//! Bootstrap peers and discovery keys.
//!
//! A drive is found on the DHT by its discovery key: peers holding the drive
//! register as Kademlia providers of that key, and joiners look providers up.
//! The key is derived from the public key, so the DHT never sees the key itself.

use std::fs;
use std::path::Path;

use libp2p::kad::RecordKey;
use libp2p::Multiaddr;
use tracing::{debug, info, warn};

/// Load bootstrap multiaddrs from a file, one per line. Blank lines and `#`
/// comments are ignored; malformed lines are logged and skipped. A missing
/// file yields an empty list.
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to read bootstrap peers file"
            );
            return Vec::new();
        }
    };

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    let addrs = parse_multiaddrs(&lines);

    info!(
        count = addrs.len(),
        path = %path.display(),
        "Loaded bootstrap peers"
    );
    addrs
}

/// Parse multiaddr strings, dropping (and logging) the invalid ones.
pub fn parse_multiaddrs(raw: &[String]) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Parsed multiaddr");
                Some(addr)
            }
            Err(e) => {
                warn!(addr = %s, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

/// DHT provider key for a drive's discovery key.
pub fn provider_key(discovery_key: &[u8]) -> RecordKey {
    RecordKey::new(&discovery_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_nonexistent_file() {
        let peers = load_bootstrap_peers(Path::new("/nonexistent/bootstrap.txt"));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_load_skips_comments_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("peers.txt");

        let mut f = fs::File::create(&file_path).unwrap();
        writeln!(f, "# bootstrap nodes").unwrap();
        writeln!(f, "/ip4/127.0.0.1/udp/4101/quic-v1").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "invalid-addr").unwrap();
        writeln!(f, "  /ip4/127.0.0.2/udp/4101/quic-v1  ").unwrap();
        drop(f);

        assert_eq!(load_bootstrap_peers(&file_path).len(), 2);
    }

    #[test]
    fn test_provider_key_is_stable() {
        let a = provider_key(&[1u8; 32]);
        let b = provider_key(&[1u8; 32]);
        let c = provider_key(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_ref(), &[1u8; 32]);
    }
}
