/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/peerdrive/1.0.0";

/// Application name
pub const APP_NAME: &str = "PeerDrive";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum GossipSub message size in bytes (4 MiB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Largest blob carried inline in a replicated op. Bigger blobs replicate
/// metadata-only; leaves room for the op header, nonce and AEAD tag.
pub const INLINE_BLOB_LIMIT: usize = MAX_MESSAGE_SIZE - 64 * 1024;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4101;

/// GossipSub topic prefix for per-drive replication traffic
pub const DRIVE_TOPIC_PREFIX: &str = "drive:";

/// Marker entry written inside otherwise empty folders
pub const FOLDER_MARKER: &str = ".keep";

/// Chunk size for streamed blob reads
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DISCOVERY_KEY: &str = "peerdrive-discovery-key-v1";
pub const KDF_CONTEXT_REPLICATION_KEY: &str = "peerdrive-replication-key-v1";
pub const KDF_CONTEXT_CONTENT_KEY: &str = "peerdrive-content-key-v1";

/// Application-owned file and directory names under the data dir
pub const REGISTRY_FILE: &str = "drives.json";
pub const HISTORY_FILE: &str = "download-history.json";
pub const DRIVES_DIR: &str = "drives";

/// Completed download records older than this are pruned
pub const HISTORY_RETENTION_DAYS: i64 = 15;
