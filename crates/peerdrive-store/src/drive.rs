//! The async drive handle.
//!
//! [`DriveStore`] owns the per-drive database and blob directory. Writes are
//! serialized through the database mutex so log sequence numbers stay
//! contiguous; blob file I/O happens outside the lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use peerdrive_shared::constants::STREAM_CHUNK_SIZE;
use peerdrive_shared::protocol::{is_entry_path, BlobRef, DriveOp, SignedOp};
use peerdrive_shared::{DriveKeypair, DrivePublicKey};

use crate::blobs::BlobFiles;
use crate::database::{Database, DB_FILE};
use crate::error::{Result, StoreError};
use crate::models::{Applied, ChangeKind, Entry, StorageInfo, StoreChange};

const META_PUBLIC_KEY: &str = "public_key";
const META_SECRET_KEY: &str = "secret_key";
const META_CREATED_AT: &str = "created_at";

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Chunked blob contents.
pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

pub struct DriveStore {
    dir: PathBuf,
    public_key: DrivePublicKey,
    /// Present only on the drive's writer.
    keypair: Option<DriveKeypair>,
    db: Mutex<Database>,
    blobs: BlobFiles,
    changes: Mutex<Option<broadcast::Sender<StoreChange>>>,
    update_hint: Arc<Notify>,
    closed: AtomicBool,
}

impl DriveStore {
    // ------------------------------------------------------------------
    // Open / create
    // ------------------------------------------------------------------

    /// Initialize fresh writable storage for a newly generated drive key.
    pub async fn create(dir: &Path, keypair: DriveKeypair) -> Result<Self> {
        let db = Self::init_storage(dir, &keypair.public_key(), Some(&keypair)).await?;
        info!(
            dir = %dir.display(),
            key = %keypair.public_key().short(),
            "Created writable drive storage"
        );
        Ok(Self::from_parts(dir, keypair.public_key(), Some(keypair), db))
    }

    /// Initialize fresh read-only storage replicating someone else's drive.
    pub async fn join(dir: &Path, public_key: DrivePublicKey) -> Result<Self> {
        let db = Self::init_storage(dir, &public_key, None).await?;
        info!(
            dir = %dir.display(),
            key = %public_key.short(),
            "Created read-only drive storage"
        );
        Ok(Self::from_parts(dir, public_key, None, db))
    }

    /// Re-open existing storage. Never creates anything: a missing directory
    /// or database is an error.
    pub async fn open(dir: &Path) -> Result<Self> {
        let db_path = dir.join(DB_FILE);
        if tokio::fs::metadata(&db_path).await.is_err() {
            return Err(StoreError::Missing(dir.to_path_buf()));
        }

        let db = Database::open_at(&db_path)?;

        let public_hex = db
            .meta_get(META_PUBLIC_KEY)?
            .ok_or_else(|| StoreError::Corrupt("missing public key".into()))?;
        let public_key = DrivePublicKey::from_hex(&public_hex)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let keypair = match db.meta_get(META_SECRET_KEY)? {
            Some(secret_hex) => {
                let bytes = hex::decode(secret_hex)?;
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("secret key length".into()))?;
                let keypair = DriveKeypair::from_secret_bytes(&secret);
                if keypair.public_key() != public_key {
                    return Err(StoreError::Corrupt(
                        "secret key does not match public key".into(),
                    ));
                }
                Some(keypair)
            }
            None => None,
        };

        let store = Self::from_parts(dir, public_key, keypair, db);
        debug!(
            dir = %dir.display(),
            key = %public_key.short(),
            writable = store.is_writable(),
            version = store.version()?,
            "Opened drive storage"
        );
        Ok(store)
    }

    async fn init_storage(
        dir: &Path,
        public_key: &DrivePublicKey,
        keypair: Option<&DriveKeypair>,
    ) -> Result<Database> {
        tokio::fs::create_dir_all(dir).await?;

        let db_path = dir.join(DB_FILE);
        if tokio::fs::metadata(&db_path).await.is_ok() {
            return Err(StoreError::Corrupt(format!(
                "storage already initialized at {}",
                dir.display()
            )));
        }

        let db = Database::open_at(&db_path)?;
        db.meta_set(META_PUBLIC_KEY, &public_key.to_hex())?;
        if let Some(keypair) = keypair {
            db.meta_set(META_SECRET_KEY, &hex::encode(keypair.secret_bytes()))?;
        }
        db.meta_set(META_CREATED_AT, &Utc::now().to_rfc3339())?;
        Ok(db)
    }

    fn from_parts(
        dir: &Path,
        public_key: DrivePublicKey,
        keypair: Option<DriveKeypair>,
        db: Database,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            dir: dir.to_path_buf(),
            public_key,
            keypair,
            db: Mutex::new(db),
            blobs: BlobFiles::new(dir),
            changes: Mutex::new(Some(changes)),
            update_hint: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn public_key(&self) -> DrivePublicKey {
        self.public_key
    }

    pub fn discovery_key(&self) -> [u8; 32] {
        self.public_key.discovery_key()
    }

    pub fn is_writable(&self) -> bool {
        self.keypair.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> Result<u64> {
        self.db()?.head_seq()
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|e| StoreError::Corrupt(format!("lock poisoned: {e}")))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tree reads
    // ------------------------------------------------------------------

    pub fn entry(&self, path: &str) -> Result<Option<Entry>> {
        self.ensure_open()?;
        self.db()?.get_entry(path)
    }

    /// Whole-tree iteration, ordered by path.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        self.db()?.list_entries()
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Write `data` at `path`. Zero-length data is stored without a blob.
    pub async fn put(&self, path: &str, data: &[u8]) -> Result<Entry> {
        self.ensure_open()?;
        let keypair = self.keypair.as_ref().ok_or(StoreError::ReadOnly)?;
        check_path(path)?;

        let blob = if data.is_empty() {
            None
        } else {
            let blob = BlobRef::for_bytes(data);
            self.blobs.write(&blob, data).await?;
            Some(blob)
        };

        let entry = {
            let mut db = self.db()?;
            let seq = db.head_seq()? + 1;
            let modified_at = Utc::now();
            let signed = SignedOp::sign(
                DriveOp::Put {
                    seq,
                    path: path.to_string(),
                    blob,
                    modified_at,
                },
                keypair,
            )?;
            db.commit_op(&signed)?;
            if let Some(ref blob) = blob {
                db.insert_blob(blob)?;
            }
            Entry {
                path: path.to_string(),
                blob,
                seq,
                modified_at,
            }
        };

        debug!(path = %path, seq = entry.seq, size = data.len(), "Put entry");
        self.emit(StoreChange {
            seq: entry.seq,
            path: entry.path.clone(),
            kind: ChangeKind::Put,
        });
        Ok(entry)
    }

    /// Remove the tree entry at `path`. Blob storage is left untouched; see
    /// [`DriveStore::clear_blob`]. Returns `false` if nothing was there.
    pub async fn del(&self, path: &str) -> Result<bool> {
        self.ensure_open()?;
        let keypair = self.keypair.as_ref().ok_or(StoreError::ReadOnly)?;
        check_path(path)?;

        let seq = {
            let mut db = self.db()?;
            if db.get_entry(path)?.is_none() {
                return Ok(false);
            }
            let seq = db.head_seq()? + 1;
            let signed = SignedOp::sign(
                DriveOp::Del {
                    seq,
                    path: path.to_string(),
                },
                keypair,
            )?;
            db.commit_op(&signed)?;
            seq
        };

        debug!(path = %path, seq, "Deleted entry");
        self.emit(StoreChange {
            seq,
            path: path.to_string(),
            kind: ChangeKind::Del,
        });
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Blob reads
    // ------------------------------------------------------------------

    /// Random-access read of a whole blob. `None` when the bytes are not
    /// held locally (e.g. not replicated yet).
    pub async fn read_blob(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if !self.db()?.blob_present(blob)? {
            return Ok(None);
        }
        self.blobs.read(blob).await
    }

    /// Whether the bytes behind `blob` are held locally.
    pub fn has_blob(&self, blob: &BlobRef) -> Result<bool> {
        self.ensure_open()?;
        self.db()?.blob_present(blob)
    }

    /// Sequential chunked read of the entry at `path`.
    ///
    /// `None` if the path does not exist or its blob file is absent. Entries
    /// without a blob yield an empty stream.
    pub async fn read_stream(&self, path: &str) -> Result<Option<BlobStream>> {
        let Some(entry) = self.entry(path)? else {
            return Ok(None);
        };
        let Some(blob) = entry.blob else {
            return Ok(Some(stream::empty().boxed()));
        };
        let Some(file) = self.blobs.open(&blob).await? else {
            return Ok(None);
        };

        let chunks = stream::try_unfold(file, |mut file| async move {
            let mut buf = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
            let n = file.read_buf(&mut buf).await?;
            let next = (n > 0).then(|| (buf.freeze(), file));
            Ok::<_, std::io::Error>(next)
        });
        Ok(Some(chunks.boxed()))
    }

    // ------------------------------------------------------------------
    // Storage reclaim
    // ------------------------------------------------------------------

    /// Reclaim a blob's disk space once no tree entry references it.
    /// Returns the number of bytes freed (0 if still referenced or absent).
    pub async fn clear_blob(&self, blob: &BlobRef) -> Result<u64> {
        self.ensure_open()?;
        let removed = {
            let db = self.db()?;
            if db.blob_refcount(blob)? > 0 {
                debug!(hash = %blob.hash_hex(), "Blob still referenced, keeping");
                return Ok(0);
            }
            db.delete_blob(blob)?
        };
        if !removed {
            return Ok(0);
        }
        self.blobs.remove(blob).await?;
        Ok(blob.size)
    }

    /// Path-based reclaim: drop the local copy of the bytes behind `path` (the
    /// entry itself stays) and sweep every blob nothing references any more.
    pub async fn clear(&self, path: &str) -> Result<u64> {
        let mut freed = 0;

        if let Some(blob) = self.entry(path)?.and_then(|e| e.blob) {
            let removed = self.db()?.delete_blob(&blob)?;
            if removed {
                self.blobs.remove(&blob).await?;
                freed += blob.size;
            }
        }

        freed += self.reclaim_orphans().await?;
        Ok(freed)
    }

    pub async fn reclaim_orphans(&self) -> Result<u64> {
        self.ensure_open()?;
        let orphans = {
            let db = self.db()?;
            let orphans = db.orphan_blobs()?;
            for blob in &orphans {
                db.delete_blob(blob)?;
            }
            orphans
        };

        let mut freed = 0;
        for blob in &orphans {
            self.blobs.remove(blob).await?;
            freed += blob.size;
        }
        if !orphans.is_empty() {
            debug!(count = orphans.len(), freed, "Reclaimed orphan blobs");
        }
        Ok(freed)
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        self.ensure_open()?;
        let db = self.db()?;
        Ok(StorageInfo {
            blob_bytes: db.total_blob_bytes()?,
            version: db.head_seq()?,
        })
    }

    // ------------------------------------------------------------------
    // Mutation feed
    // ------------------------------------------------------------------

    /// Subscribe to every change applied to the tree. The receiver reports
    /// `Closed` once the store is closed.
    pub fn watch(&self) -> Result<broadcast::Receiver<StoreChange>> {
        let guard = self
            .changes
            .lock()
            .map_err(|e| StoreError::Corrupt(format!("lock poisoned: {e}")))?;
        guard.as_ref().map(|tx| tx.subscribe()).ok_or(StoreError::Closed)
    }

    fn emit(&self, change: StoreChange) {
        if let Ok(guard) = self.changes.lock() {
            if let Some(tx) = guard.as_ref() {
                // no receivers is fine
                let _ = tx.send(change);
            }
        }
    }

    /// Non-blocking hint that the caller expects the drive to change soon.
    pub fn expect_updates(&self) {
        self.update_hint.notify_one();
    }

    /// Handle the replication layer waits on for [`DriveStore::expect_updates`].
    pub fn update_hint(&self) -> Arc<Notify> {
        self.update_hint.clone()
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Ops after `since`, each with its blob bytes when held locally and no
    /// larger than `inline_limit`.
    pub async fn export_ops(
        &self,
        since: u64,
        inline_limit: usize,
    ) -> Result<Vec<(SignedOp, Option<Vec<u8>>)>> {
        self.ensure_open()?;
        let ops = self.db()?.ops_since(since)?;

        let mut exported = Vec::with_capacity(ops.len());
        for signed in ops {
            let blob = match &signed.op {
                DriveOp::Put {
                    blob: Some(blob), ..
                } if blob.size as usize <= inline_limit => self.read_blob(blob).await?,
                _ => None,
            };
            exported.push((signed, blob));
        }
        Ok(exported)
    }

    /// Verify and apply an op received from a peer.
    pub async fn apply_remote(&self, signed: SignedOp, blob: Option<Vec<u8>>) -> Result<Applied> {
        self.ensure_open()?;
        signed.verify(&self.public_key)?;
        // a valid signature only proves the writer sent it
        check_path(signed.op.path())?;

        let seq = signed.op.seq();
        let head = self.version()?;
        if seq <= head {
            return Ok(Applied::Duplicate);
        }
        if seq > head + 1 {
            return Ok(Applied::Gap { have: head });
        }

        let mut stored_blob = None;
        if let (
            DriveOp::Put {
                blob: Some(expected),
                path,
                ..
            },
            Some(data),
        ) = (&signed.op, blob.as_deref())
        {
            if BlobRef::for_bytes(data) != *expected {
                return Err(StoreError::Integrity(path.clone()));
            }
            self.blobs.write(expected, data).await?;
            stored_blob = Some(*expected);
        }

        {
            let mut db = self.db()?;
            // another apply may have landed while the blob was written
            if db.head_seq()? != head {
                return Ok(Applied::Duplicate);
            }
            db.commit_op(&signed)?;
            if let Some(ref blob) = stored_blob {
                db.insert_blob(blob)?;
            }
        }

        let kind = match signed.op {
            DriveOp::Put { .. } => ChangeKind::Put,
            DriveOp::Del { .. } => ChangeKind::Del,
        };
        debug!(path = %signed.op.path(), seq, "Applied remote op");
        self.emit(StoreChange {
            seq,
            path: signed.op.path().to_string(),
            kind,
        });
        Ok(Applied::Applied { seq })
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Stop accepting operations and end every watch subscription.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self
            .changes
            .lock()
            .map_err(|e| StoreError::Corrupt(format!("lock poisoned: {e}")))?;
        guard.take();
        self.update_hint.notify_waiters();
        info!(dir = %self.dir.display(), "Closed drive storage");
        Ok(())
    }
}

impl std::fmt::Debug for DriveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveStore")
            .field("dir", &self.dir)
            .field("public_key", &self.public_key.short())
            .field("writable", &self.is_writable())
            .finish_non_exhaustive()
    }
}

fn check_path(path: &str) -> Result<()> {
    if is_entry_path(path) {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use peerdrive_shared::constants::INLINE_BLOB_LIMIT;
    use tempfile::TempDir;

    async fn owned_store() -> (DriveStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DriveStore::create(&dir.path().join("drive"), DriveKeypair::generate())
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_and_read_both_paths() {
        let (store, _dir) = owned_store().await;
        let entry = store.put("/docs/a.txt", b"hello drive").await.unwrap();
        assert_eq!(entry.seq, 1);

        let blob = entry.blob.unwrap();
        assert_eq!(store.read_blob(&blob).await.unwrap().unwrap(), b"hello drive");

        let chunks: Vec<Bytes> = store
            .read_stream("/docs/a.txt")
            .await
            .unwrap()
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"hello drive");
    }

    #[tokio::test]
    async fn test_zero_length_put_has_no_blob() {
        let (store, _dir) = owned_store().await;
        let entry = store.put("/empty/.keep", b"").await.unwrap();
        assert!(entry.blob.is_none());

        let chunks: Vec<Bytes> = store
            .read_stream("/empty/.keep")
            .await
            .unwrap()
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_del_then_clear_blob_reclaims_space() {
        let (store, _dir) = owned_store().await;
        let entry = store.put("/x.bin", &[9u8; 100]).await.unwrap();
        let before = store.storage_info().unwrap();
        assert_eq!(before.blob_bytes, 100);

        assert!(store.del("/x.bin").await.unwrap());
        assert!(!store.del("/x.bin").await.unwrap());
        assert_eq!(store.clear_blob(&entry.blob.unwrap()).await.unwrap(), 100);

        let after = store.storage_info().unwrap();
        assert_eq!(after.blob_bytes, 0);
        assert_eq!(after.version, 2);
    }

    #[tokio::test]
    async fn test_shared_blob_kept_while_referenced() {
        let (store, _dir) = owned_store().await;
        let a = store.put("/a", b"same bytes").await.unwrap();
        store.put("/b", b"same bytes").await.unwrap();

        store.del("/a").await.unwrap();
        assert_eq!(store.clear_blob(&a.blob.unwrap()).await.unwrap(), 0);
        assert!(store.read_blob(&a.blob.unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_sweeps_orphans() {
        let (store, _dir) = owned_store().await;
        store.put("/a", b"first").await.unwrap();
        store.put("/a", b"second").await.unwrap();
        // "first" is no longer referenced after the overwrite
        assert_eq!(store.clear("/missing").await.unwrap(), 5);
        assert_eq!(store.storage_info().unwrap().blob_bytes, 6);
    }

    #[tokio::test]
    async fn test_joined_store_is_read_only() {
        let dir = TempDir::new().unwrap();
        let key = DriveKeypair::generate().public_key();
        let store = DriveStore::join(&dir.path().join("ro"), key).await.unwrap();

        assert!(!store.is_writable());
        assert!(matches!(
            store.put("/a", b"nope").await,
            Err(StoreError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_open_missing_storage_fails() {
        let dir = TempDir::new().unwrap();
        let result = DriveStore::open(&dir.path().join("gone")).await;
        assert!(matches!(result, Err(StoreError::Missing(_))));
    }

    #[tokio::test]
    async fn test_reopen_keeps_tree_and_writer_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drive");
        let keypair = DriveKeypair::generate();
        let public_key = keypair.public_key();
        {
            let store = DriveStore::create(&path, keypair).await.unwrap();
            store.put("/keep.txt", b"persisted").await.unwrap();
            store.close().unwrap();
        }

        let reopened = DriveStore::open(&path).await.unwrap();
        assert!(reopened.is_writable());
        assert_eq!(reopened.public_key(), public_key);
        assert_eq!(reopened.version().unwrap(), 1);
        assert!(reopened.entry("/keep.txt").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_storage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drive");
        DriveStore::create(&path, DriveKeypair::generate()).await.unwrap();
        assert!(DriveStore::create(&path, DriveKeypair::generate())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_changes_and_ends_on_close() {
        let (store, _dir) = owned_store().await;
        let mut rx = store.watch().unwrap();

        store.put("/a", b"1").await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.path, "/a");
        assert_eq!(change.kind, ChangeKind::Put);

        store.close().unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(store.watch(), Err(StoreError::Closed)));
        assert!(matches!(store.put("/b", b"2").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_replicate_owner_to_reader() {
        let (owner, _dir1) = owned_store().await;
        owner.put("/a.txt", b"alpha").await.unwrap();
        owner.put("/b/c.txt", b"gamma").await.unwrap();
        owner.del("/a.txt").await.unwrap();

        let dir2 = TempDir::new().unwrap();
        let reader = DriveStore::join(&dir2.path().join("ro"), owner.public_key())
            .await
            .unwrap();

        for (op, blob) in owner.export_ops(0, INLINE_BLOB_LIMIT).await.unwrap() {
            let applied = reader.apply_remote(op, blob).await.unwrap();
            assert!(matches!(applied, Applied::Applied { .. }));
        }

        assert_eq!(reader.version().unwrap(), 3);
        assert!(reader.entry("/a.txt").unwrap().is_none());
        let entry = reader.entry("/b/c.txt").unwrap().unwrap();
        assert_eq!(
            reader.read_blob(&entry.blob.unwrap()).await.unwrap().unwrap(),
            b"gamma"
        );
    }

    #[tokio::test]
    async fn test_apply_remote_detects_gap_and_duplicate() {
        let (owner, _dir1) = owned_store().await;
        owner.put("/1", b"one").await.unwrap();
        owner.put("/2", b"two").await.unwrap();
        let ops = owner.export_ops(0, INLINE_BLOB_LIMIT).await.unwrap();

        let dir2 = TempDir::new().unwrap();
        let reader = DriveStore::join(&dir2.path().join("ro"), owner.public_key())
            .await
            .unwrap();

        let (second, second_blob) = ops[1].clone();
        assert_eq!(
            reader.apply_remote(second, second_blob).await.unwrap(),
            Applied::Gap { have: 0 }
        );

        let (first, first_blob) = ops[0].clone();
        reader.apply_remote(first.clone(), first_blob.clone()).await.unwrap();
        assert_eq!(
            reader.apply_remote(first, first_blob).await.unwrap(),
            Applied::Duplicate
        );
    }

    #[tokio::test]
    async fn test_apply_remote_rejects_foreign_and_corrupt_ops() {
        let (owner, _dir1) = owned_store().await;
        owner.put("/1", b"one").await.unwrap();
        let (op, blob) = owner.export_ops(0, INLINE_BLOB_LIMIT).await.unwrap().remove(0);

        let dir2 = TempDir::new().unwrap();
        let other_key = DriveKeypair::generate().public_key();
        let stranger = DriveStore::join(&dir2.path().join("ro"), other_key)
            .await
            .unwrap();
        assert!(matches!(
            stranger.apply_remote(op.clone(), blob).await,
            Err(StoreError::Protocol(_))
        ));

        let dir3 = TempDir::new().unwrap();
        let reader = DriveStore::join(&dir3.path().join("ro"), owner.public_key())
            .await
            .unwrap();
        assert!(matches!(
            reader.apply_remote(op, Some(b"tampered".to_vec())).await,
            Err(StoreError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_local_writes_refuse_non_entry_paths() {
        let (store, _dir) = owned_store().await;
        for bad in ["/docs/../../escaped.txt", "relative.txt", "/", "/a//b"] {
            assert!(matches!(
                store.put(bad, b"x").await,
                Err(StoreError::InvalidPath(_))
            ));
        }
        assert!(matches!(
            store.del("/docs/..").await,
            Err(StoreError::InvalidPath(_))
        ));
        assert_eq!(store.version().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_remote_rejects_traversal_path() {
        let dir1 = TempDir::new().unwrap();
        let keypair = DriveKeypair::generate();
        let public_key = keypair.public_key();
        // signed by the real writer, bypassing the local path check
        let data = b"outside".to_vec();
        let signed = SignedOp::sign(
            DriveOp::Put {
                seq: 1,
                path: "/docs/../../escaped.txt".into(),
                blob: Some(BlobRef::for_bytes(&data)),
                modified_at: Utc::now(),
            },
            &keypair,
        )
        .unwrap();
        DriveStore::create(&dir1.path().join("drive"), keypair).await.unwrap();

        let dir2 = TempDir::new().unwrap();
        let reader = DriveStore::join(&dir2.path().join("ro"), public_key)
            .await
            .unwrap();
        assert!(matches!(
            reader.apply_remote(signed, Some(data)).await,
            Err(StoreError::InvalidPath(_))
        ));
        assert_eq!(reader.version().unwrap(), 0);
        assert!(reader.entries().unwrap().is_empty());
        assert_eq!(reader.storage_info().unwrap().blob_bytes, 0);
    }

    #[tokio::test]
    async fn test_metadata_only_op_leaves_bytes_missing() {
        let (owner, _dir1) = owned_store().await;
        owner.put("/big.bin", &[1u8; 32]).await.unwrap();
        let (op, blob) = owner.export_ops(0, 16).await.unwrap().remove(0);
        assert!(blob.is_none());

        let dir2 = TempDir::new().unwrap();
        let reader = DriveStore::join(&dir2.path().join("ro"), owner.public_key())
            .await
            .unwrap();
        reader.apply_remote(op, None).await.unwrap();

        let entry = reader.entry("/big.bin").unwrap().unwrap();
        assert_eq!(entry.size(), 32);
        assert!(reader.read_blob(&entry.blob.unwrap()).await.unwrap().is_none());
        assert!(reader.read_stream("/big.bin").await.unwrap().is_none());
    }
}
