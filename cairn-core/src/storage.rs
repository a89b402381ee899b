//! Content-addressed block storage
//!
//! A block is `(Cid, bytes)` where the CID is derived from the bytes, so a
//! write is idempotent and a stored block never changes. Three backends share
//! the [`BlockStore`] trait: an in-memory map for tests and mirrors, an LSM
//! store on disk (fjall), and an LRU read cache that wraps either.

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::cid::Cid;
use crate::codec::{self, Value};
use crate::error::{Error, Result};

/// Content-addressed block store
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Get block bytes by CID
    async fn get(&self, cid: Cid) -> Result<Bytes>;

    /// Check if a block exists
    async fn has(&self, cid: Cid) -> Result<bool>;

    /// Store bytes under their CID; storing the same bytes twice is a no-op
    async fn put(&self, data: Bytes) -> Result<Cid>;

    /// Get several blocks. Each slot carries its own outcome, so one missing
    /// or unreadable block leaves the others intact.
    async fn get_batch(&self, cids: Vec<Cid>) -> Vec<Result<Bytes>> {
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(self.get(cid).await);
        }
        results
    }

    /// Store several blocks, in order, with one outcome per block
    async fn put_batch(&self, data: Vec<Bytes>) -> Vec<Result<Cid>> {
        let mut results = Vec::with_capacity(data.len());
        for bytes in data {
            results.push(self.put(bytes).await);
        }
        results
    }
}

/// Value-level helpers over any block store
#[async_trait]
pub trait BlockStoreExt: BlockStore {
    /// Canonically encode and store a value
    async fn put_value(&self, value: &Value) -> Result<Cid> {
        let bytes = codec::encode(value)?;
        self.put(Bytes::from(bytes)).await
    }

    /// Fetch and decode a value
    async fn get_value(&self, cid: Cid) -> Result<Value> {
        let bytes = self.get(cid).await?;
        codec::decode(&bytes)
    }

    /// Fetch and decode several values, each succeeding or failing on its own
    async fn get_values(&self, cids: Vec<Cid>) -> Vec<Result<Value>> {
        self.get_batch(cids)
            .await
            .into_iter()
            .map(|block| block.and_then(|bytes| codec::decode(&bytes)))
            .collect()
    }
}

impl<T: BlockStore + ?Sized> BlockStoreExt for T {}

/// In-memory block store
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks held
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    /// Overwrite a block without re-hashing. Only for corruption tests.
    #[cfg(test)]
    pub(crate) async fn corrupt(&self, cid: Cid, data: Bytes) {
        self.blocks.write().await.insert(cid, data);
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: Cid) -> Result<Bytes> {
        self.blocks
            .read()
            .await
            .get(&cid)
            .cloned()
            .ok_or(Error::NotFound(cid))
    }

    async fn has(&self, cid: Cid) -> Result<bool> {
        Ok(self.blocks.read().await.contains_key(&cid))
    }

    async fn put(&self, data: Bytes) -> Result<Cid> {
        let cid = Cid::for_block(&data);
        self.blocks.write().await.entry(cid).or_insert(data);
        Ok(cid)
    }
}

/// On-disk block store using an LSM tree (fjall)
pub struct FjallBlockStore {
    db: fjall::Database,
    blocks: fjall::Keyspace,
}

impl FjallBlockStore {
    /// Open or create a block store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let db = fjall::Database::builder(path)
            .open()
            .map_err(|e| Error::Storage(format!("Failed to open block store: {}", e)))?;

        let blocks = db
            .keyspace("blocks", || fjall::KeyspaceCreateOptions::default())
            .map_err(|e| Error::Storage(format!("Failed to open blocks keyspace: {}", e)))?;

        Ok(Self { db, blocks })
    }

    /// Flush to disk
    pub fn persist(&self) -> Result<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| Error::Storage(format!("Failed to persist: {}", e)))
    }
}

#[async_trait]
impl BlockStore for FjallBlockStore {
    async fn get(&self, cid: Cid) -> Result<Bytes> {
        let key = cid.to_hex();

        self.blocks
            .get(key.as_bytes())
            .map_err(|e| Error::Storage(format!("Get failed: {}", e)))?
            .map(|v| Bytes::copy_from_slice(v.as_ref()))
            .ok_or(Error::NotFound(cid))
    }

    async fn has(&self, cid: Cid) -> Result<bool> {
        let key = cid.to_hex();

        Ok(self
            .blocks
            .get(key.as_bytes())
            .map_err(|e| Error::Storage(format!("Exists check failed: {}", e)))?
            .is_some())
    }

    async fn put(&self, data: Bytes) -> Result<Cid> {
        let cid = Cid::for_block(&data);
        let key = cid.to_hex();

        if !self.has(cid).await? {
            self.blocks
                .insert(key.as_bytes(), data.as_ref())
                .map_err(|e| Error::Storage(format!("Put failed: {}", e)))?;
        }

        Ok(cid)
    }
}

/// LRU read cache in front of another store
pub struct CachedBlockStore {
    inner: Arc<dyn BlockStore>,
    cache: Mutex<LruCache<Cid, Bytes>>,
}

impl CachedBlockStore {
    pub fn new(inner: Arc<dyn BlockStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cached(&self, cid: &Cid) -> Result<Option<Bytes>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Storage("block cache lock poisoned".to_string()))?;
        Ok(cache.get(cid).cloned())
    }

    fn remember(&self, cid: Cid, data: Bytes) -> Result<()> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Storage("block cache lock poisoned".to_string()))?;
        cache.put(cid, data);
        Ok(())
    }
}

#[async_trait]
impl BlockStore for CachedBlockStore {
    async fn get(&self, cid: Cid) -> Result<Bytes> {
        if let Some(data) = self.cached(&cid)? {
            return Ok(data);
        }
        let data = self.inner.get(cid).await?;
        self.remember(cid, data.clone())?;
        Ok(data)
    }

    async fn has(&self, cid: Cid) -> Result<bool> {
        if self.cached(&cid)?.is_some() {
            return Ok(true);
        }
        self.inner.has(cid).await
    }

    async fn put(&self, data: Bytes) -> Result<Cid> {
        let cid = self.inner.put(data.clone()).await?;
        self.remember(cid, data)?;
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn note(text: &str) -> Value {
        Value::from_pairs([("text", Value::from(text))])
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryBlockStore::new();
        let a = store.put_value(&note("hi")).await.unwrap();
        let b = store.put_value(&note("hi")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get_value(a).await.unwrap(), note("hi"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryBlockStore::new();
        let cid = Cid::for_block(b"nothing");
        assert!(matches!(store.get(cid).await, Err(Error::NotFound(c)) if c == cid));
        assert!(!store.has(cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_rejects_non_finite() {
        let store = MemoryBlockStore::new();
        let value = Value::from_pairs([("x", Value::Float(f64::NAN))]);
        assert!(matches!(store.put_value(&value).await, Err(Error::Encoding(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let store = MemoryBlockStore::new();
        let good = store.put_value(&note("good")).await.unwrap();
        let corrupt = store.put_value(&note("corrupt")).await.unwrap();
        store.corrupt(corrupt, Bytes::from_static(&[0xff, 0x00])).await;
        let missing = Cid::for_block(b"missing");

        let results = store.get_values(vec![good, missing, corrupt]).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &note("good"));
        assert!(matches!(results[1], Err(Error::NotFound(_))));
        assert!(matches!(results[2], Err(Error::Decoding(_))));
    }

    /// Fails reads of one block with a storage fault
    struct FlakyStore {
        inner: MemoryBlockStore,
        broken: Cid,
    }

    #[async_trait]
    impl BlockStore for FlakyStore {
        async fn get(&self, cid: Cid) -> Result<Bytes> {
            if cid == self.broken {
                return Err(Error::Storage("read fault".to_string()));
            }
            self.inner.get(cid).await
        }

        async fn has(&self, cid: Cid) -> Result<bool> {
            self.inner.has(cid).await
        }

        async fn put(&self, data: Bytes) -> Result<Cid> {
            self.inner.put(data).await
        }
    }

    #[tokio::test]
    async fn test_batch_continues_past_storage_fault() {
        let inner = MemoryBlockStore::new();
        let first = inner.put(Bytes::from_static(b"first")).await.unwrap();
        let broken = inner.put(Bytes::from_static(b"broken")).await.unwrap();
        let last = inner.put(Bytes::from_static(b"last")).await.unwrap();
        let store = FlakyStore { inner, broken };

        let batch = store.get_batch(vec![first, broken, last]).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].as_deref().ok(), Some(&b"first"[..]));
        assert!(matches!(batch[1], Err(Error::Storage(_))));
        assert_eq!(batch[2].as_deref().ok(), Some(&b"last"[..]));
    }

    #[tokio::test]
    async fn test_fjall_store_persists() {
        let dir = TempDir::new().unwrap();
        let cid = {
            let store = FjallBlockStore::open(dir.path()).unwrap();
            let cid = store.put_value(&note("disk")).await.unwrap();
            store.persist().unwrap();
            cid
        };
        let store = FjallBlockStore::open(dir.path()).unwrap();
        assert!(store.has(cid).await.unwrap());
        assert_eq!(store.get_value(cid).await.unwrap(), note("disk"));
    }

    #[tokio::test]
    async fn test_cache_serves_reads() {
        let inner = Arc::new(MemoryBlockStore::new());
        let cached = CachedBlockStore::new(inner.clone(), 2);
        let cids = cached
            .put_batch(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")])
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        for cid in &cids {
            assert!(cached.has(*cid).await.unwrap());
        }
        let batch = cached.get_batch(cids.clone()).await;
        assert_eq!(batch[2].as_deref().ok(), Some(&b"c"[..]));
        assert_eq!(inner.len().await, 3);
    }
}
