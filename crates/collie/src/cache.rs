//! Write-back LRU object cache.
//!
//! Caches whole backing objects in memory. Writes land in the cache and
//! are written back later; reads check the cache before falling through
//! to the object store.
//!
//! The cache uses:
//! - `dashmap` for concurrent access from multiple tasks
//! - `lru::LruCache` for eviction ordering (wrapped in a mutex)
//!
//! When the volume is journaled, a dirty entry remembers the journal
//! tids covering its unwritten bytes. Writeback waits until those
//! events are safe, then acknowledges the extents back to the journal
//! coordinator once the object write lands. This keeps the write-ahead
//! invariant: no data reaches the store before its journal record is
//! durable.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use collie_proto::{ObjectId, SnapContext, VolError, VolResult, SNAP_HEAD};
use dashmap::DashMap;
use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::journal::Journal;
use crate::store::ObjectStore;

/// A journal extent acknowledgment owed once the entry is written back:
/// (tid, image offset, image length).
type PendingCommit = (u64, u64, u64);

/// A single cached object.
#[derive(Debug, Clone)]
struct CacheEntry {
    oid: ObjectId,
    /// Object content from offset 0. May be shorter than the object
    /// size; the tail reads as zeroes.
    data: Vec<u8>,
    /// Modified since last writeback.
    dirty: bool,
    /// Journal extents to acknowledge after writeback.
    pending_commits: Vec<PendingCommit>,
    /// Monotonic access counter for stats.
    last_access: u64,
}

/// Statistics about cache usage.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub dirty: usize,
    pub bytes_cached: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

/// Write-back LRU object cache, keyed by object number.
pub struct ObjectCache {
    data: DashMap<u64, CacheEntry>,
    /// LRU tracker. Protected by a mutex since LruCache is not Sync.
    lru: Mutex<LruCache<u64, ()>>,
    capacity: usize,
    object_size: u64,
    access_counter: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writeback_count: AtomicU64,
}

impl ObjectCache {
    /// Create a cache holding up to `capacity` objects.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize, object_size: u64) -> Self {
        let cap = NonZeroUsize::new(capacity).expect("cache capacity must be > 0");
        Self {
            data: DashMap::with_capacity(capacity),
            lru: Mutex::new(LruCache::new(cap)),
            capacity,
            object_size,
            access_counter: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writeback_count: AtomicU64::new(0),
        }
    }

    /// Read `length` bytes at `offset` within an object, populating the
    /// cache from the store on miss. A short return means the object
    /// ends inside the range; the caller zero-fills.
    pub async fn read(
        &self,
        store: &Arc<dyn ObjectStore>,
        oid: &ObjectId,
        object_no: u64,
        offset: u64,
        length: u64,
    ) -> VolResult<Bytes> {
        if let Some(mut entry) = self.data.get_mut(&object_no) {
            let access = self.access_counter.fetch_add(1, Ordering::Relaxed);
            entry.last_access = access;
            let slice = Self::slice_entry(&entry, offset, length);
            drop(entry);
            if let Ok(mut lru) = self.lru.lock() {
                lru.get(&object_no);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(slice);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = match store.read(oid, 0, self.object_size, SNAP_HEAD).await {
            Ok(data) => data.to_vec(),
            Err(VolError::NoObject) => Vec::new(),
            Err(e) => return Err(e),
        };
        let entry = self.insert_entry(oid, object_no, data, false);
        Ok(Self::slice_entry(&entry, offset, length))
    }

    /// Apply a write to the cached object, fetching it from the store
    /// first when absent. `journal_commits` records the extent
    /// acknowledgments owed to the journal after writeback.
    pub async fn write(
        &self,
        store: &Arc<dyn ObjectStore>,
        oid: &ObjectId,
        object_no: u64,
        offset: u64,
        data: &[u8],
        journal_commits: Vec<PendingCommit>,
    ) -> VolResult<()> {
        if !self.data.contains_key(&object_no) {
            let existing = match store.read(oid, 0, self.object_size, SNAP_HEAD).await {
                Ok(data) => data.to_vec(),
                Err(VolError::NoObject) => Vec::new(),
                Err(e) => return Err(e),
            };
            self.insert_entry(oid, object_no, existing, false);
        }

        let mut entry = self
            .data
            .get_mut(&object_no)
            .ok_or(VolError::Io)?;
        let end = offset as usize + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset as usize..end].copy_from_slice(data);
        entry.dirty = true;
        entry.pending_commits.extend(journal_commits);
        entry.last_access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        drop(entry);

        if let Ok(mut lru) = self.lru.lock() {
            lru.get(&object_no);
        }
        trace!(oid = %oid, offset, len = data.len(), "cache write");
        Ok(())
    }

    /// Drop an object from the cache (discard invalidation). Returns the
    /// journal acknowledgments the entry still owed; the caller settles
    /// them, since the discarded data will never be written back.
    pub fn purge(&self, object_no: u64) -> Vec<PendingCommit> {
        if let Ok(mut lru) = self.lru.lock() {
            lru.pop(&object_no);
        }
        match self.data.remove(&object_no) {
            Some((_, entry)) => entry.pending_commits,
            None => Vec::new(),
        }
    }

    /// Write every dirty entry back to the store.
    ///
    /// With a journal, each entry first waits for its covering events to
    /// turn safe, and acknowledges their extents once the object write
    /// lands.
    pub async fn writeback(
        &self,
        store: &Arc<dyn ObjectStore>,
        journal: Option<&Arc<Journal>>,
    ) -> VolResult<()> {
        let dirty: Vec<(u64, ObjectId, Vec<u8>, Vec<PendingCommit>)> = self
            .data
            .iter_mut()
            .filter(|e| e.dirty)
            .map(|mut e| {
                e.dirty = false;
                let commits = std::mem::take(&mut e.pending_commits);
                (*e.key(), e.oid.clone(), e.data.clone(), commits)
            })
            .collect();

        if dirty.is_empty() {
            return Ok(());
        }
        self.writeback_count.fetch_add(1, Ordering::Relaxed);
        debug!(entries = dirty.len(), "cache writeback");

        let snapc = SnapContext::default();
        for (object_no, oid, data, commits) in dirty {
            if let Some(journal) = journal {
                for &(tid, _, _) in &commits {
                    journal.wait_event_safe(tid).await;
                }
            }
            match store
                .write(&oid, 0, Bytes::from(data), &snapc)
                .await
            {
                Ok(()) => {
                    if let Some(journal) = journal {
                        for (tid, off, len) in commits {
                            journal.commit_event_extent(tid, off, len, 0);
                        }
                    }
                }
                Err(e) => {
                    // Mark dirty again since writeback failed.
                    if let Some(mut entry) = self.data.get_mut(&object_no) {
                        entry.dirty = true;
                        entry.pending_commits.extend(commits);
                    }
                    warn!(oid = %oid, error = %e, "cache writeback failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Write back all dirty entries and flush the store.
    pub async fn flush(
        &self,
        store: &Arc<dyn ObjectStore>,
        journal: Option<&Arc<Journal>>,
    ) -> VolResult<()> {
        self.writeback(store, journal).await?;
        store.flush().await
    }

    fn insert_entry(
        &self,
        oid: &ObjectId,
        object_no: u64,
        data: Vec<u8>,
        dirty: bool,
    ) -> CacheEntry {
        if self.data.len() >= self.capacity && !self.data.contains_key(&object_no) {
            self.evict_one();
        }
        let entry = CacheEntry {
            oid: oid.clone(),
            data,
            dirty,
            pending_commits: Vec::new(),
            last_access: self.access_counter.fetch_add(1, Ordering::Relaxed),
        };
        self.data.insert(object_no, entry.clone());
        if let Ok(mut lru) = self.lru.lock() {
            lru.put(object_no, ());
        }
        entry
    }

    /// Evict one clean entry, LRU first. Dirty entries are never evicted
    /// here: their writeback may still be gated on the journal, so the
    /// cache runs over capacity instead and writeback drains it.
    fn evict_one(&self) {
        let Ok(mut lru) = self.lru.lock() else { return };
        let keys: Vec<u64> = lru.iter().rev().map(|(k, _)| *k).collect();
        for key in keys {
            let clean = self.data.get(&key).map_or(true, |e| !e.dirty);
            if clean {
                self.data.remove(&key);
                lru.pop(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(object_no = key, "cache evicted clean entry");
                return;
            }
        }
        warn!("cache over capacity: all entries dirty");
    }

    fn slice_entry(entry: &CacheEntry, offset: u64, length: u64) -> Bytes {
        let start = (offset as usize).min(entry.data.len());
        let end = ((offset + length) as usize).min(entry.data.len());
        Bytes::copy_from_slice(&entry.data[start..end])
    }

    pub fn stats(&self) -> CacheStats {
        let dirty = self.data.iter().filter(|e| e.dirty).count();
        let bytes_cached: u64 = self.data.iter().map(|e| e.data.len() as u64).sum();
        CacheStats {
            entries: self.data.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dirty,
            bytes_cached,
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writeback_count.load(Ordering::Relaxed),
        }
    }

    pub fn contains(&self, object_no: u64) -> bool {
        self.data.contains_key(&object_no)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn oid(n: u64) -> ObjectId {
        ObjectId::new("p", n)
    }

    fn store_of(mem: Arc<MemStore>) -> Arc<dyn ObjectStore> {
        mem
    }

    #[tokio::test]
    async fn test_read_miss_populates_from_store() {
        let mem = Arc::new(MemStore::new(4096));
        let store = store_of(mem.clone());
        mem.write(&oid(0), 0, Bytes::from_static(b"hello"), &SnapContext::default())
            .await
            .unwrap();

        let cache = ObjectCache::new(10, 4096);
        let data = cache.read(&store, &oid(0), 0, 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(cache.contains(0));

        // Second read is a hit.
        cache.read(&store, &oid(0), 0, 0, 5).await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_read_of_missing_object_is_short() {
        let store = store_of(Arc::new(MemStore::new(4096)));
        let cache = ObjectCache::new(10, 4096);
        let data = cache.read(&store, &oid(7), 7, 0, 100).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_write_is_dirty_until_writeback() {
        let mem = Arc::new(MemStore::new(4096));
        let store = store_of(mem.clone());
        let cache = ObjectCache::new(10, 4096);

        cache
            .write(&store, &oid(0), 0, 100, b"data", Vec::new())
            .await
            .unwrap();
        assert_eq!(cache.stats().dirty, 1);
        assert!(!mem.contains(&oid(0)));

        // The cache serves its own dirty data.
        let data = cache.read(&store, &oid(0), 0, 100, 4).await.unwrap();
        assert_eq!(&data[..], b"data");

        cache.writeback(&store, None).await.unwrap();
        assert_eq!(cache.stats().dirty, 0);
        let stored = mem
            .read(&oid(0), 100, 4, SNAP_HEAD)
            .await
            .unwrap();
        assert_eq!(&stored[..], b"data");
    }

    #[tokio::test]
    async fn test_write_miss_preserves_existing_object_bytes() {
        let mem = Arc::new(MemStore::new(4096));
        let store = store_of(mem.clone());
        mem.write(&oid(0), 0, Bytes::from_static(b"aaaa"), &SnapContext::default())
            .await
            .unwrap();

        let cache = ObjectCache::new(10, 4096);
        cache.write(&store, &oid(0), 0, 2, b"bb", Vec::new()).await.unwrap();
        cache.writeback(&store, None).await.unwrap();

        let stored = mem.read(&oid(0), 0, 4, SNAP_HEAD).await.unwrap();
        assert_eq!(&stored[..], b"aabb");
    }

    #[tokio::test]
    async fn test_purge_returns_pending_commits() {
        let store = store_of(Arc::new(MemStore::new(4096)));
        let cache = ObjectCache::new(10, 4096);
        cache
            .write(&store, &oid(0), 0, 0, b"x", vec![(3, 0, 1)])
            .await
            .unwrap();
        let commits = cache.purge(0);
        assert_eq!(commits, vec![(3, 0, 1)]);
        assert!(cache.is_empty());
        assert!(cache.purge(0).is_empty());
    }

    #[tokio::test]
    async fn test_clean_entries_evicted_lru_first() {
        let mem = Arc::new(MemStore::new(4096));
        let store = store_of(mem.clone());
        for i in 0..3u64 {
            mem.write(&oid(i), 0, Bytes::from(vec![i as u8]), &SnapContext::default())
                .await
                .unwrap();
        }

        let cache = ObjectCache::new(2, 4096);
        cache.read(&store, &oid(0), 0, 0, 1).await.unwrap();
        cache.read(&store, &oid(1), 1, 0, 1).await.unwrap();
        cache.read(&store, &oid(2), 2, 0, 1).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(0));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_dirty_entries_survive_eviction_pressure() {
        let store = store_of(Arc::new(MemStore::new(4096)));
        let cache = ObjectCache::new(2, 4096);
        cache.write(&store, &oid(0), 0, 0, b"a", Vec::new()).await.unwrap();
        cache.write(&store, &oid(1), 1, 0, b"b", Vec::new()).await.unwrap();
        cache.write(&store, &oid(2), 2, 0, b"c", Vec::new()).await.unwrap();
        // All dirty: nothing evictable, cache runs over capacity.
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().dirty, 3);
    }
}
