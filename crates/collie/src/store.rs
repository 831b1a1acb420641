//! Object store abstraction.
//!
//! The `ObjectStore` trait is the seam between the I/O core and the
//! backing store's transport. Reads of absent objects report
//! `VolError::NoObject`; the read path converts that into zeroes, which
//! is the defined semantic for unwritten ranges of a volume. Writes
//! carry the snapshot context they must be visible to.
//!
//! `MemStore` is the in-process implementation, used for standalone
//! volumes and throughout the test suite.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use collie_proto::{ObjectId, SnapContext, SnapId, VolError, VolResult};
use dashmap::DashMap;
use tracing::trace;

/// Backing store interface for per-object I/O.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Read up to `length` bytes at `offset` from an object as it existed
    /// at `snap_id`. A short return means the object ends inside the
    /// range; the caller zero-fills. Absent objects are `NoObject`.
    async fn read(
        &self,
        oid: &ObjectId,
        offset: u64,
        length: u64,
        snap_id: SnapId,
    ) -> VolResult<Bytes>;

    /// Write `data` at `offset`, creating the object if needed.
    async fn write(
        &self,
        oid: &ObjectId,
        offset: u64,
        data: Bytes,
        snapc: &SnapContext,
    ) -> VolResult<()>;

    /// Zero an interior range of an object. Absent objects are left
    /// absent.
    async fn zero(
        &self,
        oid: &ObjectId,
        offset: u64,
        length: u64,
        snapc: &SnapContext,
    ) -> VolResult<()>;

    /// Truncate an object down to `offset` bytes.
    async fn truncate(&self, oid: &ObjectId, offset: u64, snapc: &SnapContext) -> VolResult<()>;

    /// Remove an object. Absent objects are `NoObject`.
    async fn remove(&self, oid: &ObjectId, snapc: &SnapContext) -> VolResult<()>;

    /// Flush all acknowledged writes to stable storage.
    async fn flush(&self) -> VolResult<()>;
}

/// Operation counters, mostly of interest to tests and stats reporting.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub zeros: AtomicU64,
    pub truncates: AtomicU64,
    pub removes: AtomicU64,
    pub flushes: AtomicU64,
}

impl StoreStats {
    /// Total mutating operations observed.
    pub fn mutations(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
            + self.zeros.load(Ordering::Relaxed)
            + self.truncates.load(Ordering::Relaxed)
            + self.removes.load(Ordering::Relaxed)
    }
}

/// In-memory object store keyed by object name.
pub struct MemStore {
    objects: DashMap<String, Vec<u8>>,
    object_size: u64,
    stats: StoreStats,
}

impl MemStore {
    pub fn new(object_size: u64) -> Self {
        Self {
            objects: DashMap::new(),
            object_size,
            stats: StoreStats::default(),
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Whether an object currently exists.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.objects.contains_key(oid.name())
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn check_range(&self, offset: u64, length: u64) -> VolResult<()> {
        if offset + length > self.object_size {
            return Err(VolError::InvalidParam);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    fn name(&self) -> &str {
        "mem"
    }

    async fn read(
        &self,
        oid: &ObjectId,
        offset: u64,
        length: u64,
        _snap_id: SnapId,
    ) -> VolResult<Bytes> {
        self.check_range(offset, length)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let obj = self.objects.get(oid.name()).ok_or(VolError::NoObject)?;
        let start = (offset as usize).min(obj.len());
        let end = ((offset + length) as usize).min(obj.len());
        trace!(oid = %oid, offset, length, have = obj.len(), "mem read");
        Ok(Bytes::copy_from_slice(&obj[start..end]))
    }

    async fn write(
        &self,
        oid: &ObjectId,
        offset: u64,
        data: Bytes,
        _snapc: &SnapContext,
    ) -> VolResult<()> {
        self.check_range(offset, data.len() as u64)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut obj = self.objects.entry(oid.name().to_string()).or_default();
        let end = offset as usize + data.len();
        if obj.len() < end {
            obj.resize(end, 0);
        }
        obj[offset as usize..end].copy_from_slice(&data);
        Ok(())
    }

    async fn zero(
        &self,
        oid: &ObjectId,
        offset: u64,
        length: u64,
        _snapc: &SnapContext,
    ) -> VolResult<()> {
        self.check_range(offset, length)?;
        self.stats.zeros.fetch_add(1, Ordering::Relaxed);
        if let Some(mut obj) = self.objects.get_mut(oid.name()) {
            let start = (offset as usize).min(obj.len());
            let end = ((offset + length) as usize).min(obj.len());
            obj[start..end].fill(0);
        }
        Ok(())
    }

    async fn truncate(&self, oid: &ObjectId, offset: u64, _snapc: &SnapContext) -> VolResult<()> {
        self.check_range(offset, 0)?;
        self.stats.truncates.fetch_add(1, Ordering::Relaxed);
        if let Some(mut obj) = self.objects.get_mut(oid.name()) {
            if obj.len() > offset as usize {
                obj.truncate(offset as usize);
            }
        }
        Ok(())
    }

    async fn remove(&self, oid: &ObjectId, _snapc: &SnapContext) -> VolResult<()> {
        self.stats.removes.fetch_add(1, Ordering::Relaxed);
        self.objects
            .remove(oid.name())
            .map(|_| ())
            .ok_or(VolError::NoObject)
    }

    async fn flush(&self) -> VolResult<()> {
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
