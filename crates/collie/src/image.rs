//! Image context — the long-lived handle for one open volume.
//!
//! Holds the volume identity, striping layout, snapshot state, and the
//! three reader/writer locks that order all I/O:
//!
//! - `owner_lock`: read-shared by in-flight operations, write-exclusive
//!   during lock-ownership transitions and close.
//! - `md_lock`: read-shared by writers, write-exclusive while the
//!   journal opens or closes.
//! - snap lock: read-shared while sampling the snapshot id and clipping
//!   lengths, write-exclusive during snapshot mutation.
//!
//! Lock order is owner → md → snap; never acquire leftward while
//! holding a lock to the right.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use collie_proto::{SnapContext, SnapId, StripingLayout, VolError, VolResult, SNAP_HEAD};
use tokio::sync::{oneshot, Notify, RwLock, RwLockReadGuard};
use tracing::{info, trace, warn};

use crate::cache::ObjectCache;
use crate::completion::AioCompletion;
use crate::config::ImageOptions;
use crate::journal::{Journal, JournalState};
use crate::journaler::Journaler;
use crate::store::ObjectStore;
use crate::watcher::ImageWatcher;
use crate::work_queue::ImageRequestWQ;

/// Snapshot-scoped volume state, guarded by the snap lock.
#[derive(Debug, Clone)]
pub struct SnapState {
    /// Currently selected snapshot, or [`SNAP_HEAD`] for the writable head.
    pub snap_id: SnapId,
    /// Volume size in bytes, sampled once per request under the snap lock.
    pub size: u64,
    /// The volume was opened read-only.
    pub read_only: bool,
    /// Snapshot context carried by every write.
    pub snapc: SnapContext,
}

/// Clip a request length against the volume size sampled under the snap
/// lock: `max(0, size - offset)` bytes are accepted.
pub fn clip_io(snap: &SnapState, offset: u64, length: u64) -> u64 {
    length.min(snap.size.saturating_sub(offset))
}

struct Waiter {
    pending: HashSet<u64>,
    tx: Option<oneshot::Sender<()>>,
}

/// Tracks mutating image requests from submission entry until their
/// object-store writes have been handed off, so a flush can wait for
/// everything that was in flight when it arrived.
///
/// The waiter's snapshot of in-flight ids is taken under the same lock
/// that registers new operations, so a flush either sees a concurrent
/// submission completely or not at all.
#[derive(Default)]
pub struct AsyncOpTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    next_id: u64,
    in_flight: HashSet<u64>,
    waiters: Vec<Waiter>,
}

impl AsyncOpTracker {
    pub fn start_op(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.in_flight.insert(id);
        id
    }

    pub fn finish_op(&self, id: u64) {
        let ready: Vec<oneshot::Sender<()>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(&id);
            let mut ready = Vec::new();
            for waiter in &mut inner.waiters {
                waiter.pending.remove(&id);
                if waiter.pending.is_empty() {
                    if let Some(tx) = waiter.tx.take() {
                        ready.push(tx);
                    }
                }
            }
            inner.waiters.retain(|w| w.tx.is_some());
            ready
        };
        for tx in ready {
            let _ = tx.send(());
        }
    }

    /// Register a waiter for the operations currently in flight. `None`
    /// means there is nothing to wait for.
    fn flush_waiter(&self) -> Option<oneshot::Receiver<()>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_flight.is_empty() {
            return None;
        }
        let pending = inner.in_flight.clone();
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(Waiter { pending, tx: Some(tx) });
        Some(rx)
    }
}

/// The long-lived handle for one open volume.
pub struct ImageCtx {
    /// Volume name, for logging.
    pub name: String,
    /// Volume id; backing object names derive from it.
    pub id: String,
    /// Prefix of every backing object name.
    pub object_prefix: String,
    pub layout: StripingLayout,
    pub opts: ImageOptions,

    pub owner_lock: RwLock<()>,
    pub md_lock: RwLock<()>,
    snap_lock: RwLock<SnapState>,

    pub store: Arc<dyn ObjectStore>,
    pub cache: Option<Arc<ObjectCache>>,
    pub journal: Option<Arc<Journal>>,
    pub watcher: Arc<dyn ImageWatcher>,

    ops: AsyncOpTracker,
}

impl ImageCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        id: String,
        size: u64,
        layout: StripingLayout,
        opts: ImageOptions,
        store: Arc<dyn ObjectStore>,
        watcher: Arc<dyn ImageWatcher>,
        cache: Option<Arc<ObjectCache>>,
        journal: Option<Arc<Journal>>,
    ) -> Arc<Self> {
        let object_prefix = format!("vol_data.{}", id);
        Arc::new(Self {
            name,
            id,
            object_prefix,
            layout,
            opts,
            owner_lock: RwLock::new(()),
            md_lock: RwLock::new(()),
            snap_lock: RwLock::new(SnapState {
                snap_id: SNAP_HEAD,
                size,
                read_only: false,
                snapc: SnapContext::default(),
            }),
            store,
            cache,
            journal,
            watcher,
            ops: AsyncOpTracker::default(),
        })
    }

    /// Sample the snapshot state. Read-shared; hold it across clipping
    /// and extent mapping so the size cannot change mid-request.
    pub async fn snap_read(&self) -> RwLockReadGuard<'_, SnapState> {
        self.snap_lock.read().await
    }

    /// Select a snapshot (or [`SNAP_HEAD`]). Write-exclusive on the snap
    /// lock.
    pub async fn set_snap(&self, snap_id: SnapId) {
        self.snap_lock.write().await.snap_id = snap_id;
    }

    pub async fn set_read_only(&self, read_only: bool) {
        self.snap_lock.write().await.read_only = read_only;
    }

    /// Record a mutating request as in flight. Pair with
    /// [`finish_async_op`](Self::finish_async_op) once its object-store
    /// writes are submitted.
    pub fn start_async_op(&self) -> u64 {
        let id = self.ops.start_op();
        trace!(image = %self.name, id, "async op start");
        id
    }

    pub fn finish_async_op(&self, id: u64) {
        trace!(image = %self.name, id, "async op finish");
        self.ops.finish_op(id);
    }

    /// Wait until every currently recorded in-flight request has
    /// submitted its object-store writes.
    pub async fn flush_async_operations(&self) {
        if let Some(rx) = self.ops.flush_waiter() {
            let _ = rx.await;
        }
    }
}

/// An open volume: the public API surface.
///
/// Wires the image context, journal, cache, and work queue together and
/// tears them down in order on close.
pub struct Image {
    ctx: Arc<ImageCtx>,
    wq: Arc<ImageRequestWQ>,
    writeback_stop: Option<Arc<Notify>>,
}

impl Image {
    /// Open a volume of `size` bytes over the given store.
    ///
    /// With a journaler, the journal is opened and replayed before any
    /// I/O is accepted; a journal that fails to open fails the whole
    /// open.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        name: impl Into<String>,
        id: impl Into<String>,
        size: u64,
        layout: StripingLayout,
        opts: ImageOptions,
        store: Arc<dyn ObjectStore>,
        watcher: Arc<dyn ImageWatcher>,
        journaler: Option<Arc<dyn Journaler>>,
    ) -> VolResult<Self> {
        layout.validate()?;
        let name = name.into();
        let id = id.into();
        let object_prefix = format!("vol_data.{}", id);

        let cache = (opts.cache_objects > 0)
            .then(|| Arc::new(ObjectCache::new(opts.cache_objects, layout.object_size)));
        let journal = journaler
            .map(|journaler| Journal::new(journaler, store.clone(), layout, object_prefix));

        let ctx = ImageCtx::new(
            name, id, size, layout, opts, store, watcher, cache, journal.clone(),
        );

        if let Some(journal) = &journal {
            journal.open();
            if journal.wait_until_steady().await == JournalState::Closed {
                return Err(journal.last_error().unwrap_or(VolError::Io));
            }
        }

        let wq = ImageRequestWQ::new(ctx.clone());
        let writeback_stop = ctx.cache.as_ref().map(|cache| {
            let stop = Arc::new(Notify::new());
            Self::spawn_writeback_loop(&ctx, cache.clone(), stop.clone());
            stop
        });

        info!(image = %ctx.name, size, "image opened");
        Ok(Self { ctx, wq, writeback_stop })
    }

    /// Periodic background writeback of the cache's dirty set.
    fn spawn_writeback_loop(ctx: &Arc<ImageCtx>, cache: Arc<ObjectCache>, stop: Arc<Notify>) {
        let store = ctx.store.clone();
        let journal = ctx.journal.clone();
        let interval = ctx.opts.cache_writeback_interval;
        let image = ctx.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.writeback(&store, journal.as_ref()).await {
                            warn!(image = %image, error = %e, "background writeback failed");
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        });
    }

    pub fn ctx(&self) -> &Arc<ImageCtx> {
        &self.ctx
    }

    pub async fn aio_read(&self, comp: Arc<AioCompletion>, offset: u64, length: u64, op_flags: u32) {
        self.wq.aio_read(comp, offset, length, op_flags).await;
    }

    pub async fn aio_read_vectored(
        &self,
        comp: Arc<AioCompletion>,
        extents: Vec<(u64, u64)>,
        op_flags: u32,
    ) {
        self.wq.aio_read_vectored(comp, extents, op_flags).await;
    }

    pub async fn aio_write(&self, comp: Arc<AioCompletion>, offset: u64, data: Bytes, op_flags: u32) {
        self.wq.aio_write(comp, offset, data, op_flags).await;
    }

    pub async fn aio_discard(&self, comp: Arc<AioCompletion>, offset: u64, length: u64) {
        self.wq.aio_discard(comp, offset, length).await;
    }

    pub async fn aio_flush(&self, comp: Arc<AioCompletion>) {
        self.wq.aio_flush(comp).await;
    }

    /// Blocking read.
    pub async fn read(&self, offset: u64, length: u64, op_flags: u32) -> VolResult<Vec<u8>> {
        self.wq.read(offset, length, op_flags).await
    }

    /// Blocking write; returns the accepted byte count.
    pub async fn write(&self, offset: u64, data: Bytes, op_flags: u32) -> VolResult<u64> {
        self.wq.write(offset, data, op_flags).await
    }

    /// Blocking discard; returns the accepted byte count.
    pub async fn discard(&self, offset: u64, length: u64) -> VolResult<u64> {
        self.wq.discard(offset, length).await
    }

    /// Blocking flush.
    pub async fn flush(&self) -> VolResult<()> {
        self.wq.flush().await
    }

    /// Suspend write dispatch (lock handover). Returns once no write is
    /// executing.
    pub async fn suspend_writes(&self) {
        self.wq.suspend_writes().await;
    }

    pub fn resume_writes(&self) {
        self.wq.resume_writes();
    }

    /// Signal from the watcher that the distributed lock was acquired.
    pub fn handle_lock_acquired(&self) {
        self.wq.handle_lock_acquired();
    }

    /// Close the volume: drain the queue, flush the cache, stop the
    /// journal, flush the store.
    pub async fn close(&self) -> VolResult<()> {
        info!(image = %self.ctx.name, "closing image");
        if let Some(stop) = &self.writeback_stop {
            stop.notify_waiters();
        }
        self.wq.shut_down().await;
        {
            // Blocks until every in-flight operation has released its
            // read hold.
            let _owner = self.ctx.owner_lock.write().await;
        }
        if let Some(cache) = &self.ctx.cache {
            cache.flush(&self.ctx.store, self.ctx.journal.as_ref()).await?;
        }
        if let Some(journal) = &self.ctx.journal {
            // Writers hold this shared; exclusive here keeps the journal
            // teardown invisible to them.
            let _md = self.ctx.md_lock.write().await;
            journal.close().await?;
        }
        self.ctx.store.flush().await
    }
}
