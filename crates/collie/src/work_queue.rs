//! Request work queue — queue-and-dispatch for image requests.
//!
//! Requests either run inline on the caller's task (when non-blocking
//! mode is off and nothing gates them) or are queued for the worker
//! pool. Writes are accounted under the queue lock: the transition from
//! zero to one queued write raises the watcher's "async ops pending"
//! flag, the transition back clears it.
//!
//! Dispatch gating: a write at the head of the queue is held while
//! writes are suspended, while the distributed lock is supported but not
//! owned, or while the journal is still opening. Reads at the head are
//! never held. The peek-and-dequeue is atomic with the accounting mutex:
//! `in_progress_writes` is incremented before the item leaves the queue,
//! so a concurrent `suspend_writes` either observes the increment and
//! waits, or finds the item still queued and blocks its dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use collie_proto::{VolError, VolResult};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::completion::AioCompletion;
use crate::image::ImageCtx;
use crate::image_request::ImageRequest;

struct QueuedRequest {
    req: ImageRequest,
    comp: Arc<AioCompletion>,
}

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<QueuedRequest>,
    queued_writes: u64,
    in_progress_writes: u64,
    writes_suspended: bool,
}

/// Work queue for one image.
pub struct ImageRequestWQ {
    ctx: Arc<ImageCtx>,
    inner: Mutex<QueueInner>,
    /// Wakes workers when the queue or a dispatch gate changes.
    dispatch: Notify,
    /// Wakes `suspend_writes` when `in_progress_writes` reaches zero.
    drained: Notify,
    /// Wakes `drain` when the queue empties.
    queue_empty: Notify,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ImageRequestWQ {
    pub fn new(ctx: Arc<ImageCtx>) -> Arc<Self> {
        let wq = Arc::new(Self {
            ctx,
            inner: Mutex::new(QueueInner::default()),
            dispatch: Notify::new(),
            drained: Notify::new(),
            queue_empty: Notify::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = wq.workers.lock().unwrap();
        for _ in 0..wq.ctx.opts.queue_workers.max(1) {
            let worker = wq.clone();
            workers.push(tokio::spawn(worker.worker_loop()));
        }
        drop(workers);

        // Writes are held while the journal opens; kick the workers once
        // it settles.
        if let Some(journal) = wq.ctx.journal.clone() {
            let wq2 = wq.clone();
            tokio::spawn(async move {
                journal.wait_until_steady().await;
                wq2.dispatch.notify_waiters();
            });
        }
        wq
    }

    /// Submit an asynchronous read of one byte range.
    pub async fn aio_read(
        self: &Arc<Self>,
        comp: Arc<AioCompletion>,
        offset: u64,
        length: u64,
        op_flags: u32,
    ) {
        self.aio_read_vectored(comp, vec![(offset, length)], op_flags).await;
    }

    /// Submit an asynchronous read of several byte ranges; gathered
    /// bytes land back to back in the destination buffer.
    pub async fn aio_read_vectored(
        self: &Arc<Self>,
        comp: Arc<AioCompletion>,
        extents: Vec<(u64, u64)>,
        op_flags: u32,
    ) {
        trace!(image = %self.ctx.name, ranges = extents.len(), "aio_read");
        {
            let _owner = self.ctx.owner_lock.read().await;
        }
        let req = ImageRequest::Read { extents, op_flags };
        if self.ctx.opts.non_blocking_aio {
            self.queue_request(req, comp);
        } else {
            req.send(&self.ctx, &comp).await;
        }
    }

    /// Submit an asynchronous write.
    pub async fn aio_write(
        self: &Arc<Self>,
        comp: Arc<AioCompletion>,
        offset: u64,
        data: Bytes,
        op_flags: u32,
    ) {
        trace!(image = %self.ctx.name, offset, len = data.len(), "aio_write");
        self.submit_mutating(ImageRequest::Write { offset, data, op_flags }, comp).await;
    }

    /// Submit an asynchronous discard.
    pub async fn aio_discard(self: &Arc<Self>, comp: Arc<AioCompletion>, offset: u64, length: u64) {
        trace!(image = %self.ctx.name, offset, length, "aio_discard");
        self.submit_mutating(ImageRequest::Discard { offset, length }, comp).await;
    }

    async fn submit_mutating(self: &Arc<Self>, req: ImageRequest, comp: Arc<AioCompletion>) {
        let lock_required = {
            let _owner = self.ctx.owner_lock.read().await;
            self.is_lock_required()
        };
        let journal_opening = self
            .ctx
            .journal
            .as_ref()
            .map_or(false, |journal| journal.is_opening());

        if self.ctx.opts.non_blocking_aio || lock_required || journal_opening {
            self.queue_request(req, comp);
            if lock_required {
                // Tell the arbiter we want the lock; dispatch resumes via
                // handle_lock_acquired.
                self.ctx.watcher.request_lock();
            }
        } else {
            req.send(&self.ctx, &comp).await;
        }
    }

    /// Submit an asynchronous flush.
    pub async fn aio_flush(self: &Arc<Self>, comp: Arc<AioCompletion>) {
        trace!(image = %self.ctx.name, "aio_flush");
        {
            let _owner = self.ctx.owner_lock.read().await;
        }
        let writes_queued = self.inner.lock().unwrap().queued_writes > 0;
        let req = ImageRequest::Flush;
        if self.ctx.opts.non_blocking_aio || writes_queued {
            self.queue_request(req, comp);
        } else {
            req.send(&self.ctx, &comp).await;
        }
    }

    /// Blocking read: returns the gathered bytes (short reads past the
    /// volume end are clipped).
    pub async fn read(self: &Arc<Self>, offset: u64, length: u64, op_flags: u32) -> VolResult<Vec<u8>> {
        let (comp, rx) = AioCompletion::with_channel();
        self.aio_read(comp.clone(), offset, length, op_flags).await;
        let r = rx.await.map_err(|_| VolError::Io)?;
        if r < 0 {
            return Err(VolError::from_errno(r as i32).unwrap_or(VolError::Io));
        }
        Ok(comp.take_read_buf().unwrap_or_default())
    }

    /// Blocking write: returns the accepted byte count.
    pub async fn write(self: &Arc<Self>, offset: u64, data: Bytes, op_flags: u32) -> VolResult<u64> {
        let (comp, rx) = AioCompletion::with_channel();
        self.aio_write(comp, offset, data, op_flags).await;
        let r = rx.await.map_err(|_| VolError::Io)?;
        if r < 0 {
            return Err(VolError::from_errno(r as i32).unwrap_or(VolError::Io));
        }
        Ok(r as u64)
    }

    /// Blocking discard: returns the accepted byte count.
    pub async fn discard(self: &Arc<Self>, offset: u64, length: u64) -> VolResult<u64> {
        let (comp, rx) = AioCompletion::with_channel();
        self.aio_discard(comp, offset, length).await;
        let r = rx.await.map_err(|_| VolError::Io)?;
        if r < 0 {
            return Err(VolError::from_errno(r as i32).unwrap_or(VolError::Io));
        }
        Ok(r as u64)
    }

    /// Blocking flush.
    pub async fn flush(self: &Arc<Self>) -> VolResult<()> {
        let (comp, rx) = AioCompletion::with_channel();
        self.aio_flush(comp).await;
        let r = rx.await.map_err(|_| VolError::Io)?;
        if r < 0 {
            return Err(VolError::from_errno(r as i32).unwrap_or(VolError::Io));
        }
        Ok(())
    }

    /// Suspend write dispatch. Returns once no write is executing;
    /// queued writes stay at the head of the queue until
    /// [`resume_writes`](Self::resume_writes).
    pub async fn suspend_writes(&self) {
        debug!(image = %self.ctx.name, "suspending writes");
        self.inner.lock().unwrap().writes_suspended = true;
        loop {
            let notified = self.drained.notified();
            if self.inner.lock().unwrap().in_progress_writes == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resume write dispatch.
    pub fn resume_writes(&self) {
        debug!(image = %self.ctx.name, "resuming writes");
        self.inner.lock().unwrap().writes_suspended = false;
        self.dispatch.notify_waiters();
    }

    pub fn writes_suspended(&self) -> bool {
        self.inner.lock().unwrap().writes_suspended
    }

    /// Whether any writes are queued or executing.
    pub fn writes_empty(&self) -> bool {
        self.inner.lock().unwrap().queued_writes == 0
    }

    /// The image watcher acquired the distributed lock; gated writes may
    /// dispatch now.
    pub fn handle_lock_acquired(&self) {
        debug!(image = %self.ctx.name, "lock acquired");
        self.dispatch.notify_waiters();
    }

    /// Wait until the queue is empty and nothing is executing.
    pub async fn drain(&self) {
        loop {
            let notified = self.queue_empty.notified();
            {
                let q = self.inner.lock().unwrap();
                if q.queue.is_empty() && q.in_progress_writes == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Drain the queue and stop the worker pool.
    pub async fn shut_down(&self) {
        self.drain().await;
        self.shutdown.store(true, Ordering::SeqCst);
        self.dispatch.notify_waiters();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }

    fn is_lock_required(&self) -> bool {
        self.ctx.watcher.is_lock_supported() && !self.ctx.watcher.is_lock_owner()
    }

    fn journal_opening(&self) -> bool {
        self.ctx
            .journal
            .as_ref()
            .map_or(false, |journal| journal.is_opening())
    }

    fn queue_request(&self, req: ImageRequest, comp: Arc<AioCompletion>) {
        {
            let mut q = self.inner.lock().unwrap();
            if req.is_write_op() {
                q.queued_writes += 1;
                if q.queued_writes == 1 {
                    self.ctx.watcher.flag_aio_ops_pending();
                }
            }
            q.queue.push_back(QueuedRequest { req, comp });
        }
        self.dispatch.notify_waiters();
    }

    /// Atomic peek-and-dequeue under the accounting mutex.
    fn dequeue_one(&self) -> Option<QueuedRequest> {
        let mut q = self.inner.lock().unwrap();
        let front = q.queue.front()?;
        let is_write = front.req.is_write_op();
        let is_flush = matches!(front.req, ImageRequest::Flush);

        if is_write {
            if q.writes_suspended || self.is_lock_required() || self.journal_opening() {
                return None;
            }
            q.in_progress_writes += 1;
        } else if is_flush && q.in_progress_writes > 0 {
            // A flush waits for the writes dispatched ahead of it to
            // finish submitting, so its in-flight snapshot sees them.
            return None;
        }
        q.queue.pop_front()
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let notified = self.dispatch.notified();
            match self.dequeue_one() {
                Some(item) => self.process(item).await,
                None => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    notified.await;
                }
            }
        }
    }

    async fn process(&self, item: QueuedRequest) {
        let is_write = item.req.is_write_op();
        item.req.send(&self.ctx, &item.comp).await;

        {
            let mut q = self.inner.lock().unwrap();
            if is_write {
                debug_assert!(q.queued_writes > 0);
                q.queued_writes -= 1;
                if q.queued_writes == 0 {
                    self.ctx.watcher.clear_aio_ops_pending();
                }
                debug_assert!(q.in_progress_writes > 0);
                q.in_progress_writes -= 1;
                if q.in_progress_writes == 0 {
                    self.drained.notify_waiters();
                }
            }
            if q.queue.is_empty() && q.in_progress_writes == 0 {
                self.queue_empty.notify_waiters();
            }
        }
        // A queued flush may have been gated on the write we just
        // finished.
        self.dispatch.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}
