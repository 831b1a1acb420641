//! Image watcher — the cooperative exclusive-lock capability surface.
//!
//! The distributed lock-acquisition protocol itself lives outside this
//! crate; the I/O core only consumes its state. The work queue flags
//! dirty intent through `flag_aio_ops_pending` so the remote arbiter
//! knows this client has queued writes, and asks for the lock with
//! `request_lock` when a write arrives while the lock is held elsewhere.

/// Exclusive-lock state consumed by the request work queue.
pub trait ImageWatcher: Send + Sync + 'static {
    /// Whether this volume uses the distributed exclusive lock at all.
    fn is_lock_supported(&self) -> bool;

    /// Whether this client currently owns the lock.
    fn is_lock_owner(&self) -> bool;

    /// Ask the lock arbiter to acquire the lock for this client. The
    /// acquisition completes asynchronously; the work queue is signalled
    /// through [`crate::work_queue::ImageRequestWQ::handle_lock_acquired`].
    fn request_lock(&self);

    /// Raise the "async ops pending" flag: this client holds queued
    /// mutating requests.
    fn flag_aio_ops_pending(&self);

    /// Clear the "async ops pending" flag.
    fn clear_aio_ops_pending(&self);
}

/// Watcher for volumes opened without the distributed lock: the lock is
/// unsupported, so every writer is trivially allowed.
#[derive(Debug, Default)]
pub struct StandaloneWatcher;

impl ImageWatcher for StandaloneWatcher {
    fn is_lock_supported(&self) -> bool {
        false
    }

    fn is_lock_owner(&self) -> bool {
        true
    }

    fn request_lock(&self) {}

    fn flag_aio_ops_pending(&self) {}

    fn clear_aio_ops_pending(&self) {}
}
