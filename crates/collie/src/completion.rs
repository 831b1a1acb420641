//! Completion aggregate — fan-in for one image request.
//!
//! Every image request owns one aggregate. The submission path holds a
//! reference while it constructs children (object writes, cache writes,
//! journal appends); each child reports exactly once. The user callback
//! fires exactly once, only after `finish_adding_requests` has been
//! called and every child has reported.
//!
//! Results follow the errno convention: negative values are errors, and
//! the first error of highest severity wins. A successful aggregate
//! reports the request's accepted byte count.

use std::sync::Arc;
use std::sync::Mutex;

use collie_proto::VolError;
use tokio::sync::oneshot;
use tracing::trace;

/// User callback invoked with the final result.
pub type Callback = Box<dyn FnOnce(i64) + Send + 'static>;

struct State {
    /// Outstanding references: children plus the submission reference.
    pending: usize,
    /// True until `finish_adding_requests`; blocks terminal dispatch.
    building: bool,
    /// Success value (accepted bytes), reported when no error occurred.
    rval: i64,
    /// Worst error observed so far, errno convention.
    error: Option<i64>,
    /// Terminal callback already dispatched.
    complete: bool,
    callback: Option<Callback>,
    /// Internal hooks run at terminal dispatch, before the user callback.
    hooks: Vec<Box<dyn FnOnce() + Send>>,
    /// Destination for read scatter; pre-zeroed to the clipped length.
    read_buf: Option<Vec<u8>>,
}

type Dispatch = (Vec<Box<dyn FnOnce() + Send>>, Callback, i64);

/// Fan-in counter for one image request.
pub struct AioCompletion {
    state: Mutex<State>,
}

impl AioCompletion {
    pub fn new(callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                pending: 0,
                building: true,
                rval: 0,
                error: None,
                complete: false,
                callback: Some(callback),
                hooks: Vec::new(),
                read_buf: None,
            }),
        })
    }

    /// Register an internal hook run exactly once at terminal dispatch,
    /// before the user callback. Used to release in-flight-operation
    /// tracking when the request finishes.
    pub fn add_complete_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(!s.complete);
        s.hooks.push(hook);
    }

    /// Build a completion whose result arrives on a oneshot channel. Used
    /// by the blocking convenience wrappers.
    pub fn with_channel() -> (Arc<Self>, oneshot::Receiver<i64>) {
        let (tx, rx) = oneshot::channel();
        let comp = Self::new(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        (comp, rx)
    }

    /// Take the submission reference.
    pub fn get(&self) {
        let mut s = self.state.lock().unwrap();
        s.pending += 1;
    }

    /// Drop the submission reference; dispatches the callback when this
    /// was the last outstanding reference.
    pub fn put(self: &Arc<Self>) {
        let cb = {
            let mut s = self.state.lock().unwrap();
            if s.complete {
                return;
            }
            debug_assert!(s.pending > 0);
            s.pending -= 1;
            Self::try_take_callback(&mut s)
        };
        Self::dispatch(cb);
    }

    /// Register one child. The caller guarantees a later
    /// `complete_child`.
    pub fn add_child(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.building || s.pending > 0);
        s.pending += 1;
    }

    /// No more children will be added; terminal dispatch becomes legal
    /// once outstanding reaches zero.
    pub fn finish_adding_requests(self: &Arc<Self>) {
        let cb = {
            let mut s = self.state.lock().unwrap();
            s.building = false;
            Self::try_take_callback(&mut s)
        };
        Self::dispatch(cb);
    }

    /// One child reached its terminal state.
    pub fn complete_child(self: &Arc<Self>, result: i64) {
        let cb = {
            let mut s = self.state.lock().unwrap();
            if s.complete {
                // A prior fail() already dispatched; late children are
                // absorbed.
                return;
            }
            if result < 0 {
                Self::record_error(&mut s, result);
            }
            debug_assert!(s.pending > 0);
            s.pending -= 1;
            Self::try_take_callback(&mut s)
        };
        Self::dispatch(cb);
    }

    /// Record the failure and force terminal dispatch, regardless of
    /// outstanding children. Used for precondition failures detected on
    /// the submission path.
    pub fn fail(self: &Arc<Self>, result: i64) {
        debug_assert!(result < 0);
        let cb = {
            let mut s = self.state.lock().unwrap();
            if s.complete {
                return;
            }
            Self::record_error(&mut s, result);
            s.building = false;
            s.complete = true;
            let r = s.error.unwrap_or(s.rval);
            let hooks = std::mem::take(&mut s.hooks);
            s.callback.take().map(|cb| (hooks, cb, r))
        };
        if cb.is_some() {
            trace!(result, "completion failed at submission");
        }
        Self::dispatch(cb);
    }

    /// Set the success value reported when no child failed.
    pub fn set_rval(&self, rval: i64) {
        let mut s = self.state.lock().unwrap();
        s.rval = rval;
    }

    /// Allocate the zero-filled read destination of `len` bytes.
    pub fn init_read_buf(&self, len: usize) {
        let mut s = self.state.lock().unwrap();
        s.read_buf = Some(vec![0u8; len]);
    }

    /// Scatter `data` into the read destination at the given
    /// `(buffer_offset, length)` slices. `data` maps linearly onto the
    /// concatenated slices; a short `data` leaves the tail zeroed.
    pub fn write_read_data(&self, buffer_extents: &[(u64, u64)], data: &[u8]) {
        let mut s = self.state.lock().unwrap();
        let buf = match s.read_buf.as_mut() {
            Some(buf) => buf,
            None => return,
        };
        let mut src = 0usize;
        for &(off, len) in buffer_extents {
            if src >= data.len() {
                break;
            }
            let n = (len as usize).min(data.len() - src);
            let off = off as usize;
            buf[off..off + n].copy_from_slice(&data[src..src + n]);
            src += n;
        }
    }

    /// Take the assembled read buffer after the callback has fired.
    pub fn take_read_buf(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().read_buf.take()
    }

    /// Whether the terminal callback has been dispatched.
    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().complete
    }

    fn record_error(s: &mut State, result: i64) {
        s.error = Some(match s.error {
            None => result,
            Some(prev) => VolError::worse_errno(prev as i32, result as i32) as i64,
        });
    }

    fn try_take_callback(s: &mut State) -> Option<Dispatch> {
        if s.building || s.pending > 0 || s.complete {
            return None;
        }
        s.complete = true;
        let r = s.error.unwrap_or(s.rval);
        let hooks = std::mem::take(&mut s.hooks);
        s.callback.take().map(|cb| (hooks, cb, r))
    }

    fn dispatch(cb: Option<Dispatch>) {
        if let Some((hooks, cb, r)) = cb {
            for hook in hooks {
                hook();
            }
            cb(r);
        }
    }
}

impl std::fmt::Debug for AioCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock().unwrap();
        f.debug_struct("AioCompletion")
            .field("pending", &s.pending)
            .field("building", &s.building)
            .field("complete", &s.complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_completion() -> (Arc<AioCompletion>, Arc<AtomicU64>, Arc<AtomicU64>) {
        let fired = Arc::new(AtomicU64::new(0));
        let result = Arc::new(AtomicU64::new(0));
        let (f, r) = (fired.clone(), result.clone());
        let comp = AioCompletion::new(Box::new(move |rv| {
            f.fetch_add(1, Ordering::SeqCst);
            r.store(rv as u64, Ordering::SeqCst);
        }));
        (comp, fired, result)
    }

    #[test]
    fn test_fires_exactly_once_after_finish() {
        let (comp, fired, result) = counting_completion();
        comp.get();
        comp.add_child();
        comp.add_child();
        comp.set_rval(96);

        comp.complete_child(0);
        comp.complete_child(0);
        // All children done, but submission ref still held.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        comp.finish_adding_requests();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        comp.put();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(result.load(Ordering::SeqCst), 96);
    }

    #[test]
    fn test_finish_marker_prevents_early_dispatch() {
        let (comp, fired, _) = counting_completion();
        comp.get();
        comp.add_child();
        comp.complete_child(0);
        comp.put();
        // No finish marker yet: must not fire even at zero outstanding.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        comp.finish_adding_requests();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worst_error_wins() {
        let (comp, fired, result) = counting_completion();
        comp.get();
        comp.add_child();
        comp.add_child();
        comp.add_child();
        comp.set_rval(4096);

        comp.complete_child(-2); // ENOENT
        comp.complete_child(-5); // EIO outranks it
        comp.complete_child(0);
        comp.finish_adding_requests();
        comp.put();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(result.load(Ordering::SeqCst) as i64, -5);
    }

    #[test]
    fn test_first_error_of_highest_severity_sticks() {
        let (comp, _, result) = counting_completion();
        comp.get();
        comp.add_child();
        comp.add_child();
        comp.complete_child(-5);
        comp.complete_child(-28); // same severity, first wins
        comp.finish_adding_requests();
        comp.put();
        assert_eq!(result.load(Ordering::SeqCst) as i64, -5);
    }

    #[test]
    fn test_fail_forces_terminal_dispatch() {
        let (comp, fired, result) = counting_completion();
        comp.get();
        comp.add_child();
        comp.fail(-30);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(result.load(Ordering::SeqCst) as i64, -30);

        // Late child completion is absorbed without re-firing.
        comp.complete_child(0);
        comp.put();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_scatter_with_zero_tail() {
        let (comp, _, _) = counting_completion();
        comp.init_read_buf(10);
        // Two slices; data shorter than the slices' total leaves zeros.
        comp.write_read_data(&[(0, 4), (6, 4)], b"abcdef");
        let buf = comp.take_read_buf().unwrap();
        assert_eq!(buf, b"abcd\0\0ef\0\0");
    }

    #[test]
    fn test_zero_children_completes_with_rval() {
        let (comp, fired, result) = counting_completion();
        comp.get();
        comp.set_rval(0);
        comp.finish_adding_requests();
        comp.put();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(result.load(Ordering::SeqCst), 0);
    }
}
