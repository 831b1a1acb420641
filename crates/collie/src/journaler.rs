//! Journaler abstraction — the underlying append/replay transport the
//! journal coordinator drives.
//!
//! The coordinator owns tids, event bookkeeping, and the state machine;
//! the journaler only stores framed payloads durably and streams them
//! back for replay. Implementations MUST acknowledge appends in
//! submission order, so that once an append is acknowledged every
//! earlier append is durable too.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use collie_proto::{VolError, VolResult};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Append/replay transport for the write-ahead journal.
#[async_trait]
pub trait Journaler: Send + Sync + 'static {
    /// Open the journal and position the replay cursor at the oldest
    /// uncommitted entry.
    async fn init(&self) -> VolResult<()>;

    /// Pop the next entry to replay. `None` means the replay stream is
    /// exhausted.
    async fn pop_replay_entry(&self) -> VolResult<Option<Bytes>>;

    /// Mark every entry popped so far as committed.
    async fn commit_replayed(&self) -> VolResult<()>;

    /// Rewind the replay cursor to the last committed entry.
    async fn restart_replay(&self) -> VolResult<()>;

    /// Append a framed payload. The returned channel resolves with 0 once
    /// the entry is durable, or a negative errno on failure. Acks arrive
    /// in append order.
    fn append(&self, tid: u64, payload: Bytes) -> oneshot::Receiver<i32>;

    /// Nudge the journaler to push buffered appends to durable storage
    /// now rather than on its own schedule.
    fn flush_appends(&self);

    /// Stop accepting appends and flush everything in flight. All
    /// outstanding ack channels resolve before this returns.
    async fn stop_append(&self) -> VolResult<()>;

    /// Release the journaler's resources.
    async fn destroy(&self) -> VolResult<()>;
}

struct MemInner {
    records: Vec<(u64, Bytes)>,
    replay_entries: Vec<Bytes>,
    replay_pos: usize,
    replay_committed: usize,
    hold_acks: bool,
    pending_acks: VecDeque<oneshot::Sender<i32>>,
    fail_next_append: Option<i32>,
    fail_init: bool,
}

/// In-memory journaler: appends are durable the moment they are recorded.
///
/// Tests can pre-load replay entries, hold acknowledgments back to
/// exercise the not-yet-safe window, and inject append failures.
pub struct MemJournaler {
    inner: Mutex<MemInner>,
}

impl Default for MemJournaler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemJournaler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner {
                records: Vec::new(),
                replay_entries: Vec::new(),
                replay_pos: 0,
                replay_committed: 0,
                hold_acks: false,
                pending_acks: VecDeque::new(),
                fail_next_append: None,
                fail_init: false,
            }),
        }
    }

    /// Journaler whose replay stream yields the given payloads.
    pub fn with_replay_entries(entries: Vec<Bytes>) -> Self {
        let journaler = Self::new();
        journaler.inner.lock().unwrap().replay_entries = entries;
        journaler
    }

    /// Hold append acknowledgments until [`release_acks`](Self::release_acks).
    pub fn hold_acks(&self) {
        self.inner.lock().unwrap().hold_acks = true;
    }

    /// Release all held acknowledgments, oldest first.
    pub fn release_acks(&self) {
        let acks: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.hold_acks = false;
            inner.pending_acks.drain(..).collect()
        };
        for tx in acks {
            let _ = tx.send(0);
        }
    }

    /// Fail the next append with the given errno.
    pub fn fail_next_append(&self, errno: i32) {
        self.inner.lock().unwrap().fail_next_append = Some(errno);
    }

    /// Fail the next `init` call.
    pub fn fail_init(&self) {
        self.inner.lock().unwrap().fail_init = true;
    }

    /// Appended records, in order, as (tid, payload).
    pub fn records(&self) -> Vec<(u64, Bytes)> {
        self.inner.lock().unwrap().records.clone()
    }
}

#[async_trait]
impl Journaler for MemJournaler {
    async fn init(&self) -> VolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_init {
            inner.fail_init = false;
            return Err(VolError::Io);
        }
        debug!(entries = inner.replay_entries.len(), "mem journaler opened");
        Ok(())
    }

    async fn pop_replay_entry(&self) -> VolResult<Option<Bytes>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.replay_pos < inner.replay_entries.len() {
            let entry = inner.replay_entries[inner.replay_pos].clone();
            inner.replay_pos += 1;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    async fn commit_replayed(&self) -> VolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.replay_committed = inner.replay_pos;
        Ok(())
    }

    async fn restart_replay(&self) -> VolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.replay_pos = inner.replay_committed;
        Ok(())
    }

    fn append(&self, tid: u64, payload: Bytes) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        trace!(tid, len = payload.len(), "mem journaler append");
        if let Some(errno) = inner.fail_next_append.take() {
            let _ = tx.send(errno);
            return rx;
        }
        inner.records.push((tid, payload));
        if inner.hold_acks {
            inner.pending_acks.push_back(tx);
        } else {
            let _ = tx.send(0);
        }
        rx
    }

    fn flush_appends(&self) {
        // Durable on append; nothing buffered.
    }

    async fn stop_append(&self) -> VolResult<()> {
        self.release_acks();
        Ok(())
    }

    async fn destroy(&self) -> VolResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_acks_immediately() {
        let journaler = MemJournaler::new();
        let rx = journaler.append(1, Bytes::from_static(b"x"));
        assert_eq!(rx.await.unwrap(), 0);
        assert_eq!(journaler.records().len(), 1);
    }

    #[tokio::test]
    async fn test_held_acks_release_in_order() {
        let journaler = MemJournaler::new();
        journaler.hold_acks();
        let rx1 = journaler.append(1, Bytes::from_static(b"a"));
        let rx2 = journaler.append(2, Bytes::from_static(b"b"));
        journaler.release_acks();
        assert_eq!(rx1.await.unwrap(), 0);
        assert_eq!(rx2.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_failure_injection() {
        let journaler = MemJournaler::new();
        journaler.fail_next_append(-5);
        let rx = journaler.append(1, Bytes::from_static(b"x"));
        assert_eq!(rx.await.unwrap(), -5);
        // The failed append is not recorded.
        assert!(journaler.records().is_empty());
    }

    #[tokio::test]
    async fn test_replay_cursor_restart() {
        let entries = vec![Bytes::from_static(b"e0"), Bytes::from_static(b"e1")];
        let journaler = MemJournaler::with_replay_entries(entries);
        journaler.init().await.unwrap();

        assert_eq!(
            journaler.pop_replay_entry().await.unwrap().unwrap(),
            Bytes::from_static(b"e0")
        );
        journaler.commit_replayed().await.unwrap();
        assert_eq!(
            journaler.pop_replay_entry().await.unwrap().unwrap(),
            Bytes::from_static(b"e1")
        );

        // Rewind re-reads from the last committed entry.
        journaler.restart_replay().await.unwrap();
        assert_eq!(
            journaler.pop_replay_entry().await.unwrap().unwrap(),
            Bytes::from_static(b"e1")
        );
        assert!(journaler.pop_replay_entry().await.unwrap().is_none());
    }
}
