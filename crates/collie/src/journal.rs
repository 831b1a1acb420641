//! Journal coordinator.
//!
//! Mirrors every mutating image operation into the write-ahead journal
//! before the object store sees it, and keeps the two in step: an event
//! is finished only when the journal append is durable ("safe") AND every
//! object write it covers has been acknowledged.
//!
//! ## State machine
//!
//! ```text
//! <start>
//!    |
//!    v
//! UNINITIALIZED ---> INITIALIZING ---> REPLAYING ------> READY
//!    |                    |             ^      |           |
//!    |              (open failed)       |      v           v
//!    |                    |             | RESTARTING    STOPPING
//!    |                    |             |      |           |
//!    |                    |             \------/           |
//!    |                    v                                v
//!    |                  CLOSED <-------- CLOSING <---------/
//!    |                    |
//!    \--------------------+---> <finish>
//! ```
//!
//! Any non-terminal state jumps to CLOSING on a fatal error; the first
//! error code recorded survives all later failures. Every transition
//! wakes the steady-state waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use collie_proto::striping::to_object_extents;
use collie_proto::{EventEntry, FramedEvent, SnapContext, StripingLayout, VolError, VolResult};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::completion::AioCompletion;
use crate::interval::IntervalSet;
use crate::journaler::Journaler;
use crate::object_request::{gather, ObjectRequest};
use crate::store::ObjectStore;

/// Consecutive replay restarts tolerated before the journal gives up and
/// closes with the replay error.
const MAX_REPLAY_RESTARTS: u32 = 5;

/// Journal lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    Uninitialized,
    Initializing,
    Replaying,
    RestartingReplay,
    Ready,
    Stopping,
    Closing,
    Closed,
}

struct StateInner {
    state: JournalState,
    error: Option<VolError>,
    close_pending: bool,
}

/// Callback fired when an event is finalized (safe and fully committed).
pub type OnSafe = Box<dyn FnOnce(i64) + Send + 'static>;

struct Event {
    /// Aggregate of the image request that produced this event. Holds
    /// one child slot for the journal append itself.
    completion: Arc<AioCompletion>,
    /// Image extents not yet acknowledged by the object store.
    pending_extents: IntervalSet,
    /// The append is durable.
    safe: bool,
    /// Cumulative result: 0 or the worst error seen.
    ret: i64,
    /// Waiters released the moment the append turns safe.
    safe_txs: Vec<oneshot::Sender<i64>>,
    /// Callbacks fired at finalization, observing the cumulative result.
    on_safe: Vec<OnSafe>,
}

struct EventMap {
    next_tid: u64,
    events: HashMap<u64, Event>,
}

struct Finalized {
    tid: u64,
    ret: i64,
    on_safe: Vec<OnSafe>,
}

/// Per-volume journal coordinator.
pub struct Journal {
    journaler: Arc<dyn Journaler>,
    store: Arc<dyn ObjectStore>,
    layout: StripingLayout,
    object_prefix: String,
    state: Mutex<StateInner>,
    state_changed: Notify,
    events: Mutex<EventMap>,
    events_drained: Notify,
}

impl Journal {
    pub fn new(
        journaler: Arc<dyn Journaler>,
        store: Arc<dyn ObjectStore>,
        layout: StripingLayout,
        object_prefix: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            journaler,
            store,
            layout,
            object_prefix,
            state: Mutex::new(StateInner {
                state: JournalState::Uninitialized,
                error: None,
                close_pending: false,
            }),
            state_changed: Notify::new(),
            events: Mutex::new(EventMap { next_tid: 0, events: HashMap::new() }),
            events_drained: Notify::new(),
        })
    }

    pub fn state(&self) -> JournalState {
        self.state.lock().unwrap().state
    }

    /// First error recorded by a failed transition, if any.
    pub fn last_error(&self) -> Option<VolError> {
        self.state.lock().unwrap().error
    }

    pub fn is_ready(&self) -> bool {
        self.state() == JournalState::Ready
    }

    /// Whether the journal is still working toward READY. The work queue
    /// holds mutating requests back while this is true.
    pub fn is_opening(&self) -> bool {
        matches!(
            self.state(),
            JournalState::Uninitialized
                | JournalState::Initializing
                | JournalState::Replaying
                | JournalState::RestartingReplay
        )
    }

    pub fn is_steady_state(&self) -> bool {
        matches!(self.state(), JournalState::Ready | JournalState::Closed)
    }

    /// Block until the journal reaches READY or CLOSED.
    pub async fn wait_until_steady(&self) -> JournalState {
        loop {
            let notified = self.state_changed.notified();
            let state = self.state();
            if matches!(state, JournalState::Ready | JournalState::Closed) {
                return state;
            }
            notified.await;
        }
    }

    /// Begin opening: initialize the journaler, replay uncommitted
    /// events, then start recording. Returns immediately; observe
    /// progress through [`wait_until_steady`](Self::wait_until_steady).
    pub fn open(self: &Arc<Self>) {
        {
            let mut s = self.state.lock().unwrap();
            if s.state != JournalState::Uninitialized {
                return;
            }
            self.set_state(&mut s, JournalState::Initializing);
        }
        let journal = self.clone();
        tokio::spawn(async move { journal.run_open().await });
    }

    async fn run_open(self: Arc<Self>) {
        if let Err(e) = self.journaler.init().await {
            error!(error = %e, "journal open failed");
            let mut s = self.state.lock().unwrap();
            if s.error.is_none() {
                s.error = Some(e);
            }
            self.set_state(&mut s, JournalState::Closed);
            return;
        }

        let close_pending = {
            let mut s = self.state.lock().unwrap();
            if s.close_pending {
                true
            } else {
                self.set_state(&mut s, JournalState::Replaying);
                false
            }
        };
        if close_pending {
            self.finish_close().await;
            return;
        }

        self.run_replay().await;
    }

    async fn run_replay(self: Arc<Self>) {
        let mut restarts = 0u32;
        let mut replayed = 0u64;
        loop {
            if self.state.lock().unwrap().close_pending {
                self.finish_close().await;
                return;
            }

            let payload = match self.journaler.pop_replay_entry().await {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "journal replay stream failed");
                    self.record_error(e);
                    self.finish_close().await;
                    return;
                }
            };

            match self.apply_replay_entry(&payload).await {
                Ok(()) => {
                    restarts = 0;
                    replayed += 1;
                    if let Err(e) = self.journaler.commit_replayed().await {
                        self.record_error(e);
                        self.finish_close().await;
                        return;
                    }
                }
                Err(e) => {
                    restarts += 1;
                    if restarts > MAX_REPLAY_RESTARTS {
                        error!(error = %e, restarts, "journal replay failed permanently");
                        self.record_error(e);
                        self.finish_close().await;
                        return;
                    }
                    warn!(error = %e, restarts, "replayed write failed, restarting replay");
                    {
                        let mut s = self.state.lock().unwrap();
                        self.set_state(&mut s, JournalState::RestartingReplay);
                    }
                    if let Err(e) = self.journaler.restart_replay().await {
                        self.record_error(e);
                        self.finish_close().await;
                        return;
                    }
                    {
                        let mut s = self.state.lock().unwrap();
                        self.set_state(&mut s, JournalState::Replaying);
                    }
                }
            }
        }

        let close_pending = {
            let mut s = self.state.lock().unwrap();
            if s.close_pending {
                true
            } else {
                self.set_state(&mut s, JournalState::Ready);
                false
            }
        };
        if close_pending {
            self.finish_close().await;
            return;
        }
        info!(replayed, "journal ready");
    }

    /// Apply one replayed event through the object store.
    async fn apply_replay_entry(&self, payload: &[u8]) -> VolResult<()> {
        let framed = FramedEvent::decode(payload)?;
        let snapc = SnapContext::default();
        trace!(tid = framed.tid, event = framed.entry.event_type(), "replaying event");

        match framed.entry {
            EventEntry::AioWrite { offset, length, data } => {
                let extents =
                    to_object_extents(&self.layout, &self.object_prefix, offset, length, 0);
                for extent in extents {
                    let chunk = gather(&data, &extent.buffer_extents);
                    self.store
                        .write(&extent.oid, extent.offset, chunk, &snapc)
                        .await?;
                }
            }
            EventEntry::AioDiscard { offset, length } => {
                let extents =
                    to_object_extents(&self.layout, &self.object_prefix, offset, length, 0);
                for extent in extents {
                    let r = if extent.length == self.layout.object_size {
                        self.store.remove(&extent.oid, &snapc).await
                    } else if extent.offset + extent.length == self.layout.object_size {
                        self.store.truncate(&extent.oid, extent.offset, &snapc).await
                    } else {
                        self.store
                            .zero(&extent.oid, extent.offset, extent.length, &snapc)
                            .await
                    };
                    match r {
                        Ok(()) | Err(VolError::NoObject) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            EventEntry::AioFlush => {
                self.store.flush().await?;
            }
        }
        Ok(())
    }

    /// Append a mutating event.
    ///
    /// Assigns the next tid, records the event's extent interval, issues
    /// the append, then submits the stashed object children. The
    /// completion aggregate gains one child that completes when the
    /// append turns safe, so the image request cannot finish before
    /// durability. With `synchronous`, the call does not return until
    /// the event is safe.
    pub async fn append_event(
        self: &Arc<Self>,
        completion: &Arc<AioCompletion>,
        entry: EventEntry,
        requests: Vec<ObjectRequest>,
        offset: u64,
        length: u64,
        synchronous: bool,
    ) -> VolResult<u64> {
        if self.state() != JournalState::Ready {
            return Err(VolError::ShuttingDown);
        }

        completion.add_child();

        let (tid, ack, sync_rx) = {
            let mut map = self.events.lock().unwrap();
            map.next_tid += 1;
            let tid = map.next_tid;

            let event_type = entry.event_type();
            let payload = match (FramedEvent { tid, entry }).encode() {
                Ok(payload) => payload,
                Err(e) => {
                    drop(map);
                    completion.complete_child(e.to_errno() as i64);
                    return Err(e);
                }
            };

            let mut pending_extents = IntervalSet::new();
            pending_extents.insert(offset, length);

            let mut safe_txs = Vec::new();
            let sync_rx = if synchronous {
                let (tx, rx) = oneshot::channel();
                safe_txs.push(tx);
                Some(rx)
            } else {
                None
            };

            map.events.insert(
                tid,
                Event {
                    completion: completion.clone(),
                    pending_extents,
                    safe: false,
                    ret: 0,
                    safe_txs,
                    on_safe: Vec::new(),
                },
            );

            debug!(tid, event = event_type, offset, length, "journal append");
            // The append is issued while the event lock is held, so tid
            // order and journal order agree for overlapping extents.
            let ack = self.journaler.append(tid, payload);
            (tid, ack, sync_rx)
        };

        let journal = self.clone();
        tokio::spawn(async move {
            let r = ack.await.unwrap_or(VolError::Io.to_errno());
            journal.handle_event_safe(r, tid);
        });

        // The append is issued; release the object children.
        for mut request in requests {
            request.set_journal_hook(self.clone(), tid);
            request.send();
        }

        if synchronous {
            if let Some(rx) = sync_rx {
                let _ = rx.await;
            }
        }
        Ok(tid)
    }

    /// Register a callback fired when the event is finalized. Fires
    /// immediately with 0 if the event is already gone.
    pub fn on_event_safe(&self, tid: u64, callback: OnSafe) {
        let run_now = {
            let mut map = self.events.lock().unwrap();
            match map.events.get_mut(&tid) {
                Some(event) => {
                    event.on_safe.push(callback);
                    None
                }
                None => Some(callback),
            }
        };
        if let Some(cb) = run_now {
            cb(0);
        }
    }

    /// Wait until the event's append is durable. Returns the event's
    /// cumulative result at that point, or 0 if the event is already
    /// finalized.
    pub async fn wait_event_safe(&self, tid: u64) -> i64 {
        let rx = {
            let mut map = self.events.lock().unwrap();
            match map.events.get_mut(&tid) {
                None => return 0,
                Some(event) if event.safe => return event.ret,
                Some(event) => {
                    let (tx, rx) = oneshot::channel();
                    event.safe_txs.push(tx);
                    rx
                }
            }
        };
        rx.await.unwrap_or(0)
    }

    /// Acknowledge an object write covering `[offset, offset + length)`
    /// of the event's extent interval.
    pub fn commit_event_extent(&self, tid: u64, offset: u64, length: u64, result: i32) {
        trace!(tid, offset, length, result, "commit event extent");
        let finalized = {
            let mut map = self.events.lock().unwrap();
            let event = match map.events.get_mut(&tid) {
                Some(event) => event,
                None => {
                    warn!(tid, "extent commit for unknown event");
                    return;
                }
            };
            if result < 0 {
                Self::record_event_error(event, result);
            }
            event.pending_extents.subtract(offset, length);
            if event.safe && event.pending_extents.is_empty() {
                Self::take_finalized(&mut map, tid, &self.events_drained)
            } else {
                None
            }
        };
        self.run_finalized(finalized);
    }

    /// The journaler reported durability (or failure) for the append.
    fn handle_event_safe(self: &Arc<Self>, result: i32, tid: u64) {
        debug!(tid, result, "journal event safe");
        let (completion, child_result, safe_txs, safe_ret, finalized) = {
            let mut map = self.events.lock().unwrap();
            let event = match map.events.get_mut(&tid) {
                Some(event) => event,
                None => return,
            };
            event.safe = true;
            if result < 0 {
                Self::record_event_error(event, result);
            }
            let completion = event.completion.clone();
            let safe_txs = std::mem::take(&mut event.safe_txs);
            let safe_ret = event.ret;
            let finalized = if event.pending_extents.is_empty() {
                Self::take_finalized(&mut map, tid, &self.events_drained)
            } else {
                None
            };
            let child_result = if result < 0 { result as i64 } else { 0 };
            (completion, child_result, safe_txs, safe_ret, finalized)
        };

        for tx in safe_txs {
            let _ = tx.send(safe_ret);
        }
        completion.complete_child(child_result);
        self.run_finalized(finalized);

        if result < 0 {
            self.fatal_error(VolError::from_errno(result).unwrap_or(VolError::Io));
        }
    }

    /// Stop the journal: Ready → Stopping → Closing → Closed, draining
    /// in-flight events along the way. Safe to call from any state.
    pub async fn close(&self) -> VolResult<()> {
        loop {
            enum Action {
                Done,
                Wait,
                Stop,
            }
            let notified = self.state_changed.notified();
            let action = {
                let mut s = self.state.lock().unwrap();
                match s.state {
                    JournalState::Uninitialized => {
                        self.set_state(&mut s, JournalState::Closed);
                        Action::Done
                    }
                    JournalState::Initializing
                    | JournalState::Replaying
                    | JournalState::RestartingReplay => {
                        s.close_pending = true;
                        Action::Wait
                    }
                    JournalState::Ready => {
                        self.set_state(&mut s, JournalState::Stopping);
                        Action::Stop
                    }
                    JournalState::Stopping | JournalState::Closing => Action::Wait,
                    JournalState::Closed => Action::Done,
                }
            };
            match action {
                Action::Done => {
                    return match self.last_error() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
                Action::Wait => notified.await,
                Action::Stop => {
                    if let Err(e) = self.journaler.stop_append().await {
                        self.record_error(e);
                    }
                    self.wait_events_drained().await;
                    self.finish_close().await;
                    return match self.last_error() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    /// Push buffered appends toward durability now.
    pub fn flush_appends(&self) {
        self.journaler.flush_appends();
    }

    async fn wait_events_drained(&self) {
        loop {
            let notified = self.events_drained.notified();
            if self.events.lock().unwrap().events.is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn finish_close(&self) {
        {
            let mut s = self.state.lock().unwrap();
            if s.state == JournalState::Closed {
                return;
            }
            self.set_state(&mut s, JournalState::Closing);
        }
        self.fail_all_events(VolError::ShuttingDown);
        if let Err(e) = self.journaler.destroy().await {
            self.record_error(e);
        }
        let mut s = self.state.lock().unwrap();
        self.set_state(&mut s, JournalState::Closed);
    }

    /// Resolve every in-flight event with the given error.
    fn fail_all_events(&self, e: VolError) {
        let errno = e.to_errno() as i64;
        let drained: Vec<(u64, Event)> = {
            let mut map = self.events.lock().unwrap();
            let drained = map.events.drain().collect();
            self.events_drained.notify_waiters();
            drained
        };
        for (tid, event) in drained {
            warn!(tid, "failing in-flight journal event");
            for tx in event.safe_txs {
                let _ = tx.send(errno);
            }
            for cb in event.on_safe {
                cb(errno);
            }
            if !event.safe {
                // The journal child never completed; fail it now.
                event.completion.complete_child(errno);
            }
        }
    }

    /// Record the first fatal error and drive the state machine to
    /// CLOSING/CLOSED in the background.
    fn fatal_error(self: &Arc<Self>, e: VolError) {
        let act = {
            let mut s = self.state.lock().unwrap();
            match s.state {
                JournalState::Closing | JournalState::Closed => false,
                _ => {
                    if s.error.is_none() {
                        s.error = Some(e);
                    }
                    true
                }
            }
        };
        if act {
            warn!(error = %e, "fatal journal error, closing");
            let journal = self.clone();
            tokio::spawn(async move { journal.finish_close().await });
        }
    }

    fn record_error(&self, e: VolError) {
        let mut s = self.state.lock().unwrap();
        if s.error.is_none() {
            s.error = Some(e);
        }
    }

    fn record_event_error(event: &mut Event, result: i32) {
        event.ret = if event.ret < 0 {
            VolError::worse_errno(event.ret as i32, result) as i64
        } else {
            result as i64
        };
    }

    fn take_finalized(map: &mut EventMap, tid: u64, drained: &Notify) -> Option<Finalized> {
        let event = map.events.remove(&tid)?;
        if map.events.is_empty() {
            drained.notify_waiters();
        }
        Some(Finalized { tid, ret: event.ret, on_safe: event.on_safe })
    }

    fn run_finalized(&self, finalized: Option<Finalized>) {
        if let Some(finalized) = finalized {
            debug!(tid = finalized.tid, ret = finalized.ret, "journal event finalized");
            for cb in finalized.on_safe {
                cb(finalized.ret);
            }
        }
    }

    fn set_state(&self, s: &mut StateInner, state: JournalState) {
        debug!(from = ?s.state, to = ?state, "journal state transition");
        s.state = state;
        self.state_changed.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn event_count(&self) -> usize {
        self.events.lock().unwrap().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journaler::MemJournaler;
    use crate::store::MemStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use collie_proto::{ObjectId, SnapId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn layout() -> StripingLayout {
        StripingLayout { object_size: 4096, stripe_unit: 4096, stripe_count: 1 }
    }

    fn new_journal(
        journaler: Arc<MemJournaler>,
        store: Arc<dyn ObjectStore>,
    ) -> Arc<Journal> {
        Journal::new(journaler, store, layout(), "p".to_string())
    }

    async fn open_ready(journal: &Arc<Journal>) {
        journal.open();
        assert_eq!(journal.wait_until_steady().await, JournalState::Ready);
    }

    #[tokio::test]
    async fn test_open_reaches_ready() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        assert_eq!(journal.state(), JournalState::Uninitialized);
        open_ready(&journal).await;
        assert!(journal.is_ready());
        assert!(!journal.is_opening());
    }

    #[tokio::test]
    async fn test_open_failure_closes_with_error() {
        let journaler = Arc::new(MemJournaler::new());
        journaler.fail_init();
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        journal.open();
        assert_eq!(journal.wait_until_steady().await, JournalState::Closed);
        assert_eq!(journal.last_error(), Some(VolError::Io));
    }

    #[tokio::test]
    async fn test_append_before_ready_is_shutdown() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        let (comp, _rx) = AioCompletion::with_channel();
        let err = journal
            .append_event(&comp, EventEntry::AioFlush, Vec::new(), 0, 0, false)
            .await;
        assert_eq!(err.unwrap_err(), VolError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_tids_in_journal_order() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler.clone(), Arc::new(MemStore::new(4096)));
        open_ready(&journal).await;

        for i in 0..3u64 {
            let (comp, rx) = AioCompletion::with_channel();
            comp.get();
            let tid = journal
                .append_event(
                    &comp,
                    EventEntry::AioWrite {
                        offset: 0,
                        length: 1,
                        data: Bytes::from(vec![i as u8]),
                    },
                    Vec::new(),
                    0,
                    1,
                    false,
                )
                .await
                .unwrap();
            assert_eq!(tid, i + 1);
            // No object children: the event finalizes at safe.
            journal.commit_event_extent(tid, 0, 1, 0);
            comp.finish_adding_requests();
            comp.put();
            rx.await.unwrap();
        }

        let records = journaler.records();
        assert_eq!(records.len(), 3);
        for (i, (tid, payload)) in records.iter().enumerate() {
            assert_eq!(*tid, i as u64 + 1);
            let framed = FramedEvent::decode(payload).unwrap();
            assert_eq!(framed.tid, *tid);
        }
    }

    #[tokio::test]
    async fn test_event_requires_safe_and_extent_commit() {
        let journaler = Arc::new(MemJournaler::new());
        journaler.hold_acks();
        let mem = Arc::new(MemStore::new(4096));
        let journal = new_journal(journaler.clone(), mem.clone());
        // Become ready before holding acks matters (no appends yet).
        open_ready(&journal).await;

        let (comp, mut rx) = AioCompletion::with_channel();
        comp.get();
        comp.set_rval(5);
        let req = ObjectRequest::new_write(
            mem.clone(),
            ObjectId::new("p", 0),
            0,
            Bytes::from_static(b"hello"),
            SnapContext::default(),
            comp.clone(),
            vec![(0, 5)],
        );
        let tid = journal
            .append_event(
                &comp,
                EventEntry::AioWrite { offset: 0, length: 5, data: Bytes::from_static(b"hello") },
                vec![req],
                0,
                5,
                false,
            )
            .await
            .unwrap();
        comp.finish_adding_requests();
        comp.put();

        // Object write lands, but the append is not yet safe: the event
        // stays in the map and the completion stays open.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(journal.event_count(), 1);
        assert!(rx.try_recv().is_err());
        assert!(!comp.is_complete());

        journaler.release_acks();
        assert_eq!(rx.await.unwrap(), 5);
        assert_eq!(journal.event_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_event_finalizes_at_safe() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        open_ready(&journal).await;

        let (comp, rx) = AioCompletion::with_channel();
        comp.get();
        let tid = journal
            .append_event(&comp, EventEntry::AioFlush, Vec::new(), 0, 0, false)
            .await
            .unwrap();
        comp.finish_adding_requests();
        comp.put();
        assert_eq!(rx.await.unwrap(), 0);
        assert_eq!(journal.wait_event_safe(tid).await, 0);
        assert_eq!(journal.event_count(), 0);
    }

    #[tokio::test]
    async fn test_on_safe_callbacks_fire_at_finalize() {
        let journaler = Arc::new(MemJournaler::new());
        journaler.hold_acks();
        let mem = Arc::new(MemStore::new(4096));
        let journal = new_journal(journaler.clone(), mem);
        open_ready(&journal).await;

        let (comp, _rx) = AioCompletion::with_channel();
        comp.get();
        let tid = journal
            .append_event(
                &comp,
                EventEntry::AioWrite { offset: 0, length: 4, data: Bytes::from_static(b"abcd") },
                Vec::new(),
                0,
                4,
                false,
            )
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        journal.on_event_safe(
            tid,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );

        // Safe alone does not finalize while an extent is pending.
        journaler.release_acks();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        journal.commit_event_extent(tid, 0, 4, 0);
        assert_eq!(rx.await.unwrap(), 0);

        // Registering against a finalized event fires immediately.
        let (tx, rx) = tokio::sync::oneshot::channel();
        journal.on_event_safe(
            tid,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_synchronous_append_waits_for_safe() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        open_ready(&journal).await;

        let (comp, rx) = AioCompletion::with_channel();
        comp.get();
        journal
            .append_event(&comp, EventEntry::AioFlush, Vec::new(), 0, 0, true)
            .await
            .unwrap();
        // Returning from a synchronous append means the event is safe.
        comp.finish_adding_requests();
        comp.put();
        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_failure_fails_completion_and_closes() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler.clone(), Arc::new(MemStore::new(4096)));
        open_ready(&journal).await;

        journaler.fail_next_append(-5);
        let (comp, rx) = AioCompletion::with_channel();
        comp.get();
        journal
            .append_event(&comp, EventEntry::AioFlush, Vec::new(), 0, 0, false)
            .await
            .unwrap();
        comp.finish_adding_requests();
        comp.put();
        assert_eq!(rx.await.unwrap(), -5);

        assert_eq!(journal.wait_until_steady().await, JournalState::Closed);
        assert_eq!(journal.last_error(), Some(VolError::Io));
    }

    #[tokio::test]
    async fn test_replay_applies_events_to_store() {
        let entries = vec![
            FramedEvent {
                tid: 1,
                entry: EventEntry::AioWrite {
                    offset: 0,
                    length: 5,
                    data: Bytes::from_static(b"hello"),
                },
            }
            .encode()
            .unwrap(),
            FramedEvent { tid: 2, entry: EventEntry::AioDiscard { offset: 0, length: 2 } }
                .encode()
                .unwrap(),
            FramedEvent { tid: 3, entry: EventEntry::AioFlush }.encode().unwrap(),
        ];
        let journaler = Arc::new(MemJournaler::with_replay_entries(entries));
        let mem = Arc::new(MemStore::new(4096));
        let journal = new_journal(journaler, mem.clone());
        open_ready(&journal).await;

        let data = mem
            .read(&ObjectId::new("p", 0), 0, 5, collie_proto::SNAP_HEAD)
            .await
            .unwrap();
        assert_eq!(&data[..], b"\0\0llo");
    }

    /// Store whose first write fails, to force a replay restart.
    struct FlakyStore {
        inner: MemStore,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn read(
            &self,
            oid: &ObjectId,
            offset: u64,
            length: u64,
            snap_id: SnapId,
        ) -> VolResult<Bytes> {
            self.inner.read(oid, offset, length, snap_id).await
        }
        async fn write(
            &self,
            oid: &ObjectId,
            offset: u64,
            data: Bytes,
            snapc: &SnapContext,
        ) -> VolResult<()> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(VolError::Io);
            }
            self.inner.write(oid, offset, data, snapc).await
        }
        async fn zero(
            &self,
            oid: &ObjectId,
            offset: u64,
            length: u64,
            snapc: &SnapContext,
        ) -> VolResult<()> {
            self.inner.zero(oid, offset, length, snapc).await
        }
        async fn truncate(&self, oid: &ObjectId, offset: u64, snapc: &SnapContext) -> VolResult<()> {
            self.inner.truncate(oid, offset, snapc).await
        }
        async fn remove(&self, oid: &ObjectId, snapc: &SnapContext) -> VolResult<()> {
            self.inner.remove(oid, snapc).await
        }
        async fn flush(&self) -> VolResult<()> {
            self.inner.flush().await
        }
    }

    #[tokio::test]
    async fn test_replay_restarts_after_failed_write() {
        let entries = vec![FramedEvent {
            tid: 1,
            entry: EventEntry::AioWrite {
                offset: 0,
                length: 3,
                data: Bytes::from_static(b"abc"),
            },
        }
        .encode()
        .unwrap()];
        let journaler = Arc::new(MemJournaler::with_replay_entries(entries));
        let store = Arc::new(FlakyStore {
            inner: MemStore::new(4096),
            failed_once: AtomicBool::new(false),
        });
        let journal = new_journal(journaler, store.clone());
        open_ready(&journal).await;

        // The entry was retried after the restart and applied.
        let data = store
            .read(&ObjectId::new("p", 0), 0, 3, collie_proto::SNAP_HEAD)
            .await
            .unwrap();
        assert_eq!(&data[..], b"abc");
    }

    #[tokio::test]
    async fn test_close_from_ready() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        open_ready(&journal).await;
        journal.close().await.unwrap();
        assert_eq!(journal.state(), JournalState::Closed);
    }

    #[tokio::test]
    async fn test_close_unopened_journal() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        journal.close().await.unwrap();
        assert_eq!(journal.state(), JournalState::Closed);
    }

    #[tokio::test]
    async fn test_append_after_close_is_shutdown() {
        let journaler = Arc::new(MemJournaler::new());
        let journal = new_journal(journaler, Arc::new(MemStore::new(4096)));
        open_ready(&journal).await;
        journal.close().await.unwrap();

        let (comp, _rx) = AioCompletion::with_channel();
        let err = journal
            .append_event(&comp, EventEntry::AioFlush, Vec::new(), 0, 0, false)
            .await;
        assert_eq!(err.unwrap_err(), VolError::ShuttingDown);
    }
}
