//! Per-object request primitives.
//!
//! An image request fans out into one of these per touched object. A
//! discard picks its primitive from the extent geometry: an extent
//! covering the whole object removes it, an extent reaching the object's
//! end truncates, and an interior extent zeroes (unless partial discards
//! are configured away, in which case the extent is skipped and its
//! completion path short-circuits with success by never being created).
//!
//! When the owning image request is journaled, each primitive carries a
//! hook back to the journal coordinator and acknowledges its image
//! extents there once the object store replies.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use collie_proto::{ObjectExtent, ObjectId, SnapContext, VolError};
use tracing::{debug, trace};

use crate::completion::AioCompletion;
use crate::journal::Journal;
use crate::store::ObjectStore;

/// The object-store operation an [`ObjectRequest`] performs.
#[derive(Debug, Clone)]
pub enum ObjectOp {
    Write { offset: u64, data: Bytes },
    Remove,
    Truncate { offset: u64 },
    Zero { offset: u64, length: u64 },
}

impl ObjectOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Remove => "remove",
            Self::Truncate { .. } => "truncate",
            Self::Zero { .. } => "zero",
        }
    }
}

struct JournalHook {
    journal: Arc<Journal>,
    tid: u64,
}

/// One in-flight operation against a single backing object.
///
/// Construction registers a child on the completion aggregate; `send`
/// consumes the request and guarantees exactly one `complete_child`.
pub struct ObjectRequest {
    store: Arc<dyn ObjectStore>,
    oid: ObjectId,
    op: ObjectOp,
    snapc: SnapContext,
    completion: Arc<AioCompletion>,
    /// Image-extent slices this request covers, for journal extent
    /// acknowledgment.
    image_extents: Vec<(u64, u64)>,
    journal: Option<JournalHook>,
}

impl ObjectRequest {
    /// Build a write of `data` at `object_offset`.
    pub fn new_write(
        store: Arc<dyn ObjectStore>,
        oid: ObjectId,
        object_offset: u64,
        data: Bytes,
        snapc: SnapContext,
        completion: Arc<AioCompletion>,
        image_extents: Vec<(u64, u64)>,
    ) -> Self {
        completion.add_child();
        Self {
            store,
            oid,
            op: ObjectOp::Write { offset: object_offset, data },
            snapc,
            completion,
            image_extents,
            journal: None,
        }
    }

    /// Build the discard primitive selected by extent geometry, or `None`
    /// when an interior extent is skipped by configuration.
    pub fn new_discard(
        store: Arc<dyn ObjectStore>,
        extent: &ObjectExtent,
        object_size: u64,
        skip_partial_discard: bool,
        snapc: SnapContext,
        completion: &Arc<AioCompletion>,
        image_extents: Vec<(u64, u64)>,
    ) -> Option<Self> {
        let op = if extent.length == object_size {
            ObjectOp::Remove
        } else if extent.offset + extent.length == object_size {
            ObjectOp::Truncate { offset: extent.offset }
        } else if skip_partial_discard {
            trace!(oid = %extent.oid, "skipping partial discard");
            return None;
        } else {
            ObjectOp::Zero { offset: extent.offset, length: extent.length }
        };
        completion.add_child();
        Some(Self {
            store,
            oid: extent.oid.clone(),
            op,
            snapc,
            completion: completion.clone(),
            image_extents,
            journal: None,
        })
    }

    /// Attach the journal hook once the coordinator has assigned a tid.
    pub(crate) fn set_journal_hook(&mut self, journal: Arc<Journal>, tid: u64) {
        self.journal = Some(JournalHook { journal, tid });
    }

    pub fn op(&self) -> &ObjectOp {
        &self.op
    }

    pub fn oid(&self) -> &ObjectId {
        &self.oid
    }

    /// Submit to the object store. Completion is reported asynchronously
    /// through the aggregate (and the journal hook, when present).
    pub fn send(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        trace!(oid = %self.oid, op = self.op.name(), "object request send");
        let result = match &self.op {
            ObjectOp::Write { offset, data } => {
                self.store
                    .write(&self.oid, *offset, data.clone(), &self.snapc)
                    .await
            }
            ObjectOp::Remove => self.store.remove(&self.oid, &self.snapc).await,
            ObjectOp::Truncate { offset } => {
                self.store.truncate(&self.oid, *offset, &self.snapc).await
            }
            ObjectOp::Zero { offset, length } => {
                self.store.zero(&self.oid, *offset, *length, &self.snapc).await
            }
        };

        let errno = match result {
            Ok(()) => 0,
            // Discarding an object that is already gone is success; the
            // volume range reads back as zeroes either way.
            Err(VolError::NoObject) if !matches!(self.op, ObjectOp::Write { .. }) => 0,
            Err(e) => {
                debug!(oid = %self.oid, op = self.op.name(), error = %e, "object request failed");
                e.to_errno()
            }
        };

        if let Some(hook) = &self.journal {
            for &(off, len) in &self.image_extents {
                hook.journal.commit_event_extent(hook.tid, off, len, errno);
            }
        }
        self.completion.complete_child(errno as i64);
    }
}

/// Gather the buffer slices of one object extent out of a flat payload.
pub(crate) fn gather(data: &Bytes, buffer_extents: &[(u64, u64)]) -> Bytes {
    if let [(off, len)] = buffer_extents {
        return data.slice(*off as usize..(*off + *len) as usize);
    }
    let mut out = BytesMut::new();
    for &(off, len) in buffer_extents {
        out.extend_from_slice(&data[off as usize..(off + len) as usize]);
    }
    out.freeze()
}
