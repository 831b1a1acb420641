//! Image request objects — the per-operation send paths.
//!
//! A request clips its range against the volume size sampled under the
//! snap lock, maps it to object extents, and fans out per-object
//! children under the completion aggregate. Mutating requests branch on
//! journal and cache presence: with a journal, the object children are
//! stashed and handed to the coordinator, which submits them once the
//! event append is issued; with a cache, writes land in the cache and
//! the cache owns final dispatch to the store.

use std::sync::Arc;

use bytes::Bytes;
use collie_proto::constants::FADVISE_RANDOM;
use collie_proto::striping::to_object_extents;
use collie_proto::{EventEntry, VolError, SNAP_HEAD};
use tracing::{debug, trace};

use crate::completion::AioCompletion;
use crate::image::{clip_io, ImageCtx};
use crate::object_request::{gather, ObjectRequest};

/// One volume operation, from submission to `finish_adding_requests`.
pub enum ImageRequest {
    Read {
        /// `(offset, length)` ranges; gathered bytes land back to back in
        /// the destination buffer.
        extents: Vec<(u64, u64)>,
        op_flags: u32,
    },
    Write {
        offset: u64,
        data: Bytes,
        op_flags: u32,
    },
    Discard {
        offset: u64,
        length: u64,
    },
    Flush,
}

enum MutatingKind {
    Write { data: Bytes },
    Discard,
}

impl ImageRequest {
    /// Writes and discards mutate the volume and are subject to write
    /// suspension and lock gating.
    pub fn is_write_op(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Discard { .. })
    }

    pub fn request_type(&self) -> &'static str {
        match self {
            Self::Read { .. } => "aio_read",
            Self::Write { .. } => "aio_write",
            Self::Discard { .. } => "aio_discard",
            Self::Flush => "aio_flush",
        }
    }

    /// Run the request's submission path. Returns once every child has
    /// been constructed and handed off; completion arrives through the
    /// aggregate.
    pub async fn send(self, ctx: &Arc<ImageCtx>, comp: &Arc<AioCompletion>) {
        let _owner = ctx.owner_lock.read().await;
        trace!(image = %ctx.name, request = self.request_type(), "send");
        comp.get();

        match self {
            Self::Read { extents, op_flags } => send_read(ctx, comp, extents, op_flags).await,
            Self::Write { offset, data, op_flags: _ } => {
                send_mutating(ctx, comp, offset, data.len() as u64, MutatingKind::Write { data })
                    .await
            }
            Self::Discard { offset, length } => {
                send_mutating(ctx, comp, offset, length, MutatingKind::Discard).await
            }
            Self::Flush => send_flush(ctx, comp).await,
        }
    }
}

async fn send_read(
    ctx: &Arc<ImageCtx>,
    comp: &Arc<AioCompletion>,
    extents: Vec<(u64, u64)>,
    op_flags: u32,
) {
    // Sample the snapshot and clip while the size cannot move.
    let (snap_id, mapped, total, readahead) = {
        let snap = ctx.snap_read().await;
        let mut mapped = Vec::new();
        let mut buffer_ofs = 0u64;
        let mut last_range = None;
        for &(offset, length) in &extents {
            let clipped = clip_io(&snap, offset, length);
            if clipped == 0 {
                continue;
            }
            mapped.extend(to_object_extents(
                &ctx.layout,
                &ctx.object_prefix,
                offset,
                clipped,
                buffer_ofs,
            ));
            buffer_ofs += clipped;
            last_range = Some((offset, clipped));
        }

        // Sequential readahead window past the last range, trimmed to the
        // volume. Readahead children are not chained to the aggregate.
        let readahead = match last_range {
            Some((offset, clipped))
                if ctx.cache.is_some()
                    && ctx.opts.readahead_max_bytes > 0
                    && op_flags & FADVISE_RANDOM == 0 =>
            {
                let start = offset + clipped;
                let len = ctx.opts.readahead_max_bytes.min(snap.size.saturating_sub(start));
                (len > 0).then_some((start, len))
            }
            _ => None,
        };
        (snap.snap_id, mapped, buffer_ofs, readahead)
    };

    comp.init_read_buf(total as usize);
    comp.set_rval(total as i64);

    for extent in mapped {
        comp.add_child();
        let store = ctx.store.clone();
        let cache = ctx.cache.clone();
        let comp = comp.clone();
        tokio::spawn(async move {
            let result = match &cache {
                Some(cache) => {
                    cache
                        .read(&store, &extent.oid, extent.object_no, extent.offset, extent.length)
                        .await
                }
                None => store.read(&extent.oid, extent.offset, extent.length, snap_id).await,
            };
            match result {
                Ok(data) => {
                    comp.write_read_data(&extent.buffer_extents, &data);
                    comp.complete_child(0);
                }
                // Unwritten ranges read as zeroes; the buffer is
                // pre-zeroed.
                Err(VolError::NoObject) => comp.complete_child(0),
                Err(e) => comp.complete_child(e.to_errno() as i64),
            }
        });
    }

    if let Some((start, len)) = readahead {
        if let Some(cache) = ctx.cache.clone() {
            let store = ctx.store.clone();
            let window =
                to_object_extents(&ctx.layout, &ctx.object_prefix, start, len, 0);
            trace!(start, len, "readahead");
            tokio::spawn(async move {
                for extent in window {
                    let _ = cache
                        .read(&store, &extent.oid, extent.object_no, extent.offset, extent.length)
                        .await;
                }
            });
        }
    }

    comp.finish_adding_requests();
    comp.put();
}

async fn send_mutating(
    ctx: &Arc<ImageCtx>,
    comp: &Arc<AioCompletion>,
    offset: u64,
    length: u64,
    kind: MutatingKind,
) {
    // Entering the mutating path without lock ownership is a programming
    // error; the work queue gates dispatch on it.
    debug_assert!(!ctx.watcher.is_lock_supported() || ctx.watcher.is_lock_owner());

    // Record the request as in flight until its completion fires, so a
    // flush arriving later can wait for it.
    let op_id = ctx.start_async_op();
    {
        let ctx = ctx.clone();
        comp.add_complete_hook(Box::new(move || ctx.finish_async_op(op_id)));
    }

    let _md = ctx.md_lock.read().await;

    let (clipped, extents, snapc) = {
        let snap = ctx.snap_read().await;
        if snap.snap_id != SNAP_HEAD || snap.read_only {
            comp.fail(VolError::ReadOnly.to_errno() as i64);
            return;
        }
        let clipped = clip_io(&snap, offset, length);
        let extents = to_object_extents(&ctx.layout, &ctx.object_prefix, offset, clipped, 0);
        (clipped, extents, snap.snapc.clone())
    };

    comp.set_rval(clipped as i64);

    if clipped == 0 {
        comp.finish_adding_requests();
        comp.put();
        return;
    }

    match kind {
        MutatingKind::Write { data } => {
            send_write_requests(ctx, comp, offset, clipped, data, extents, snapc).await;
        }
        MutatingKind::Discard => {
            send_discard_requests(ctx, comp, offset, clipped, extents, snapc).await;
        }
    }

    comp.finish_adding_requests();
    comp.put();
}

async fn send_write_requests(
    ctx: &Arc<ImageCtx>,
    comp: &Arc<AioCompletion>,
    offset: u64,
    clipped: u64,
    data: Bytes,
    extents: Vec<collie_proto::ObjectExtent>,
    snapc: collie_proto::SnapContext,
) {
    debug!(image = %ctx.name, offset, len = clipped, objects = extents.len(), "write");

    if let Some(cache) = &ctx.cache {
        // The cache owns final dispatch to the store. With a journal the
        // event's extents are acknowledged by cache writeback, which is
        // held until the event is safe.
        let tid = match &ctx.journal {
            Some(journal) => {
                let event = EventEntry::AioWrite {
                    offset,
                    length: clipped,
                    data: data.slice(..clipped as usize),
                };
                match journal
                    .append_event(comp, event, Vec::new(), offset, clipped, false)
                    .await
                {
                    Ok(tid) => Some(tid),
                    Err(e) => {
                        comp.fail(e.to_errno() as i64);
                        return;
                    }
                }
            }
            None => None,
        };

        for extent in extents {
            comp.add_child();
            let chunk = gather(&data, &extent.buffer_extents);
            let commits: Vec<(u64, u64, u64)> = match tid {
                Some(tid) => extent
                    .buffer_extents
                    .iter()
                    .map(|&(b, l)| (tid, offset + b, l))
                    .collect(),
                None => Vec::new(),
            };
            let store = ctx.store.clone();
            let cache = cache.clone();
            let journal = ctx.journal.clone();
            let comp = comp.clone();
            tokio::spawn(async move {
                match cache
                    .write(&store, &extent.oid, extent.object_no, extent.offset, &chunk, commits.clone())
                    .await
                {
                    Ok(()) => comp.complete_child(0),
                    Err(e) => {
                        // The data never reached the cache; settle the
                        // journal extents with the failure.
                        if let Some(journal) = &journal {
                            for (tid, off, len) in commits {
                                journal.commit_event_extent(tid, off, len, e.to_errno());
                            }
                        }
                        comp.complete_child(e.to_errno() as i64);
                    }
                }
            });
        }
        return;
    }

    let mut requests = Vec::with_capacity(extents.len());
    for extent in &extents {
        let chunk = gather(&data, &extent.buffer_extents);
        let image_extents: Vec<(u64, u64)> = extent
            .buffer_extents
            .iter()
            .map(|&(b, l)| (offset + b, l))
            .collect();
        requests.push(ObjectRequest::new_write(
            ctx.store.clone(),
            extent.oid.clone(),
            extent.offset,
            chunk,
            snapc.clone(),
            comp.clone(),
            image_extents,
        ));
    }

    match &ctx.journal {
        Some(journal) => {
            let event = EventEntry::AioWrite {
                offset,
                length: clipped,
                data: data.slice(..clipped as usize),
            };
            if let Err(e) = journal
                .append_event(comp, event, requests, offset, clipped, false)
                .await
            {
                comp.fail(e.to_errno() as i64);
            }
        }
        None => {
            for request in requests {
                request.send();
            }
        }
    }
}

async fn send_discard_requests(
    ctx: &Arc<ImageCtx>,
    comp: &Arc<AioCompletion>,
    offset: u64,
    clipped: u64,
    extents: Vec<collie_proto::ObjectExtent>,
    snapc: collie_proto::SnapContext,
) {
    debug!(image = %ctx.name, offset, len = clipped, objects = extents.len(), "discard");

    let mut requests = Vec::new();
    let mut skipped: Vec<(u64, u64)> = Vec::new();
    for extent in &extents {
        let image_extents: Vec<(u64, u64)> = extent
            .buffer_extents
            .iter()
            .map(|&(b, l)| (offset + b, l))
            .collect();
        match ObjectRequest::new_discard(
            ctx.store.clone(),
            extent,
            ctx.layout.object_size,
            ctx.opts.skip_partial_discard,
            snapc.clone(),
            comp,
            image_extents.clone(),
        ) {
            Some(request) => requests.push(request),
            None => skipped.extend(image_extents),
        }
    }

    // Invalidate cached objects. Entries still owing journal
    // acknowledgments settle them now: their data is superseded and will
    // never be written back.
    let mut orphan_commits = Vec::new();
    if let Some(cache) = &ctx.cache {
        for extent in &extents {
            orphan_commits.extend(cache.purge(extent.object_no));
        }
    }

    match &ctx.journal {
        Some(journal) => {
            let event = EventEntry::AioDiscard { offset, length: clipped };
            match journal
                .append_event(comp, event, requests, offset, clipped, false)
                .await
            {
                Ok(tid) => {
                    // Extents suppressed by skip_partial_discard have no
                    // object child to acknowledge them.
                    for (off, len) in skipped {
                        journal.commit_event_extent(tid, off, len, 0);
                    }
                }
                Err(e) => comp.fail(e.to_errno() as i64),
            }
            for (tid, off, len) in orphan_commits {
                journal.commit_event_extent(tid, off, len, 0);
            }
        }
        None => {
            for request in requests {
                request.send();
            }
        }
    }
}

async fn send_flush(ctx: &Arc<ImageCtx>, comp: &Arc<AioCompletion>) {
    if let Some(journal) = &ctx.journal {
        let snap = ctx.snap_read().await;
        let result = journal
            .append_event(comp, EventEntry::AioFlush, Vec::new(), 0, 0, false)
            .await;
        drop(snap);
        match result {
            Ok(_tid) => journal.flush_appends(),
            Err(e) => {
                comp.fail(e.to_errno() as i64);
                return;
            }
        }
    }

    comp.add_child();
    let ctx = ctx.clone();
    let comp_child = comp.clone();
    tokio::spawn(async move {
        // Wait for every request in flight at flush time to complete,
        // then flush the cache (which owns dirty data) or the transport.
        ctx.flush_async_operations().await;
        let r = match &ctx.cache {
            Some(cache) => cache.flush(&ctx.store, ctx.journal.as_ref()).await,
            None => ctx.store.flush().await,
        };
        comp_child.complete_child(match r {
            Ok(()) => 0,
            Err(e) => e.to_errno() as i64,
        });
    });

    comp.finish_adding_requests();
    comp.put();
}
