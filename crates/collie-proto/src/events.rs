//! Journal event wire format.
//!
//! Every mutating volume operation is mirrored into the write-ahead
//! journal as one event. On the wire an event is the bincode encoding of
//! a [`FramedEvent`]: the transaction id assigned by the coordinator plus
//! the event body. Replay decodes the same framing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{VolError, VolResult};

/// Body of a journal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventEntry {
    /// A write of `data` at `offset`. `length == data.len()`.
    AioWrite {
        offset: u64,
        length: u64,
        data: Bytes,
    },
    /// A discard of the given volume range.
    AioDiscard { offset: u64, length: u64 },
    /// A flush barrier. Carries no payload.
    AioFlush,
}

impl EventEntry {
    /// Event type name, for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AioWrite { .. } => "aio_write",
            Self::AioDiscard { .. } => "aio_discard",
            Self::AioFlush => "aio_flush",
        }
    }
}

/// A journal event as framed on the wire: the transaction id plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramedEvent {
    /// Monotonic transaction id, unique for the journal's lifetime.
    pub tid: u64,
    /// Event body.
    pub entry: EventEntry,
}

impl FramedEvent {
    /// Encode for appending to the journal.
    pub fn encode(&self) -> VolResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|_| VolError::CorruptEntry)
    }

    /// Decode a journal payload back into the framed event.
    pub fn decode(payload: &[u8]) -> VolResult<Self> {
        bincode::deserialize(payload).map_err(|_| VolError::CorruptEntry)
    }
}
