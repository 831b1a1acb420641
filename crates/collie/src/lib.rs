//! # collie
//!
//! Block-device client core: presents a flat byte-addressable volume
//! backed by a striped set of fixed-size objects in an object store.
//!
//! Asynchronous read/write/discard/flush operations are fanned out
//! across the backing objects, optionally mirrored into a write-ahead
//! journal for crash recovery and replication, and coordinated with a
//! cooperative distributed exclusive lock that may revoke write
//! capability at any time.
//!
//! The usual entry point is [`Image::open`]; every volume operation
//! then goes through its `aio_*` methods or the blocking wrappers.

pub mod cache;
pub mod completion;
pub mod config;
pub mod image;
pub mod image_request;
pub mod interval;
pub mod journal;
pub mod journaler;
pub mod object_request;
pub mod store;
pub mod watcher;
pub mod work_queue;

// Re-export commonly used types at the crate root
pub use cache::ObjectCache;
pub use completion::AioCompletion;
pub use config::ImageOptions;
pub use image::{Image, ImageCtx};
pub use journal::{Journal, JournalState};
pub use journaler::{Journaler, MemJournaler};
pub use store::{MemStore, ObjectStore};
pub use watcher::{ImageWatcher, StandaloneWatcher};
pub use work_queue::ImageRequestWQ;

pub use collie_proto::{
    EventEntry, ObjectId, SnapContext, SnapId, StripingLayout, VolError, VolResult, SNAP_HEAD,
};
