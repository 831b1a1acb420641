//! # collie-proto
//!
//! Volume format types for the collie block-device client.
//!
//! This crate defines everything a component needs to speak the volume
//! format without pulling in the I/O engine: error codes, backing-object
//! identifiers, the striping layout and extent mapper, snapshot contexts,
//! and the journal event wire format.

pub mod constants;
pub mod error;
pub mod events;
pub mod oid;
pub mod snap;
pub mod striping;

// Re-export commonly used types at the crate root
pub use error::{VolError, VolResult};
pub use events::{EventEntry, FramedEvent};
pub use oid::ObjectId;
pub use snap::{SnapContext, SnapId, SNAP_HEAD};
pub use striping::{ObjectExtent, StripingLayout};
