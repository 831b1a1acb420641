/// Snapshot identifiers and contexts.
use serde::{Deserialize, Serialize};

/// A point-in-time snapshot identifier.
pub type SnapId = u64;

/// Sentinel snapshot id meaning "the writable head of the volume".
pub const SNAP_HEAD: SnapId = u64::MAX;

/// The snapshot context a write must respect: the most recent snapshot
/// sequence number plus the ids of all existing snapshots, newest first.
///
/// An empty context (seq 0, no snaps) is valid and describes a volume
/// that has never been snapshotted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    /// Highest snapshot id ever issued for this volume.
    pub seq: SnapId,
    /// Existing snapshot ids, newest first.
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    /// A context is valid when `seq` is at least as new as every listed
    /// snapshot and the list is sorted newest first.
    pub fn is_valid(&self) -> bool {
        if let Some(&newest) = self.snaps.first() {
            if self.seq < newest {
                return false;
            }
        }
        self.snaps.windows(2).all(|w| w[0] > w[1])
    }
}
