//! Volume-to-object extent mapping.
//!
//! The volume's byte address space is cut into stripe units of `stripe_unit`
//! bytes. Consecutive stripe units are spread round-robin over
//! `stripe_count` objects; once each object of the set holds
//! `object_size / stripe_unit` units, the mapping moves on to the next
//! object set. The closed form, for stripe unit `u`, stripe count `w` and
//! object size `s`:
//!
//! ```text
//! blockno     = offset / u
//! stripeno    = blockno / w
//! stripepos   = blockno % w
//! objectsetno = stripeno / (s / u)
//! objectno    = objectsetno * w + stripepos
//! ```
//!
//! This layout is byte-for-byte compatible with the backing object store's
//! striping, so a volume written by one client maps identically everywhere.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_OBJECT_SIZE, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE};
use crate::error::{VolError, VolResult};
use crate::oid::ObjectId;

/// Striping parameters of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripingLayout {
    /// Size of each backing object in bytes. Power of two.
    pub object_size: u64,
    /// Size of one stripe unit in bytes. Divides `object_size`.
    pub stripe_unit: u64,
    /// Number of objects a stripe is spread over.
    pub stripe_count: u64,
}

impl Default for StripingLayout {
    fn default() -> Self {
        // No fan-out: each object holds one contiguous run of the volume.
        Self {
            object_size: DEFAULT_OBJECT_SIZE,
            stripe_unit: DEFAULT_OBJECT_SIZE,
            stripe_count: 1,
        }
    }
}

impl StripingLayout {
    /// Validate the layout invariants.
    pub fn validate(&self) -> VolResult<()> {
        if !self.object_size.is_power_of_two()
            || self.object_size < MIN_OBJECT_SIZE
            || self.object_size > MAX_OBJECT_SIZE
        {
            return Err(VolError::InvalidParam);
        }
        if self.stripe_unit == 0
            || self.stripe_count == 0
            || self.object_size % self.stripe_unit != 0
        {
            return Err(VolError::InvalidParam);
        }
        Ok(())
    }

    /// Number of backing objects needed to hold `volume_size` bytes.
    pub fn object_count(&self, volume_size: u64) -> u64 {
        let stripes_per_object = self.object_size / self.stripe_unit;
        let period = self.stripe_unit * self.stripe_count * stripes_per_object;
        if volume_size == 0 {
            return 0;
        }
        let full_periods = volume_size / period;
        let tail = volume_size % period;
        let mut count = full_periods * self.stripe_count;
        if tail > 0 {
            // A partial object set still occupies up to stripe_count objects.
            count += ((tail + self.stripe_unit - 1) / self.stripe_unit).min(self.stripe_count);
        }
        count
    }
}

/// One contiguous range within a single backing object, plus the slices of
/// the caller's flat buffer that gather into (or scatter out of) it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    /// Identifier of the backing object.
    pub oid: ObjectId,
    /// Object number within the volume.
    pub object_no: u64,
    /// Byte offset within the object.
    pub offset: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// `(buffer_offset, length)` slices of the caller's buffer, in the
    /// order the bytes appear within this object range.
    pub buffer_extents: Vec<(u64, u64)>,
}

/// Map a volume byte range to object extents.
///
/// `buffer_ofs` is the offset of this range within the caller's flat
/// buffer, so that multi-range requests land their bytes in the right
/// place. A zero-length range produces an empty mapping.
///
/// Extents are returned grouped by object, ordered by object number and
/// offset; contiguous runs within one object are merged into a single
/// extent with multiple buffer slices.
pub fn to_object_extents(
    layout: &StripingLayout,
    prefix: &str,
    file_offset: u64,
    file_length: u64,
    buffer_ofs: u64,
) -> Vec<ObjectExtent> {
    let mut extents: Vec<ObjectExtent> = Vec::new();
    if file_length == 0 {
        return extents;
    }

    let u = layout.stripe_unit;
    let w = layout.stripe_count;
    let stripes_per_object = layout.object_size / u;

    let mut pos = file_offset;
    let end = file_offset + file_length;
    let mut buf = buffer_ofs;

    while pos < end {
        let blockno = pos / u;
        let stripeno = blockno / w;
        let stripepos = blockno % w;
        let objectsetno = stripeno / stripes_per_object;
        let objectno = objectsetno * w + stripepos;

        let off_in_unit = pos % u;
        let off_in_obj = (stripeno % stripes_per_object) * u + off_in_unit;
        let n = (u - off_in_unit).min(end - pos);

        // Merge with the previous extent when this chunk continues the
        // same object range.
        match extents.iter_mut().find(|e| {
            e.object_no == objectno && e.offset + e.length == off_in_obj
        }) {
            Some(e) => {
                e.length += n;
                e.buffer_extents.push((buf, n));
            }
            None => {
                extents.push(ObjectExtent {
                    oid: ObjectId::new(prefix, objectno),
                    object_no: objectno,
                    offset: off_in_obj,
                    length: n,
                    buffer_extents: vec![(buf, n)],
                });
            }
        }

        pos += n;
        buf += n;
    }

    extents.sort_by(|a, b| (a.object_no, a.offset).cmp(&(b.object_no, b.offset)));
    extents
}
