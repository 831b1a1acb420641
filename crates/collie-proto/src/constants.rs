//! Volume format constants and defaults.

/// Default size of a backing object: 4 MiB.
pub const DEFAULT_OBJECT_SIZE: u64 = 1 << 22;

/// Smallest backing object size accepted by the striping layout: 4 KiB.
pub const MIN_OBJECT_SIZE: u64 = 1 << 12;

/// Largest backing object size accepted by the striping layout: 32 GiB.
pub const MAX_OBJECT_SIZE: u64 = 1 << 35;

/// Operation advice flags carried by every I/O request.
///
/// These mirror the posix_fadvise hints: they never change the result of
/// an operation, only how the cache treats the touched range.
pub const FADVISE_RANDOM: u32 = 1 << 0;
pub const FADVISE_SEQUENTIAL: u32 = 1 << 1;
pub const FADVISE_WILLNEED: u32 = 1 << 2;
pub const FADVISE_DONTNEED: u32 = 1 << 3;
pub const FADVISE_NOCACHE: u32 = 1 << 4;
