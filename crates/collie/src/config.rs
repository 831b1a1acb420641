//! Image tunables.

/// Per-image options. These are fixed at open time.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// When true, every request is queued for the worker pool instead of
    /// running on the caller's task.
    pub non_blocking_aio: bool,
    /// Suppress object-interior zero requests on discard. Whole-object
    /// removes and end-of-object truncates still happen.
    pub skip_partial_discard: bool,
    /// Readahead window for cached sequential reads, in bytes. Zero
    /// disables readahead.
    pub readahead_max_bytes: u64,
    /// Number of worker tasks draining the request queue.
    pub queue_workers: usize,
    /// Write-back cache capacity in objects. Zero disables the cache.
    pub cache_objects: usize,
    /// Interval between background writeback passes, when the cache is
    /// enabled.
    pub cache_writeback_interval: std::time::Duration,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            non_blocking_aio: true,
            skip_partial_discard: false,
            readahead_max_bytes: 512 * 1024,
            queue_workers: 4,
            cache_objects: 0,
            cache_writeback_interval: std::time::Duration::from_secs(5),
        }
    }
}
