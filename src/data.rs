//! Point-in-time diagnostic snapshots.
//!
//! bbolt's own `Stats`/`BucketStats` are the closest real precedent; these
//! are plain data, computed on demand from state a transaction already has
//! in hand — no background collector, no persisted counters.

/// Database-wide counters, as of the moment `Database::stats()` is called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Pages currently available for allocation.
    pub free_page_count: usize,
    /// Pages released by a transaction but not yet reclaimable because a
    /// reader still might observe them.
    pub pending_page_count: usize,
    /// Highest committed transaction id (0 before the first commit).
    pub tx_id: u64,
}

/// Per-bucket counters, as of the transaction `Bucket::stats()` was called
/// from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Regular (non-bucket) key/value entries directly in this bucket.
    pub key_count: usize,
    /// Immediate nested buckets.
    pub bucket_count: usize,
    /// Length of the longest root-to-leaf path in this bucket's tree (a
    /// bucket with only a root leaf has depth 1).
    pub depth: usize,
}
