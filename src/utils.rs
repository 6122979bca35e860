//! Small shared helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap, clonable cancellation handle passed into `update_with_context` /
/// `view_with_context`. Polled before spill, after rebalance, and before
/// meta write-back, rather than wired through any implicit scoped/async
/// mechanism.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rounds `size` up to the next multiple of `page_size`.
pub(crate) fn round_up_to_page(size: u64, page_size: u64) -> u64 {
    if size % page_size == 0 {
        size
    } else {
        (size / page_size + 1) * page_size
    }
}
