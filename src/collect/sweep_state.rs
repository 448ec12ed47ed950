//! Cross-phase sweep state. One `RecyclerSweep` lives from the end of mark
//! until the transfer completes, whether the body sweep runs in-thread or
//! in the background.

use std::time::{Duration, Instant};

use crate::heap::bucket::PartialReuseStats;

pub struct RecyclerSweep {
    /// The body sweep runs on the background thread.
    background: bool,
    /// A partial collection: only new blocks were staged.
    partial: bool,
    /// Two-pass concurrent sweep engaged for at least one bucket.
    two_pass: bool,
    /// Objects were finalized this cycle and dispose has not drained yet.
    /// May only be set while the background holds the block lists, and may
    /// only be cleared by the mutator in `transfer_disposed_objects`.
    has_pending_transfer_disposed_objects: bool,
    finalize_count: usize,
    swept_block_count: usize,
    partial_reuse: PartialReuseStats,
    start: Instant,
    background_elapsed: Duration,
}

impl RecyclerSweep {
    pub fn new(background: bool, partial: bool) -> RecyclerSweep {
        RecyclerSweep {
            background,
            partial,
            two_pass: false,
            has_pending_transfer_disposed_objects: false,
            finalize_count: 0,
            swept_block_count: 0,
            partial_reuse: PartialReuseStats::default(),
            start: Instant::now(),
            background_elapsed: Duration::ZERO,
        }
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn set_two_pass(&mut self) {
        self.two_pass = true;
    }

    pub fn is_two_pass(&self) -> bool {
        self.two_pass
    }

    pub fn note_finalized(&mut self, count: usize) {
        self.finalize_count += count;
        if count > 0 {
            self.has_pending_transfer_disposed_objects = true;
        }
    }

    pub fn finalize_count(&self) -> usize {
        self.finalize_count
    }

    pub fn note_swept_blocks(&mut self, count: usize) {
        self.swept_block_count += count;
    }

    pub fn swept_block_count(&self) -> usize {
        self.swept_block_count
    }

    pub fn has_pending_transfer_disposed_objects(&self) -> bool {
        self.has_pending_transfer_disposed_objects
    }

    /// Mutator-only, after dispose slots returned to their free lists.
    pub fn clear_pending_transfer_disposed_objects(&mut self) {
        self.has_pending_transfer_disposed_objects = false;
    }

    pub fn set_partial_reuse(&mut self, stats: PartialReuseStats) {
        self.partial_reuse = stats;
    }

    pub fn partial_reuse(&self) -> PartialReuseStats {
        self.partial_reuse
    }

    pub fn note_background_elapsed(&mut self, elapsed: Duration) {
        self.background_elapsed += elapsed;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn background_elapsed(&self) -> Duration {
        self.background_elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_transfer_flag_follows_finalization() {
        let mut sweep = RecyclerSweep::new(false, false);
        assert!(!sweep.has_pending_transfer_disposed_objects());
        sweep.note_finalized(0);
        assert!(!sweep.has_pending_transfer_disposed_objects());
        sweep.note_finalized(3);
        assert!(sweep.has_pending_transfer_disposed_objects());
        assert_eq!(sweep.finalize_count(), 3);
        sweep.clear_pending_transfer_disposed_objects();
        assert!(!sweep.has_pending_transfer_disposed_objects());
    }
}
