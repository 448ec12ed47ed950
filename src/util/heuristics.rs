//! Collection trigger tunables. One immutable instance per process,
//! consulted by the allocation-path trigger checks and the partial-collect
//! policy. All byte figures are process-lifetime constants; the dynamic
//! counters they are compared against live on the recycler.

use crate::util::constants::BYTES_IN_PAGE;

pub struct RecyclerHeuristic {
    /// In-thread collection trigger: total bytes handed out since the last
    /// collection.
    pub max_uncollected_alloc_bytes: usize,
    /// Concurrent collection trigger; lower than the in-thread trigger so
    /// the background thread gets a head start.
    pub concurrent_uncollected_alloc_bytes: usize,
    /// Partial collection trigger.
    pub partial_uncollected_alloc_bytes: usize,
    /// Ceiling on pages allocated since the last collection before a
    /// partial collect is promoted to a full one.
    pub max_partial_uncollected_new_page_count: usize,
    /// A swept block page is eligible for partial reuse only if at least
    /// this many bytes on it are free.
    pub partial_collect_block_reuse_min_free_bytes: usize,
    /// Promote partial to full when efficacy/cost drops below this.
    pub partial_efficacy_threshold: f64,
    /// Budget for host-reported external (non-recycler) allocations before
    /// allocation pressure forces a collection.
    pub max_external_alloc_bytes: usize,
    /// Default cap on pooled free pages per page allocator.
    pub default_max_free_page_count: usize,
    /// Largest single page request serviced from pooled segments; bigger
    /// requests get a dedicated reservation.
    pub default_max_alloc_page_count: usize,
}

lazy_static! {
    static ref INSTANCE: RecyclerHeuristic = RecyclerHeuristic {
        max_uncollected_alloc_bytes: 16 << 20,
        concurrent_uncollected_alloc_bytes: 4 << 20,
        partial_uncollected_alloc_bytes: 1 << 20,
        max_partial_uncollected_new_page_count: 1024,
        partial_collect_block_reuse_min_free_bytes: BYTES_IN_PAGE / 2,
        partial_efficacy_threshold: 0.5,
        max_external_alloc_bytes: 192 << 20,
        default_max_free_page_count: 1024,
        default_max_alloc_page_count: 64,
    };
}

impl RecyclerHeuristic {
    pub fn instance() -> &'static RecyclerHeuristic {
        &INSTANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_ordered() {
        let h = RecyclerHeuristic::instance();
        assert!(h.partial_uncollected_alloc_bytes < h.concurrent_uncollected_alloc_bytes);
        assert!(h.concurrent_uncollected_alloc_bytes < h.max_uncollected_alloc_bytes);
        assert!(h.partial_collect_block_reuse_min_free_bytes <= BYTES_IN_PAGE);
    }
}
