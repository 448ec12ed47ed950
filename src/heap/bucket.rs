//! Size-class buckets: the per-(size, info-class) allocator front end and
//! the owner of that class's heap blocks as they migrate through the
//! collection cycle.
//!
//! The hot path is a bump pointer into the current block; when it runs dry
//! the bucket pops the block's threaded free-cell list, then a partially
//! free block from the allocable list, then asks the page allocator for a
//! fresh block. Sweeping is staged: `setup_sweep` hands every block to the
//! pending-sweep set (the background thread's working set), `sweep_pending`
//! rebuilds free lists, and the foreground `transfer_swept` folds the
//! results back where the mutator can see them. A wholly empty block found
//! by a background sweep waits on the pending-empty list; only the
//! foreground returns pages to the page allocator.

use crate::heap::block::{SmallHeapBlock, SweepState};
use crate::heap::block_map::HeapBlockMap;
use crate::heap::object_info::*;
use crate::heap::page_allocator::PageAllocator;
use crate::heap::stats::HeapBucketStats;
use crate::heap::BlockAttributes;
use crate::util::Address;

/// Everything a bucket needs from its surroundings to create and destroy
/// blocks.
pub struct BucketContext<'a> {
    pub page_allocator: &'a PageAllocator,
    pub block_map: &'a HeapBlockMap,
    /// A concurrent collection is mid-flight; fresh blocks are tagged so
    /// stats pre-aggregation can see them before they are merged.
    pub during_concurrent: bool,
    /// Never keep swept-empty pages for reuse.
    pub no_page_reuse: bool,
}

/// Result of the partial-collect reuse decision over a bucket.
#[derive(Copy, Clone, Debug, Default)]
pub struct PartialReuseStats {
    /// Free bytes on blocks kept allocable.
    pub reused_free_bytes: usize,
    /// Free bytes on under-threshold blocks parked until the next full
    /// collection; charged back to the collector's heuristic.
    pub unused_free_bytes: usize,
}

pub struct HeapBucket<A: BlockAttributes> {
    bucket_index: usize,
    bucket_kind: BucketKind,
    size_cat: usize,
    // Allocator.
    bump_current: Address,
    bump_end: Address,
    free_cell_list: Address,
    explicit_free_list: Address,
    current_block: Option<Box<SmallHeapBlock<A>>>,
    // Block lists.
    allocable: Vec<Box<SmallHeapBlock<A>>>,
    full: Vec<Box<SmallHeapBlock<A>>>,
    // Sweep staging.
    pending_sweep: Vec<Box<SmallHeapBlock<A>>>,
    swept_allocable: Vec<Box<SmallHeapBlock<A>>>,
    swept_full: Vec<Box<SmallHeapBlock<A>>>,
    pending_empty: Vec<Box<SmallHeapBlock<A>>>,
    pending_dispose_blocks: Vec<Box<SmallHeapBlock<A>>>,
    /// Two-pass concurrent sweep: allocation may resume from pass-1 output
    /// while pass 2 still runs.
    allocation_during_sweep: bool,
    heap_block_count: usize,
    stats: HeapBucketStats,
}

impl<A: BlockAttributes> HeapBucket<A> {
    pub fn new(bucket_index: usize, bucket_kind: BucketKind) -> Self {
        HeapBucket {
            bucket_index,
            bucket_kind,
            size_cat: A::bucket_size(bucket_index),
            bump_current: Address::ZERO,
            bump_end: Address::ZERO,
            free_cell_list: Address::ZERO,
            explicit_free_list: Address::ZERO,
            current_block: None,
            allocable: vec![],
            full: vec![],
            pending_sweep: vec![],
            swept_allocable: vec![],
            swept_full: vec![],
            pending_empty: vec![],
            pending_dispose_blocks: vec![],
            allocation_during_sweep: false,
            heap_block_count: 0,
            stats: HeapBucketStats::default(),
        }
    }

    pub fn size_cat(&self) -> usize {
        self.size_cat
    }

    pub fn bucket_kind(&self) -> BucketKind {
        self.bucket_kind
    }

    pub fn heap_block_kind(&self) -> HeapBlockKind {
        A::block_kind(self.bucket_kind)
    }

    pub fn heap_block_count(&self) -> usize {
        self.heap_block_count
    }

    // ---- allocation ----

    /// The hot path. Returns an uninitialized cell of `size_cat` bytes.
    pub fn alloc(&mut self, attributes: u8, ctx: &BucketContext) -> Option<Address> {
        // Explicitly freed cells are recycled first.
        if !self.explicit_free_list.is_zero() {
            return Some(self.pop_explicit_free(attributes));
        }
        loop {
            // Bump into the current fresh block.
            if self.bump_current + self.size_cat <= self.bump_end {
                let cell = self.bump_current;
                self.bump_current += self.size_cat;
                self.current_block
                    .as_mut()
                    .expect("bump range without current block")
                    .note_alloc(cell, attributes);
                return Some(cell);
            }
            // Pop the current block's free-cell list.
            if !self.free_cell_list.is_zero() {
                let cell = self.free_cell_list;
                self.free_cell_list = unsafe { cell.load::<Address>() };
                unsafe { cell.store::<Address>(Address::ZERO) };
                self.current_block
                    .as_mut()
                    .expect("free cells without current block")
                    .note_alloc(cell, attributes);
                return Some(cell);
            }
            // Current block is exhausted.
            if let Some(mut block) = self.current_block.take() {
                block.set_in_allocator(false);
                self.full.push(block);
            }
            // Promote a partially free block, or get a fresh one.
            if let Some(block) = self.allocable.pop() {
                self.adopt_block(block);
                continue;
            }
            let block = self.new_heap_block(ctx)?;
            self.adopt_block(block);
        }
    }

    fn adopt_block(&mut self, mut block: Box<SmallHeapBlock<A>>) {
        block.set_in_allocator(true);
        self.free_cell_list = block.free_object_list();
        block.set_free_object_list(Address::ZERO);
        if block.free_count() == block.object_count() && self.free_cell_list.is_zero() {
            // A virgin block: bump through the whole payload.
            self.bump_current = block.address();
            self.bump_end = block.address() + block.object_count() as usize * self.size_cat;
        } else {
            self.bump_current = Address::ZERO;
            self.bump_end = Address::ZERO;
        }
        self.current_block = Some(block);
    }

    fn new_heap_block(&mut self, ctx: &BucketContext) -> Option<Box<SmallHeapBlock<A>>> {
        let pages = ctx.page_allocator.alloc_pages(A::PAGE_COUNT)?;
        // Every fresh block is "new" until the next sweep folds it into the
        // cycle; partial collection only processes new blocks.
        let block = SmallHeapBlock::<A>::new(pages, self.bucket_index, self.bucket_kind, true);
        ctx.block_map.register_block(&block);
        self.heap_block_count += 1;
        trace!(
            "bucket {:?}/{} new heap block at {}",
            self.bucket_kind,
            self.size_cat,
            pages
        );
        Some(block)
    }

    fn pop_explicit_free(&mut self, attributes: u8) -> Address {
        let cell = self.explicit_free_list;
        self.explicit_free_list = unsafe { cell.load::<Address>() };
        unsafe { cell.store::<Address>(Address::ZERO) };
        let block = self
            .find_block_mut(cell)
            .expect("explicit free cell without owning block");
        block.reuse_explicit_free(cell, attributes);
        cell
    }

    fn find_block_mut(&mut self, addr: Address) -> Option<&mut SmallHeapBlock<A>> {
        let covers = |b: &SmallHeapBlock<A>| addr >= b.address() && addr < b.end_address();
        if self.current_block.as_deref().is_some_and(covers) {
            return self.current_block.as_deref_mut();
        }
        for list in [
            &mut self.allocable,
            &mut self.full,
            &mut self.swept_allocable,
            &mut self.swept_full,
            &mut self.pending_dispose_blocks,
        ] {
            if let Some(block) = list.iter_mut().find(|b| covers(b)) {
                return Some(block);
            }
        }
        None
    }

    /// Tombstone a cell and put it on the bucket's recycle list. Returns
    /// false if the address is not a live object start in this bucket.
    pub fn explicit_free(&mut self, addr: Address) -> bool {
        let head = self.explicit_free_list;
        let Some(block) = self.find_block_mut(addr) else {
            return false;
        };
        if !block.explicit_free(addr) {
            return false;
        }
        unsafe { addr.store::<Address>(head) };
        self.explicit_free_list = addr;
        true
    }

    // ---- collection fan-out ----

    /// Stable header pointers for every block that participates in the
    /// collection starting now. Fresh blocks created after the snapshot are
    /// born marked and stay out of the cycle. A partial collection takes
    /// only blocks created since the last sweep; everything on an old block
    /// is conservatively retained.
    pub fn snapshot_blocks(&self, out: &mut Vec<*mut SmallHeapBlock<A>>, partial: bool) {
        if let Some(block) = self.current_block.as_deref() {
            if !partial || block.is_new_block() {
                out.push(block as *const _ as *mut _);
            }
        }
        for list in [&self.allocable, &self.full, &self.pending_dispose_blocks] {
            for block in list.iter() {
                if !partial || block.is_new_block() {
                    out.push(block.as_ref() as *const _ as *mut _);
                }
            }
        }
    }

    /// Close the allocator before a sweep: the bump range collapses into
    /// ordinary free cells, the free-cell list goes back to its block, and
    /// tombstoned recycle cells are left for the sweep to reclaim.
    pub fn reset_allocator(&mut self) {
        if let Some(mut block) = self.current_block.take() {
            block.set_free_object_list(self.free_cell_list);
            block.set_in_allocator(false);
            self.allocable.push(block);
        }
        self.free_cell_list = Address::ZERO;
        self.bump_current = Address::ZERO;
        self.bump_end = Address::ZERO;
        self.explicit_free_list = Address::ZERO;
    }

    /// In-thread finalize pass; must precede the body sweep.
    pub fn sweep_finalizable_objects(&mut self, finalize: &mut dyn FnMut(Address, usize)) -> usize {
        debug_assert!(self.current_block.is_none(), "allocator must be reset first");
        if !self.bucket_kind.is_finalizable() {
            return 0;
        }
        let mut count = 0;
        for list in [&mut self.allocable, &mut self.full, &mut self.pending_dispose_blocks] {
            for block in list.iter_mut() {
                count += block.sweep_finalizable_objects(finalize);
            }
        }
        count
    }

    /// Move blocks into the pending-sweep working set: every block for a
    /// full collection, only new blocks for a partial one.
    pub fn setup_sweep(&mut self, partial: bool) {
        debug_assert!(self.current_block.is_none(), "allocator must be reset first");
        debug_assert!(self.swept_allocable.is_empty() && self.swept_full.is_empty());
        if partial {
            for list in [&mut self.allocable, &mut self.full] {
                let mut kept = Vec::with_capacity(list.len());
                for block in std::mem::take(list) {
                    if block.is_new_block() {
                        self.pending_sweep.push(block);
                    } else {
                        kept.push(block);
                    }
                }
                *list = kept;
            }
        } else {
            self.pending_sweep.append(&mut self.allocable);
            self.pending_sweep.append(&mut self.full);
            self.pending_sweep.append(&mut self.pending_dispose_blocks);
        }
        for block in self.pending_sweep.iter_mut() {
            block.clear_new_block();
        }
    }

    pub fn has_pending_sweep(&self) -> bool {
        !self.pending_sweep.is_empty()
    }

    /// Sweep up to `limit` pending blocks (all of them when `None`).
    /// Callable from the background thread; empty blocks are parked on the
    /// pending-empty list rather than released.
    pub fn sweep_pending(&mut self, limit: Option<usize>) -> usize {
        let mut swept = 0;
        while let Some(mut block) = self.pending_sweep.pop() {
            let state = block.sweep();
            match state {
                SweepState::Empty => self.pending_empty.push(block),
                SweepState::Full => self.swept_full.push(block),
                SweepState::PartialFree => self.swept_allocable.push(block),
                SweepState::PendingDispose => self.pending_dispose_blocks.push(block),
            }
            swept += 1;
            if let Some(limit) = limit {
                if swept >= limit {
                    break;
                }
            }
        }
        swept
    }

    /// Fold the sweep output back into the mutator-visible lists and
    /// release empty blocks. Foreground only.
    pub fn transfer_swept(&mut self, ctx: &BucketContext) -> usize {
        debug_assert!(self.pending_sweep.is_empty());
        self.allocable.append(&mut self.swept_allocable);
        self.full.append(&mut self.swept_full);
        self.transfer_pending_empty_heap_blocks(ctx)
    }

    /// Release blocks the sweep found wholly empty. When page reuse is
    /// allowed, one empty block per bucket is kept allocable to absorb
    /// allocation bursts.
    pub fn transfer_pending_empty_heap_blocks(&mut self, ctx: &BucketContext) -> usize {
        let mut released = 0;
        let mut keep_one = !ctx.no_page_reuse && self.allocable.is_empty();
        for block in std::mem::take(&mut self.pending_empty) {
            if keep_one {
                keep_one = false;
                self.allocable.push(block);
                continue;
            }
            self.release_block(block, ctx);
            released += 1;
        }
        released
    }

    fn release_block(&mut self, block: Box<SmallHeapBlock<A>>, ctx: &BucketContext) {
        debug_assert!(block.is_empty());
        ctx.block_map.unregister(block.address(), A::PAGE_COUNT);
        ctx.page_allocator.release_pages(block.address(), A::PAGE_COUNT);
        self.heap_block_count -= 1;
    }

    // ---- two-pass concurrent sweep ----

    /// Decide whether this bucket may resume allocation while its
    /// concurrent sweep is still running: only buckets whose last
    /// aggregation showed under half the bytes surviving and that hold at
    /// least four blocks.
    pub fn do_two_pass_concurrent_sweep_pre_check(&mut self) -> bool {
        let survival = self.stats.mem_stats().used_ratio();
        let block_count = self.allocable.len() + self.full.len() + usize::from(self.current_block.is_some());
        self.allocation_during_sweep = survival < 0.5 && block_count >= 4;
        self.allocation_during_sweep
    }

    pub fn is_allocation_during_sweep_enabled(&self) -> bool {
        self.allocation_during_sweep
    }

    /// Pass 1: sweep half the working set so allocation can resume early.
    pub fn finish_concurrent_sweep_pass1(&mut self) -> usize {
        let half = self.pending_sweep.len().div_ceil(2);
        self.sweep_pending(Some(half))
    }

    /// Foreground: adopt pass-1 output mid-sweep.
    pub fn start_allocation_during_concurrent_sweep(&mut self) -> bool {
        if !self.allocation_during_sweep {
            return false;
        }
        self.allocable.append(&mut self.swept_allocable);
        !self.allocable.is_empty()
    }

    /// Pass 2: finish the remainder.
    pub fn finish_concurrent_sweep(&mut self) -> usize {
        let swept = self.sweep_pending(None);
        self.allocation_during_sweep = false;
        swept
    }

    // ---- dispose ----

    pub fn has_disposable_objects(&self) -> bool {
        self.pending_dispose_blocks.iter().any(|b| b.has_pending_dispose())
    }

    pub fn dispose_objects(&mut self, dispose: &mut dyn FnMut(Address, usize)) -> usize {
        let mut count = 0;
        for block in self.pending_dispose_blocks.iter_mut() {
            count += block.dispose_objects(dispose);
        }
        count
    }

    /// Return disposed slots to their free lists and reclassify the blocks.
    pub fn transfer_disposed_objects(&mut self, ctx: &BucketContext) -> usize {
        let mut count = 0;
        for mut block in std::mem::take(&mut self.pending_dispose_blocks) {
            count += block.transfer_disposed_objects();
            if block.has_pending_dispose() || block.has_disposed() {
                self.pending_dispose_blocks.push(block);
            } else if block.is_empty() {
                self.release_block(block, ctx);
            } else if block.free_count() == 0 {
                self.full.push(block);
            } else {
                self.allocable.push(block);
            }
        }
        count
    }

    // ---- partial collection ----

    /// Keep only blocks worth reusing on the allocable list; park the rest
    /// until the next full collection and report their stranded free bytes.
    pub fn sweep_partial_reuse_pages(&mut self, min_free_bytes: usize) -> PartialReuseStats {
        let mut stats = PartialReuseStats::default();
        let mut kept = Vec::with_capacity(self.allocable.len());
        for block in std::mem::take(&mut self.allocable) {
            if block.free_bytes() >= min_free_bytes {
                stats.reused_free_bytes += block.free_bytes();
                kept.push(block);
            } else {
                stats.unused_free_bytes += block.free_bytes();
                self.full.push(block);
            }
        }
        self.allocable = kept;
        stats
    }

    /// After a partial collect, parked blocks become allocable again.
    pub fn finish_partial_collect(&mut self) {
        let mut still_full = Vec::with_capacity(self.full.len());
        for block in std::mem::take(&mut self.full) {
            if block.free_count() > 0 {
                self.allocable.push(block);
            } else {
                still_full.push(block);
            }
        }
        self.full = still_full;
    }

    // ---- stats, enumeration, verification ----

    pub fn begin_aggregate(&mut self) {
        self.stats.reset();
    }

    /// Pre-pass over blocks born since the last sweep; they have not been
    /// merged into the cycle yet and the main aggregation skips them.
    pub fn pre_aggregate_bucket_stats(&mut self) {
        let mut stats = HeapBucketStats::default();
        let finalizable = self.bucket_kind.is_finalizable();
        self.for_each_block(|block| {
            if block.is_new_block() {
                Self::add_block_stats(&mut stats, block, finalizable);
            }
        });
        self.stats.aggregate(&stats);
    }

    pub fn aggregate_bucket_stats(&mut self) -> HeapBucketStats {
        let mut stats = HeapBucketStats::default();
        let finalizable = self.bucket_kind.is_finalizable();
        self.for_each_block(|block| {
            if !block.is_new_block() {
                Self::add_block_stats(&mut stats, block, finalizable);
            }
        });
        self.stats.aggregate(&stats);
        self.stats
    }

    fn add_block_stats(stats: &mut HeapBucketStats, block: &SmallHeapBlock<A>, finalizable: bool) {
        stats.object_byte_count += block.object_byte_count();
        stats.total_byte_count += block.total_byte_count();
        stats.total_block_count += 1;
        let live = (block.object_count() - block.free_count()) as usize;
        stats.object_count += live;
        if finalizable {
            stats.finalize_count += live;
        }
    }

    pub fn mem_stats(&self) -> HeapBucketStats {
        self.stats
    }

    fn for_each_block(&self, mut f: impl FnMut(&SmallHeapBlock<A>)) {
        if let Some(block) = self.current_block.as_deref() {
            f(block);
        }
        for list in [
            &self.allocable,
            &self.full,
            &self.pending_sweep,
            &self.swept_allocable,
            &self.swept_full,
            &self.pending_empty,
            &self.pending_dispose_blocks,
        ] {
            for block in list.iter() {
                f(block);
            }
        }
    }

    pub fn enumerate_objects(&self, info_bits_filter: u8, f: &mut dyn FnMut(Address, usize, u8)) {
        self.for_each_block(|block| block.enumerate_objects(info_bits_filter, f));
    }

    /// Mark and push every implicit-root object in the bucket, including
    /// blocks born after the collection snapshot.
    pub fn scan_implicit_roots(&self, push: &mut dyn FnMut(crate::heap::block::MarkedObject)) {
        self.for_each_block(|block| block.scan_implicit_roots(push));
    }

    /// Clear an implicit-root bit somewhere in this bucket.
    pub fn clear_implicit_root(&mut self, addr: Address) -> bool {
        match self.find_block_mut(addr) {
            Some(block) => block.clear_implicit_root(addr),
            None => false,
        }
    }

    /// Count blocks across every list; the heap-wide `check` compares this
    /// against the tracked counter.
    pub fn check_block_count(&self) -> usize {
        let mut count = 0;
        self.for_each_block(|_| count += 1);
        debug_assert_eq!(count, self.heap_block_count, "bucket block lists out of sync");
        count
    }

    pub fn verify_mark(&self, is_marked_or_foreign: &dyn Fn(Address) -> bool) {
        self.for_each_block(|block| block.verify_mark(is_marked_or_foreign));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page_allocator::AllocatorRole;
    use crate::heap::SmallAllocationBlockAttributes;

    fn ctx<'a>(pa: &'a PageAllocator, map: &'a HeapBlockMap) -> BucketContext<'a> {
        BucketContext {
            page_allocator: pa,
            block_map: map,
            during_concurrent: false,
            no_page_reuse: false,
        }
    }

    #[test]
    fn bump_allocation_is_contiguous() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 64);
        let map = HeapBlockMap::new();
        let mut bucket = HeapBucket::<SmallAllocationBlockAttributes>::new(1, BucketKind::Normal);
        let ctx = ctx(&pa, &map);
        let a = bucket.alloc(NO_BIT, &ctx).unwrap();
        let b = bucket.alloc(NO_BIT, &ctx).unwrap();
        assert_eq!(b, a + 32usize);
        assert_eq!(bucket.heap_block_count(), 1);
        assert!(map.covers(a));
    }

    #[test]
    fn explicit_free_roundtrip_returns_same_cell() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 64);
        let map = HeapBlockMap::new();
        let mut bucket = HeapBucket::<SmallAllocationBlockAttributes>::new(0, BucketKind::Leaf);
        let ctx = ctx(&pa, &map);
        let a = bucket.alloc(LEAF_BIT, &ctx).unwrap();
        assert!(bucket.explicit_free(a));
        let b = bucket.alloc(LEAF_BIT, &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn full_sweep_reclaims_unmarked() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 64);
        let map = HeapBlockMap::new();
        let mut bucket = HeapBucket::<SmallAllocationBlockAttributes>::new(0, BucketKind::Normal);
        let bctx = ctx(&pa, &map);
        let cells: Vec<Address> = (0..10).map(|_| bucket.alloc(NO_BIT, &bctx).unwrap()).collect();

        bucket.reset_allocator();
        // Reset marks, then mark only the even cells.
        let mut blocks = vec![];
        bucket.snapshot_blocks(&mut blocks, false);
        assert_eq!(blocks.len(), 1);
        let block = unsafe { &*blocks[0] };
        block.reset_marks();
        for cell in cells.iter().step_by(2) {
            assert!(block.try_mark(*cell, false).is_some());
        }

        bucket.setup_sweep(false);
        assert!(bucket.has_pending_sweep());
        bucket.sweep_pending(None);
        bucket.transfer_swept(&bctx);

        // 5 survivors; the next allocations recycle the freed cells.
        let stats = bucket.aggregate_bucket_stats();
        assert_eq!(stats.object_count, 5);
        let again = bucket.alloc(NO_BIT, &bctx).unwrap();
        assert!(cells.contains(&again), "expected recycled cell, got {}", again);
    }

    #[test]
    fn empty_blocks_are_released_after_sweep() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 64);
        let map = HeapBlockMap::new();
        let mut bucket = HeapBucket::<SmallAllocationBlockAttributes>::new(0, BucketKind::Normal);
        let bctx = BucketContext {
            no_page_reuse: true,
            ..ctx(&pa, &map)
        };
        let a = bucket.alloc(NO_BIT, &bctx).unwrap();
        bucket.reset_allocator();
        let mut blocks = vec![];
        bucket.snapshot_blocks(&mut blocks, false);
        unsafe { &*blocks[0] }.reset_marks();
        bucket.setup_sweep(false);
        bucket.sweep_pending(None);
        bucket.transfer_swept(&bctx);
        assert_eq!(bucket.heap_block_count(), 0);
        assert!(!map.covers(a));
        assert_eq!(pa.used_page_count(), 0);
    }

    #[test]
    fn partial_reuse_parks_under_threshold_blocks() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 64);
        let map = HeapBlockMap::new();
        let mut bucket = HeapBucket::<SmallAllocationBlockAttributes>::new(0, BucketKind::Normal);
        let bctx = ctx(&pa, &map);
        // Fill a block almost completely, then sweep with everything marked
        // except a handful.
        let cells: Vec<Address> = (0..256).map(|_| bucket.alloc(NO_BIT, &bctx).unwrap()).collect();
        bucket.reset_allocator();
        let mut blocks = vec![];
        bucket.snapshot_blocks(&mut blocks, false);
        let block = unsafe { &*blocks[0] };
        block.reset_marks();
        for cell in cells.iter().skip(4) {
            block.try_mark(*cell, false).unwrap();
        }
        bucket.setup_sweep(false);
        bucket.sweep_pending(None);
        bucket.transfer_swept(&bctx);
        // 4 free cells of 16 bytes = 64 free bytes, under a 2048 threshold.
        let stats = bucket.sweep_partial_reuse_pages(2048);
        assert_eq!(stats.reused_free_bytes, 0);
        assert_eq!(stats.unused_free_bytes, 64);
        bucket.finish_partial_collect();
        // The parked block is allocable again after the partial collect.
        assert!(bucket.alloc(NO_BIT, &bctx).is_some());
    }
}
