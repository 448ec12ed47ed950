//! The heap owner: every size-class bucket group, the large bucket, the
//! block map and the four page allocators. Each collection phase is one
//! call here that fans out to every bucket.

use std::sync::Arc;

use enum_map::EnumMap;

use crate::heap::block::{MarkedObject, SmallHeapBlock};
use crate::heap::block_map::{HeapBlockMap, MappedBlock};
use crate::heap::bucket::{BucketContext, HeapBucket, PartialReuseStats};
use crate::heap::large::LargeHeapBucket;
use crate::heap::object_info::*;
use crate::heap::page_allocator::{AllocatorRole, PageAllocator};
use crate::heap::stats::{BucketStatsReport, BucketStatsReporter};
use crate::heap::{
    BlockAttributes, MediumAllocationBlockAttributes, SmallAllocationBlockAttributes,
};
use crate::util::constants::*;
use crate::util::options::{Options, PageHeapMode};
use crate::util::Address;

/// One size class across every object-info class.
pub struct HeapBucketGroup<A: BlockAttributes> {
    pub buckets: EnumMap<BucketKind, HeapBucket<A>>,
}

impl<A: BlockAttributes> HeapBucketGroup<A> {
    fn new(bucket_index: usize) -> Self {
        HeapBucketGroup {
            buckets: EnumMap::from_fn(|kind| HeapBucket::new(bucket_index, kind)),
        }
    }
}

/// A heap object as seen by enumeration clients; abstracts small, medium
/// and large blocks.
#[derive(Copy, Clone, Debug)]
pub struct RecyclerHeapObjectInfo {
    pub address: Address,
    pub size: usize,
    pub attributes: u8,
    pub is_large: bool,
}

macro_rules! for_each_bucket_mut {
    ($self:ident, $bucket:ident => $body:block) => {
        for group in $self.small_groups.iter_mut() {
            for (_, $bucket) in group.buckets.iter_mut() {
                $body
            }
        }
        for group in $self.medium_groups.iter_mut() {
            for (_, $bucket) in group.buckets.iter_mut() {
                $body
            }
        }
    };
}

macro_rules! for_each_bucket {
    ($self:ident, $bucket:ident => $body:block) => {
        for group in $self.small_groups.iter() {
            for (_, $bucket) in group.buckets.iter() {
                $body
            }
        }
        for group in $self.medium_groups.iter() {
            for (_, $bucket) in group.buckets.iter() {
                $body
            }
        }
    };
}

pub struct HeapInfo {
    small_groups: Vec<HeapBucketGroup<SmallAllocationBlockAttributes>>,
    medium_groups: Vec<HeapBucketGroup<MediumAllocationBlockAttributes>>,
    large_bucket: LargeHeapBucket,
    block_map: HeapBlockMap,
    recycler_page_allocator: Arc<PageAllocator>,
    leaf_page_allocator: Arc<PageAllocator>,
    large_page_allocator: Arc<PageAllocator>,
    with_barrier_page_allocator: Arc<PageAllocator>,
    page_heap_small: bool,
    page_heap_medium: bool,
    no_page_reuse: bool,
    /// Stable block-header pointers for the collection in flight. The
    /// background thread walks these, never the bucket lists themselves;
    /// blocks born after the snapshot stay out of the cycle.
    small_snapshot: Vec<*mut SmallHeapBlock<SmallAllocationBlockAttributes>>,
    medium_snapshot: Vec<*mut SmallHeapBlock<MediumAllocationBlockAttributes>>,
}

// The raw snapshot pointers refer to Box-stable block headers owned by the
// buckets; the collection state machine guarantees they outlive the
// snapshot. See the Recycler for the sharing discipline.
unsafe impl Send for HeapInfo {}

impl HeapInfo {
    pub fn initialize(options: &Options) -> HeapInfo {
        let max_free = *options.max_free_page_count;
        let with_barrier_page_allocator =
            Arc::new(PageAllocator::new(AllocatorRole::WithBarrier, max_free));
        with_barrier_page_allocator.enable_write_watch();
        let page_heap_mode = *options.page_heap;
        let block_kinds = *options.page_heap_block_type;
        HeapInfo {
            small_groups: (0..SMALL_BUCKET_COUNT).map(HeapBucketGroup::new).collect(),
            medium_groups: (0..MEDIUM_BUCKET_COUNT).map(HeapBucketGroup::new).collect(),
            large_bucket: LargeHeapBucket::new(
                if page_heap_mode != PageHeapMode::Off && block_kinds.includes_large() {
                    page_heap_mode
                } else {
                    PageHeapMode::Off
                },
                *options.page_heap_alloc_stack,
                *options.page_heap_free_stack,
            ),
            block_map: HeapBlockMap::new(),
            recycler_page_allocator: Arc::new(PageAllocator::new(AllocatorRole::Normal, max_free)),
            leaf_page_allocator: Arc::new(PageAllocator::new(AllocatorRole::Leaf, max_free)),
            large_page_allocator: Arc::new(PageAllocator::new(AllocatorRole::LargeBlock, max_free)),
            with_barrier_page_allocator,
            page_heap_small: page_heap_mode != PageHeapMode::Off && block_kinds.includes_small(),
            page_heap_medium: page_heap_mode != PageHeapMode::Off && block_kinds.includes_medium(),
            no_page_reuse: *options.no_page_reuse,
            small_snapshot: vec![],
            medium_snapshot: vec![],
        }
    }

    pub fn block_map(&self) -> &HeapBlockMap {
        &self.block_map
    }

    pub fn page_allocators(&self) -> Vec<Arc<PageAllocator>> {
        vec![
            self.recycler_page_allocator.clone(),
            self.leaf_page_allocator.clone(),
            self.large_page_allocator.clone(),
            self.with_barrier_page_allocator.clone(),
        ]
    }

    pub fn with_barrier_page_allocator(&self) -> &PageAllocator {
        &self.with_barrier_page_allocator
    }

    /// Route a store into the software write watch.
    pub fn write_barrier(&self, addr: Address) {
        if self.with_barrier_page_allocator.is_write_watch_enabled() {
            self.with_barrier_page_allocator.write_watch().touch(addr);
        }
    }

    /// A mark stack ran out of pages while holding this object. Dirty its
    /// page so the OOM rescan re-traces the payload; the watch table is
    /// consulted by rescan regardless of the barrier enablement.
    pub fn note_mark_stack_overflow(&self, addr: Address) {
        self.with_barrier_page_allocator.write_watch().touch(addr);
    }

    // ---- allocation ----

    /// Dispatch an allocation to the right bucket family. Returns the cell
    /// address or `None` when the page allocator is out of memory.
    pub fn real_alloc(
        &mut self,
        size: usize,
        attributes: u8,
        during_concurrent: bool,
    ) -> Option<Address> {
        let kind = BucketKind::of(attributes);
        let HeapInfo {
            small_groups,
            medium_groups,
            large_bucket,
            block_map,
            recycler_page_allocator,
            leaf_page_allocator,
            large_page_allocator,
            with_barrier_page_allocator,
            page_heap_small,
            page_heap_medium,
            no_page_reuse,
            ..
        } = self;
        let use_large = size > MAX_MEDIUM_OBJECT_SIZE
            || (size <= MAX_SMALL_OBJECT_SIZE && *page_heap_small)
            || (size > MAX_SMALL_OBJECT_SIZE && size <= MAX_MEDIUM_OBJECT_SIZE && *page_heap_medium);
        if use_large {
            return large_bucket.alloc(
                size,
                attributes,
                large_page_allocator,
                block_map,
                during_concurrent,
            );
        }
        let page_allocator = match kind {
            BucketKind::Leaf => leaf_page_allocator,
            BucketKind::NormalWithBarrier | BucketKind::FinalizableWithBarrier => {
                with_barrier_page_allocator
            }
            _ => recycler_page_allocator,
        };
        let ctx = BucketContext {
            page_allocator,
            block_map,
            during_concurrent,
            no_page_reuse: *no_page_reuse,
        };
        if size <= MAX_SMALL_OBJECT_SIZE {
            let index = SmallAllocationBlockAttributes::bucket_index(size);
            small_groups[index].buckets[kind].alloc(attributes, &ctx)
        } else {
            let index = MediumAllocationBlockAttributes::bucket_index(size);
            medium_groups[index].buckets[kind].alloc(attributes, &ctx)
        }
    }

    /// One large block, regardless of size; the no-throw fallback path.
    pub fn add_large_heap_block(&mut self, size: usize, attributes: u8) -> Option<Address> {
        self.large_bucket.alloc(
            size,
            attributes,
            &self.large_page_allocator,
            &self.block_map,
            false,
        )
    }

    /// Tombstone an explicitly freed object.
    pub fn explicit_free(&mut self, addr: Address, size: usize) -> bool {
        match self.block_map.get(addr) {
            Some(MappedBlock::Small(_)) if size <= MAX_SMALL_OBJECT_SIZE => {
                let kind_freed = self.small_explicit_free(addr, size);
                debug_assert!(kind_freed, "explicit free missed its bucket");
                kind_freed
            }
            Some(MappedBlock::Medium(_)) if size <= MAX_MEDIUM_OBJECT_SIZE => {
                let index = MediumAllocationBlockAttributes::bucket_index(size);
                let group = &mut self.medium_groups[index];
                BucketKind::ALL
                    .iter()
                    .any(|&k| group.buckets[k].explicit_free(addr))
            }
            Some(MappedBlock::Large(block)) => unsafe { block.as_ref() }.explicit_free(addr),
            _ => false,
        }
    }

    fn small_explicit_free(&mut self, addr: Address, size: usize) -> bool {
        let index = SmallAllocationBlockAttributes::bucket_index(size);
        let group = &mut self.small_groups[index];
        BucketKind::ALL
            .iter()
            .any(|&k| group.buckets[k].explicit_free(addr))
    }

    // ---- conservative marking ----

    /// Round a candidate to an object start and atomically mark it.
    pub fn try_mark(&self, addr: Address, interior: bool) -> Option<MarkedObject> {
        if addr.is_zero() {
            return None;
        }
        match self.block_map.get(addr)? {
            MappedBlock::Small(block) => unsafe { block.as_ref() }.try_mark(addr, interior),
            MappedBlock::Medium(block) => unsafe { block.as_ref() }.try_mark(addr, interior),
            MappedBlock::Large(block) => unsafe { block.as_ref() }.try_mark(addr, interior),
        }
    }

    pub fn is_object_marked(&self, addr: Address) -> bool {
        match self.block_map.get(addr) {
            Some(MappedBlock::Small(block)) => unsafe { block.as_ref() }.is_object_marked(addr, false),
            Some(MappedBlock::Medium(block)) => unsafe { block.as_ref() }.is_object_marked(addr, false),
            Some(MappedBlock::Large(block)) => unsafe { block.as_ref() }.is_object_marked(addr, false),
            None => false,
        }
    }

    /// Is the address inside any recycler-owned page?
    pub fn is_heap_address(&self, addr: Address) -> bool {
        self.block_map.covers(addr)
    }

    /// Clear an implicit-root bit anywhere in the heap.
    pub fn clear_implicit_root(&mut self, addr: Address) -> bool {
        match self.block_map.get(addr) {
            Some(MappedBlock::Small(_)) | Some(MappedBlock::Medium(_)) => {
                let mut cleared = false;
                for_each_bucket_mut!(self, bucket => {
                    if !cleared && bucket.clear_implicit_root(addr) {
                        cleared = true;
                    }
                });
                cleared
            }
            Some(MappedBlock::Large(block)) => unsafe { block.as_ref() }.clear_implicit_root(addr),
            None => false,
        }
    }

    // ---- collection phases ----

    /// Capture the set of blocks this collection will process. Foreground
    /// only; the background walks the captured pointers.
    pub fn snapshot_collection_blocks(&mut self, partial: bool) {
        self.small_snapshot.clear();
        self.medium_snapshot.clear();
        for group in self.small_groups.iter() {
            for (_, bucket) in group.buckets.iter() {
                bucket.snapshot_blocks(&mut self.small_snapshot, partial);
            }
        }
        for group in self.medium_groups.iter() {
            for (_, bucket) in group.buckets.iter() {
                bucket.snapshot_blocks(&mut self.medium_snapshot, partial);
            }
        }
    }

    /// Clear mark bits (to the invalid-bit background) on every
    /// participating block. Safe on the background thread.
    pub fn reset_marks(&self, partial: bool) {
        for &block in self.small_snapshot.iter() {
            unsafe { &*block }.reset_marks();
        }
        for &block in self.medium_snapshot.iter() {
            unsafe { &*block }.reset_marks();
        }
        self.large_bucket.reset_marks(partial);
    }

    /// Push implicit roots of the snapshotted blocks.
    pub fn scan_initial_implicit_roots(&self, push: &mut dyn FnMut(MarkedObject)) {
        for &block in self.small_snapshot.iter() {
            unsafe { &*block }.scan_implicit_roots(push);
        }
        for &block in self.medium_snapshot.iter() {
            unsafe { &*block }.scan_implicit_roots(push);
        }
        self.large_bucket.scan_initial_implicit_roots(push);
    }

    /// Push implicit roots everywhere, catching objects allocated since the
    /// snapshot. Foreground only (walks live bucket lists).
    pub fn scan_new_implicit_roots(&self, push: &mut dyn FnMut(MarkedObject)) {
        for_each_bucket!(self, bucket => {
            bucket.scan_implicit_roots(push);
        });
        self.large_bucket.scan_new_implicit_roots(push);
    }

    /// Re-trace objects on pages dirtied through the write barrier since
    /// the last reset. Returns the number of pages processed.
    pub fn rescan(&self, push: &mut dyn FnMut(MarkedObject)) -> usize {
        let dirty = self.with_barrier_page_allocator.write_watch().drain();
        let mut pages = 0;
        for page in dirty {
            match self.block_map.get(page) {
                Some(MappedBlock::Small(block)) => {
                    unsafe { block.as_ref() }.rescan_page(page, push);
                    pages += 1;
                }
                Some(MappedBlock::Medium(block)) => {
                    unsafe { block.as_ref() }.rescan_page(page, push);
                    pages += 1;
                }
                Some(MappedBlock::Large(block)) => {
                    unsafe { block.as_ref() }.rescan(push);
                    pages += 1;
                }
                None => {}
            }
        }
        pages
    }

    /// Close every bucket's allocator ahead of the sweep.
    pub fn reset_allocators(&mut self) {
        for_each_bucket_mut!(self, bucket => {
            bucket.reset_allocator();
        });
    }

    /// The in-thread finalize pass over every finalizable bucket. Must
    /// precede any body sweep, so a finalizer observes every heap object it
    /// can still reach.
    pub fn sweep_finalizable_objects(&mut self, finalize: &mut dyn FnMut(Address, usize)) -> usize {
        let mut count = 0;
        for_each_bucket_mut!(self, bucket => {
            count += bucket.sweep_finalizable_objects(finalize);
        });
        count += self.large_bucket.sweep_finalizable_objects(finalize);
        count
    }

    /// Stage every participating block for sweeping.
    pub fn setup_sweep(&mut self, partial: bool) {
        self.small_snapshot.clear();
        self.medium_snapshot.clear();
        for_each_bucket_mut!(self, bucket => {
            bucket.setup_sweep(partial);
        });
        self.large_bucket.merge_new_blocks();
    }

    /// Sweep everything staged. Runs on the background thread during a
    /// concurrent sweep.
    pub fn sweep_pending(&mut self, background: bool) -> usize {
        let mut swept = 0;
        for_each_bucket_mut!(self, bucket => {
            swept += bucket.sweep_pending(None);
        });
        let HeapInfo {
            large_bucket,
            block_map,
            large_page_allocator,
            ..
        } = self;
        large_bucket.sweep(large_page_allocator, block_map, background);
        swept
    }

    /// Fold sweep output back into the mutator-visible lists and release
    /// empty blocks. Foreground only.
    pub fn transfer_swept(&mut self) -> usize {
        let HeapInfo {
            small_groups,
            medium_groups,
            large_bucket,
            block_map,
            recycler_page_allocator,
            leaf_page_allocator,
            large_page_allocator,
            with_barrier_page_allocator,
            no_page_reuse,
            ..
        } = self;
        let mut released = 0;
        for group in small_groups.iter_mut() {
            for (kind, bucket) in group.buckets.iter_mut() {
                let ctx = BucketContext {
                    page_allocator: allocator_for(
                        kind,
                        recycler_page_allocator,
                        leaf_page_allocator,
                        with_barrier_page_allocator,
                    ),
                    block_map,
                    during_concurrent: false,
                    no_page_reuse: *no_page_reuse,
                };
                released += bucket.transfer_swept(&ctx);
            }
        }
        for group in medium_groups.iter_mut() {
            for (kind, bucket) in group.buckets.iter_mut() {
                let ctx = BucketContext {
                    page_allocator: allocator_for(
                        kind,
                        recycler_page_allocator,
                        leaf_page_allocator,
                        with_barrier_page_allocator,
                    ),
                    block_map,
                    during_concurrent: false,
                    no_page_reuse: *no_page_reuse,
                };
                released += bucket.transfer_swept(&ctx);
            }
        }
        released += large_bucket.transfer_pending_empty_blocks(large_page_allocator, block_map);
        released
    }

    // ---- two-pass concurrent sweep ----

    /// Ask each bucket whether it wants allocation-during-sweep. Returns
    /// true if any bucket opted in.
    pub fn do_two_pass_concurrent_sweep_pre_check(&mut self) -> bool {
        let mut any = false;
        for_each_bucket_mut!(self, bucket => {
            any |= bucket.do_two_pass_concurrent_sweep_pre_check();
        });
        any
    }

    /// Background pass 1 over the opted-in buckets.
    pub fn finish_concurrent_sweep_pass1(&mut self) -> usize {
        let mut swept = 0;
        for_each_bucket_mut!(self, bucket => {
            if bucket.is_allocation_during_sweep_enabled() {
                swept += bucket.finish_concurrent_sweep_pass1();
            }
        });
        swept
    }

    /// Foreground: let opted-in buckets allocate from pass-1 output.
    pub fn start_allocation_during_concurrent_sweep(&mut self) {
        for_each_bucket_mut!(self, bucket => {
            bucket.start_allocation_during_concurrent_sweep();
        });
    }

    /// Background pass 2 plus everything that never opted in.
    pub fn finish_concurrent_sweep(&mut self) -> usize {
        let mut swept = 0;
        for_each_bucket_mut!(self, bucket => {
            swept += bucket.finish_concurrent_sweep();
        });
        swept
    }

    // ---- partial collection ----

    pub fn sweep_partial_reuse_pages(&mut self, min_free_bytes: usize) -> PartialReuseStats {
        let mut total = PartialReuseStats::default();
        for_each_bucket_mut!(self, bucket => {
            let stats = bucket.sweep_partial_reuse_pages(min_free_bytes);
            total.reused_free_bytes += stats.reused_free_bytes;
            total.unused_free_bytes += stats.unused_free_bytes;
        });
        total
    }

    pub fn finish_partial_collect(&mut self) {
        for_each_bucket_mut!(self, bucket => {
            bucket.finish_partial_collect();
        });
    }

    // ---- finalization / dispose ----

    pub fn has_disposable_object(&self) -> bool {
        let mut any = self.large_bucket.has_pending_dispose();
        for_each_bucket!(self, bucket => {
            any |= bucket.has_disposable_objects();
        });
        any
    }

    pub fn dispose_objects(&mut self, dispose: &mut dyn FnMut(Address, usize)) -> usize {
        let mut count = 0;
        for_each_bucket_mut!(self, bucket => {
            count += bucket.dispose_objects(dispose);
        });
        count + self.large_bucket.dispose_objects(dispose)
    }

    pub fn transfer_disposed_objects(&mut self) -> usize {
        let HeapInfo {
            small_groups,
            medium_groups,
            large_bucket,
            block_map,
            recycler_page_allocator,
            leaf_page_allocator,
            large_page_allocator,
            with_barrier_page_allocator,
            no_page_reuse,
            ..
        } = self;
        let mut count = 0;
        for group in small_groups.iter_mut() {
            for (kind, bucket) in group.buckets.iter_mut() {
                let ctx = BucketContext {
                    page_allocator: allocator_for(
                        kind,
                        recycler_page_allocator,
                        leaf_page_allocator,
                        with_barrier_page_allocator,
                    ),
                    block_map,
                    during_concurrent: false,
                    no_page_reuse: *no_page_reuse,
                };
                count += bucket.transfer_disposed_objects(&ctx);
            }
        }
        for group in medium_groups.iter_mut() {
            for (kind, bucket) in group.buckets.iter_mut() {
                let ctx = BucketContext {
                    page_allocator: allocator_for(
                        kind,
                        recycler_page_allocator,
                        leaf_page_allocator,
                        with_barrier_page_allocator,
                    ),
                    block_map,
                    during_concurrent: false,
                    no_page_reuse: *no_page_reuse,
                };
                count += bucket.transfer_disposed_objects(&ctx);
            }
        }
        count += large_bucket.transfer_disposed_objects(large_page_allocator, block_map);
        count
    }

    // ---- enumeration, stats, verification ----

    pub fn enumerate_objects(
        &self,
        info_bits_filter: u8,
        f: &mut dyn FnMut(RecyclerHeapObjectInfo),
    ) {
        for_each_bucket!(self, bucket => {
            bucket.enumerate_objects(info_bits_filter, &mut |address, size, attributes| {
                f(RecyclerHeapObjectInfo {
                    address,
                    size,
                    attributes,
                    is_large: false,
                })
            });
        });
        self.large_bucket
            .enumerate_objects(info_bits_filter, &mut |address, size, attributes| {
                f(RecyclerHeapObjectInfo {
                    address,
                    size,
                    attributes,
                    is_large: true,
                })
            });
    }

    pub fn get_bucket_stats(&mut self, dump: bool) -> BucketStatsReport {
        let mut reporter = BucketStatsReporter::new(dump);
        for_each_bucket_mut!(self, bucket => {
            bucket.begin_aggregate();
            bucket.pre_aggregate_bucket_stats();
            let stats = bucket.aggregate_bucket_stats();
            reporter.add(bucket.heap_block_kind(), bucket.bucket_kind(), bucket.size_cat(), &stats);
        });
        let large_stats = self.large_bucket.aggregate_bucket_stats();
        reporter.add(
            HeapBlockKind::Large,
            BucketKind::Normal,
            self.large_bucket.size_cat(),
            &large_stats,
        );
        reporter.finish()
    }

    pub fn heap_block_count_by_kind(&self) -> EnumMap<HeapBlockKind, usize> {
        let mut counts: EnumMap<HeapBlockKind, usize> = EnumMap::default();
        for_each_bucket!(self, bucket => {
            counts[bucket.heap_block_kind()] += bucket.heap_block_count();
        });
        counts[HeapBlockKind::Large] = self.large_bucket.block_count();
        counts
    }

    /// Total small/medium block count. With `check`, walk every list and
    /// compare against the tracked counters.
    pub fn get_small_heap_block_count(&self, check: bool) -> usize {
        let mut count = 0;
        for_each_bucket!(self, bucket => {
            count += if check {
                bucket.check_block_count()
            } else {
                bucket.heap_block_count()
            };
        });
        count
    }

    pub fn get_large_heap_block_count(&self) -> usize {
        self.large_bucket.block_count()
    }

    /// Walk every list and validate counters.
    pub fn check(&self) {
        let walked = self.get_small_heap_block_count(true);
        let tracked = self.get_small_heap_block_count(false);
        debug_assert_eq!(walked, tracked, "heap block count mismatch");
    }

    /// After mark: assert every pointer in a marked object leads to a
    /// marked object.
    pub fn verify_mark(&self) {
        let is_marked_or_foreign = |addr: Address| -> bool {
            match self.block_map.get(addr) {
                None => true,
                Some(MappedBlock::Small(b)) => unsafe { b.as_ref() }.verify_mark_probe(addr),
                Some(MappedBlock::Medium(b)) => unsafe { b.as_ref() }.verify_mark_probe(addr),
                Some(MappedBlock::Large(b)) => unsafe { b.as_ref() }.is_marked(),
            }
        };
        for_each_bucket!(self, bucket => {
            bucket.verify_mark(&is_marked_or_foreign);
        });
    }
}

fn allocator_for<'a>(
    kind: BucketKind,
    normal: &'a Arc<PageAllocator>,
    leaf: &'a Arc<PageAllocator>,
    with_barrier: &'a Arc<PageAllocator>,
) -> &'a PageAllocator {
    match kind {
        BucketKind::Leaf => leaf,
        BucketKind::NormalWithBarrier | BucketKind::FinalizableWithBarrier => with_barrier,
        _ => normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> HeapInfo {
        HeapInfo::initialize(&Options::default())
    }

    #[test]
    fn alloc_dispatches_by_size() {
        let mut heap = heap();
        let small = heap.real_alloc(40, NO_BIT, false).unwrap();
        let medium = heap.real_alloc(2000, NO_BIT, false).unwrap();
        let large = heap.real_alloc(20000, NO_BIT, false).unwrap();
        assert!(heap.is_heap_address(small));
        assert!(heap.is_heap_address(medium));
        assert!(heap.is_heap_address(large));
        let counts = heap.heap_block_count_by_kind();
        assert_eq!(counts[HeapBlockKind::SmallNormal], 1);
        assert_eq!(counts[HeapBlockKind::MediumNormal], 1);
        assert_eq!(counts[HeapBlockKind::Large], 1);
        heap.check();
    }

    #[test]
    fn leaf_and_barrier_use_their_own_allocators() {
        let mut heap = heap();
        heap.real_alloc(32, LEAF_BIT, false).unwrap();
        heap.real_alloc(32, WITH_BARRIER_BIT, false).unwrap();
        let allocators = heap.page_allocators();
        // normal, leaf, large, with-barrier
        assert_eq!(allocators[0].used_page_count(), 0);
        assert_eq!(allocators[1].used_page_count(), 1);
        assert_eq!(allocators[2].used_page_count(), 0);
        assert_eq!(allocators[3].used_page_count(), 1);
    }

    #[test]
    fn full_collection_cycle_sweeps_unreferenced() {
        let mut heap = heap();
        let keep = heap.real_alloc(48, NO_BIT, false).unwrap();
        let drop_ = heap.real_alloc(48, NO_BIT, false).unwrap();
        heap.reset_allocators();
        heap.snapshot_collection_blocks(false);
        heap.reset_marks(false);
        assert!(heap.try_mark(keep, false).is_some());
        assert!(heap.try_mark(keep, false).is_none());
        heap.setup_sweep(false);
        heap.sweep_pending(false);
        heap.transfer_swept();
        // The unmarked cell is free again; the marked one is not.
        let again = heap.real_alloc(48, NO_BIT, false).unwrap();
        assert_eq!(again, drop_);
        assert_ne!(again, keep);
    }

    #[test]
    fn write_barrier_feeds_rescan() {
        let mut heap = heap();
        let obj = heap.real_alloc(64, WITH_BARRIER_BIT, false).unwrap();
        heap.reset_allocators();
        heap.snapshot_collection_blocks(false);
        heap.reset_marks(false);
        heap.try_mark(obj, false).unwrap();
        heap.write_barrier(obj);
        let mut pushed = vec![];
        let pages = heap.rescan(&mut |m| pushed.push(m.address));
        assert_eq!(pages, 1);
        assert_eq!(pushed, vec![obj]);
        // The dirty set was consumed.
        assert_eq!(heap.rescan(&mut |_| {}), 0);
    }

    #[test]
    fn bucket_stats_reflect_live_bytes() {
        let mut heap = heap();
        heap.real_alloc(100, NO_BIT, false).unwrap();
        let report = heap.get_bucket_stats(false);
        // 100 rounds to a 112-byte bucket.
        assert!(report.total.object_byte_count >= 112);
        assert!(report.total.total_byte_count >= BYTES_IN_PAGE);
    }
}
