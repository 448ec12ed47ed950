//! Large objects: one header per object, each on its own page run. The
//! large bucket keeps the headers in plain lists and sweeps by walking
//! them. Page-heap debug mode hangs a guard page off either end of the run
//! and optionally captures allocation/free backtraces.

use atomic::Ordering;

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU8};

use crate::heap::block::MarkedObject;
use crate::heap::block_map::HeapBlockMap;
use crate::heap::object_info::*;
use crate::heap::page_allocator::PageAllocator;
use crate::heap::stats::HeapBucketStats;
use crate::util::constants::*;
use crate::util::conversions::{bytes_to_pages_up, object_size_cat, pages_to_bytes, raw_align_down};
use crate::util::memory;
use crate::util::options::PageHeapMode;
use crate::util::Address;

pub struct LargeHeapBlock {
    /// Object payload start. Not necessarily the start of the page run in
    /// page-heap BlockEnd mode.
    address: Address,
    pages_start: Address,
    page_count: usize,
    object_size: usize,
    attributes: AtomicU8,
    mark: AtomicBool,
    is_new: bool,
    pending_dispose: bool,
    disposed: bool,
    page_heap_mode: PageHeapMode,
    alloc_stack: Option<Backtrace>,
    free_stack: Option<Backtrace>,
}

impl LargeHeapBlock {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pages_start(&self) -> Address {
        self.pages_start
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn attributes(&self) -> u8 {
        self.attributes.load(Ordering::Relaxed)
    }

    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::SeqCst)
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn reset_marks(&self) {
        let implicit = self.attributes() & IMPLICIT_ROOT_BIT != 0;
        self.mark.store(implicit, Ordering::SeqCst);
    }

    pub fn clear_implicit_root(&self, addr: Address) -> bool {
        if addr != self.address {
            return false;
        }
        let info = self.attributes();
        self.attributes.store(info & !IMPLICIT_ROOT_BIT, Ordering::Relaxed);
        true
    }

    /// Atomically mark. Non-interior candidates must hit the payload start
    /// exactly; interior candidates anywhere inside the payload.
    pub fn try_mark(&self, addr: Address, interior: bool) -> Option<MarkedObject> {
        let hit = if interior {
            addr >= self.address && addr < self.address + self.object_size
        } else {
            addr == self.address
        };
        if !hit || self.pending_dispose || self.disposed {
            return None;
        }
        let info = self.attributes();
        if info & DELETED_BIT != 0 {
            return None;
        }
        if self.mark.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(MarkedObject {
            address: self.address,
            size: self.object_size,
            info,
        })
    }

    pub fn is_object_marked(&self, addr: Address, interior: bool) -> bool {
        let hit = if interior {
            addr >= self.address && addr < self.address + self.object_size
        } else {
            addr == self.address
        };
        hit && self.is_marked()
    }

    pub fn scan_implicit_roots(&self, push: &mut dyn FnMut(MarkedObject)) {
        let info = self.attributes();
        if info & IMPLICIT_ROOT_BIT == 0 || info & DELETED_BIT != 0 {
            return;
        }
        self.mark.store(true, Ordering::SeqCst);
        push(MarkedObject {
            address: self.address,
            size: self.object_size,
            info,
        });
    }

    pub fn rescan(&self, push: &mut dyn FnMut(MarkedObject)) -> usize {
        let info = self.attributes();
        if self.is_marked() && info & (LEAF_BIT | DELETED_BIT) == 0 {
            push(MarkedObject {
                address: self.address,
                size: self.object_size,
                info,
            });
            1
        } else {
            0
        }
    }

    pub fn explicit_free(&self, addr: Address) -> bool {
        if addr != self.address {
            return false;
        }
        let info = self.attributes();
        self.attributes.store(info | DELETED_BIT, Ordering::Relaxed);
        true
    }

    pub fn note_free_stack(&mut self, capture: bool) {
        if capture {
            self.free_stack = Some(Backtrace::force_capture());
        }
    }

    pub fn alloc_stack(&self) -> Option<&Backtrace> {
        self.alloc_stack.as_ref()
    }

    pub fn free_stack(&self) -> Option<&Backtrace> {
        self.free_stack.as_ref()
    }
}

/// How page-heap placement shaped a large allocation.
struct LargeLayout {
    total_pages: usize,
    object_offset: usize,
    guard: Option<(usize, usize)>,
}

fn large_layout(size: usize, page_heap: PageHeapMode) -> LargeLayout {
    let object_pages = bytes_to_pages_up(size);
    match page_heap {
        PageHeapMode::Off => LargeLayout {
            total_pages: object_pages,
            object_offset: 0,
            guard: None,
        },
        // Data at the start of the run, guard page after it: overruns fault.
        PageHeapMode::BlockStart => LargeLayout {
            total_pages: object_pages + 1,
            object_offset: 0,
            guard: Some((object_pages, 1)),
        },
        // Guard page first, data pushed against the end: underruns fault
        // and so do overruns past the unaligned tail.
        PageHeapMode::BlockEnd => LargeLayout {
            total_pages: object_pages + 1,
            object_offset: pages_to_bytes(object_pages + 1)
                - crate::util::conversions::raw_align_up(size, OBJECT_GRANULARITY),
            guard: Some((0, 1)),
        },
    }
}

/// The bucket for objects above the medium threshold.
pub struct LargeHeapBucket {
    blocks: Vec<Box<LargeHeapBlock>>,
    /// Blocks created while a concurrent collection was mid-flight; merged
    /// into `blocks` at sweep.
    new_blocks: Vec<Box<LargeHeapBlock>>,
    /// Finalized blocks awaiting the dispose callback.
    pending_dispose: Vec<Box<LargeHeapBlock>>,
    /// Disposed blocks awaiting the in-thread page release.
    disposed: Vec<Box<LargeHeapBlock>>,
    /// Blocks swept empty by the background thread, released in-thread at
    /// transfer so the page allocator is never raced.
    pending_empty: Vec<Box<LargeHeapBlock>>,
    stats: HeapBucketStats,
    page_heap_mode: PageHeapMode,
    capture_alloc_stack: bool,
    capture_free_stack: bool,
}

impl LargeHeapBucket {
    pub fn new(page_heap_mode: PageHeapMode, capture_alloc_stack: bool, capture_free_stack: bool) -> Self {
        LargeHeapBucket {
            blocks: vec![],
            new_blocks: vec![],
            pending_dispose: vec![],
            disposed: vec![],
            pending_empty: vec![],
            stats: HeapBucketStats::default(),
            page_heap_mode,
            capture_alloc_stack,
            capture_free_stack,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len() + self.new_blocks.len()
    }

    /// Allocate one large object with its own block. Returns the payload
    /// address, zeroed.
    pub fn alloc(
        &mut self,
        size: usize,
        attributes: u8,
        page_allocator: &PageAllocator,
        block_map: &HeapBlockMap,
        during_concurrent: bool,
    ) -> Option<Address> {
        let size_cat = object_size_cat(size);
        let layout = large_layout(size_cat, self.page_heap_mode);
        let pages = page_allocator.alloc_pages(layout.total_pages)?;
        if let Some((guard_page, guard_count)) = layout.guard {
            memory::decommit(pages + pages_to_bytes(guard_page), pages_to_bytes(guard_count));
        }
        let address = pages + layout.object_offset;
        let block = Box::new(LargeHeapBlock {
            address,
            pages_start: pages,
            page_count: layout.total_pages,
            object_size: size_cat,
            attributes: AtomicU8::new(attributes),
            // Objects born during a collection survive it.
            mark: AtomicBool::new(true),
            is_new: true,
            pending_dispose: false,
            disposed: false,
            page_heap_mode: self.page_heap_mode,
            alloc_stack: if self.capture_alloc_stack {
                Some(Backtrace::force_capture())
            } else {
                None
            },
            free_stack: None,
        });
        block_map.register_large_block(&block);
        if during_concurrent {
            self.new_blocks.push(block);
        } else {
            self.blocks.push(block);
        }
        trace!("large alloc {} bytes at {} ({:?})", size_cat, address, self.page_heap_mode);
        Some(address)
    }

    pub fn merge_new_blocks(&mut self) {
        for block in self.new_blocks.iter_mut() {
            block.is_new = false;
        }
        self.blocks.append(&mut self.new_blocks);
    }

    /// Reset marks for the blocks participating in this collection. A
    /// partial collection resets only blocks created since the last sweep;
    /// older blocks keep their marks and are conservatively retained.
    pub fn reset_marks(&self, partial: bool) {
        for block in self.blocks.iter() {
            if !partial || block.is_new() {
                block.reset_marks();
            }
        }
    }

    pub fn scan_initial_implicit_roots(&self, push: &mut dyn FnMut(MarkedObject)) {
        for block in self.blocks.iter() {
            block.scan_implicit_roots(push);
        }
    }

    pub fn scan_new_implicit_roots(&self, push: &mut dyn FnMut(MarkedObject)) {
        for block in self.new_blocks.iter() {
            block.scan_implicit_roots(push);
        }
    }

    /// In-thread finalize pass over dead finalizable blocks.
    pub fn sweep_finalizable_objects(&mut self, finalize: &mut dyn FnMut(Address, usize)) -> usize {
        let mut count = 0;
        let mut kept = Vec::with_capacity(self.blocks.len());
        for mut block in std::mem::take(&mut self.blocks) {
            let info = block.attributes();
            let dead = info & DELETED_BIT != 0 || !block.is_marked();
            if dead && info & FINALIZE_BIT != 0 {
                block
                    .attributes
                    .store(info & !FINALIZE_BIT, Ordering::Relaxed);
                finalize(block.address(), block.object_size());
                block.pending_dispose = true;
                self.pending_dispose.push(block);
                count += 1;
            } else {
                kept.push(block);
            }
        }
        self.blocks = kept;
        count
    }

    /// Sweep dead blocks. Empty page runs go straight back to the page
    /// allocator in-thread, or to the pending-empty list when the sweep is
    /// running in the background.
    pub fn sweep(
        &mut self,
        page_allocator: &PageAllocator,
        block_map: &HeapBlockMap,
        background: bool,
    ) {
        let mut kept = Vec::with_capacity(self.blocks.len());
        for mut block in std::mem::take(&mut self.blocks) {
            let info = block.attributes();
            let dead = info & DELETED_BIT != 0 || !block.is_marked();
            if !dead {
                block.is_new = false;
                kept.push(block);
                continue;
            }
            debug_assert!(info & FINALIZE_BIT == 0, "finalize pass must precede sweep");
            block.note_free_stack(self.capture_free_stack);
            if background {
                self.pending_empty.push(block);
            } else {
                Self::release_block(block, page_allocator, block_map);
            }
        }
        self.blocks = kept;
    }

    fn release_block(block: Box<LargeHeapBlock>, page_allocator: &PageAllocator, block_map: &HeapBlockMap) {
        block_map.unregister(block.pages_start(), block.page_count());
        // Guard pages were decommitted; recommit so the allocator gets the
        // whole run back in a uniform state.
        if block.page_heap_mode != PageHeapMode::Off {
            memory::commit(block.pages_start(), pages_to_bytes(block.page_count()));
        }
        page_allocator.release_pages(block.pages_start(), block.page_count());
    }

    /// Foreground transfer of blocks the background sweep found dead.
    pub fn transfer_pending_empty_blocks(
        &mut self,
        page_allocator: &PageAllocator,
        block_map: &HeapBlockMap,
    ) -> usize {
        let pending = std::mem::take(&mut self.pending_empty);
        let count = pending.len();
        for block in pending {
            Self::release_block(block, page_allocator, block_map);
        }
        count
    }

    pub fn has_pending_dispose(&self) -> bool {
        !self.pending_dispose.is_empty()
    }

    pub fn dispose_objects(&mut self, dispose: &mut dyn FnMut(Address, usize)) -> usize {
        let pending = std::mem::take(&mut self.pending_dispose);
        let count = pending.len();
        for mut block in pending {
            dispose(block.address(), block.object_size());
            block.pending_dispose = false;
            block.disposed = true;
            self.disposed.push(block);
        }
        count
    }

    pub fn transfer_disposed_objects(
        &mut self,
        page_allocator: &PageAllocator,
        block_map: &HeapBlockMap,
    ) -> usize {
        let disposed = std::mem::take(&mut self.disposed);
        let count = disposed.len();
        for block in disposed {
            Self::release_block(block, page_allocator, block_map);
        }
        count
    }

    pub fn rescan(&self, push: &mut dyn FnMut(MarkedObject)) -> usize {
        let mut count = 0;
        for block in self.blocks.iter().chain(self.new_blocks.iter()) {
            count += block.rescan(push);
        }
        count
    }

    pub fn enumerate_objects(&self, info_bits_filter: u8, f: &mut dyn FnMut(Address, usize, u8)) {
        for block in self.blocks.iter().chain(self.new_blocks.iter()) {
            let info = block.attributes();
            if info & DELETED_BIT != 0 {
                continue;
            }
            if info_bits_filter != 0 && info & info_bits_filter == 0 {
                continue;
            }
            f(block.address(), block.object_size(), info);
        }
    }

    pub fn aggregate_bucket_stats(&mut self) -> HeapBucketStats {
        let mut stats = HeapBucketStats::default();
        for block in self.blocks.iter().chain(self.new_blocks.iter()) {
            stats.total_byte_count += pages_to_bytes(block.page_count());
            // Everything still on the lists survived the last sweep.
            stats.object_byte_count += block.object_size();
            stats.total_block_count += 1;
            stats.object_count += 1;
            if block.attributes() & FINALIZE_BIT != 0 {
                stats.finalize_count += 1;
            }
        }
        self.stats = stats;
        stats
    }

    pub fn mem_stats(&self) -> HeapBucketStats {
        self.stats
    }

    /// The size category reported for the large bucket in stats events:
    /// everything above the medium threshold, capped for the u16 field.
    pub fn size_cat(&self) -> usize {
        raw_align_down(u16::MAX as usize, OBJECT_GRANULARITY)
    }
}
