//! Bitmap heap blocks: page-aligned arenas holding many objects of one
//! size class. A block answers "is this address a live object start" with
//! one valid-pointers lookup and one atomic bit test, carries the per-slot
//! mark/free bits and per-object info bytes, and knows how to sweep itself.
//!
//! Mark bits are indexed by granularity slot so that the bit position of an
//! object is just its block offset shifted; slots that are not object
//! starts are pre-set from the valid-pointers invalid bits, so a fully
//! marked block reads as all-ones without any table lookup.

use atomic::Ordering;

use std::marker::PhantomData;
use std::sync::atomic::AtomicU8;

use crate::heap::object_info::*;
use crate::heap::valid_pointers::BucketValidPointers;
use crate::heap::BlockAttributes;
use crate::util::bitvector::{AtomicBitVector, BitVector};
use crate::util::constants::*;
use crate::util::Address;

/// Result of marking a conservative candidate: a newly marked object whose
/// payload the caller now owns for scanning.
#[derive(Copy, Clone, Debug)]
pub struct MarkedObject {
    pub address: Address,
    pub size: usize,
    pub info: u8,
}

/// Where a block lands after a sweep.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SweepState {
    /// No live objects and nothing pending dispose; the pages can go back
    /// to the page allocator.
    Empty,
    /// Live objects and free cells; allocable.
    PartialFree,
    /// No free cells.
    Full,
    /// Has objects that were finalized and now await dispose.
    PendingDispose,
}

pub struct SmallHeapBlock<A: BlockAttributes> {
    address: Address,
    bucket_index: u16,
    object_size: usize,
    object_count: u16,
    /// Granularity slots per object.
    stride: usize,
    bucket_kind: BucketKind,
    free_count: u16,
    /// Free count after the last sweep; partial-collect reuse looks at it.
    last_free_count: u16,
    free_object_list: Address,
    mark_bits: AtomicBitVector,
    free_bits: AtomicBitVector,
    /// Slots explicitly freed since the last sweep, kept for verification.
    debug_free_bits: BitVector,
    object_info: Box<[AtomicU8]>,
    /// Object indexes finalized this sweep, awaiting the dispose callback.
    pending_dispose: Vec<u16>,
    pending_dispose_bits: BitVector,
    /// Disposed object indexes awaiting their slot transfer.
    disposed: Vec<u16>,
    is_in_allocator: bool,
    is_new_block: bool,
    _marker: PhantomData<A>,
}

impl<A: BlockAttributes> SmallHeapBlock<A> {
    /// Wrap freshly committed pages as an empty block of the given size
    /// class. Every cell starts out free; the owning bucket bump-allocates
    /// straight out of the pages until the first sweep rebuilds the block
    /// as a free-list block.
    pub fn new(address: Address, bucket_index: usize, bucket_kind: BucketKind, is_new_block: bool) -> Box<Self> {
        debug_assert!(address.is_aligned_to(BYTES_IN_PAGE));
        let object_size = A::bucket_size(bucket_index);
        let vpm = Self::vpm_for(bucket_index);
        let object_count = vpm.object_count();
        let stride = object_size / OBJECT_GRANULARITY;

        let mark_bits = AtomicBitVector::new(A::MAX_SLOT_COUNT);
        mark_bits.copy_from(vpm.invalid_bits());
        let free_bits = AtomicBitVector::new(A::MAX_SLOT_COUNT);
        for j in 0..object_count as usize {
            free_bits.set(j * stride);
        }
        let mut object_info = Vec::with_capacity(object_count as usize);
        object_info.resize_with(object_count as usize, || AtomicU8::new(0));

        Box::new(SmallHeapBlock {
            address,
            bucket_index: bucket_index as u16,
            object_size,
            object_count,
            stride,
            bucket_kind,
            free_count: object_count,
            last_free_count: object_count,
            free_object_list: Address::ZERO,
            mark_bits,
            free_bits,
            debug_free_bits: BitVector::new(A::MAX_SLOT_COUNT),
            object_info: object_info.into_boxed_slice(),
            pending_dispose: vec![],
            pending_dispose_bits: BitVector::new(object_count as usize),
            disposed: vec![],
            is_in_allocator: false,
            is_new_block,
            _marker: PhantomData,
        })
    }

    fn vpm_for(bucket_index: usize) -> &'static BucketValidPointers {
        A::valid_pointers().bucket(bucket_index)
    }

    fn vpm(&self) -> &'static BucketValidPointers {
        Self::vpm_for(self.bucket_index as usize)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn end_address(&self) -> Address {
        self.address + A::BLOCK_BYTES
    }

    pub fn bucket_index(&self) -> usize {
        self.bucket_index as usize
    }

    pub fn bucket_kind(&self) -> BucketKind {
        self.bucket_kind
    }

    pub fn heap_block_kind(&self) -> HeapBlockKind {
        A::block_kind(self.bucket_kind)
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn object_count(&self) -> u16 {
        self.object_count
    }

    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    pub fn last_free_count(&self) -> u16 {
        self.last_free_count
    }

    pub fn free_bytes(&self) -> usize {
        self.free_count as usize * self.object_size
    }

    pub fn is_empty(&self) -> bool {
        self.free_count == self.object_count && self.pending_dispose.is_empty() && self.disposed.is_empty()
    }

    pub fn is_in_allocator(&self) -> bool {
        self.is_in_allocator
    }

    pub fn set_in_allocator(&mut self, value: bool) {
        self.is_in_allocator = value;
    }

    pub fn is_new_block(&self) -> bool {
        self.is_new_block
    }

    pub fn clear_new_block(&mut self) {
        self.is_new_block = false;
    }

    pub fn object_address(&self, index: u16) -> Address {
        debug_assert!(index < self.object_count);
        self.address + index as usize * self.object_size
    }

    fn slot_of(&self, index: u16) -> usize {
        index as usize * self.stride
    }

    pub fn object_info(&self, index: u16) -> u8 {
        self.object_info[index as usize].load(Ordering::Relaxed)
    }

    pub fn set_object_info(&self, index: u16, info: u8) {
        self.object_info[index as usize].store(info, Ordering::Relaxed);
    }

    pub fn is_object_free(&self, index: u16) -> bool {
        self.free_bits.is_set(self.slot_of(index))
    }

    // ---- allocation ----

    /// Head of the threaded free-cell list, for the bucket's allocator.
    pub fn free_object_list(&self) -> Address {
        self.free_object_list
    }

    pub fn set_free_object_list(&mut self, head: Address) {
        self.free_object_list = head;
    }

    /// Record that the bucket handed out the cell at `addr`.
    pub fn note_alloc(&mut self, addr: Address, attributes: u8) {
        debug_assert!(addr >= self.address && addr < self.end_address());
        let offset = addr - self.address;
        debug_assert_eq!(offset % self.object_size, 0);
        let index = (offset / self.object_size) as u16;
        let slot = self.slot_of(index);
        debug_assert!(self.free_bits.is_set(slot));
        self.free_bits.clear(slot);
        self.debug_free_bits.clear(slot);
        self.object_info[index as usize].store(attributes, Ordering::Relaxed);
        self.free_count -= 1;
        // An object born during concurrent mark must survive the cycle even
        // though nothing scanned it yet.
        self.mark_bits.set(slot);
    }

    /// Tombstone an explicitly freed cell. The slot is reclaimed at the
    /// next sweep unless the bucket recycles it first.
    pub fn explicit_free(&mut self, addr: Address) -> bool {
        let offset = addr - self.address;
        let index = self.vpm().get_address_index(offset);
        if index == INVALID_OBJECT_INDEX {
            return false;
        }
        let slot = self.slot_of(index);
        if self.free_bits.is_set(slot) {
            return false;
        }
        let info = self.object_info[index as usize].load(Ordering::Relaxed);
        self.object_info[index as usize].store(info | DELETED_BIT, Ordering::Relaxed);
        self.debug_free_bits.set(slot);
        true
    }

    /// Un-tombstone a cell the bucket is recycling from its explicit free
    /// list.
    pub fn reuse_explicit_free(&mut self, addr: Address, attributes: u8) {
        let offset = addr - self.address;
        let index = self.vpm().get_address_index(offset);
        debug_assert_ne!(index, INVALID_OBJECT_INDEX);
        let slot = self.slot_of(index);
        debug_assert!(!self.free_bits.is_set(slot));
        self.debug_free_bits.clear(slot);
        self.object_info[index as usize].store(attributes, Ordering::Relaxed);
        self.mark_bits.set(slot);
    }

    // ---- marking ----

    /// Round a candidate to an object start, atomically set its mark bit
    /// and return the object if this call newly marked it.
    pub fn try_mark(&self, addr: Address, interior: bool) -> Option<MarkedObject> {
        let offset = addr - self.address;
        let index = if interior {
            self.vpm().get_interior_index(offset)
        } else {
            self.vpm().get_address_index(offset)
        };
        if index == INVALID_OBJECT_INDEX || index >= self.object_count {
            return None;
        }
        let slot = self.slot_of(index);
        if self.free_bits.is_set(slot) {
            return None;
        }
        let info = self.object_info[index as usize].load(Ordering::Relaxed);
        if info & DELETED_BIT != 0 {
            return None;
        }
        if !self.mark_bits.test_and_set(slot) {
            return None;
        }
        Some(MarkedObject {
            address: self.object_address(index),
            size: self.object_size,
            info,
        })
    }

    pub fn is_object_marked(&self, addr: Address, interior: bool) -> bool {
        let offset = addr - self.address;
        let index = if interior {
            self.vpm().get_interior_index(offset)
        } else {
            self.vpm().get_address_index(offset)
        };
        if index == INVALID_OBJECT_INDEX || index >= self.object_count {
            return false;
        }
        self.mark_bits.is_set(self.slot_of(index))
    }

    /// Mark-verification probe: true unless the address resolves to a live
    /// object that is unmarked. Free and tombstoned cells pass; a stale
    /// pointer to them is not a marking defect.
    pub fn verify_mark_probe(&self, addr: Address) -> bool {
        let offset = addr - self.address;
        let index = self.vpm().get_interior_index(offset);
        if index == INVALID_OBJECT_INDEX || index >= self.object_count {
            return true;
        }
        let slot = self.slot_of(index);
        if self.free_bits.is_set(slot) {
            return true;
        }
        let info = self.object_info[index as usize].load(Ordering::Relaxed);
        if info & DELETED_BIT != 0 {
            return true;
        }
        self.mark_bits.is_set(slot)
    }

    /// Reset mark bits to the invalid-bits background, then re-assert
    /// implicit roots so they survive without incoming references.
    pub fn reset_marks(&self) {
        self.mark_bits.copy_from(self.vpm().invalid_bits());
        for index in 0..self.object_count {
            let slot = self.slot_of(index);
            if self.free_bits.is_set(slot) {
                continue;
            }
            let info = self.object_info[index as usize].load(Ordering::Relaxed);
            if info & IMPLICIT_ROOT_BIT != 0 {
                self.mark_bits.set(slot);
            }
        }
    }

    /// Push every implicit-root object's payload to the mark visitor.
    pub fn scan_implicit_roots(&self, push: &mut dyn FnMut(MarkedObject)) {
        for index in 0..self.object_count {
            let slot = self.slot_of(index);
            if self.free_bits.is_set(slot) {
                continue;
            }
            let info = self.object_info[index as usize].load(Ordering::Relaxed);
            if info & IMPLICIT_ROOT_BIT == 0 || info & DELETED_BIT != 0 {
                continue;
            }
            self.mark_bits.set(slot);
            push(MarkedObject {
                address: self.object_address(index),
                size: self.object_size,
                info,
            });
        }
    }

    /// Clear an object's implicit-root bit. Returns false if the address is
    /// not a live object start in this block.
    pub fn clear_implicit_root(&self, addr: Address) -> bool {
        let offset = addr - self.address;
        let index = self.vpm().get_address_index(offset);
        if index == INVALID_OBJECT_INDEX || index >= self.object_count {
            return false;
        }
        if self.free_bits.is_set(self.slot_of(index)) {
            return false;
        }
        let info = self.object_info[index as usize].load(Ordering::Relaxed);
        self.object_info[index as usize].store(info & !IMPLICIT_ROOT_BIT, Ordering::Relaxed);
        true
    }

    /// Re-push marked, scannable objects intersecting a dirty page.
    /// Returns the number of objects re-pushed.
    pub fn rescan_page(&self, page_addr: Address, push: &mut dyn FnMut(MarkedObject)) -> usize {
        debug_assert!(page_addr >= self.address && page_addr < self.end_address());
        let page = (page_addr - self.address) >> LOG_BYTES_IN_PAGE;
        let info = self.vpm().block_info(page);
        let page_start_offset = page << LOG_BYTES_IN_PAGE;
        let mut first = self.vpm().get_interior_index(page_start_offset);
        if first == INVALID_OBJECT_INDEX {
            // The page starts in trailing waste; nothing to do.
            return 0;
        }
        let last = std::cmp::min(info.last_object_index_on_page, self.object_count - 1);
        let mut rescanned = 0;
        while first <= last {
            let slot = self.slot_of(first);
            if self.mark_bits.is_set(slot) && !self.free_bits.is_set(slot) {
                let object_info = self.object_info[first as usize].load(Ordering::Relaxed);
                if object_info & (LEAF_BIT | DELETED_BIT) == 0 {
                    push(MarkedObject {
                        address: self.object_address(first),
                        size: self.object_size,
                        info: object_info,
                    });
                    rescanned += 1;
                }
            }
            first += 1;
        }
        rescanned
    }

    // ---- sweeping ----

    /// In-thread finalize pass: invoke the finalizer of every dead
    /// finalizable object exactly once and queue it for dispose. No slot is
    /// freed here; the object's memory stays intact until after dispose.
    pub fn sweep_finalizable_objects(&mut self, finalize: &mut dyn FnMut(Address, usize)) -> usize {
        debug_assert!(self.bucket_kind.is_finalizable());
        let mut count = 0;
        for index in 0..self.object_count {
            let slot = self.slot_of(index);
            if self.free_bits.is_set(slot) || self.pending_dispose_bits.is_set(index as usize) {
                continue;
            }
            let info = self.object_info[index as usize].load(Ordering::Relaxed);
            if info & FINALIZE_BIT == 0 {
                continue;
            }
            let dead = info & DELETED_BIT != 0 || !self.mark_bits.is_set(slot);
            if !dead {
                continue;
            }
            // Clear the bit before calling out so re-entrant sweeps cannot
            // finalize twice.
            self.object_info[index as usize].store(info & !FINALIZE_BIT, Ordering::Relaxed);
            finalize(self.object_address(index), self.object_size);
            self.pending_dispose_bits.set(index as usize);
            self.pending_dispose.push(index);
            count += 1;
        }
        count
    }

    /// Sweep the block: rebuild the free-cell list from the mark bits.
    /// Dead finalizable objects must already have gone through
    /// `sweep_finalizable_objects`; their slots are skipped until dispose.
    pub fn sweep(&mut self) -> SweepState {
        let mut free_list = Address::ZERO;
        let mut free_count = 0u16;
        for index in (0..self.object_count).rev() {
            let slot = self.slot_of(index);
            if self.pending_dispose_bits.is_set(index as usize) {
                continue;
            }
            let info = self.object_info[index as usize].load(Ordering::Relaxed);
            let was_free = self.free_bits.is_set(slot);
            let dead = was_free || info & DELETED_BIT != 0 || !self.mark_bits.is_set(slot);
            if !dead {
                continue;
            }
            debug_assert!(
                info & FINALIZE_BIT == 0 || was_free,
                "dead finalizable object survived the finalize pass"
            );
            if !was_free {
                self.free_bits.set(slot);
                self.object_info[index as usize].store(0, Ordering::Relaxed);
            }
            self.debug_free_bits.clear(slot);
            let cell = self.object_address(index);
            unsafe {
                cell.store::<Address>(free_list);
            }
            free_list = cell;
            free_count += 1;
        }
        self.free_object_list = free_list;
        self.free_count = free_count;
        self.last_free_count = free_count;
        if !self.pending_dispose.is_empty() || !self.disposed.is_empty() {
            SweepState::PendingDispose
        } else if free_count == self.object_count {
            SweepState::Empty
        } else if free_count == 0 {
            SweepState::Full
        } else {
            SweepState::PartialFree
        }
    }

    pub fn has_pending_dispose(&self) -> bool {
        !self.pending_dispose.is_empty()
    }

    pub fn has_disposed(&self) -> bool {
        !self.disposed.is_empty()
    }

    /// Run the dispose callback for every finalized object. Slots stay out
    /// of the free list until `transfer_disposed_objects`.
    pub fn dispose_objects(&mut self, dispose: &mut dyn FnMut(Address, usize)) -> usize {
        let pending = std::mem::take(&mut self.pending_dispose);
        let count = pending.len();
        for index in pending {
            dispose(self.object_address(index), self.object_size);
            self.disposed.push(index);
        }
        count
    }

    /// Return disposed slots to the free list.
    pub fn transfer_disposed_objects(&mut self) -> usize {
        let disposed = std::mem::take(&mut self.disposed);
        let count = disposed.len();
        for index in disposed {
            let slot = self.slot_of(index);
            self.pending_dispose_bits.clear(index as usize);
            self.free_bits.set(slot);
            self.object_info[index as usize].store(0, Ordering::Relaxed);
            let cell = self.object_address(index);
            unsafe {
                cell.store::<Address>(self.free_object_list);
            }
            self.free_object_list = cell;
            self.free_count += 1;
            self.last_free_count = self.free_count;
        }
        count
    }

    // ---- enumeration and verification ----

    /// Walk live objects. A zero filter matches everything; otherwise an
    /// object matches when it carries any of the filter bits.
    pub fn enumerate_objects(&self, info_bits_filter: u8, f: &mut dyn FnMut(Address, usize, u8)) {
        for index in 0..self.object_count {
            let slot = self.slot_of(index);
            if self.free_bits.is_set(slot) || self.pending_dispose_bits.is_set(index as usize) {
                continue;
            }
            let info = self.object_info[index as usize].load(Ordering::Relaxed);
            if info & DELETED_BIT != 0 {
                continue;
            }
            if info_bits_filter != 0 && info & info_bits_filter == 0 {
                continue;
            }
            f(self.object_address(index), self.object_size, info);
        }
    }

    /// Check that every heap pointer stored in a marked object points at a
    /// marked object. `is_marked_or_foreign` returns true for addresses
    /// outside the heap.
    pub fn verify_mark(&self, is_marked_or_foreign: &dyn Fn(Address) -> bool) {
        for index in 0..self.object_count {
            let slot = self.slot_of(index);
            if self.free_bits.is_set(slot) || !self.mark_bits.is_set(slot) {
                continue;
            }
            let info = self.object_info[index as usize].load(Ordering::Relaxed);
            if info & (LEAF_BIT | DELETED_BIT) != 0 {
                continue;
            }
            let start = self.object_address(index);
            let mut cursor = start;
            let end = start + self.object_size;
            while cursor < end {
                let field = unsafe { cursor.load::<Address>() };
                debug_assert!(
                    is_marked_or_foreign(field),
                    "marked object {} holds pointer {} to unmarked object",
                    start,
                    field
                );
                cursor += BYTES_IN_ADDRESS;
            }
        }
    }

    /// Live-byte figure for the stats aggregation.
    pub fn object_byte_count(&self) -> usize {
        (self.object_count - self.free_count) as usize * self.object_size
    }

    pub fn total_byte_count(&self) -> usize {
        A::BLOCK_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page_allocator::{AllocatorRole, PageAllocator};
    use crate::heap::SmallAllocationBlockAttributes;

    type SmallBlock = SmallHeapBlock<SmallAllocationBlockAttributes>;

    fn with_block(bucket_index: usize, f: impl FnOnce(&mut SmallBlock, Address)) {
        let pa = PageAllocator::new(AllocatorRole::Normal, 16);
        let pages = pa.alloc_pages(SmallAllocationBlockAttributes::PAGE_COUNT).unwrap();
        let mut block = SmallBlock::new(pages, bucket_index, BucketKind::Normal, false);
        f(&mut block, pages);
        pa.release_pages(pages, SmallAllocationBlockAttributes::PAGE_COUNT);
    }

    #[test]
    fn fresh_block_geometry() {
        with_block(0, |block, pages| {
            assert_eq!(block.object_size(), 16);
            assert_eq!(block.object_count(), 256);
            assert_eq!(block.free_count(), 256);
            assert!(block.is_empty());
            assert_eq!(block.object_address(3), pages + 48usize);
        });
    }

    #[test]
    fn alloc_mark_sweep_cycle() {
        with_block(3, |block, pages| {
            // 64-byte bucket.
            assert_eq!(block.object_size(), 64);
            let a = pages;
            let b = pages + 64usize;
            block.note_alloc(a, NO_BIT);
            block.note_alloc(b, LEAF_BIT);
            assert_eq!(block.free_count(), block.object_count() - 2);

            block.reset_marks();
            // Mark only `a`; interior pointer into it rounds down.
            let marked = block.try_mark(a + 40usize, true).expect("should mark");
            assert_eq!(marked.address, a);
            assert_eq!(marked.size, 64);
            // Second mark is idempotent.
            assert!(block.try_mark(a, false).is_none());
            assert!(block.is_object_marked(a, false));

            // Candidates into free cells or unaligned non-starts fail.
            assert!(block.try_mark(pages + 128usize, false).is_none());
            assert!(block.try_mark(a + 8usize, false).is_none());

            assert_eq!(block.sweep(), SweepState::PartialFree);
            // `b` was unmarked and went back to the free list.
            assert_eq!(block.free_count(), block.object_count() - 1);
            assert!(block.is_object_free(1));
            assert!(!block.is_object_free(0));
        });
    }

    #[test]
    fn explicit_free_is_tombstoned_until_swept() {
        with_block(0, |block, pages| {
            block.note_alloc(pages, LEAF_BIT);
            assert!(block.explicit_free(pages));
            // Tombstones cannot be marked.
            block.reset_marks();
            assert!(block.try_mark(pages, false).is_none());
            // Sweep reclaims the slot even though the mark pass never saw it.
            assert_eq!(block.sweep(), SweepState::Empty);
            assert_eq!(block.free_count(), block.object_count());
        });
    }

    #[test]
    fn finalizable_objects_survive_until_dispose() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 16);
        let pages = pa.alloc_pages(1).unwrap();
        let mut block = SmallBlock::new(pages, 0, BucketKind::Finalizable, false);
        block.note_alloc(pages, FINALIZE_BIT);
        block.reset_marks();

        let mut finalized = vec![];
        block.sweep_finalizable_objects(&mut |addr, size| finalized.push((addr, size)));
        assert_eq!(finalized, vec![(pages, 16)]);
        // Second finalize pass must not re-finalize.
        block.sweep_finalizable_objects(&mut |_, _| panic!("finalized twice"));

        assert_eq!(block.sweep(), SweepState::PendingDispose);
        // The slot is not yet free.
        assert_eq!(block.free_count(), block.object_count() - 1);

        let mut disposed = 0;
        block.dispose_objects(&mut |_, _| disposed += 1);
        assert_eq!(disposed, 1);
        assert_eq!(block.transfer_disposed_objects(), 1);
        assert!(block.is_empty());
        pa.release_pages(pages, 1);
    }

    #[test]
    fn implicit_roots_survive_reset() {
        with_block(0, |block, pages| {
            block.note_alloc(pages, IMPLICIT_ROOT_BIT);
            block.reset_marks();
            assert!(block.is_object_marked(pages, false));
            assert_eq!(block.sweep(), SweepState::PartialFree);
            assert!(!block.is_object_free(0));

            // Clearing the bit makes the next cycle sweep it.
            assert!(block.clear_implicit_root(pages));
            block.reset_marks();
            assert!(!block.is_object_marked(pages, false));
            assert_eq!(block.sweep(), SweepState::Empty);
        });
    }

    #[test]
    fn rescan_pushes_marked_scannable_objects() {
        with_block(3, |block, pages| {
            block.note_alloc(pages, WITH_BARRIER_BIT);
            block.note_alloc(pages + 64usize, LEAF_BIT);
            block.reset_marks();
            block.try_mark(pages, false).unwrap();
            block.try_mark(pages + 64usize, false).unwrap();
            let mut pushed = vec![];
            let count = block.rescan_page(pages, &mut |m| pushed.push(m.address));
            assert_eq!(count, 1);
            assert_eq!(pushed, vec![pages]);
        });
    }
}
