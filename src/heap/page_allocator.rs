//! Segment-based virtual memory supply for the heap.
//!
//! A page allocator owns a set of reserved segments and hands out runs of
//! committed, zeroed pages. Released pages go back into a pooled free set,
//! bounded by `max_free_page_count`; pages above the bound (and anything
//! the idle-decommit thread gets to) are decommitted in place so the
//! reservation survives but the physical memory goes back to the OS.
//! Requests larger than a segment get a dedicated reservation that is
//! unmapped as soon as it is released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::util::bitvector::BitVector;
use crate::util::constants::*;
use crate::util::conversions::pages_to_bytes;
use crate::util::memory;
use crate::util::Address;

/// What the allocator's pages are used for. Only affects scanning policy
/// and telemetry labels; the page machinery is identical.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocatorRole {
    /// Blocks whose objects the mark phase scans.
    Normal,
    /// Blocks holding leaf objects; never scanned.
    Leaf,
    /// Large object blocks.
    LargeBlock,
    /// Blocks whose pages participate in write-watch rescan.
    WithBarrier,
}

impl AllocatorRole {
    pub fn name(self) -> &'static str {
        match self {
            AllocatorRole::Normal => "recycler",
            AllocatorRole::Leaf => "recyclerLeaf",
            AllocatorRole::LargeBlock => "recyclerLargeBlock",
            AllocatorRole::WithBarrier => "recyclerWithBarrier",
        }
    }
}

/// Point-in-time usage numbers for telemetry.
#[derive(Copy, Clone, Debug, Default)]
pub struct PageAllocatorSnapshot {
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub used_bytes: usize,
    pub segment_count: usize,
}

/// The dirty-page set behind the software write watch. The mutator's write
/// barrier records the page of every store into a with-barrier object;
/// rescan drains the set.
pub struct WriteWatchTable {
    dirty: spin::Mutex<HashSet<usize>>,
}

impl WriteWatchTable {
    fn new() -> Self {
        WriteWatchTable {
            dirty: spin::Mutex::new(HashSet::new()),
        }
    }

    /// Record a store into `addr`'s page.
    pub fn touch(&self, addr: Address) {
        let page = addr.align_down(BYTES_IN_PAGE).as_usize();
        self.dirty.lock().insert(page);
    }

    /// Number of pages dirtied since the last reset.
    pub fn dirty_page_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Take the dirty set, leaving it empty.
    pub fn drain(&self) -> Vec<Address> {
        let mut set = self.dirty.lock();
        set.drain()
            .map(|page| unsafe { Address::from_usize(page) })
            .collect()
    }

    pub fn clear(&self) {
        self.dirty.lock().clear();
    }
}

struct PageSegment {
    start: Address,
    page_count: usize,
    /// Pages not handed out. Decommitted pages are a subset.
    available: BitVector,
    decommitted: BitVector,
    available_count: usize,
    decommitted_count: usize,
}

impl PageSegment {
    fn reserve(page_count: usize) -> Option<PageSegment> {
        let start = memory::reserve(pages_to_bytes(page_count))?;
        let mut available = BitVector::new(page_count);
        available.set_all();
        let mut decommitted = BitVector::new(page_count);
        decommitted.set_all();
        Some(PageSegment {
            start,
            page_count,
            available,
            decommitted,
            available_count: page_count,
            decommitted_count: page_count,
        })
    }

    fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.start + pages_to_bytes(self.page_count)
    }

    fn page_index(&self, addr: Address) -> usize {
        (addr - self.start) >> LOG_BYTES_IN_PAGE
    }

    /// First-fit scan for a run of `n` available pages.
    fn find_available_run(&self, n: usize) -> Option<usize> {
        let mut run = 0;
        for i in 0..self.page_count {
            if self.available.is_set(i) {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Carve out `n` pages starting at `first`, committing and zeroing as
    /// needed. The returned run is all zero; the second value is how many
    /// pages were newly committed.
    fn take(&mut self, first: usize, n: usize) -> (Address, usize) {
        let addr = self.start + pages_to_bytes(first);
        memory::commit(addr, pages_to_bytes(n));
        let mut newly_committed = 0;
        for i in first..first + n {
            debug_assert!(self.available.is_set(i));
            if !self.decommitted.is_set(i) {
                // A pooled committed page still holds stale data.
                memory::zero(self.start + pages_to_bytes(i), BYTES_IN_PAGE);
            } else {
                self.decommitted.clear(i);
                self.decommitted_count -= 1;
                newly_committed += 1;
            }
            self.available.clear(i);
        }
        self.available_count -= n;
        (addr, newly_committed)
    }

    fn give_back(&mut self, addr: Address, n: usize) {
        let first = self.page_index(addr);
        for i in first..first + n {
            debug_assert!(!self.available.is_set(i));
            self.available.set(i);
        }
        self.available_count += n;
    }

    /// Decommit every pooled page that is still committed. Returns the
    /// number of pages decommitted.
    fn decommit_pooled(&mut self) -> usize {
        let mut count = 0;
        for i in 0..self.page_count {
            if self.available.is_set(i) && !self.decommitted.is_set(i) {
                memory::decommit(self.start + pages_to_bytes(i), BYTES_IN_PAGE);
                self.decommitted.set(i);
                self.decommitted_count += 1;
                count += 1;
            }
        }
        count
    }

    fn pooled_committed_count(&self) -> usize {
        self.available_count - self.decommitted_count
    }

    fn is_all_available(&self) -> bool {
        self.available_count == self.page_count
    }
}

impl Drop for PageSegment {
    fn drop(&mut self) {
        memory::release(self.start, pages_to_bytes(self.page_count));
    }
}

struct PageAllocatorSync {
    segments: Vec<PageSegment>,
}

/// Reserve/commit page supplier with a bounded free-page pool.
pub struct PageAllocator {
    role: AllocatorRole,
    max_free_page_count: usize,
    sync: spin::Mutex<PageAllocatorSync>,
    used_pages: AtomicUsize,
    committed_pages: AtomicUsize,
    reserved_pages: AtomicUsize,
    write_watch_enabled: AtomicBool,
    write_watch: WriteWatchTable,
    idle_decommit_suspend: AtomicUsize,
}

impl PageAllocator {
    pub fn new(role: AllocatorRole, max_free_page_count: usize) -> Self {
        PageAllocator {
            role,
            max_free_page_count,
            sync: spin::Mutex::new(PageAllocatorSync { segments: vec![] }),
            used_pages: AtomicUsize::new(0),
            committed_pages: AtomicUsize::new(0),
            reserved_pages: AtomicUsize::new(0),
            write_watch_enabled: AtomicBool::new(false),
            write_watch: WriteWatchTable::new(),
            idle_decommit_suspend: AtomicUsize::new(0),
        }
    }

    pub fn role(&self) -> AllocatorRole {
        self.role
    }

    /// Allocate `n` committed, zeroed pages. Returns `None` on reservation
    /// failure; the caller decides whether that triggers a collection.
    pub fn alloc_pages(&self, n: usize) -> Option<Address> {
        debug_assert!(n > 0);
        let mut sync = self.sync.lock();
        for segment in sync.segments.iter_mut() {
            if segment.available_count >= n {
                if let Some(first) = segment.find_available_run(n) {
                    let (addr, newly_committed) = segment.take(first, n);
                    self.note_alloc(n, newly_committed);
                    return Some(addr);
                }
            }
        }
        // No pooled space: reserve a new segment. Oversized requests get an
        // exact-fit reservation of their own.
        let segment_pages = std::cmp::max(n, SEGMENT_PAGE_COUNT);
        let mut segment = PageSegment::reserve(segment_pages)?;
        self.reserved_pages.fetch_add(segment_pages, Ordering::Relaxed);
        let (addr, newly_committed) = segment.take(0, n);
        sync.segments.push(segment);
        self.note_alloc(n, newly_committed);
        trace!(
            "{}: new segment of {} pages, alloc {} pages at {}",
            self.role.name(),
            segment_pages,
            n,
            addr
        );
        Some(addr)
    }

    fn note_alloc(&self, n: usize, newly_committed: usize) {
        self.used_pages.fetch_add(n, Ordering::Relaxed);
        self.committed_pages.fetch_add(newly_committed, Ordering::Relaxed);
    }

    /// Return `n` pages starting at `addr` to the pool. Pages above the
    /// free-pool cap are decommitted; an all-free oversized segment is
    /// unmapped entirely.
    pub fn release_pages(&self, addr: Address, n: usize) {
        let mut sync = self.sync.lock();
        self.used_pages.fetch_sub(n, Ordering::Relaxed);
        let mut release_segment = None;
        let mut pooled: usize = 0;
        for (i, segment) in sync.segments.iter_mut().enumerate() {
            if segment.contains(addr) {
                segment.give_back(addr, n);
                if segment.is_all_available() && segment.page_count > SEGMENT_PAGE_COUNT {
                    release_segment = Some(i);
                }
            }
            pooled += segment.pooled_committed_count();
        }
        if let Some(i) = release_segment {
            let segment = sync.segments.remove(i);
            self.reserved_pages
                .fetch_sub(segment.page_count, Ordering::Relaxed);
            self.committed_pages
                .fetch_sub(segment.pooled_committed_count(), Ordering::Relaxed);
            return;
        }
        if pooled > self.max_free_page_count {
            let decommitted = Self::decommit_segments(&mut sync);
            self.committed_pages.fetch_sub(decommitted, Ordering::Relaxed);
        }
    }

    fn decommit_segments(sync: &mut PageAllocatorSync) -> usize {
        let mut count = 0;
        for segment in sync.segments.iter_mut() {
            count += segment.decommit_pooled();
        }
        count
    }

    /// Decommit the whole free pool right now, regardless of the cap.
    pub fn decommit_now(&self) {
        let mut sync = self.sync.lock();
        let decommitted = Self::decommit_segments(&mut sync);
        self.committed_pages.fetch_sub(decommitted, Ordering::Relaxed);
        if decommitted > 0 {
            debug!("{}: decommitted {} pooled pages", self.role.name(), decommitted);
        }
    }

    /// Block the idle thread from decommitting while a heap walk relies on
    /// pooled pages staying committed.
    pub fn suspend_idle_decommit(&self) {
        self.idle_decommit_suspend.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume_idle_decommit(&self) {
        let old = self.idle_decommit_suspend.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0);
    }

    pub fn is_idle_decommit_suspended(&self) -> bool {
        self.idle_decommit_suspend.load(Ordering::SeqCst) > 0
    }

    pub fn enable_write_watch(&self) {
        self.write_watch_enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_write_watch_enabled(&self) -> bool {
        self.write_watch_enabled.load(Ordering::SeqCst)
    }

    pub fn write_watch(&self) -> &WriteWatchTable {
        &self.write_watch
    }

    /// Clear the dirty flag of every watched page. Returns false if write
    /// watch was never enabled.
    pub fn reset_write_watch(&self) -> bool {
        if !self.is_write_watch_enabled() {
            return false;
        }
        self.write_watch.clear();
        true
    }

    pub fn get_write_watch_page_count(&self) -> usize {
        self.write_watch.dirty_page_count()
    }

    pub fn used_page_count(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PageAllocatorSnapshot {
        let segment_count = self.sync.lock().segments.len();
        PageAllocatorSnapshot {
            reserved_bytes: pages_to_bytes(self.reserved_pages.load(Ordering::Relaxed)),
            committed_bytes: pages_to_bytes(self.committed_pages.load(Ordering::Relaxed)),
            used_bytes: pages_to_bytes(self.used_pages.load(Ordering::Relaxed)),
            segment_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_release_roundtrip() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 16);
        let a = pa.alloc_pages(1).unwrap();
        assert!(a.is_aligned_to(BYTES_IN_PAGE));
        assert_eq!(unsafe { a.load::<usize>() }, 0);
        unsafe { a.store::<usize>(42) };
        pa.release_pages(a, 1);
        assert_eq!(pa.used_page_count(), 0);
        // Reused pages come back zeroed.
        let b = pa.alloc_pages(1).unwrap();
        assert_eq!(unsafe { b.load::<usize>() }, 0);
        pa.release_pages(b, 1);
    }

    #[test]
    fn oversized_request_gets_own_segment() {
        let pa = PageAllocator::new(AllocatorRole::LargeBlock, 16);
        let n = SEGMENT_PAGE_COUNT + 8;
        let a = pa.alloc_pages(n).unwrap();
        let snapshot = pa.snapshot();
        assert_eq!(snapshot.segment_count, 1);
        assert!(snapshot.reserved_bytes >= pages_to_bytes(n));
        pa.release_pages(a, n);
        assert_eq!(pa.snapshot().segment_count, 0);
    }

    #[test]
    fn multi_page_runs_are_contiguous() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 64);
        let a = pa.alloc_pages(8).unwrap();
        let b = pa.alloc_pages(8).unwrap();
        assert_ne!(a, b);
        memory::zero(a, pages_to_bytes(8));
        memory::zero(b, pages_to_bytes(8));
        pa.release_pages(a, 8);
        pa.release_pages(b, 8);
    }

    #[test]
    fn write_watch_records_and_drains() {
        let pa = PageAllocator::new(AllocatorRole::WithBarrier, 16);
        pa.enable_write_watch();
        let a = pa.alloc_pages(2).unwrap();
        pa.write_watch().touch(a + 8usize);
        pa.write_watch().touch(a + BYTES_IN_PAGE + 16usize);
        pa.write_watch().touch(a + 24usize);
        assert_eq!(pa.get_write_watch_page_count(), 2);
        let drained = pa.write_watch().drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(pa.get_write_watch_page_count(), 0);
        assert!(pa.reset_write_watch());
        pa.release_pages(a, 2);
    }

    #[test]
    fn decommit_now_empties_pool() {
        let pa = PageAllocator::new(AllocatorRole::Normal, 1024);
        let a = pa.alloc_pages(4).unwrap();
        pa.release_pages(a, 4);
        pa.decommit_now();
        // Pool pages stay usable after decommit.
        let b = pa.alloc_pages(4).unwrap();
        assert_eq!(unsafe { b.load::<usize>() }, 0);
        pa.release_pages(b, 4);
    }
}
