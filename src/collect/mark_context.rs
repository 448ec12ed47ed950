//! Per-lane mark state: a mark stack built from page-sized chunks plus the
//! pending-track queue for host-visited objects. One context exists for the
//! primary marking thread and one per parallel worker lane.
//!
//! Chunk layout: two header words (previous chunk, entry count of that
//! chunk when it was pushed down), then (address, byte count) entries. The
//! stack never moves entries; exhausting a chunk releases its page back to
//! the context's page pool.

use crate::collect::page_pool::PagePool;
use crate::util::constants::*;
use crate::util::Address;

/// One unit of marking work: an object payload to scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MarkCandidate {
    pub address: Address,
    pub byte_count: usize,
}

const CHUNK_HEADER_BYTES: usize = 2 * BYTES_IN_ADDRESS;
/// Entries per page-sized chunk.
pub const MARK_STACK_ENTRIES_PER_CHUNK: usize =
    (BYTES_IN_PAGE - CHUNK_HEADER_BYTES) / MARK_CANDIDATE_SIZE;

/// Number of pages a context must hold in reserve so an OOM rescan can
/// drain the largest small bucket's worth of candidates.
pub const PRIMARY_MARK_STACK_RESERVED_PAGE_COUNT: usize =
    (SMALL_BLOCK_PAGE_COUNT * BYTES_IN_PAGE * MARK_CANDIDATE_SIZE / MIN_OBJECT_SIZE)
        / BYTES_IN_PAGE
        + 1;

fn chunk_prev(chunk: Address) -> Address {
    unsafe { chunk.load::<Address>() }
}

fn chunk_set_prev(chunk: Address, prev: Address) {
    unsafe { chunk.store::<Address>(prev) }
}

fn chunk_saved_count(chunk: Address) -> usize {
    unsafe { (chunk + BYTES_IN_ADDRESS).load::<usize>() }
}

fn chunk_set_saved_count(chunk: Address, count: usize) {
    unsafe { (chunk + BYTES_IN_ADDRESS).store::<usize>(count) }
}

fn chunk_entry(chunk: Address, index: usize) -> Address {
    chunk + CHUNK_HEADER_BYTES + index * MARK_CANDIDATE_SIZE
}

pub struct MarkContext {
    current_chunk: Address,
    current_count: usize,
    page_pool: PagePool,
    pending_track: Vec<MarkCandidate>,
    /// A push failed for want of pages; the collector owes an OOM rescan.
    overflowed: bool,
}

impl MarkContext {
    pub fn new(page_pool: PagePool) -> MarkContext {
        MarkContext {
            current_chunk: Address::ZERO,
            current_count: 0,
            page_pool,
            pending_track: vec![],
            overflowed: false,
        }
    }

    pub fn page_pool_mut(&mut self) -> &mut PagePool {
        &mut self.page_pool
    }

    pub fn has_pending_mark_objects(&self) -> bool {
        !self.current_chunk.is_zero()
    }

    pub fn has_pending_track_objects(&self) -> bool {
        !self.pending_track.is_empty()
    }

    /// Push a payload to scan. Returns false when no chunk page could be
    /// found; the caller must arrange an OOM rescan for the object.
    pub fn push(&mut self, address: Address, byte_count: usize) -> bool {
        if self.current_chunk.is_zero() || self.current_count == MARK_STACK_ENTRIES_PER_CHUNK {
            let Some(page) = self.page_pool.get_page() else {
                self.overflowed = true;
                return false;
            };
            if !self.current_chunk.is_zero() {
                chunk_set_saved_count(self.current_chunk, self.current_count);
            }
            chunk_set_prev(page, self.current_chunk);
            self.current_chunk = page;
            self.current_count = 0;
        }
        let entry = chunk_entry(self.current_chunk, self.current_count);
        unsafe {
            entry.store::<Address>(address);
            (entry + BYTES_IN_ADDRESS).store::<usize>(byte_count);
        }
        self.current_count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<MarkCandidate> {
        while !self.current_chunk.is_zero() {
            if self.current_count == 0 {
                let prev = chunk_prev(self.current_chunk);
                self.page_pool.release_page(self.current_chunk);
                self.current_chunk = prev;
                if prev.is_zero() {
                    return None;
                }
                self.current_count = chunk_saved_count(prev);
                continue;
            }
            self.current_count -= 1;
            let entry = chunk_entry(self.current_chunk, self.current_count);
            let candidate = MarkCandidate {
                address: unsafe { entry.load::<Address>() },
                byte_count: unsafe { (entry + BYTES_IN_ADDRESS).load::<usize>() },
            };
            // An empty chunk is released on the next pop.
            return Some(candidate);
        }
        None
    }

    pub fn push_track(&mut self, address: Address, byte_count: usize) {
        self.pending_track.push(MarkCandidate {
            address,
            byte_count,
        });
    }

    pub fn pop_track(&mut self) -> Option<MarkCandidate> {
        self.pending_track.pop()
    }

    /// Did any push fail since the last check? Clears the flag.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    /// Drop all pending work and trim chunk pages. Used on abort.
    pub fn abort(&mut self) {
        while !self.current_chunk.is_zero() {
            let prev = chunk_prev(self.current_chunk);
            self.page_pool.release_page(self.current_chunk);
            self.current_chunk = prev;
        }
        self.current_count = 0;
        self.pending_track.clear();
        self.overflowed = false;
        self.page_pool.release_free_pages();
    }

    /// Trim cached pages between collections.
    pub fn cleanup(&mut self) {
        debug_assert!(!self.has_pending_mark_objects());
        self.page_pool.release_free_pages();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page_allocator::{AllocatorRole, PageAllocator};
    use std::sync::Arc;

    fn context() -> MarkContext {
        let pa = Arc::new(PageAllocator::new(AllocatorRole::Normal, 64));
        MarkContext::new(PagePool::new(pa, 2))
    }

    #[test]
    fn push_pop_is_lifo_within_chunk() {
        let mut ctx = context();
        assert!(!ctx.has_pending_mark_objects());
        let a = unsafe { Address::from_usize(0x1000) };
        let b = unsafe { Address::from_usize(0x2000) };
        assert!(ctx.push(a, 16));
        assert!(ctx.push(b, 32));
        assert_eq!(ctx.pop(), Some(MarkCandidate { address: b, byte_count: 32 }));
        assert_eq!(ctx.pop(), Some(MarkCandidate { address: a, byte_count: 16 }));
        assert_eq!(ctx.pop(), None);
        assert!(!ctx.has_pending_mark_objects());
    }

    #[test]
    fn stack_grows_across_chunks() {
        let mut ctx = context();
        let count = MARK_STACK_ENTRIES_PER_CHUNK * 3 + 7;
        for i in 0..count {
            let addr = unsafe { Address::from_usize(0x10000 + i * 16) };
            assert!(ctx.push(addr, 16));
        }
        let mut popped = 0;
        while ctx.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, count);
        ctx.cleanup();
    }

    #[test]
    fn track_queue_is_separate() {
        let mut ctx = context();
        let a = unsafe { Address::from_usize(0x3000) };
        ctx.push_track(a, 64);
        assert!(ctx.has_pending_track_objects());
        assert!(!ctx.has_pending_mark_objects());
        assert_eq!(ctx.pop_track(), Some(MarkCandidate { address: a, byte_count: 64 }));
    }

    #[test]
    fn reserved_page_math() {
        // One small block can push at most PAGE/16 candidates of 16 bytes
        // each; the reservation must cover that.
        assert!(PRIMARY_MARK_STACK_RESERVED_PAGE_COUNT >= 2);
    }
}
