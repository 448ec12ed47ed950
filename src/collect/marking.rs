//! The tracing core: candidate filtering, payload scanning and the drain
//! loop. Candidates come from conservative sources (stack words, guest
//! arenas) or precise ones (pinned table, implicit roots, rescan); either
//! way they funnel through the heap's valid-pointers lookup and end up as
//! payload ranges on a mark context.

use crate::collect::mark_context::MarkContext;
use crate::heap::block::MarkedObject;
use crate::heap::heap_info::HeapInfo;
use crate::heap::object_info::{LEAF_BIT, VISITED_HOST_BIT};
use crate::util::constants::BYTES_IN_ADDRESS;
use crate::util::Address;

/// Handle a freshly marked object: queue its payload for scanning, or park
/// it for the host's visit callback. Mark-stack overflow dirties the
/// object's page so the guaranteed OOM rescan re-traces it.
pub fn process_marked(heap: &HeapInfo, ctx: &mut MarkContext, object: MarkedObject) {
    if object.info & VISITED_HOST_BIT != 0 {
        ctx.push_track(object.address, object.size);
        return;
    }
    if object.info & LEAF_BIT != 0 {
        return;
    }
    if !ctx.push(object.address, object.size) {
        heap.note_mark_stack_overflow(object.address);
    }
}

/// Root-marking primitive for exact object starts.
pub fn try_mark_non_interior(heap: &HeapInfo, ctx: &mut MarkContext, candidate: Address) {
    if let Some(object) = heap.try_mark(candidate, false) {
        process_marked(heap, ctx, object);
    }
}

/// Root-marking primitive that accepts pointers into the middle of an
/// object.
pub fn try_mark_interior(heap: &HeapInfo, ctx: &mut MarkContext, candidate: Address) {
    if let Some(object) = heap.try_mark(candidate, true) {
        process_marked(heap, ctx, object);
    }
}

/// Scan a memory range for pointer candidates. Conservative root ranges
/// (stack, guest arenas) accept interior pointers; object payloads only
/// accept exact starts. Returns the number of bytes scanned.
pub fn scan_memory(
    heap: &HeapInfo,
    ctx: &mut MarkContext,
    start: Address,
    byte_count: usize,
    interior: bool,
) -> usize {
    let mut cursor = start;
    let end = start + (byte_count & !(BYTES_IN_ADDRESS - 1));
    while cursor < end {
        let candidate = unsafe { cursor.load::<Address>() };
        if !candidate.is_zero() {
            if let Some(object) = heap.try_mark(candidate, interior) {
                process_marked(heap, ctx, object);
            }
        }
        cursor += BYTES_IN_ADDRESS;
    }
    byte_count
}

/// Drain the context's mark stack, scanning each queued payload. Leaves the
/// pending-track queue untouched; tracked objects are the mutator thread's
/// to visit.
pub fn drain(heap: &HeapInfo, ctx: &mut MarkContext) {
    while let Some(candidate) = ctx.pop() {
        scan_memory(heap, ctx, candidate.address, candidate.byte_count, false);
    }
}

/// Drain with a cooperative abort check every `check_interval` objects.
/// Returns false if aborted.
pub fn drain_with_abort(
    heap: &HeapInfo,
    ctx: &mut MarkContext,
    check_interval: usize,
    should_abort: &dyn Fn() -> bool,
) -> bool {
    let mut since_check = 0;
    while let Some(candidate) = ctx.pop() {
        scan_memory(heap, ctx, candidate.address, candidate.byte_count, false);
        since_check += 1;
        if since_check >= check_interval {
            since_check = 0;
            if should_abort() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::page_pool::PagePool;
    use crate::heap::object_info::NO_BIT;
    use crate::heap::page_allocator::{AllocatorRole, PageAllocator};
    use crate::util::options::Options;
    use std::sync::Arc;

    fn setup() -> (HeapInfo, MarkContext) {
        let heap = HeapInfo::initialize(&Options::default());
        let pa = Arc::new(PageAllocator::new(AllocatorRole::Normal, 64));
        let ctx = MarkContext::new(PagePool::new(pa, 2));
        (heap, ctx)
    }

    #[test]
    fn drain_traces_object_graph() {
        let (mut heap, mut ctx) = setup();
        // c <- b <- a, all 32-byte objects; a is the root.
        let c = heap.real_alloc(32, NO_BIT, false).unwrap();
        let b = heap.real_alloc(32, NO_BIT, false).unwrap();
        let a = heap.real_alloc(32, NO_BIT, false).unwrap();
        unsafe {
            crate::util::memory::zero(a, 32);
            crate::util::memory::zero(b, 32);
            crate::util::memory::zero(c, 32);
            a.store::<Address>(b);
            b.store::<Address>(c);
        }
        heap.reset_allocators();
        heap.snapshot_collection_blocks(false);
        heap.reset_marks(false);

        try_mark_non_interior(&heap, &mut ctx, a);
        drain(&heap, &mut ctx);

        assert!(heap.is_object_marked(a));
        assert!(heap.is_object_marked(b));
        assert!(heap.is_object_marked(c));
        heap.verify_mark();
    }

    #[test]
    fn interior_roots_round_down() {
        let (mut heap, mut ctx) = setup();
        let a = heap.real_alloc(64, NO_BIT, false).unwrap();
        unsafe { crate::util::memory::zero(a, 64) };
        heap.reset_allocators();
        heap.snapshot_collection_blocks(false);
        heap.reset_marks(false);

        // Non-interior rejects mid-object pointers; interior rounds down.
        try_mark_non_interior(&heap, &mut ctx, a + 40usize);
        assert!(!heap.is_object_marked(a));
        try_mark_interior(&heap, &mut ctx, a + 40usize);
        assert!(heap.is_object_marked(a));
        drain(&heap, &mut ctx);
    }

    #[test]
    fn leaf_payloads_are_not_scanned() {
        let (mut heap, mut ctx) = setup();
        let victim = heap.real_alloc(32, NO_BIT, false).unwrap();
        let leaf = heap.real_alloc(32, crate::heap::object_info::LEAF_BIT, false).unwrap();
        unsafe {
            crate::util::memory::zero(leaf, 32);
            // A pointer stored in a leaf must not keep anything alive.
            leaf.store::<Address>(victim);
        }
        heap.reset_allocators();
        heap.snapshot_collection_blocks(false);
        heap.reset_marks(false);

        try_mark_non_interior(&heap, &mut ctx, leaf);
        drain(&heap, &mut ctx);
        assert!(heap.is_object_marked(leaf));
        assert!(!heap.is_object_marked(victim));
    }
}
