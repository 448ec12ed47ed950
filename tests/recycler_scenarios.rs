//! End-to-end collection scenarios driven through the public API, with a
//! deterministic root set (pinned objects and guest arenas; the machine
//! stack is skipped so test-frame garbage cannot retain objects).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use recycler::collection_flags::*;
use recycler::{Address, CollectionFlags, CollectionHost, DefaultCollectionHost, Options, Recycler};

fn test_options() -> Options {
    let mut options = Options::default();
    options.set_bulk("concurrent=false,parallel_mark_worker_count=0,idle_decommit=false");
    options
}

fn in_thread_recycler() -> Recycler {
    Recycler::new(Arc::new(DefaultCollectionHost), test_options())
}

const COLLECT: CollectionFlags = CollectionFlags(
    COLLECT_NOW_FORCE_IN_THREAD.0 | COLLECT_OVERRIDE_SKIP_STACK.0,
);

fn live_object_count(r: &Recycler) -> usize {
    let mut count = 0;
    r.enumerate_objects(0, &mut |_| count += 1);
    count
}

#[test]
fn unreferenced_linked_list_is_swept() {
    let r = in_thread_recycler();
    // A linked list threaded through the first word of each node, rooted
    // in a guest arena slot.
    let root_slot = Box::new([0usize; 1]);
    let root_addr = Address::from_ref(&root_slot[0]);
    let arena = r.add_guest_arena(root_addr, std::mem::size_of::<usize>());

    let mut head = Address::ZERO;
    for _ in 0..10_000 {
        let node = r.alloc_zero(32);
        unsafe { node.store::<Address>(head) };
        head = node;
    }
    unsafe { root_addr.store::<Address>(head) };

    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 10_000);

    // Null the head; the whole chain dies.
    unsafe { root_addr.store::<Address>(Address::ZERO) };
    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 0);

    r.remove_guest_arena(arena);
}

#[test]
fn implicit_root_keeps_object_alive() {
    let r = in_thread_recycler();
    let obj = r.alloc_implicit_root(64).expect("implicit root alloc");
    for _ in 0..5 {
        r.collect_now(COLLECT);
        assert_eq!(live_object_count(&r), 1, "implicit root was swept");
    }
    assert!(r.clear_implicit_root(obj));
    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 0);
}

#[test]
fn weak_reference_is_cleared_when_target_dies() {
    let r = in_thread_recycler();
    let a = r.alloc_zero(48);
    let weak = r.create_weak_reference_handle(a);
    let id_before = r.get_weak_reference_cleanup_id();

    // While pinned, the weak reference holds.
    r.root_add_ref(a);
    r.collect_now(COLLECT);
    assert_eq!(weak.get(), Some(a));
    assert_eq!(r.get_weak_reference_cleanup_id(), id_before);

    // Drop the pin: the target dies and the handle reads null.
    r.root_release(a);
    r.collect_now(COLLECT);
    assert_eq!(weak.get(), None);
    assert_eq!(r.get_weak_reference_cleanup_id(), id_before + 1);
}

struct FinalizerHost {
    finalize_count: AtomicUsize,
    dispose_count: AtomicUsize,
    observed_sentinel: AtomicUsize,
}

impl CollectionHost for FinalizerHost {
    fn finalize(&self, object: Address, _size: usize) {
        self.finalize_count.fetch_add(1, Ordering::SeqCst);
        // The object's first word points at a companion object; it must
        // still be intact when the finalizer runs.
        let other = unsafe { object.load::<Address>() };
        if !other.is_zero() {
            let sentinel = unsafe { (other + 8usize).load::<usize>() };
            self.observed_sentinel.store(sentinel, Ordering::SeqCst);
        }
    }

    fn dispose(&self, _object: Address, _size: usize) {
        self.dispose_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn finalizer_observes_live_references_and_runs_once() {
    let host = Arc::new(FinalizerHost {
        finalize_count: AtomicUsize::new(0),
        dispose_count: AtomicUsize::new(0),
        observed_sentinel: AtomicUsize::new(0),
    });
    let r = Recycler::new(host.clone(), test_options());

    let other = r.alloc_zero(32);
    unsafe { (other + 8usize).store::<usize>(0xfeed_face) };
    let f = r.alloc_finalized(32);
    unsafe {
        f.store::<Address>(other);
        (f + 8usize).store::<usize>(0) ;
        (f + 16usize).store::<usize>(0);
        (f + 24usize).store::<usize>(0);
    }

    // Both unreferenced: F is finalized before anything is reclaimed, so
    // the finalizer sees `other` alive.
    r.collect_now(COLLECT);
    assert_eq!(host.finalize_count.load(Ordering::SeqCst), 1);
    assert_eq!(host.observed_sentinel.load(Ordering::SeqCst), 0xfeed_face);
    assert_eq!(host.dispose_count.load(Ordering::SeqCst), 1);

    // Later collections never re-finalize.
    r.collect_now(COLLECT);
    r.collect_now(COLLECT);
    assert_eq!(host.finalize_count.load(Ordering::SeqCst), 1);
    assert_eq!(host.dispose_count.load(Ordering::SeqCst), 1);
}

#[test]
fn partial_collect_reuses_hot_page() {
    let r = in_thread_recycler();
    // Fill one small block of 16-byte cells, keeping every other object.
    let cells: Vec<Address> = (0..256).map(|_| r.alloc_zero(16)).collect();
    for cell in cells.iter().step_by(2) {
        r.root_add_ref(*cell);
    }
    let page = cells[0].align_down(4096);

    let flags = CollectionFlags(COLLECT_NOW_PARTIAL.0 | COLLECT_OVERRIDE_SKIP_STACK.0);
    assert!(r.collect_now(flags));

    // Half the page is free again; the next same-size allocation must bump
    // into the reused page rather than a fresh one.
    let next = r.alloc(16);
    assert_eq!(next.align_down(4096), page, "allocation did not reuse the hot page");
}

struct InteriorRootHost {
    candidate: AtomicUsize,
}

impl CollectionHost for InteriorRootHost {
    fn mark_external_roots(&self, scanner: &mut recycler::RootScanner<'_>) -> usize {
        let raw = self.candidate.load(Ordering::SeqCst);
        if raw != 0 {
            scanner.mark_interior(Address::from_ptr(raw as *const u8));
        }
        std::mem::size_of::<usize>()
    }
}

#[test]
fn interior_pointer_marks_containing_object() {
    let host = Arc::new(InteriorRootHost {
        candidate: AtomicUsize::new(0),
    });
    let r = Recycler::new(host.clone(), test_options());
    let p = r.alloc_zero(64);
    host.candidate.store((p + 40usize).as_usize(), Ordering::SeqCst);

    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 1, "interior pointer failed to keep object");

    host.candidate.store(0, Ordering::SeqCst);
    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 0);
}

#[test]
fn explicit_free_roundtrip() {
    let r = in_thread_recycler();
    let a = r.alloc_leaf(40);
    assert!(r.explicit_free_leaf(a, 40));
    // The tombstoned cell is recycled ahead of fresh memory.
    assert_eq!(r.alloc_leaf(40), a);

    let b = r.alloc(400);
    assert!(r.explicit_free_non_leaf(b, 400));
    assert_eq!(r.alloc(400), b);
}

#[test]
fn guest_arena_roots_are_interior() {
    let r = in_thread_recycler();
    let obj = r.alloc_zero(96);
    // The arena slot holds a pointer into the middle of the object.
    let slot = Box::new([(obj + 24usize).as_usize()]);
    let arena = r.add_guest_arena(
        Address::from_ref(&slot[0]),
        std::mem::size_of::<usize>(),
    );
    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 1);

    r.remove_guest_arena(arena);
    r.collect_now(COLLECT);
    assert_eq!(live_object_count(&r), 0);
}

#[test]
fn dispose_only_flags_drain_queue() {
    let host = Arc::new(FinalizerHost {
        finalize_count: AtomicUsize::new(0),
        dispose_count: AtomicUsize::new(0),
        observed_sentinel: AtomicUsize::new(0),
    });
    let r = Recycler::new(host.clone(), test_options());
    let f = r.alloc_finalized(32);
    zero_cell(f, 32);
    r.collect_now(COLLECT);
    assert_eq!(host.dispose_count.load(Ordering::SeqCst), 1);
    // FinishDispose with nothing pending is a no-op.
    assert!(!r.collect_now(FINISH_DISPOSE));
}

fn zero_cell(addr: Address, size: usize) {
    for off in (0..size).step_by(std::mem::size_of::<usize>()) {
        unsafe { (addr + off).store::<usize>(0) };
    }
}

#[test]
fn bucket_stats_track_live_bytes() {
    let r = in_thread_recycler();
    for _ in 0..10 {
        r.alloc_zero(128);
    }
    let report = r.get_bucket_stats();
    assert!(report.total.object_byte_count >= 10 * 128);
    assert!(report.total.total_byte_count >= report.total.object_byte_count);
    r.collect_now(COLLECT);
    let report = r.get_bucket_stats();
    assert_eq!(report.total.object_byte_count, 0);
}
