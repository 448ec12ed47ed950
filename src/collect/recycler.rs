//! The recycler: typed allocation front end, root registration, and the
//! collection state machine with its in-thread, concurrent, parallel and
//! partial variants.
//!
//! ## Sharing discipline
//!
//! The heap lives in an `UnsafeCell` shared between the mutator thread and
//! the background GC thread; the collection state word is the lock:
//!
//! - The mutator takes `&mut HeapInfo` for allocation and for the
//!   foreground phase calls. During `ExecutingConcurrent` states it only
//!   touches structures the background never walks (bucket lists, the
//!   block map and page allocators, which carry their own locks).
//! - The background thread takes `&HeapInfo` during concurrent mark (all
//!   block-side mark state is atomic) and `&mut HeapInfo` only in
//!   `ConcurrentSweep`, when the mutator is excluded from the staged lists
//!   by the state machine.
//! - Parallel mark lanes only ever use `&HeapInfo`.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::collect::collection_flags::*;
use crate::collect::collection_state::*;
use crate::collect::mark_context::{MarkContext, PRIMARY_MARK_STACK_RESERVED_PAGE_COUNT};
use crate::collect::marking;
use crate::collect::page_pool::PagePool;
use crate::collect::parallel::ParallelMarkThreads;
use crate::collect::sweep_state::RecyclerSweep;
use crate::collect::weak_ref::{WeakReferenceHandle, WeakReferenceTable};
use crate::heap::heap_info::{HeapInfo, RecyclerHeapObjectInfo};
use crate::heap::object_info::*;
use crate::heap::idle_decommit::IdleDecommit;
use crate::heap::stats::BucketStatsReport;
use crate::host::{CollectionHost, RootScanner};
use crate::telemetry::{
    AllocatorSnapshots, CollectionPhase, RecyclerTelemetryInfo, UiThreadBlockedReason,
};
use crate::util::constants::*;
use crate::util::conversions::object_size_cat;
use crate::util::event::Event;
use crate::util::heuristics::RecyclerHeuristic;
use crate::util::options::{CollectTriggerSelector, Options};
use crate::util::Address;

/// Primary lane plus up to three parallel workers.
const MAX_MARK_CONTEXTS: usize = 1 + ParallelMarkThreads::MAX_PARALLEL_THREADS;

/// Registered guest arena: externally managed memory scanned as roots.
#[derive(Copy, Clone, Debug)]
struct GuestArena {
    start: Address,
    byte_count: usize,
}

struct BackgroundGc {
    work_ready: Event,
    work_done: Event,
    sweep_pass1_done: Event,
    sweep_pass1_ack: Event,
    /// Claimed by whichever foreground path releases the pass-1 barrier;
    /// the staged lists may be touched only by the claimant, only while
    /// the background is still parked.
    sweep_pass1_ack_sent: AtomicBool,
    handle: spin::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

#[derive(Default)]
struct CollectCounters {
    uncollected_alloc_bytes: AtomicUsize,
    unused_partial_collect_free_bytes: AtomicUsize,
    partial_uncollected_alloc_bytes: AtomicUsize,
    rescan_root_bytes: AtomicUsize,
    estimated_partial_reuse_bytes: AtomicUsize,
    used_pages_at_last_collect: AtomicUsize,
    collect_efficacy: AtomicU64,
    collect_cost: AtomicU64,
    collection_count: AtomicUsize,
}

pub(crate) struct RecyclerInner {
    heap: UnsafeCell<HeapInfo>,
    state: AtomicU32,
    partial_in_flight: AtomicBool,
    in_partial_collect_mode: AtomicBool,
    options: Options,
    host: Arc<dyn CollectionHost>,
    mark_contexts: [UnsafeCell<MarkContext>; MAX_MARK_CONTEXTS],
    pinned: spin::Mutex<HashMap<usize, usize>>,
    guest_arenas: spin::Mutex<Vec<Option<GuestArena>>>,
    weak_refs: spin::Mutex<WeakReferenceTable>,
    counters: CollectCounters,
    background: BackgroundGc,
    parallel: spin::Once<ParallelMarkThreads>,
    idle_decommit: IdleDecommit,
    telemetry: spin::Mutex<RecyclerTelemetryInfo>,
    sweep_state: spin::Mutex<Option<RecyclerSweep>>,
    stack_base: AtomicUsize,
    need_oom_rescan: AtomicBool,
    is_aborting: AtomicBool,
    concurrent_thread_exited: AtomicBool,
    external_allocated_bytes: AtomicUsize,
    in_dispose: AtomicBool,
    /// Re-entrancy guard: dispose and host callbacks may allocate, and
    /// allocation may ask for a collection that is already on the stack.
    in_collect: AtomicBool,
}

// The unsafe cells are shared under the state-machine discipline described
// in the module docs; every other field is internally synchronized.
unsafe impl Send for RecyclerInner {}
unsafe impl Sync for RecyclerInner {}

static NEXT_RECYCLER_ID: AtomicU64 = AtomicU64::new(1);

/// The collector and allocator for one script context. Thread-bound: the
/// owning thread is the mutator; all public methods must be called from it.
pub struct Recycler {
    inner: Arc<RecyclerInner>,
    // Pins the recycler to the mutator thread; only `inner` crosses threads.
    _not_send_sync: PhantomData<*mut ()>,
}

impl Recycler {
    pub fn new(host: Arc<dyn CollectionHost>, mut options: Options) -> Recycler {
        let _ = crate::util::logger::try_init();
        options.read_env_var_settings();
        let heap = HeapInfo::initialize(&options);
        let allocators = heap.page_allocators();
        let idle_decommit = IdleDecommit::start(allocators.clone(), *options.idle_decommit);
        let mark_contexts = std::array::from_fn(|lane| {
            let reserved = if lane == 0 {
                PRIMARY_MARK_STACK_RESERVED_PAGE_COUNT
            } else {
                1
            };
            UnsafeCell::new(MarkContext::new(PagePool::new(allocators[0].clone(), reserved)))
        });
        let recycler_id = NEXT_RECYCLER_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(RecyclerInner {
            heap: UnsafeCell::new(heap),
            state: AtomicU32::new(CollectionState::NOT_COLLECTING.0),
            partial_in_flight: AtomicBool::new(false),
            in_partial_collect_mode: AtomicBool::new(false),
            telemetry: spin::Mutex::new(RecyclerTelemetryInfo::new(
                recycler_id,
                *options.concurrent,
            )),
            options,
            host,
            mark_contexts,
            pinned: spin::Mutex::new(HashMap::new()),
            guest_arenas: spin::Mutex::new(vec![]),
            weak_refs: spin::Mutex::new(WeakReferenceTable::new()),
            counters: CollectCounters::default(),
            background: BackgroundGc {
                work_ready: Event::new(),
                work_done: Event::new(),
                sweep_pass1_done: Event::new(),
                sweep_pass1_ack: Event::new(),
                sweep_pass1_ack_sent: AtomicBool::new(false),
                handle: spin::Mutex::new(None),
                started: AtomicBool::new(false),
            },
            parallel: spin::Once::new(),
            idle_decommit,
            sweep_state: spin::Mutex::new(None),
            stack_base: AtomicUsize::new(0),
            need_oom_rescan: AtomicBool::new(false),
            is_aborting: AtomicBool::new(false),
            concurrent_thread_exited: AtomicBool::new(false),
            external_allocated_bytes: AtomicUsize::new(0),
            in_dispose: AtomicBool::new(false),
            in_collect: AtomicBool::new(false),
        });
        let recycler = Recycler {
            inner,
            _not_send_sync: PhantomData,
        };
        // Until the host registers a deeper base, use a frame near creation.
        let probe = 0usize;
        recycler.set_stack_base(Address::from_ref(&probe));
        recycler
    }

    pub fn with_defaults() -> Recycler {
        Recycler::new(
            Arc::new(crate::host::DefaultCollectionHost),
            Options::default(),
        )
    }

    fn state(&self) -> CollectionState {
        self.inner.state()
    }

    pub fn collection_state(&self) -> CollectionState {
        self.state()
    }

    pub fn is_collecting(&self) -> bool {
        !self.state().is_not_collecting()
    }

    pub fn collection_count(&self) -> usize {
        self.inner.counters.collection_count.load(Ordering::Relaxed)
    }

    /// Register the top of the mutator stack for conservative scanning.
    pub fn set_stack_base(&self, base: Address) {
        self.inner.stack_base.store(base.as_usize(), Ordering::Relaxed);
    }

    // ---- allocation ----

    /// Allocate a traceable object. Calls the host's out-of-memory hook
    /// (which may not return) if memory cannot be found even after an
    /// emergency collection.
    pub fn alloc(&self, size: usize) -> Address {
        self.alloc_with_attributes_throwing(size, NO_BIT)
    }

    /// Allocate a zeroed traceable object.
    pub fn alloc_zero(&self, size: usize) -> Address {
        let addr = self.alloc(size);
        crate::util::memory::zero(addr, object_size_cat(size));
        addr
    }

    pub fn alloc_leaf(&self, size: usize) -> Address {
        self.alloc_with_attributes_throwing(size, LEAF_BIT)
    }

    pub fn alloc_leaf_zero(&self, size: usize) -> Address {
        let addr = self.alloc_leaf(size);
        crate::util::memory::zero(addr, object_size_cat(size));
        addr
    }

    pub fn alloc_finalized(&self, size: usize) -> Address {
        self.alloc_with_attributes_throwing(size, FINALIZE_BIT)
    }

    pub fn alloc_with_barrier(&self, size: usize) -> Address {
        self.alloc_with_attributes_throwing(size, WITH_BARRIER_BIT)
    }

    pub fn alloc_finalized_with_barrier(&self, size: usize) -> Address {
        self.alloc_with_attributes_throwing(size, FINALIZABLE_WITH_BARRIER_BITS)
    }

    /// Allocate an object the host traces through its visit callback.
    pub fn alloc_tracked(&self, size: usize) -> Address {
        self.alloc_with_attributes_throwing(size, VISITED_HOST_BIT)
    }

    /// Nothrow, zeroed, pinned-by-info-bit allocation.
    pub fn alloc_implicit_root(&self, size: usize) -> Option<Address> {
        let addr = self.try_alloc_with_attributes(size, IMPLICIT_ROOT_BIT)?;
        crate::util::memory::zero(addr, object_size_cat(size));
        Some(addr)
    }

    pub fn alloc_implicit_root_leaf(&self, size: usize) -> Option<Address> {
        let addr = self.try_alloc_with_attributes(size, IMPLICIT_ROOT_LEAF_BITS)?;
        crate::util::memory::zero(addr, object_size_cat(size));
        Some(addr)
    }

    /// Allocate with explicit info bits, for host enum classes.
    pub fn alloc_with_info_bits(&self, size: usize, info_bits: u8) -> Address {
        self.alloc_with_attributes_throwing(size, info_bits)
    }

    /// Nothrow allocation; returns `None` instead of invoking the host's
    /// out-of-memory hook.
    pub fn try_alloc(&self, size: usize) -> Option<Address> {
        self.try_alloc_with_attributes(size, NO_BIT)
    }

    fn alloc_with_attributes_throwing(&self, size: usize, attributes: u8) -> Address {
        match self.try_alloc_with_attributes(size, attributes) {
            Some(addr) => addr,
            None => {
                self.inner.host.out_of_memory();
                panic!("recycler: allocation of {} bytes failed", size);
            }
        }
    }

    fn try_alloc_with_attributes(&self, size: usize, attributes: u8) -> Option<Address> {
        debug_assert!(size > 0);
        self.collection_trigger_check();
        let size_cat = object_size_cat(size);
        match self.inner.heap_alloc(size_cat, attributes) {
            Some(addr) => {
                self.note_allocated(size_cat);
                Some(addr)
            }
            None => {
                // Page reserve failed: force an emergency in-thread
                // collection with immediate decommit and retry once.
                warn!("allocation of {} bytes failed; forcing collection", size_cat);
                self.collect_now(COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY);
                let addr = self.inner.heap_alloc(size_cat, attributes)?;
                self.note_allocated(size_cat);
                Some(addr)
            }
        }
    }

    fn note_allocated(&self, size_cat: usize) {
        self.inner
            .counters
            .uncollected_alloc_bytes
            .fetch_add(size_cat, Ordering::Relaxed);
        if self.inner.in_partial_collect_mode.load(Ordering::Relaxed) {
            self.inner
                .counters
                .partial_uncollected_alloc_bytes
                .fetch_add(size_cat, Ordering::Relaxed);
        }
    }

    /// Explicitly free a leaf object. The slot is tombstoned and recycled
    /// by the owning bucket ahead of any fresh cell.
    pub fn explicit_free_leaf(&self, addr: Address, size: usize) -> bool {
        self.explicit_free_inner(addr, size)
    }

    /// Explicitly free a non-leaf object.
    pub fn explicit_free_non_leaf(&self, addr: Address, size: usize) -> bool {
        self.explicit_free_inner(addr, size)
    }

    fn explicit_free_inner(&self, addr: Address, size: usize) -> bool {
        let heap = unsafe { self.inner.heap_mut() };
        heap.explicit_free(addr, object_size_cat(size))
    }

    /// The software write barrier: record a store into a with-barrier
    /// object so concurrent and partial collections re-trace its page.
    pub fn write_barrier(&self, addr: Address) {
        self.inner.heap_ref().write_barrier(addr);
    }

    /// Store a pointer field and run the write barrier for it.
    pub fn write_with_barrier(&self, field: Address, value: Address) {
        unsafe { field.store::<Address>(value) };
        self.write_barrier(field);
    }

    // ---- external allocations ----

    /// Account for a host-side allocation tied to heap lifetime. On budget
    /// pressure forces a collection and retries; false means the host
    /// should fail its allocation.
    pub fn do_external_allocation(&self, byte_count: usize) -> bool {
        let limit = RecyclerHeuristic::instance().max_external_alloc_bytes;
        let current = self
            .inner
            .external_allocated_bytes
            .fetch_add(byte_count, Ordering::SeqCst);
        if current + byte_count <= limit {
            return true;
        }
        self.collect_now(COLLECT_ON_TYPED_ARRAY_ALLOCATION);
        if self.inner.external_allocated_bytes.load(Ordering::SeqCst) <= limit {
            return true;
        }
        self.inner
            .external_allocated_bytes
            .fetch_sub(byte_count, Ordering::SeqCst);
        false
    }

    pub fn report_external_memory_free(&self, byte_count: usize) {
        self.inner
            .external_allocated_bytes
            .fetch_sub(byte_count, Ordering::SeqCst);
    }

    /// Failure report for an external allocation whose budget was taken
    /// but whose backing store could not be produced.
    pub fn report_external_memory_failure(&self, byte_count: usize) {
        self.report_external_memory_free(byte_count);
    }

    pub fn external_allocated_bytes(&self) -> usize {
        self.inner.external_allocated_bytes.load(Ordering::SeqCst)
    }

    /// Take external budget for the duration of a host allocation attempt.
    /// Returns `None` when the budget cannot be found even after a
    /// collection.
    pub fn external_allocation_scope(&self, byte_count: usize) -> Option<ExternalAllocationScope<'_>> {
        if self.do_external_allocation(byte_count) {
            Some(ExternalAllocationScope {
                recycler: self,
                byte_count,
                committed: false,
            })
        } else {
            None
        }
    }

    // ---- roots, pins, weak references ----

    /// Pin an object: keep it (and everything it references) live until
    /// the matching `root_release`. Nested add-refs stack.
    pub fn root_add_ref(&self, obj: Address) {
        let mut pinned = self.inner.pinned.lock();
        *pinned.entry(obj.as_usize()).or_insert(0) += 1;
    }

    pub fn root_release(&self, obj: Address) {
        let mut pinned = self.inner.pinned.lock();
        if let Some(count) = pinned.get_mut(&obj.as_usize()) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&obj.as_usize());
            }
        }
    }

    pub fn is_pinned(&self, obj: Address) -> bool {
        self.inner.pinned.lock().contains_key(&obj.as_usize())
    }

    /// Register an external linear allocator whose contents are scanned,
    /// interior pointers accepted. Returns a handle for removal.
    pub fn add_guest_arena(&self, start: Address, byte_count: usize) -> usize {
        let mut arenas = self.inner.guest_arenas.lock();
        arenas.push(Some(GuestArena { start, byte_count }));
        arenas.len() - 1
    }

    pub fn remove_guest_arena(&self, handle: usize) {
        let mut arenas = self.inner.guest_arenas.lock();
        if let Some(slot) = arenas.get_mut(handle) {
            *slot = None;
        }
    }

    pub fn create_weak_reference_handle(&self, target: Address) -> WeakReferenceHandle {
        self.inner.weak_refs.lock().create_handle(target)
    }

    pub fn find_or_create_weak_reference_handle(&self, target: Address) -> WeakReferenceHandle {
        self.inner.weak_refs.lock().find_or_create_handle(target)
    }

    pub fn get_weak_reference_cleanup_id(&self) -> u64 {
        self.inner.weak_refs.lock().cleanup_id()
    }

    /// Clear an implicit-root bit so the next collection can reclaim the
    /// object.
    pub fn clear_implicit_root(&self, obj: Address) -> bool {
        let heap = unsafe { self.inner.heap_mut() };
        heap.clear_implicit_root(obj)
    }

    // ---- collection ----

    /// Trigger or continue a collection according to `flags`. Returns true
    /// if any collection work ran.
    pub fn collect_now(&self, flags: CollectionFlags) -> bool {
        if flags.contains(COLLECT_HEURISTIC_NEVER) {
            return false;
        }
        let acquired = !self.inner.in_collect.swap(true, Ordering::SeqCst);
        if !acquired && !flags.contains(COLLECT_OVERRIDE_ALLOW_REENTRANT) {
            return false;
        }
        let worked = self.collect_now_inner(flags);
        if acquired {
            self.inner.in_collect.store(false, Ordering::SeqCst);
        }
        worked
    }

    fn collect_now_inner(&self, flags: CollectionFlags) -> bool {
        let mut worked = false;
        let state = self.state();
        if !state.is_not_collecting() {
            // A concurrent collection is in flight; help it along.
            worked = self.finish_concurrent_collect(flags);
            if flags.contains(COLLECT_OVERRIDE_FORCE_FINISH) {
                while !self.state().is_not_collecting() {
                    self.finish_concurrent_collect(flags);
                }
            }
            if !self.state().is_not_collecting() || !flags.contains(COLLECT_OVERRIDE_EXPLICIT) {
                self.post_collect_decommit(flags);
                return worked;
            }
        }
        if flags.intersects(COLLECT_HEURISTIC_MASK) && !self.heuristic_trip(flags) {
            self.post_collect_decommit(flags);
            return worked;
        }
        if flags.contains(COLLECT_OVERRIDE_ALLOW_DISPOSE)
            && !flags.intersects(COLLECT_MODE_CONCURRENT)
            && flags.0 == FINISH_DISPOSE.0
        {
            // Dispose-only request.
            return self.dispose_objects();
        }

        let partial = self.decide_partial(flags);
        let concurrent = flags.intersects(COLLECT_MODE_CONCURRENT)
            && *self.inner.options.concurrent
            && !flags.contains(COLLECT_OVERRIDE_FORCE_IN_THREAD);

        if concurrent {
            self.start_concurrent_collect(flags, partial);
            if flags.contains(COLLECT_OVERRIDE_FORCE_FINISH) {
                while !self.state().is_not_collecting() {
                    self.finish_concurrent_collect(flags.union(FINISH_CONCURRENT_DEFAULT));
                }
            }
            worked = true;
        } else {
            self.do_in_thread_collect(flags, partial);
            worked = true;
            if flags.contains(COLLECT_MODE_EXHAUSTIVE) {
                // Keep collecting while dispose keeps producing garbage.
                let mut rounds = 0;
                while self.inner.heap_ref().has_disposable_object() && rounds < 3 {
                    self.dispose_objects();
                    self.do_in_thread_collect(flags.without(COLLECT_MODE_EXHAUSTIVE), false);
                    rounds += 1;
                }
            }
        }
        self.post_collect_decommit(flags);
        worked
    }

    fn post_collect_decommit(&self, flags: CollectionFlags) {
        if flags.contains(COLLECT_MODE_DECOMMIT_NOW) {
            for allocator in self.inner.heap_ref().page_allocators() {
                allocator.decommit_now();
            }
        }
    }

    /// Signal host idle time: finish concurrent work, maybe collect, and
    /// let the idle thread decommit.
    pub fn on_idle(&self) -> bool {
        let worked = self.collect_now(COLLECT_ON_SCRIPT_IDLE);
        self.inner.idle_decommit.signal_idle();
        worked
    }

    /// Drain the dispose queue. Dispose may allocate, which may re-enter
    /// collection, so re-entry is rejected.
    pub fn dispose_objects(&self) -> bool {
        if self
            .inner
            .in_dispose
            .swap(true, Ordering::SeqCst)
        {
            return false;
        }
        let mut disposed_any = false;
        loop {
            let heap = unsafe { self.inner.heap_mut() };
            let host = self.inner.host.clone();
            let count = heap.dispose_objects(&mut |addr, size| host.dispose(addr, size));
            disposed_any |= count > 0;
            self.transfer_disposed_objects();
            if !self.inner.heap_ref().has_disposable_object() {
                break;
            }
        }
        self.inner.in_dispose.store(false, Ordering::SeqCst);
        disposed_any
    }

    /// Return disposed slots to their free lists. Legal only while not
    /// collecting or at transfer; deferred otherwise.
    pub fn transfer_disposed_objects(&self) {
        let state = self.state();
        if !(state.is_not_collecting() || state == CollectionState::TRANSFER_SWEPT) {
            return;
        }
        let heap = unsafe { self.inner.heap_mut() };
        heap.transfer_disposed_objects();
        if let Some(sweep) = self.inner.sweep_state.lock().as_mut() {
            sweep.clear_pending_transfer_disposed_objects();
        }
    }

    // ---- queries ----

    pub fn is_valid_object(&self, addr: Address) -> bool {
        self.inner.heap_ref().is_heap_address(addr)
    }

    pub fn enumerate_objects(&self, info_bits_filter: u8, f: &mut dyn FnMut(RecyclerHeapObjectInfo)) {
        self.inner.heap_ref().enumerate_objects(info_bits_filter, f);
    }

    pub fn get_bucket_stats(&self) -> BucketStatsReport {
        let started = Instant::now();
        let heap = unsafe { self.inner.heap_mut() };
        let report = heap.get_bucket_stats(*self.inner.options.dump_fragmentation_stats);
        self.inner
            .telemetry
            .lock()
            .note_bucket_stats_elapsed(started.elapsed());
        report
    }

    pub fn telemetry_buffered_pass_count(&self) -> usize {
        self.inner.telemetry.lock().buffered_pass_count()
    }

    pub fn concurrent_thread_exited(&self) -> bool {
        self.inner.concurrent_thread_exited.load(Ordering::SeqCst)
    }

    /// A mark stack overflowed and a reserved-page rescan is owed.
    pub fn needs_oom_rescan(&self) -> bool {
        self.inner.need_oom_rescan.load(Ordering::SeqCst)
    }

    // ---- internals ----

    fn heuristic_trip(&self, flags: CollectionFlags) -> bool {
        if !flags.intersects(COLLECT_HEURISTIC_ALLOC_SIZE) {
            return true;
        }
        let heuristic = RecyclerHeuristic::instance();
        let threshold = match *self.inner.options.collect_trigger {
            CollectTriggerSelector::Default => {
                if *self.inner.options.concurrent {
                    heuristic.concurrent_uncollected_alloc_bytes
                } else {
                    heuristic.max_uncollected_alloc_bytes
                }
            }
            CollectTriggerSelector::FixedBytes(bytes) => bytes,
        };
        let pressure = self.inner.counters.uncollected_alloc_bytes.load(Ordering::Relaxed)
            + self
                .inner
                .counters
                .unused_partial_collect_free_bytes
                .load(Ordering::Relaxed);
        pressure >= threshold
    }

    fn decide_partial(&self, flags: CollectionFlags) -> bool {
        if !flags.intersects(COLLECT_MODE_PARTIAL)
            || !*self.inner.options.partial
            || flags.intersects(COLLECT_MODE_EXHAUSTIVE)
        {
            return false;
        }
        let heuristic = RecyclerHeuristic::instance();
        if self.inner.uncollected_new_page_count() > heuristic.max_partial_uncollected_new_page_count
        {
            return false;
        }
        // Promote to full when partial collections stopped paying off.
        let efficacy = f64::from_bits(self.inner.counters.collect_efficacy.load(Ordering::Relaxed));
        let cost = f64::from_bits(self.inner.counters.collect_cost.load(Ordering::Relaxed));
        if cost > 0.0 && efficacy / cost < heuristic.partial_efficacy_threshold {
            return false;
        }
        true
    }

    fn collection_trigger_check(&self) {
        let state = self.state();
        if state.is_finish_concurrent_waiting() {
            // The background finished its phase; take a bounded in-thread
            // slot to advance the machine.
            let pressure = self.inner.counters.uncollected_alloc_bytes.load(Ordering::Relaxed);
            if pressure >= RecyclerHeuristic::instance().partial_uncollected_alloc_bytes {
                self.finish_concurrent_collect(FINISH_CONCURRENT_TIMEOUT);
            }
            return;
        }
        if !state.is_not_collecting() {
            return;
        }
        self.collect_now(COLLECT_ON_ALLOCATION);
    }

    fn reset_collection_counters(&self, elapsed: Duration, reused_bytes: usize, unused_bytes: usize, partial: bool) {
        let counters = &self.inner.counters;
        counters.uncollected_alloc_bytes.store(0, Ordering::Relaxed);
        counters.partial_uncollected_alloc_bytes.store(0, Ordering::Relaxed);
        counters.collection_count.fetch_add(1, Ordering::Relaxed);
        let used: usize = self
            .inner
            .heap_ref()
            .page_allocators()
            .iter()
            .map(|pa| pa.used_page_count())
            .sum();
        counters.used_pages_at_last_collect.store(used, Ordering::Relaxed);
        if partial {
            counters
                .unused_partial_collect_free_bytes
                .fetch_add(unused_bytes, Ordering::Relaxed);
            counters
                .estimated_partial_reuse_bytes
                .store(reused_bytes, Ordering::Relaxed);
            counters
                .collect_efficacy
                .store((reused_bytes as f64).to_bits(), Ordering::Relaxed);
            counters
                .collect_cost
                .store((elapsed.as_secs_f64() * 1e6).max(1.0).to_bits(), Ordering::Relaxed);
        } else {
            counters.unused_partial_collect_free_bytes.store(0, Ordering::Relaxed);
            counters.estimated_partial_reuse_bytes.store(0, Ordering::Relaxed);
        }
    }

    // ---- in-thread collection ----

    fn do_in_thread_collect(&self, flags: CollectionFlags, partial: bool) {
        let inner = &self.inner;
        let started = Instant::now();
        inner.host.pre_collection_callback();
        inner.telemetry.lock().start_pass(false, partial, inner.allocator_snapshots());
        if inner.in_partial_collect_mode.swap(false, Ordering::SeqCst) && !partial {
            unsafe { inner.heap_mut() }.finish_partial_collect();
        }
        inner.partial_in_flight.store(partial, Ordering::SeqCst);

        // Mark.
        let phase = Instant::now();
        inner.set_state(CollectionState::RESET_MARKS.with(if partial { COLLECTION_PARTIAL } else { 0 }));
        {
            let heap = unsafe { inner.heap_mut() };
            heap.snapshot_collection_blocks(partial);
            heap.reset_marks(partial);
            if !partial {
                // A full mark makes the accumulated dirty set irrelevant.
                heap.with_barrier_page_allocator().reset_write_watch();
            }
        }
        inner.telemetry.lock().note_phase(CollectionPhase::ResetMarks, phase.elapsed());

        let phase = Instant::now();
        inner.set_state(CollectionState::FIND_ROOTS);
        self.find_roots(flags, true);
        if partial {
            // Old blocks keep their marks; stores recorded by the write
            // barrier since the last collection are the old-to-new roots.
            let heap = inner.heap_ref();
            let ctx = unsafe { inner.lane_mut(0) };
            heap.rescan(&mut |object| marking::process_marked(heap, ctx, object));
        }
        inner.telemetry.lock().note_phase(CollectionPhase::FindRoots, phase.elapsed());

        let phase = Instant::now();
        let parallel = self.parallel_threads_for_mark();
        if parallel.is_some() {
            inner.set_state(CollectionState::PARALLEL_MARK);
            self.parallel_mark();
        } else {
            inner.set_state(CollectionState::MARK);
            inner.drain_lane(0);
        }
        self.process_tracked_objects();
        self.oom_rescan_loop(flags);
        inner.telemetry.lock().note_phase(CollectionPhase::Mark, phase.elapsed());

        self.end_mark();

        // Sweep.
        let phase = Instant::now();
        self.sweep_in_thread(partial);
        inner.telemetry.lock().note_phase(CollectionPhase::Sweep, phase.elapsed());

        self.collection_epilogue(flags, started, partial);
    }

    fn end_mark(&self) {
        let inner = &self.inner;
        let heap = inner.heap_ref();
        // Weak references to unmarked targets die now.
        inner.weak_refs.lock().sweep(|target| heap.is_object_marked(target));
        if *inner.options.verify_mark {
            heap.verify_mark();
        }
    }

    fn sweep_in_thread(&self, partial: bool) {
        let inner = &self.inner;
        let heap = unsafe { inner.heap_mut() };
        inner.set_state(CollectionState::SWEEP.with(if partial { COLLECTION_PARTIAL } else { 0 }));
        heap.reset_allocators();
        let mut sweep = RecyclerSweep::new(false, partial);
        let host = inner.host.clone();
        let finalized = heap.sweep_finalizable_objects(&mut |addr, size| host.finalize(addr, size));
        sweep.note_finalized(finalized);
        heap.setup_sweep(partial);
        let swept = heap.sweep_pending(false);
        sweep.note_swept_blocks(swept);
        inner.set_state(CollectionState::TRANSFER_SWEPT);
        heap.transfer_swept();
        if partial {
            let stats = heap.sweep_partial_reuse_pages(
                RecyclerHeuristic::instance().partial_collect_block_reuse_min_free_bytes,
            );
            sweep.set_partial_reuse(stats);
            inner.in_partial_collect_mode.store(true, Ordering::SeqCst);
        }
        *inner.sweep_state.lock() = Some(sweep);
        if *inner.options.check_heap {
            heap.check();
        }
    }

    fn collection_epilogue(&self, flags: CollectionFlags, started: Instant, partial: bool) {
        let inner = &self.inner;
        inner.set_state(CollectionState::POST_SWEEP_REDEFERRAL_CALLBACK);
        inner.host.post_sweep_redeferral_callback();

        if flags.contains(COLLECT_OVERRIDE_ALLOW_DISPOSE) {
            let phase = Instant::now();
            inner.set_state(CollectionState::NOT_COLLECTING);
            self.dispose_objects();
            inner.telemetry.lock().note_phase(CollectionPhase::Dispose, phase.elapsed());
        }

        inner.set_state(CollectionState::POST_COLLECTION_CALLBACK);
        inner.host.post_collection_callback();
        inner.set_state(CollectionState::NOT_COLLECTING);
        inner.partial_in_flight.store(false, Ordering::SeqCst);

        let (reused, unused) = {
            let sweep_state = inner.sweep_state.lock();
            match sweep_state.as_ref() {
                Some(sweep) => {
                    let stats = sweep.partial_reuse();
                    (stats.reused_free_bytes, stats.unused_free_bytes)
                }
                None => (0, 0),
            }
        };
        self.reset_collection_counters(started.elapsed(), reused, unused, partial);

        let batch = {
            let mut telemetry = inner.telemetry.lock();
            telemetry.end_pass(inner.allocator_snapshots())
        };
        if let Some(batch) = batch {
            inner.host.transmit_telemetry(&batch);
        }
        for lane in 0..MAX_MARK_CONTEXTS {
            unsafe { inner.lane_mut(lane) }.cleanup();
        }
        debug!(
            "collection {} finished in {:?} (partial={}, root bytes={}, partial reuse est={})",
            self.collection_count(),
            started.elapsed(),
            partial,
            inner.counters.rescan_root_bytes.load(Ordering::Relaxed),
            inner.counters.estimated_partial_reuse_bytes.load(Ordering::Relaxed),
        );
    }

    // ---- roots ----

    fn find_roots(&self, flags: CollectionFlags, initial: bool) -> usize {
        let inner = &self.inner;
        let heap = inner.heap_ref();
        let ctx = unsafe { inner.lane_mut(0) };
        let mut bytes = 0usize;

        // Pinned objects: exact starts.
        let pinned: Vec<usize> = inner.pinned.lock().keys().copied().collect();
        for raw in pinned {
            marking::try_mark_non_interior(heap, ctx, unsafe { Address::from_usize(raw) });
            bytes += BYTES_IN_ADDRESS;
        }

        // Guest arenas: conservative interior scan.
        let arenas: Vec<GuestArena> = inner.guest_arenas.lock().iter().flatten().copied().collect();
        for arena in arenas {
            bytes += marking::scan_memory(heap, ctx, arena.start, arena.byte_count, true);
        }

        // Implicit roots.
        if initial {
            heap.scan_initial_implicit_roots(&mut |object| {
                marking::process_marked(heap, ctx, object)
            });
        } else {
            heap.scan_new_implicit_roots(&mut |object| marking::process_marked(heap, ctx, object));
        }

        // Host roots.
        bytes += inner
            .host
            .mark_external_roots(&mut RootScanner { heap, ctx });

        // The machine stack, conservatively.
        if !flags.contains(COLLECT_OVERRIDE_SKIP_STACK) {
            bytes += self.scan_stack();
        }
        inner
            .counters
            .rescan_root_bytes
            .store(bytes, Ordering::Relaxed);
        bytes
    }

    #[inline(never)]
    fn scan_stack(&self) -> usize {
        let inner = &self.inner;
        let base = inner.stack_base.load(Ordering::Relaxed);
        let probe = 0usize;
        let top = Address::from_ref(&probe).as_usize();
        if base == 0 || top >= base {
            return 0;
        }
        let heap = inner.heap_ref();
        let ctx = unsafe { inner.lane_mut(0) };
        let start = unsafe { Address::from_usize(top) }.align_up(BYTES_IN_ADDRESS);
        marking::scan_memory(heap, ctx, start, base - start.as_usize(), true)
    }

    fn process_tracked_objects(&self) {
        let inner = &self.inner;
        let heap = inner.heap_ref();
        for lane in 0..MAX_MARK_CONTEXTS {
            loop {
                let tracked = {
                    let ctx = unsafe { inner.lane_mut(lane) };
                    ctx.pop_track()
                };
                let Some(tracked) = tracked else {
                    break;
                };
                let primary = unsafe { inner.lane_mut(0) };
                inner.host.visit_tracked_object(
                    tracked.address,
                    tracked.byte_count,
                    &mut RootScanner { heap, ctx: primary },
                );
                let primary = unsafe { inner.lane_mut(0) };
                marking::drain(heap, primary);
            }
        }
    }

    /// Mark-stack overflow recovery: rescan with reserved pages until the
    /// watch-table queue stays empty.
    fn oom_rescan_loop(&self, _flags: CollectionFlags) {
        let inner = &self.inner;
        let heap = inner.heap_ref();
        loop {
            let mut overflowed = false;
            for lane in 0..MAX_MARK_CONTEXTS {
                overflowed |= unsafe { inner.lane_mut(lane) }.take_overflow();
            }
            if !overflowed {
                break;
            }
            inner.need_oom_rescan.store(true, Ordering::SeqCst);
            inner.set_state(CollectionState::RESCAN_MARK);
            let ctx = unsafe { inner.lane_mut(0) };
            ctx.page_pool_mut().set_use_reserved(true);
            heap.rescan(&mut |object| marking::process_marked(heap, ctx, object));
            marking::drain(heap, ctx);
            self.process_tracked_objects();
            let ctx = unsafe { inner.lane_mut(0) };
            ctx.page_pool_mut().set_use_reserved(false);
            inner.need_oom_rescan.store(false, Ordering::SeqCst);
        }
    }

    // ---- parallel mark ----

    fn parallel_threads_for_mark(&self) -> Option<&ParallelMarkThreads> {
        let worker_count = *self.inner.options.parallel_mark_worker_count;
        if worker_count == 0 {
            return None;
        }
        let inner = self.inner.clone();
        Some(self.inner.parallel.call_once(move || {
            ParallelMarkThreads::start(
                worker_count,
                Arc::new(move |lane| inner.parallel_mark_lane(lane)),
            )
        }))
    }

    /// Split the primary lane's pending work across the worker lanes, run
    /// every lane to completion, then rebalance until nothing is pending.
    fn parallel_mark(&self) {
        let inner = &self.inner;
        let Some(threads) = self.parallel_threads_for_mark() else {
            inner.drain_lane(0);
            return;
        };
        loop {
            // Seed the shared injector from the primary stack.
            let primary = unsafe { inner.lane_mut(0) };
            let mut seeded = false;
            while let Some(candidate) = primary.pop() {
                threads.push_shared(candidate);
                seeded = true;
            }
            if !seeded && threads.all_lanes_idle() {
                break;
            }
            threads.run_workers();
            // The marking thread works lane 0 alongside the workers.
            inner.parallel_mark_lane(0);
        }
    }

    // ---- concurrent collection ----

    fn ensure_background_thread(&self) {
        if self.inner.background.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("recycler-concurrent-gc".to_string())
            .spawn(move || RecyclerInner::background_proc(inner))
            .expect("failed to spawn concurrent GC thread");
        *self.inner.background.handle.lock() = Some(handle);
    }

    fn start_concurrent_collect(&self, _flags: CollectionFlags, partial: bool) {
        let inner = &self.inner;
        self.ensure_background_thread();
        inner.host.pre_collection_callback();
        inner.telemetry.lock().start_pass(true, partial, inner.allocator_snapshots());
        if inner.in_partial_collect_mode.swap(false, Ordering::SeqCst) && !partial {
            unsafe { inner.heap_mut() }.finish_partial_collect();
        }
        inner.partial_in_flight.store(partial, Ordering::SeqCst);
        {
            let heap = unsafe { inner.heap_mut() };
            heap.snapshot_collection_blocks(partial);
            // Dirty tracking for this cycle starts now.
            heap.with_barrier_page_allocator().reset_write_watch();
            // The reset must not race the mark bits that allocation sets on
            // objects born during the cycle, so it runs here, before the
            // mutator can allocate again, not on the background thread.
            inner.set_state(CollectionState::CONCURRENT_RESET_MARKS);
            heap.reset_marks(partial);
        }
        inner.background.work_done.reset();
        inner.set_state(CollectionState::CONCURRENT_FIND_ROOTS);
        inner.background.work_ready.set();
        trace!("concurrent collection started (partial={})", partial);
    }

    /// Take an in-thread slot to advance a concurrent collection. Returns
    /// true if any work was done. May leave the machine mid-flight (e.g.
    /// with a concurrent sweep running).
    pub fn finish_concurrent_collect(&self, flags: CollectionFlags) -> bool {
        let inner = &self.inner;
        let state = self.state();
        if state.is_not_collecting() {
            return false;
        }
        if state.is_executing_concurrent() {
            if state.is_sweeping() {
                // Adopt pass-1 output if available, then release the pass-1
                // barrier so pass 2 cannot hold up the handshake.
                self.start_allocation_during_concurrent_sweep();
                inner.background.sweep_pass1_ack_sent.store(true, Ordering::SeqCst);
                inner.background.sweep_pass1_ack.set();
            }
            // Wait for the background to reach a wait state.
            let blocked = Instant::now();
            let finished = if flags.contains(COLLECT_OVERRIDE_FINISH_CONCURRENT_TIMEOUT) {
                inner
                    .background
                    .work_done
                    .wait_timeout(Duration::from_millis(*inner.options.finish_concurrent_timeout_ms))
            } else {
                inner.background.work_done.wait();
                true
            };
            let reason = if self.state().is_sweeping() {
                UiThreadBlockedReason::WaitForConcurrentSweep
            } else {
                UiThreadBlockedReason::WaitForConcurrentMark
            };
            inner.telemetry.lock().note_blocked(reason, blocked.elapsed());
            if !finished {
                return false;
            }
            inner.background.work_done.reset();
        }

        match self.state() {
            CollectionState::RESCAN_WAIT => {
                self.finish_concurrent_mark(flags);
                true
            }
            CollectionState::TRANSFER_SWEPT_WAIT => {
                self.finish_concurrent_sweep_transfer(flags);
                true
            }
            _ => false,
        }
    }

    fn finish_concurrent_mark(&self, flags: CollectionFlags) {
        let inner = &self.inner;
        let partial = inner.partial_in_flight.load(Ordering::SeqCst);

        // Foreground rescan: roots again (the mutator kept running), then
        // the pages dirtied during concurrent mark.
        let phase = Instant::now();
        inner.set_state(CollectionState::RESCAN_FIND_ROOTS);
        self.find_roots(flags, false);
        inner.telemetry.lock().note_phase(CollectionPhase::FindRoots, phase.elapsed());

        let phase = Instant::now();
        inner.set_state(CollectionState::RESCAN_MARK);
        let heap = inner.heap_ref();
        let ctx = unsafe { inner.lane_mut(0) };
        let pages = heap.rescan(&mut |object| marking::process_marked(heap, ctx, object));
        marking::drain(heap, ctx);
        self.process_tracked_objects();
        self.oom_rescan_loop(flags);
        inner.telemetry.lock().note_phase(CollectionPhase::Rescan, phase.elapsed());
        trace!("concurrent rescan processed {} pages", pages);

        self.end_mark();

        // Concurrent body sweep: finalize in-thread first.
        let heap = unsafe { inner.heap_mut() };
        inner.set_state(CollectionState::SETUP_CONCURRENT_SWEEP);
        heap.reset_allocators();
        let mut sweep = RecyclerSweep::new(true, partial);
        let host = inner.host.clone();
        let finalized = heap.sweep_finalizable_objects(&mut |addr, size| host.finalize(addr, size));
        sweep.note_finalized(finalized);
        heap.setup_sweep(partial);
        if heap.do_two_pass_concurrent_sweep_pre_check() {
            sweep.set_two_pass();
        }
        *inner.sweep_state.lock() = Some(sweep);

        inner.background.sweep_pass1_done.reset();
        inner.background.sweep_pass1_ack.reset();
        inner.background.sweep_pass1_ack_sent.store(false, Ordering::SeqCst);
        inner.background.work_done.reset();
        inner.set_state(CollectionState::CONCURRENT_SWEEP);
        inner.background.work_ready.set();
    }

    /// Mid-sweep allocation hand-off: adopt pass-1 output if the
    /// background is parked at the pass-1 barrier and nobody released it
    /// yet.
    pub fn start_allocation_during_concurrent_sweep(&self) -> bool {
        let inner = &self.inner;
        if self.state() != CollectionState::CONCURRENT_SWEEP {
            return false;
        }
        if !inner.background.sweep_pass1_done.wait_timeout(Duration::ZERO) {
            return false;
        }
        if inner.background.sweep_pass1_ack_sent.swap(true, Ordering::SeqCst) {
            // Already released; the staged lists belong to pass 2.
            return false;
        }
        let heap = unsafe { inner.heap_mut() };
        heap.start_allocation_during_concurrent_sweep();
        inner.background.sweep_pass1_ack.set();
        true
    }

    fn finish_concurrent_sweep_transfer(&self, flags: CollectionFlags) {
        let inner = &self.inner;
        let partial = inner.partial_in_flight.load(Ordering::SeqCst);
        let phase = Instant::now();
        inner.set_state(CollectionState::TRANSFER_SWEPT);
        let heap = unsafe { inner.heap_mut() };
        heap.transfer_swept();
        if partial {
            let stats = heap.sweep_partial_reuse_pages(
                RecyclerHeuristic::instance().partial_collect_block_reuse_min_free_bytes,
            );
            if let Some(sweep) = inner.sweep_state.lock().as_mut() {
                sweep.set_partial_reuse(stats);
            }
            inner.in_partial_collect_mode.store(true, Ordering::SeqCst);
        }
        if *inner.options.check_heap {
            heap.check();
        }
        inner
            .telemetry
            .lock()
            .note_phase(CollectionPhase::TransferSwept, phase.elapsed());
        self.collection_epilogue(flags.union(COLLECT_OVERRIDE_ALLOW_DISPOSE), Instant::now(), partial);
    }
}

impl RecyclerInner {
    fn state(&self) -> CollectionState {
        CollectionState(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CollectionState) {
        trace!("collection state -> {:?}", state);
        self.state.store(state.0, Ordering::SeqCst);
    }

    /// Shared heap access; safe from any thread for the atomic mark paths.
    fn heap_ref(&self) -> &HeapInfo {
        unsafe { &*self.heap.get() }
    }

    /// Exclusive heap access.
    ///
    /// # Safety
    /// Caller must hold the state-machine role that owns the structures it
    /// will touch (see the module docs).
    #[allow(clippy::mut_from_ref)]
    unsafe fn heap_mut(&self) -> &mut HeapInfo {
        &mut *self.heap.get()
    }

    /// Exclusive access to one mark lane.
    ///
    /// # Safety
    /// Each lane is only driven by one thread at a time: lane 0 by the
    /// thread running the mark phase, lanes 1..4 by their worker.
    #[allow(clippy::mut_from_ref)]
    unsafe fn lane_mut(&self, lane: usize) -> &mut MarkContext {
        &mut *self.mark_contexts[lane].get()
    }

    fn allocator_snapshots(&self) -> AllocatorSnapshots {
        let allocators = self.heap_ref().page_allocators();
        [
            allocators[0].snapshot(),
            allocators[1].snapshot(),
            allocators[2].snapshot(),
            allocators[3].snapshot(),
        ]
    }

    fn heap_alloc(&self, size_cat: usize, attributes: u8) -> Option<Address> {
        let during_concurrent = self.state().is_executing_concurrent();
        let heap = unsafe { self.heap_mut() };
        heap.real_alloc(size_cat, attributes, during_concurrent)
    }

    fn uncollected_new_page_count(&self) -> usize {
        let used: usize = self
            .heap_ref()
            .page_allocators()
            .iter()
            .map(|pa| pa.used_page_count())
            .sum();
        used.saturating_sub(self.counters.used_pages_at_last_collect.load(Ordering::Relaxed))
    }

    fn drain_lane(&self, lane: usize) {
        let heap = self.heap_ref();
        let ctx = unsafe { self.lane_mut(lane) };
        marking::drain(heap, ctx);
    }

    /// Worker body for one parallel lane: drain own stack, then steal.
    fn parallel_mark_lane(&self, lane: usize) {
        let Some(threads) = self.parallel.get() else {
            return;
        };
        threads.note_lane_active();
        let heap = self.heap_ref();
        loop {
            let ctx = unsafe { self.lane_mut(lane) };
            marking::drain(heap, ctx);
            match threads.steal_shared() {
                Some(candidate) => {
                    let ctx = unsafe { self.lane_mut(lane) };
                    marking::scan_memory(heap, ctx, candidate.address, candidate.byte_count, false);
                }
                None => break,
            }
        }
        threads.note_lane_idle();
    }

    // ---- background thread ----

    fn background_proc(inner: Arc<RecyclerInner>) {
        debug!("concurrent GC thread running");
        loop {
            inner.background.work_ready.wait_and_reset();
            let state = inner.state();
            if state == CollectionState::EXIT {
                break;
            }
            let host = inner.host.clone();
            match state {
                CollectionState::CONCURRENT_FIND_ROOTS => {
                    let inner = &inner;
                    host.concurrent_wrapper_callback(&mut || inner.background_mark());
                }
                CollectionState::CONCURRENT_SWEEP => {
                    let inner = &inner;
                    host.concurrent_wrapper_callback(&mut || inner.background_sweep());
                }
                other => {
                    debug_assert!(
                        other.is_not_collecting(),
                        "unexpected background state {:?}",
                        other
                    );
                }
            }
            inner.background.work_done.set();
        }
        inner.concurrent_thread_exited.store(true, Ordering::SeqCst);
        debug!("concurrent GC thread exited");
    }

    fn background_mark(&self) {
        let heap = self.heap_ref();

        if self.is_aborting.load(Ordering::SeqCst) {
            self.set_state(CollectionState::RESCAN_WAIT);
            return;
        }

        // Marks were reset in the foreground before the hand-off.
        let ctx = unsafe { self.lane_mut(0) };
        // Background roots: pinned objects and guest arenas (snapshotted
        // under their locks) and the initial implicit roots. The machine
        // stack and host roots wait for the foreground rescan.
        let pinned: Vec<usize> = self.pinned.lock().keys().copied().collect();
        for raw in pinned {
            marking::try_mark_non_interior(heap, ctx, unsafe { Address::from_usize(raw) });
        }
        let arenas: Vec<GuestArena> = self.guest_arenas.lock().iter().flatten().copied().collect();
        for arena in arenas {
            marking::scan_memory(heap, ctx, arena.start, arena.byte_count, true);
        }
        heap.scan_initial_implicit_roots(&mut |object| marking::process_marked(heap, ctx, object));

        let parallel_workers = self.parallel.get().map_or(0, |t| t.worker_count());
        if parallel_workers > 0 {
            self.set_state(CollectionState::BACKGROUND_PARALLEL_MARK);
            let threads = self.parallel.get().unwrap();
            loop {
                let primary = unsafe { self.lane_mut(0) };
                let mut seeded = false;
                while let Some(candidate) = primary.pop() {
                    threads.push_shared(candidate);
                    seeded = true;
                }
                if !seeded && threads.all_lanes_idle() {
                    break;
                }
                threads.run_workers();
                self.parallel_mark_lane(0);
            }
        } else {
            self.set_state(CollectionState::CONCURRENT_MARK);
            let ctx = unsafe { self.lane_mut(0) };
            marking::drain_with_abort(heap, ctx, 256, &|| {
                self.is_aborting.load(Ordering::SeqCst)
            });
        }
        self.set_state(CollectionState::RESCAN_WAIT);
    }

    fn background_sweep(&self) {
        let started = Instant::now();
        let heap = unsafe { self.heap_mut() };
        let two_pass = self
            .sweep_state
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_two_pass());
        if two_pass {
            let pass1 = heap.finish_concurrent_sweep_pass1();
            trace!("concurrent sweep pass 1 swept {} blocks", pass1);
            self.background.sweep_pass1_done.set();
            self.background.sweep_pass1_ack.wait();
            let heap = unsafe { self.heap_mut() };
            let pass2 = heap.finish_concurrent_sweep();
            if let Some(sweep) = self.sweep_state.lock().as_mut() {
                sweep.note_swept_blocks(pass1 + pass2);
            }
        } else {
            let swept = heap.sweep_pending(true);
            if let Some(sweep) = self.sweep_state.lock().as_mut() {
                sweep.note_swept_blocks(swept);
            }
        }
        if let Some(sweep) = self.sweep_state.lock().as_mut() {
            sweep.note_background_elapsed(started.elapsed());
        }
        self.set_state(CollectionState::TRANSFER_SWEPT_WAIT);
    }
}

/// Scoped external-allocation budget. If the host's allocation fails and
/// the scope is dropped without `commit`, the failure is reported and the
/// budget returned on every exit path.
pub struct ExternalAllocationScope<'a> {
    recycler: &'a Recycler,
    byte_count: usize,
    committed: bool,
}

impl ExternalAllocationScope<'_> {
    /// The host allocation succeeded; keep the budget.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ExternalAllocationScope<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.recycler.report_external_memory_failure(self.byte_count);
        }
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.is_aborting.store(true, Ordering::SeqCst);
        // A sweep parked at the pass-1 barrier needs its ack before it can
        // reach the work-done handshake.
        inner.background.sweep_pass1_ack_sent.store(true, Ordering::SeqCst);
        inner.background.sweep_pass1_ack.set();
        if self.state().is_executing_concurrent() {
            inner.background.work_done.wait();
            inner.background.work_done.reset();
        }
        if inner.background.started.load(Ordering::SeqCst) {
            inner.set_state(CollectionState::EXIT);
            inner.background.work_ready.set();
            if let Some(handle) = inner.background.handle.lock().take() {
                let _ = handle.join();
            }
        }
        // Parallel mark threads and the idle-decommit thread join in their
        // own Drop impls; the page allocators unmap their segments last.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recycler() -> Recycler {
        let mut options = Options::default();
        // Deterministic in tests: no background machinery.
        options.set_bulk("concurrent=false,parallel_mark_worker_count=0,idle_decommit=false");
        Recycler::new(Arc::new(crate::host::DefaultCollectionHost), options)
    }

    #[test]
    fn pinned_objects_survive_collection() {
        let r = recycler();
        let obj = r.alloc_zero(64);
        r.root_add_ref(obj);
        assert!(r.collect_now(COLLECT_NOW_FORCE_IN_THREAD.union(COLLECT_OVERRIDE_SKIP_STACK)));
        assert!(r.is_valid_object(obj));
        // After release the next collection reclaims the cell.
        r.root_release(obj);
        r.collect_now(COLLECT_NOW_FORCE_IN_THREAD.union(COLLECT_OVERRIDE_SKIP_STACK));
        let again = r.alloc(64);
        assert_eq!(again, obj);
    }

    #[test]
    fn collection_state_returns_to_idle() {
        let r = recycler();
        r.alloc_zero(128);
        assert_eq!(r.collection_state(), CollectionState::NOT_COLLECTING);
        r.collect_now(COLLECT_NOW_FORCE_IN_THREAD.union(COLLECT_OVERRIDE_SKIP_STACK));
        assert_eq!(r.collection_state(), CollectionState::NOT_COLLECTING);
        assert_eq!(r.collection_count(), 1);
    }

    #[test]
    fn heuristic_collect_does_not_fire_early() {
        let r = recycler();
        r.alloc_zero(64);
        // Far below the allocation threshold: the heuristic path declines.
        assert!(!r.collect_now(CollectionFlags(
            COLLECT_HEURISTIC_ALLOC_SIZE.0 | COLLECT_OVERRIDE_SKIP_STACK.0
        )));
        assert_eq!(r.collection_count(), 0);
    }

    #[test]
    fn external_allocation_budget() {
        let r = recycler();
        assert!(r.do_external_allocation(1 << 20));
        assert_eq!(r.external_allocated_bytes(), 1 << 20);
        r.report_external_memory_free(1 << 20);
        assert_eq!(r.external_allocated_bytes(), 0);
    }

    #[test]
    fn external_allocation_scope_reports_failure_on_drop() {
        let r = recycler();
        {
            let _scope = r.external_allocation_scope(4096).unwrap();
            assert_eq!(r.external_allocated_bytes(), 4096);
            // Dropped without commit: the host allocation failed.
        }
        assert_eq!(r.external_allocated_bytes(), 0);
        let scope = r.external_allocation_scope(4096).unwrap();
        scope.commit();
        assert_eq!(r.external_allocated_bytes(), 4096);
    }
}
