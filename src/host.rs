//! The collaborator surface between the collector and the runtime that
//! embeds it. The host supplies roots, receives finalize/dispose calls and
//! traces its own visited objects; everything has a no-op default so small
//! embedders only implement what they use.

use crate::collect::mark_context::MarkContext;
use crate::collect::marking;
use crate::heap::heap_info::HeapInfo;
use crate::telemetry::TelemetryPass;
use crate::util::Address;

/// Handed to the host during root scans and tracked-object visits; wraps
/// the active mark lane.
pub struct RootScanner<'a> {
    pub(crate) heap: &'a HeapInfo,
    pub(crate) ctx: &'a mut MarkContext,
}

impl RootScanner<'_> {
    /// Mark a candidate that must be an exact object start.
    pub fn mark_non_interior(&mut self, candidate: Address) {
        marking::try_mark_non_interior(self.heap, self.ctx, candidate);
    }

    /// Mark a candidate that may point into the middle of an object.
    pub fn mark_interior(&mut self, candidate: Address) {
        marking::try_mark_interior(self.heap, self.ctx, candidate);
    }

    /// Conservatively scan a memory range for pointer candidates, interior
    /// pointers accepted. Returns the number of bytes scanned.
    pub fn scan_memory(&mut self, start: Address, byte_count: usize) -> usize {
        marking::scan_memory(self.heap, self.ctx, start, byte_count, true)
    }
}

/// What the runtime provides to the collector.
pub trait CollectionHost: Send + Sync + 'static {
    /// Iterate the runtime's own root set, feeding each candidate range or
    /// pointer to the scanner. Returns the number of bytes scanned, for
    /// telemetry.
    fn mark_external_roots(&self, _scanner: &mut RootScanner<'_>) -> usize {
        0
    }

    /// An object with the finalize bit died. Runs on the mutator thread,
    /// before any memory it can reach is reclaimed.
    fn finalize(&self, _object: Address, _size: usize) {}

    /// Second phase of finalization; the runtime may allocate here, which
    /// may re-enter collection.
    fn dispose(&self, _object: Address, _size: usize) {}

    /// Trace a host-visited object's references.
    fn visit_tracked_object(&self, _object: Address, _size: usize, _scanner: &mut RootScanner<'_>) {
    }

    fn pre_collection_callback(&self) {}

    fn post_collection_callback(&self) {}

    /// Invoked between sweep and dispose so the runtime can re-defer code.
    fn post_sweep_redeferral_callback(&self) {}

    /// Wraps concurrent phases; the host may bracket the work with its own
    /// state, but must call `work`.
    fn concurrent_wrapper_callback(&self, work: &mut dyn FnMut()) {
        work()
    }

    /// Allocation failed even after an emergency collection.
    fn out_of_memory(&self) {
        panic!("recycler: out of memory");
    }

    /// Called when the telemetry buffer fills.
    fn transmit_telemetry(&self, _passes: &[TelemetryPass]) {}
}

/// A host with every default: no external roots, no finalizer action.
pub struct DefaultCollectionHost;

impl CollectionHost for DefaultCollectionHost {}
