//! Collection trigger flags: heuristic bits that decide *whether* to
//! collect and override bits that decide *how*. Named presets are the
//! OR-compositions call sites actually use.

/// A 32-bit mask of trigger and mode bits.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct CollectionFlags(pub u32);

impl CollectionFlags {
    pub const fn contains(self, bits: CollectionFlags) -> bool {
        self.0 & bits.0 == bits.0
    }

    pub const fn intersects(self, bits: CollectionFlags) -> bool {
        self.0 & bits.0 != 0
    }

    pub const fn union(self, bits: CollectionFlags) -> CollectionFlags {
        CollectionFlags(self.0 | bits.0)
    }

    pub const fn without(self, bits: CollectionFlags) -> CollectionFlags {
        CollectionFlags(self.0 & !bits.0)
    }
}

impl std::ops::BitOr for CollectionFlags {
    type Output = CollectionFlags;
    fn bitor(self, rhs: CollectionFlags) -> CollectionFlags {
        self.union(rhs)
    }
}

// Heuristic bits: collect only if the matching threshold trips.
pub const COLLECT_HEURISTIC_ALLOC_SIZE: CollectionFlags = CollectionFlags(0x0000_0001);
pub const COLLECT_HEURISTIC_TIME: CollectionFlags = CollectionFlags(0x0000_0002);
pub const COLLECT_HEURISTIC_IN_SCRIPT: CollectionFlags = CollectionFlags(0x0000_0004);
pub const COLLECT_HEURISTIC_NEVER: CollectionFlags = CollectionFlags(0x0000_0008);
pub const COLLECT_HEURISTIC_MASK: CollectionFlags = CollectionFlags(0x0000_000f);

// Override and mode bits.
pub const COLLECT_OVERRIDE_FINISH_CONCURRENT: CollectionFlags = CollectionFlags(0x0000_0010);
pub const COLLECT_OVERRIDE_EXHAUSTIVE_CANDIDATE: CollectionFlags = CollectionFlags(0x0000_0020);
pub const COLLECT_OVERRIDE_FORCE_IN_THREAD: CollectionFlags = CollectionFlags(0x0000_0040);
pub const COLLECT_OVERRIDE_ALLOW_DISPOSE: CollectionFlags = CollectionFlags(0x0000_0080);
pub const COLLECT_OVERRIDE_ALLOW_REENTRANT: CollectionFlags = CollectionFlags(0x0000_0100);
pub const COLLECT_OVERRIDE_FORCE_FINISH: CollectionFlags = CollectionFlags(0x0000_0200);
pub const COLLECT_OVERRIDE_EXPLICIT: CollectionFlags = CollectionFlags(0x0000_0400);
pub const COLLECT_OVERRIDE_DISABLE_IDLE_FINISH: CollectionFlags = CollectionFlags(0x0000_0800);
pub const COLLECT_OVERRIDE_BACKGROUND_FINISH_MARK: CollectionFlags = CollectionFlags(0x0000_1000);
pub const COLLECT_OVERRIDE_FINISH_CONCURRENT_TIMEOUT: CollectionFlags = CollectionFlags(0x0000_2000);
pub const COLLECT_OVERRIDE_NO_EXHAUSTIVE: CollectionFlags = CollectionFlags(0x0000_4000);
pub const COLLECT_OVERRIDE_SKIP_STACK: CollectionFlags = CollectionFlags(0x0000_8000);
pub const COLLECT_OVERRIDE_CHECK_SCRIPT_CONTEXT_CLOSE: CollectionFlags = CollectionFlags(0x0001_0000);
pub const COLLECT_MODE_PARTIAL: CollectionFlags = CollectionFlags(0x0002_0000);
pub const COLLECT_MODE_CONCURRENT: CollectionFlags = CollectionFlags(0x0004_0000);
pub const COLLECT_MODE_EXHAUSTIVE: CollectionFlags = CollectionFlags(0x0008_0000);
pub const COLLECT_MODE_DECOMMIT_NOW: CollectionFlags = CollectionFlags(0x0010_0000);
pub const COLLECT_MODE_CACHE_CLEANUP: CollectionFlags = CollectionFlags(0x0020_0000);

// Named presets.
/// The default explicit collection: concurrent if available, dispose
/// allowed.
pub const COLLECT_NOW_DEFAULT: CollectionFlags = CollectionFlags(
    COLLECT_OVERRIDE_ALLOW_DISPOSE.0 | COLLECT_MODE_CONCURRENT.0 | COLLECT_OVERRIDE_EXPLICIT.0,
);
/// Allocation-path trigger: heuristics decide, partial and concurrent
/// allowed.
pub const COLLECT_ON_ALLOCATION: CollectionFlags = CollectionFlags(
    COLLECT_HEURISTIC_ALLOC_SIZE.0
        | COLLECT_HEURISTIC_TIME.0
        | COLLECT_MODE_PARTIAL.0
        | COLLECT_MODE_CONCURRENT.0,
);
/// Idle-time collection: finish anything concurrent, clean caches, then
/// decommit.
pub const COLLECT_ON_SCRIPT_IDLE: CollectionFlags = CollectionFlags(
    COLLECT_OVERRIDE_FINISH_CONCURRENT.0
        | COLLECT_OVERRIDE_ALLOW_DISPOSE.0
        | COLLECT_MODE_CONCURRENT.0
        | COLLECT_MODE_PARTIAL.0
        | COLLECT_MODE_DECOMMIT_NOW.0
        | COLLECT_MODE_CACHE_CLEANUP.0,
);
/// Keep collecting while collections keep finding garbage.
pub const COLLECT_NOW_EXHAUSTIVE: CollectionFlags = CollectionFlags(
    COLLECT_NOW_DEFAULT.0 | COLLECT_MODE_EXHAUSTIVE.0 | COLLECT_OVERRIDE_EXHAUSTIVE_CANDIDATE.0,
);
/// Synchronous full collection, everything in-thread.
pub const COLLECT_NOW_FORCE_IN_THREAD: CollectionFlags = CollectionFlags(
    COLLECT_OVERRIDE_FORCE_IN_THREAD.0 | COLLECT_OVERRIDE_ALLOW_DISPOSE.0 | COLLECT_OVERRIDE_EXPLICIT.0,
);
/// Start (or continue) a concurrent collection explicitly.
pub const COLLECT_NOW_CONCURRENT: CollectionFlags =
    CollectionFlags(COLLECT_MODE_CONCURRENT.0 | COLLECT_OVERRIDE_EXPLICIT.0);
/// A partial (young-generation-like) collection.
pub const COLLECT_NOW_PARTIAL: CollectionFlags = CollectionFlags(
    COLLECT_MODE_PARTIAL.0 | COLLECT_OVERRIDE_ALLOW_DISPOSE.0 | COLLECT_OVERRIDE_EXPLICIT.0,
);
/// Wrap up a running concurrent collection.
pub const FINISH_CONCURRENT_DEFAULT: CollectionFlags = CollectionFlags(
    COLLECT_OVERRIDE_FINISH_CONCURRENT.0 | COLLECT_OVERRIDE_ALLOW_DISPOSE.0,
);
/// Finish a concurrent pass but give the background a bounded wait only.
pub const FINISH_CONCURRENT_TIMEOUT: CollectionFlags = CollectionFlags(
    FINISH_CONCURRENT_DEFAULT.0 | COLLECT_OVERRIDE_FINISH_CONCURRENT_TIMEOUT.0,
);
/// Drain the dispose queue without a new collection.
pub const FINISH_DISPOSE: CollectionFlags = CollectionFlags(COLLECT_OVERRIDE_ALLOW_DISPOSE.0);
/// The OOM recovery collection: synchronous, then give pages back.
pub const COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY: CollectionFlags = CollectionFlags(
    COLLECT_OVERRIDE_FORCE_IN_THREAD.0
        | COLLECT_OVERRIDE_ALLOW_DISPOSE.0
        | COLLECT_MODE_DECOMMIT_NOW.0,
);
/// External (typed-array style) allocation pressure.
pub const COLLECT_ON_TYPED_ARRAY_ALLOCATION: CollectionFlags = CollectionFlags(
    COLLECT_OVERRIDE_FORCE_IN_THREAD.0 | COLLECT_OVERRIDE_ALLOW_DISPOSE.0,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_compose_expected_bits() {
        assert!(COLLECT_NOW_DEFAULT.contains(COLLECT_MODE_CONCURRENT));
        assert!(COLLECT_NOW_DEFAULT.contains(COLLECT_OVERRIDE_ALLOW_DISPOSE));
        assert!(!COLLECT_NOW_DEFAULT.intersects(COLLECT_HEURISTIC_MASK));
        assert!(COLLECT_ON_ALLOCATION.intersects(COLLECT_HEURISTIC_MASK));
        assert!(COLLECT_NOW_FORCE_IN_THREAD.contains(COLLECT_OVERRIDE_FORCE_IN_THREAD));
        assert!(COLLECT_ON_SCRIPT_IDLE.contains(COLLECT_MODE_DECOMMIT_NOW));
        assert!(FINISH_CONCURRENT_TIMEOUT.contains(COLLECT_OVERRIDE_FINISH_CONCURRENT));
    }

    #[test]
    fn without_strips_bits() {
        let flags = COLLECT_NOW_DEFAULT.without(COLLECT_MODE_CONCURRENT);
        assert!(!flags.intersects(COLLECT_MODE_CONCURRENT));
        assert!(flags.contains(COLLECT_OVERRIDE_ALLOW_DISPOSE));
    }
}
