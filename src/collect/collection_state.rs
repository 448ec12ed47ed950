//! The collection state word: phase flags composed into the named states
//! the state machine actually moves through. The current state lives in an
//! atomic on the recycler; the background thread switches on it, and "the
//! substate is the lock" for every shared heap structure.

use std::fmt;

/// Phase flags.
pub const COLLECTION_MARK: u32 = 0x0000_0001;
pub const COLLECTION_SWEEP: u32 = 0x0000_0002;
pub const COLLECTION_EXIT: u32 = 0x0000_0004;
pub const COLLECTION_PRE_COLLECTION: u32 = 0x0000_0008;

// Mark related states
pub const COLLECTION_RESET_MARKS: u32 = 0x0000_0010;
pub const COLLECTION_FIND_ROOTS: u32 = 0x0000_0020;
pub const COLLECTION_RESCAN: u32 = 0x0000_0040;
pub const COLLECTION_FINISH_MARK: u32 = 0x0000_0080;

// Sweep related states
pub const COLLECTION_CONCURRENT_SWEEP_SETUP: u32 = 0x0000_0100;
pub const COLLECTION_TRANSFER_SWEPT: u32 = 0x0000_0200;

// State attributes
pub const COLLECTION_PARTIAL: u32 = 0x0000_1000;
pub const COLLECTION_CONCURRENT: u32 = 0x0000_2000;
pub const COLLECTION_EXECUTING_CONCURRENT: u32 = 0x0000_4000;
pub const COLLECTION_FINISH_CONCURRENT: u32 = 0x0000_8000;
pub const COLLECTION_PARALLEL: u32 = 0x0001_0000;
pub const COLLECTION_POST_COLLECTION_CALLBACK: u32 = 0x0002_0000;
pub const COLLECTION_POST_SWEEP_REDEFERRAL_CALLBACK: u32 = 0x0004_0000;
pub const COLLECTION_WRAPPER_CALLBACK: u32 = 0x0008_0000;

pub const COLLECTION_CONCURRENT_MARK: u32 = COLLECTION_CONCURRENT | COLLECTION_MARK;
pub const COLLECTION_CONCURRENT_SWEEP: u32 = COLLECTION_CONCURRENT | COLLECTION_SWEEP;

/// A named point in the collection state machine.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CollectionState(pub u32);

impl CollectionState {
    pub const NOT_COLLECTING: CollectionState = CollectionState(0);
    pub const RESET_MARKS: CollectionState =
        CollectionState(COLLECTION_MARK | COLLECTION_RESET_MARKS);
    pub const FIND_ROOTS: CollectionState =
        CollectionState(COLLECTION_MARK | COLLECTION_FIND_ROOTS);
    pub const MARK: CollectionState = CollectionState(COLLECTION_MARK);
    pub const SWEEP: CollectionState = CollectionState(COLLECTION_SWEEP);
    pub const TRANSFER_SWEPT: CollectionState =
        CollectionState(COLLECTION_SWEEP | COLLECTION_TRANSFER_SWEPT);
    pub const EXIT: CollectionState = CollectionState(COLLECTION_EXIT);

    // Rescan exists without concurrency too: mark-stack OOM forces one.
    pub const RESCAN_FIND_ROOTS: CollectionState =
        CollectionState(COLLECTION_MARK | COLLECTION_RESCAN | COLLECTION_FIND_ROOTS);
    pub const RESCAN_MARK: CollectionState =
        CollectionState(COLLECTION_MARK | COLLECTION_RESCAN);

    pub const CONCURRENT_RESET_MARKS: CollectionState = CollectionState(
        COLLECTION_CONCURRENT_MARK | COLLECTION_RESET_MARKS | COLLECTION_EXECUTING_CONCURRENT,
    );
    pub const CONCURRENT_FIND_ROOTS: CollectionState = CollectionState(
        COLLECTION_CONCURRENT_MARK | COLLECTION_FIND_ROOTS | COLLECTION_EXECUTING_CONCURRENT,
    );
    pub const CONCURRENT_MARK: CollectionState =
        CollectionState(COLLECTION_CONCURRENT_MARK | COLLECTION_EXECUTING_CONCURRENT);
    pub const RESCAN_WAIT: CollectionState =
        CollectionState(COLLECTION_CONCURRENT_MARK | COLLECTION_FINISH_CONCURRENT);
    pub const CONCURRENT_FINISH_MARK: CollectionState = CollectionState(
        COLLECTION_CONCURRENT_MARK | COLLECTION_EXECUTING_CONCURRENT | COLLECTION_FINISH_CONCURRENT,
    );

    pub const SETUP_CONCURRENT_SWEEP: CollectionState =
        CollectionState(COLLECTION_SWEEP | COLLECTION_CONCURRENT_SWEEP_SETUP);
    pub const CONCURRENT_SWEEP: CollectionState =
        CollectionState(COLLECTION_CONCURRENT_SWEEP | COLLECTION_EXECUTING_CONCURRENT);
    pub const TRANSFER_SWEPT_WAIT: CollectionState =
        CollectionState(COLLECTION_CONCURRENT_SWEEP | COLLECTION_FINISH_CONCURRENT);

    pub const PARALLEL_MARK: CollectionState =
        CollectionState(COLLECTION_MARK | COLLECTION_PARALLEL);
    pub const BACKGROUND_PARALLEL_MARK: CollectionState = CollectionState(
        COLLECTION_CONCURRENT_MARK | COLLECTION_EXECUTING_CONCURRENT | COLLECTION_PARALLEL,
    );
    pub const CONCURRENT_WRAPPER_CALLBACK: CollectionState = CollectionState(
        COLLECTION_CONCURRENT | COLLECTION_EXECUTING_CONCURRENT | COLLECTION_WRAPPER_CALLBACK,
    );
    pub const POST_SWEEP_REDEFERRAL_CALLBACK: CollectionState =
        CollectionState(COLLECTION_POST_SWEEP_REDEFERRAL_CALLBACK);
    pub const POST_COLLECTION_CALLBACK: CollectionState =
        CollectionState(COLLECTION_POST_COLLECTION_CALLBACK);

    pub const fn has(self, flags: u32) -> bool {
        self.0 & flags != 0
    }

    pub const fn with(self, flags: u32) -> CollectionState {
        CollectionState(self.0 | flags)
    }

    pub const fn is_not_collecting(self) -> bool {
        self.0 == 0
    }

    pub const fn is_marking(self) -> bool {
        self.has(COLLECTION_MARK)
    }

    pub const fn is_sweeping(self) -> bool {
        self.has(COLLECTION_SWEEP)
    }

    pub const fn is_concurrent(self) -> bool {
        self.has(COLLECTION_CONCURRENT)
    }

    /// The background thread currently owns a phase.
    pub const fn is_executing_concurrent(self) -> bool {
        self.has(COLLECTION_EXECUTING_CONCURRENT)
    }

    /// The background finished its phase and waits for a foreground finish.
    pub const fn is_finish_concurrent_waiting(self) -> bool {
        self.has(COLLECTION_FINISH_CONCURRENT) && !self.has(COLLECTION_EXECUTING_CONCURRENT)
    }

    pub const fn is_partial(self) -> bool {
        self.has(COLLECTION_PARTIAL)
    }
}

impl fmt::Debug for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            CollectionState::NOT_COLLECTING => "NotCollecting",
            CollectionState::RESET_MARKS => "ResetMarks",
            CollectionState::FIND_ROOTS => "FindRoots",
            CollectionState::MARK => "Mark",
            CollectionState::SWEEP => "Sweep",
            CollectionState::TRANSFER_SWEPT => "TransferSwept",
            CollectionState::EXIT => "Exit",
            CollectionState::RESCAN_FIND_ROOTS => "RescanFindRoots",
            CollectionState::RESCAN_MARK => "RescanMark",
            CollectionState::CONCURRENT_RESET_MARKS => "ConcurrentResetMarks",
            CollectionState::CONCURRENT_FIND_ROOTS => "ConcurrentFindRoots",
            CollectionState::CONCURRENT_MARK => "ConcurrentMark",
            CollectionState::RESCAN_WAIT => "RescanWait",
            CollectionState::CONCURRENT_FINISH_MARK => "ConcurrentFinishMark",
            CollectionState::SETUP_CONCURRENT_SWEEP => "SetupConcurrentSweep",
            CollectionState::CONCURRENT_SWEEP => "ConcurrentSweep",
            CollectionState::TRANSFER_SWEPT_WAIT => "TransferSweptWait",
            CollectionState::PARALLEL_MARK => "ParallelMark",
            CollectionState::BACKGROUND_PARALLEL_MARK => "BackgroundParallelMark",
            CollectionState::CONCURRENT_WRAPPER_CALLBACK => "ConcurrentWrapperCallback",
            CollectionState::POST_SWEEP_REDEFERRAL_CALLBACK => "PostSweepRedeferralCallback",
            CollectionState::POST_COLLECTION_CALLBACK => "PostCollectionCallback",
            _ => return write!(f, "CollectionState({:#x})", self.0),
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_states_carry_their_phase_bits() {
        assert!(CollectionState::CONCURRENT_MARK.is_marking());
        assert!(CollectionState::CONCURRENT_MARK.is_concurrent());
        assert!(CollectionState::CONCURRENT_MARK.is_executing_concurrent());
        assert!(CollectionState::RESCAN_WAIT.is_finish_concurrent_waiting());
        assert!(!CollectionState::CONCURRENT_FINISH_MARK.is_finish_concurrent_waiting());
        assert!(CollectionState::TRANSFER_SWEPT.is_sweeping());
        assert!(CollectionState::NOT_COLLECTING.is_not_collecting());
        assert!(CollectionState::BACKGROUND_PARALLEL_MARK.has(COLLECTION_PARALLEL));
    }

    #[test]
    fn state_names_render() {
        assert_eq!(format!("{:?}", CollectionState::CONCURRENT_SWEEP), "ConcurrentSweep");
        assert_eq!(format!("{:?}", CollectionState::NOT_COLLECTING), "NotCollecting");
    }
}
