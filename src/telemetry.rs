//! Per-pass collection telemetry. Each collection appends one pass record:
//! wall times, process memory, per-allocator usage and per-phase
//! durations. When 16 passes accumulate the batch goes to the host's
//! transmit hook and the buffer restarts.

use std::time::{Duration, Instant, SystemTime};

use enum_map::{Enum, EnumMap};
use sysinfo::{ProcessesToUpdate, System};

use crate::heap::page_allocator::PageAllocatorSnapshot;

/// Why the mutator thread was blocked waiting on the collector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum UiThreadBlockedReason {
    WaitForConcurrentMark,
    WaitForConcurrentSweep,
    InThreadCollect,
    Dispose,
}

/// The phases a pass records durations for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum CollectionPhase {
    ResetMarks,
    FindRoots,
    Mark,
    Rescan,
    Sweep,
    TransferSwept,
    Dispose,
}

/// Snapshots of the four page allocators, in a fixed order: thread-page
/// (normal), leaf, large-block, with-barrier.
pub type AllocatorSnapshots = [PageAllocatorSnapshot; 4];

#[derive(Clone, Debug)]
pub struct TelemetryPass {
    pub pass_start: SystemTime,
    pub pass_elapsed: Duration,
    pub is_concurrent: bool,
    pub is_partial: bool,
    pub process_committed_bytes_start: u64,
    pub process_committed_bytes_end: u64,
    pub process_used_bytes_start: u64,
    pub process_used_bytes_end: u64,
    pub allocator_start: AllocatorSnapshots,
    pub allocator_end: AllocatorSnapshots,
    pub ui_thread_blocked: EnumMap<UiThreadBlockedReason, Duration>,
    pub phase_durations: EnumMap<CollectionPhase, Duration>,
    pub start_pass_processing_elapsed: Duration,
    pub end_pass_processing_elapsed: Duration,
    pub compute_bucket_stats_elapsed: Duration,
}

/// Number of passes buffered before a transmit.
pub const TRANSMIT_PASS_THRESHOLD: usize = 16;

struct PassInFlight {
    pass: TelemetryPass,
    started_at: Instant,
}

pub struct RecyclerTelemetryInfo {
    recycler_id: u64,
    is_concurrent_enabled: bool,
    passes: Vec<TelemetryPass>,
    in_flight: Option<PassInFlight>,
    /// Set when the concurrent thread failed; no further passes are
    /// recorded for this recycler.
    aborted: bool,
    system: System,
}

impl RecyclerTelemetryInfo {
    pub fn new(recycler_id: u64, is_concurrent_enabled: bool) -> RecyclerTelemetryInfo {
        RecyclerTelemetryInfo {
            recycler_id,
            is_concurrent_enabled,
            passes: Vec::with_capacity(TRANSMIT_PASS_THRESHOLD),
            in_flight: None,
            aborted: false,
            system: System::new(),
        }
    }

    pub fn recycler_id(&self) -> u64 {
        self.recycler_id
    }

    pub fn is_concurrent_enabled(&self) -> bool {
        self.is_concurrent_enabled
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Stop recording; the concurrent thread died and timings would lie.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.in_flight = None;
    }

    fn process_memory(&mut self) -> (u64, u64) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return (0, 0);
        };
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match self.system.process(pid) {
            Some(process) => (process.virtual_memory(), process.memory()),
            None => (0, 0),
        }
    }

    pub fn start_pass(&mut self, is_concurrent: bool, is_partial: bool, allocators: AllocatorSnapshots) {
        if self.aborted {
            return;
        }
        let started_at = Instant::now();
        let (committed, used) = self.process_memory();
        let pass = TelemetryPass {
            pass_start: SystemTime::now(),
            pass_elapsed: Duration::ZERO,
            is_concurrent,
            is_partial,
            process_committed_bytes_start: committed,
            process_committed_bytes_end: 0,
            process_used_bytes_start: used,
            process_used_bytes_end: 0,
            allocator_start: allocators,
            allocator_end: AllocatorSnapshots::default(),
            ui_thread_blocked: EnumMap::default(),
            phase_durations: EnumMap::default(),
            start_pass_processing_elapsed: started_at.elapsed(),
            end_pass_processing_elapsed: Duration::ZERO,
            compute_bucket_stats_elapsed: Duration::ZERO,
        };
        self.in_flight = Some(PassInFlight { pass, started_at });
    }

    pub fn note_phase(&mut self, phase: CollectionPhase, elapsed: Duration) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.pass.phase_durations[phase] += elapsed;
        }
    }

    pub fn note_blocked(&mut self, reason: UiThreadBlockedReason, elapsed: Duration) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.pass.ui_thread_blocked[reason] += elapsed;
        }
    }

    pub fn note_bucket_stats_elapsed(&mut self, elapsed: Duration) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.pass.compute_bucket_stats_elapsed += elapsed;
        }
    }

    /// Finish the in-flight pass. Returns the full batch when the transmit
    /// threshold is reached; the caller hands it to the host.
    pub fn end_pass(&mut self, allocators: AllocatorSnapshots) -> Option<Vec<TelemetryPass>> {
        let Some(mut in_flight) = self.in_flight.take() else {
            return None;
        };
        let end_processing = Instant::now();
        let (committed, used) = self.process_memory();
        in_flight.pass.pass_elapsed = in_flight.started_at.elapsed();
        in_flight.pass.process_committed_bytes_end = committed;
        in_flight.pass.process_used_bytes_end = used;
        in_flight.pass.allocator_end = allocators;
        in_flight.pass.end_pass_processing_elapsed = end_processing.elapsed();
        self.passes.push(in_flight.pass);
        if self.passes.len() >= TRANSMIT_PASS_THRESHOLD {
            Some(std::mem::take(&mut self.passes))
        } else {
            None
        }
    }

    pub fn buffered_pass_count(&self) -> usize {
        self.passes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_accumulate_and_flush_at_threshold() {
        let mut telemetry = RecyclerTelemetryInfo::new(1, true);
        for i in 0..TRANSMIT_PASS_THRESHOLD {
            telemetry.start_pass(false, false, AllocatorSnapshots::default());
            telemetry.note_phase(CollectionPhase::Mark, Duration::from_micros(10));
            let batch = telemetry.end_pass(AllocatorSnapshots::default());
            if i + 1 < TRANSMIT_PASS_THRESHOLD {
                assert!(batch.is_none());
            } else {
                let batch = batch.expect("threshold reached");
                assert_eq!(batch.len(), TRANSMIT_PASS_THRESHOLD);
            }
        }
        assert_eq!(telemetry.buffered_pass_count(), 0);
    }

    #[test]
    fn aborted_telemetry_records_nothing() {
        let mut telemetry = RecyclerTelemetryInfo::new(2, false);
        telemetry.abort();
        telemetry.start_pass(true, false, AllocatorSnapshots::default());
        assert!(telemetry.end_pass(AllocatorSnapshots::default()).is_none());
        assert_eq!(telemetry.buffered_pass_count(), 0);
        assert!(telemetry.is_aborted());
    }
}
