//! Parallel mark worker threads. Up to three workers assist the marking
//! thread; each owns a lane index into the recycler's mark contexts and a
//! pair of events for the work-ready/work-done handshake. Work distribution
//! is push-based: the marking thread splits the initial candidates across
//! the lanes through a shared injector, and idle workers steal batches from
//! it until every lane reports an empty stack.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::deque::{Injector, Steal};

use crate::collect::mark_context::MarkCandidate;
use crate::util::event::Event;

/// Shared state between the marking thread and one worker.
pub struct RecyclerParallelThread {
    pub work_ready: Event,
    pub work_done: Event,
}

impl RecyclerParallelThread {
    fn new() -> Self {
        RecyclerParallelThread {
            work_ready: Event::new(),
            work_done: Event::new(),
        }
    }
}

/// The worker fleet. The job closure receives the lane index (1-based; lane
/// 0 is the marking thread itself) and drains that lane's context.
pub struct ParallelMarkThreads {
    threads: Vec<Arc<RecyclerParallelThread>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<ParallelShared>,
}

struct ParallelShared {
    injector: Injector<MarkCandidate>,
    /// Lanes still holding or producing work.
    active_lanes: AtomicUsize,
    exit: AtomicBool,
}

impl ParallelMarkThreads {
    /// Maximum worker lanes besides the marking thread.
    pub const MAX_PARALLEL_THREADS: usize = 3;

    pub fn start(worker_count: usize, job: Arc<dyn Fn(usize) + Send + Sync>) -> ParallelMarkThreads {
        let worker_count = worker_count.min(Self::MAX_PARALLEL_THREADS);
        let shared = Arc::new(ParallelShared {
            injector: Injector::new(),
            active_lanes: AtomicUsize::new(0),
            exit: AtomicBool::new(false),
        });
        let mut threads = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for lane in 1..=worker_count {
            let thread = Arc::new(RecyclerParallelThread::new());
            let thread_for_worker = thread.clone();
            let shared_for_worker = shared.clone();
            let job = job.clone();
            let handle = std::thread::Builder::new()
                .name(format!("recycler-parallel-mark-{}", lane))
                .spawn(move || loop {
                    thread_for_worker.work_ready.wait_and_reset();
                    if shared_for_worker.exit.load(Ordering::SeqCst) {
                        break;
                    }
                    job(lane);
                    thread_for_worker.work_done.set();
                })
                .expect("failed to spawn parallel mark worker");
            threads.push(thread);
            handles.push(handle);
        }
        ParallelMarkThreads {
            threads,
            handles,
            shared,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    pub fn injector(&self) -> &Injector<MarkCandidate> {
        &self.shared.injector
    }

    /// Seed shared work for stealing.
    pub fn push_shared(&self, candidate: MarkCandidate) {
        self.shared.injector.push(candidate);
    }

    /// Steal a candidate for an idle lane.
    pub fn steal_shared(&self) -> Option<MarkCandidate> {
        loop {
            match self.shared.injector.steal() {
                Steal::Success(candidate) => return Some(candidate),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn note_lane_active(&self) {
        self.shared.active_lanes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_lane_idle(&self) {
        self.shared.active_lanes.fetch_sub(1, Ordering::SeqCst);
    }

    /// All lanes idle and no shared work left: marking is complete.
    pub fn all_lanes_idle(&self) -> bool {
        self.shared.active_lanes.load(Ordering::SeqCst) == 0 && self.shared.injector.is_empty()
    }

    /// Kick every worker and block until each reports done.
    pub fn run_workers(&self) {
        for thread in self.threads.iter() {
            thread.work_ready.set();
        }
        for thread in self.threads.iter() {
            thread.work_done.wait_and_reset();
        }
    }
}

impl Drop for ParallelMarkThreads {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        for thread in self.threads.iter() {
            thread.work_ready.set();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    #[test]
    fn workers_run_jobs_on_their_lanes() {
        let seen: Arc<spin::Mutex<Vec<usize>>> = Arc::new(spin::Mutex::new(vec![]));
        let seen2 = seen.clone();
        let threads = ParallelMarkThreads::start(
            3,
            Arc::new(move |lane| {
                seen2.lock().push(lane);
            }),
        );
        assert_eq!(threads.worker_count(), 3);
        threads.run_workers();
        let mut lanes = seen.lock().clone();
        lanes.sort_unstable();
        assert_eq!(lanes, vec![1, 2, 3]);
    }

    #[test]
    fn shared_injector_steals() {
        let threads = ParallelMarkThreads::start(0, Arc::new(|_| {}));
        let c = MarkCandidate {
            address: unsafe { Address::from_usize(0x4000) },
            byte_count: 16,
        };
        threads.push_shared(c);
        assert!(!threads.all_lanes_idle());
        assert_eq!(threads.steal_shared(), Some(c));
        assert_eq!(threads.steal_shared(), None);
        assert!(threads.all_lanes_idle());
    }
}
