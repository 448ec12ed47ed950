//! Idle-time decommit. The host signals idle; a dedicated thread walks the
//! recycler's page allocators and returns pooled pages to the OS. Heap
//! walks that need pooled pages to stay committed take an
//! [`AutoIdleDecommit`] guard, which suspends the thread's work until every
//! guard on every allocator is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::heap::page_allocator::PageAllocator;
use crate::util::event::Event;

struct IdleDecommitShared {
    idle_signal: Event,
    exit: AtomicBool,
    allocators: Vec<Arc<PageAllocator>>,
}

/// Owner of the idle-decommit thread.
pub struct IdleDecommit {
    shared: Arc<IdleDecommitShared>,
    handle: Option<JoinHandle<()>>,
}

impl IdleDecommit {
    /// Spawn the idle thread over the given allocators. When disabled, no
    /// thread starts and `signal_idle` is a no-op.
    pub fn start(allocators: Vec<Arc<PageAllocator>>, enabled: bool) -> IdleDecommit {
        let shared = Arc::new(IdleDecommitShared {
            idle_signal: Event::new(),
            exit: AtomicBool::new(false),
            allocators,
        });
        let handle = if enabled {
            let thread_shared = shared.clone();
            Some(
                std::thread::Builder::new()
                    .name("recycler-idle-decommit".to_string())
                    .spawn(move || Self::run(thread_shared))
                    .expect("failed to spawn idle decommit thread"),
            )
        } else {
            None
        };
        IdleDecommit {
            shared,
            handle,
        }
    }

    fn run(shared: Arc<IdleDecommitShared>) {
        loop {
            shared.idle_signal.wait_and_reset();
            if shared.exit.load(Ordering::SeqCst) {
                break;
            }
            for allocator in shared.allocators.iter() {
                if shared.exit.load(Ordering::SeqCst) {
                    break;
                }
                if !allocator.is_idle_decommit_suspended() {
                    allocator.decommit_now();
                }
            }
        }
        debug!("idle decommit thread exiting");
    }

    /// Tell the idle thread there is idle time to spend.
    pub fn signal_idle(&self) {
        self.shared.idle_signal.set();
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for IdleDecommit {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.idle_signal.set();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Scoped suspension of idle decommit across a set of allocators. Resumes
/// unconditionally on every exit path.
pub struct AutoIdleDecommit<'a> {
    allocators: &'a [Arc<PageAllocator>],
}

impl<'a> AutoIdleDecommit<'a> {
    pub fn new(allocators: &'a [Arc<PageAllocator>]) -> Self {
        for allocator in allocators {
            allocator.suspend_idle_decommit();
        }
        AutoIdleDecommit { allocators }
    }
}

impl Drop for AutoIdleDecommit<'_> {
    fn drop(&mut self) {
        for allocator in self.allocators {
            allocator.resume_idle_decommit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page_allocator::AllocatorRole;
    use std::time::Duration;

    #[test]
    fn idle_decommits_pool() {
        let pa = Arc::new(PageAllocator::new(AllocatorRole::Normal, 1024));
        let idle = IdleDecommit::start(vec![pa.clone()], true);
        let a = pa.alloc_pages(2).unwrap();
        pa.release_pages(a, 2);
        idle.signal_idle();
        // The decommit happens asynchronously; all we require is that the
        // pool is still usable afterwards.
        std::thread::sleep(Duration::from_millis(50));
        let b = pa.alloc_pages(1).unwrap();
        assert_eq!(unsafe { b.load::<usize>() }, 0);
        pa.release_pages(b, 1);
    }

    #[test]
    fn guard_suspends_and_resumes() {
        let pa = Arc::new(PageAllocator::new(AllocatorRole::Normal, 1024));
        let allocators = [pa.clone()];
        {
            let _guard = AutoIdleDecommit::new(&allocators);
            assert!(pa.is_idle_decommit_suspended());
        }
        assert!(!pa.is_idle_decommit_suspended());
    }
}
