//! A manual-reset event built from a mutex/condvar pair. The collector
//! threads (background GC, parallel mark workers, idle decommit) park on
//! these; the mutator signals them when there is work or state to act on.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event, waking every waiter. The event stays signaled
    /// until `reset`.
    pub fn set(&self) {
        let mut guard = self.signaled.lock().unwrap();
        *guard = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        let mut guard = self.signaled.lock().unwrap();
        *guard = false;
    }

    /// Block until the event is signaled.
    pub fn wait(&self) {
        let mut guard = self.signaled.lock().unwrap();
        while !*guard {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Block until the event is signaled or the timeout elapses. Returns
    /// true if the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.signaled.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*guard {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, result) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() && !*guard {
                return false;
            }
        }
        true
    }

    /// Wait and atomically reset, so the next wait blocks until the next
    /// signal. Used for work-ready/work-done handshakes.
    pub fn wait_and_reset(&self) {
        let mut guard = self.signaled.lock().unwrap();
        while !*guard {
            guard = self.cond.wait(guard).unwrap();
        }
        *guard = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_wakes_waiter() {
        let event = Arc::new(Event::new());
        let e2 = event.clone();
        let t = std::thread::spawn(move || {
            e2.wait();
        });
        event.set();
        t.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(10)));
    }
}
