//! Weak reference handles. Registration puts an entry in a hash table
//! keyed on the target address; after every mark the table is swept and
//! entries whose targets died are cleared. Handles stay valid after
//! clearing and simply read null.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::util::Address;

struct WeakReferenceEntry {
    target: AtomicUsize,
}

/// A host-held handle to a weakly referenced object.
#[derive(Clone)]
pub struct WeakReferenceHandle {
    entry: Arc<WeakReferenceEntry>,
}

impl WeakReferenceHandle {
    /// The target, or `None` once the collector cleared it.
    pub fn get(&self) -> Option<Address> {
        let raw = self.entry.target.load(Ordering::SeqCst);
        if raw == 0 {
            None
        } else {
            Some(unsafe { Address::from_usize(raw) })
        }
    }
}

#[derive(Default)]
pub struct WeakReferenceTable {
    entries: HashMap<usize, Arc<WeakReferenceEntry>>,
    cleanup_id: u64,
}

impl WeakReferenceTable {
    pub fn new() -> WeakReferenceTable {
        WeakReferenceTable::default()
    }

    pub fn create_handle(&mut self, target: Address) -> WeakReferenceHandle {
        debug_assert!(!target.is_zero());
        let entry = Arc::new(WeakReferenceEntry {
            target: AtomicUsize::new(target.as_usize()),
        });
        self.entries.insert(target.as_usize(), entry.clone());
        WeakReferenceHandle { entry }
    }

    /// Reuse the existing entry for a target if one is registered.
    pub fn find_or_create_handle(&mut self, target: Address) -> WeakReferenceHandle {
        if let Some(entry) = self.entries.get(&target.as_usize()) {
            if entry.target.load(Ordering::SeqCst) != 0 {
                return WeakReferenceHandle {
                    entry: entry.clone(),
                };
            }
        }
        self.create_handle(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear every entry whose target the mark phase did not reach.
    /// Returns the number of cleared entries; bumps the cleanup id when
    /// anything was cleared.
    pub fn sweep(&mut self, is_marked: impl Fn(Address) -> bool) -> usize {
        let mut cleared = 0;
        self.entries.retain(|&raw, entry| {
            let target = unsafe { Address::from_usize(raw) };
            if is_marked(target) {
                true
            } else {
                entry.target.store(0, Ordering::SeqCst);
                cleared += 1;
                false
            }
        });
        if cleared > 0 {
            self.cleanup_id += 1;
        }
        cleared
    }

    pub fn cleanup_id(&self) -> u64 {
        self.cleanup_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn sweep_clears_dead_targets() {
        let mut table = WeakReferenceTable::new();
        let live = table.create_handle(addr(0x1000));
        let dead = table.create_handle(addr(0x2000));
        assert_eq!(table.len(), 2);

        let cleared = table.sweep(|a| a == addr(0x1000));
        assert_eq!(cleared, 1);
        assert_eq!(table.cleanup_id(), 1);
        assert_eq!(live.get(), Some(addr(0x1000)));
        assert_eq!(dead.get(), None);
        assert_eq!(table.len(), 1);

        // Nothing else dies; the cleanup id stays put.
        let cleared = table.sweep(|_| true);
        assert_eq!(cleared, 0);
        assert_eq!(table.cleanup_id(), 1);
    }

    #[test]
    fn find_or_create_reuses_live_entries() {
        let mut table = WeakReferenceTable::new();
        let first = table.create_handle(addr(0x3000));
        let second = table.find_or_create_handle(addr(0x3000));
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&first.entry, &second.entry));
    }
}
