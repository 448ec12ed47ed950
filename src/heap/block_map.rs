//! Page-address to block-header directory. Conservative candidates from
//! the stack or guest arenas resolve to their owning heap block through
//! this map in O(1): a chunk-granular top level, then one word per page.
//!
//! Entries are tagged pointers: the block-header address with the family
//! tag in the low bits (headers are heap allocations, so the low bits are
//! free). Lookups run on mark lanes while the mutator registers freshly
//! created blocks; entry words are atomic and the chunk directory is
//! behind a reader/writer lock that is only write-held when a new chunk of
//! address space first hosts a block.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::block::SmallHeapBlock;
use crate::heap::large::LargeHeapBlock;
use crate::heap::{
    BlockAttributes, MediumAllocationBlockAttributes, SmallAllocationBlockAttributes,
};
use crate::util::constants::*;
use crate::util::Address;

/// log2 of the address range covered by one chunk of the directory.
const LOG_CHUNK_BYTES: usize = LOG_BYTES_IN_PAGE + 8;
/// Pages per chunk (256, one segment's worth).
const PAGES_PER_CHUNK: usize = 1 << (LOG_CHUNK_BYTES - LOG_BYTES_IN_PAGE);

const TAG_MASK: usize = 0x3;
const TAG_SMALL: usize = 0x1;
const TAG_MEDIUM: usize = 0x2;
const TAG_LARGE: usize = 0x3;

/// A resolved block header. The pointer is only safe to dereference while
/// the collection state keeps the block alive (blocks are never released
/// during mark).
pub enum MappedBlock {
    Small(NonNull<SmallHeapBlock<SmallAllocationBlockAttributes>>),
    Medium(NonNull<SmallHeapBlock<MediumAllocationBlockAttributes>>),
    Large(NonNull<LargeHeapBlock>),
}

struct MapChunk {
    entries: Box<[AtomicUsize]>,
}

impl MapChunk {
    fn new() -> MapChunk {
        let mut entries = Vec::with_capacity(PAGES_PER_CHUNK);
        entries.resize_with(PAGES_PER_CHUNK, || AtomicUsize::new(0));
        MapChunk {
            entries: entries.into_boxed_slice(),
        }
    }
}

pub struct HeapBlockMap {
    chunks: spin::RwLock<HashMap<usize, Box<MapChunk>>>,
}

impl Default for HeapBlockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapBlockMap {
    pub fn new() -> Self {
        HeapBlockMap {
            chunks: spin::RwLock::new(HashMap::new()),
        }
    }

    fn set_entry(&self, page: Address, value: usize) {
        let chunk_key = page.as_usize() >> LOG_CHUNK_BYTES;
        let index = (page.as_usize() >> LOG_BYTES_IN_PAGE) & (PAGES_PER_CHUNK - 1);
        {
            let chunks = self.chunks.read();
            if let Some(chunk) = chunks.get(&chunk_key) {
                chunk.entries[index].store(value, Ordering::SeqCst);
                return;
            }
        }
        let mut chunks = self.chunks.write();
        let chunk = chunks.entry(chunk_key).or_insert_with(|| Box::new(MapChunk::new()));
        chunk.entries[index].store(value, Ordering::SeqCst);
    }

    fn register(&self, start: Address, page_count: usize, tagged: usize) {
        debug_assert!(start.is_aligned_to(BYTES_IN_PAGE));
        for i in 0..page_count {
            self.set_entry(start + i * BYTES_IN_PAGE, tagged);
        }
    }

    /// Publish a small or medium block for every page it covers.
    pub fn register_block<A: BlockAttributes>(&self, block: &SmallHeapBlock<A>) {
        let tag = if A::IS_SMALL_BLOCK { TAG_SMALL } else { TAG_MEDIUM };
        let ptr = block as *const SmallHeapBlock<A> as usize;
        debug_assert_eq!(ptr & TAG_MASK, 0);
        self.register(block.address(), A::PAGE_COUNT, ptr | tag);
    }

    pub fn register_large_block(&self, block: &LargeHeapBlock) {
        let ptr = block as *const LargeHeapBlock as usize;
        debug_assert_eq!(ptr & TAG_MASK, 0);
        self.register(block.address(), block.page_count(), ptr | TAG_LARGE);
    }

    pub fn unregister(&self, start: Address, page_count: usize) {
        for i in 0..page_count {
            self.set_entry(start + i * BYTES_IN_PAGE, 0);
        }
    }

    /// Resolve an arbitrary address to the block covering its page.
    pub fn get(&self, addr: Address) -> Option<MappedBlock> {
        let chunk_key = addr.as_usize() >> LOG_CHUNK_BYTES;
        let index = (addr.as_usize() >> LOG_BYTES_IN_PAGE) & (PAGES_PER_CHUNK - 1);
        let chunks = self.chunks.read();
        let chunk = chunks.get(&chunk_key)?;
        let entry = chunk.entries[index].load(Ordering::SeqCst);
        if entry == 0 {
            return None;
        }
        let ptr = entry & !TAG_MASK;
        match entry & TAG_MASK {
            TAG_SMALL => Some(MappedBlock::Small(NonNull::new(ptr as *mut _)?)),
            TAG_MEDIUM => Some(MappedBlock::Medium(NonNull::new(ptr as *mut _)?)),
            TAG_LARGE => Some(MappedBlock::Large(NonNull::new(ptr as *mut _)?)),
            _ => unreachable!(),
        }
    }

    /// Is any block registered for this address?
    pub fn covers(&self, addr: Address) -> bool {
        self.get(addr).is_some()
    }
}
