//! Heap layout: page supply, block arenas, size-class buckets and the
//! tables that make conservative pointer validation O(1).

pub mod block;
pub mod block_map;
pub mod bucket;
pub mod heap_info;
pub mod idle_decommit;
pub mod large;
pub mod object_info;
pub mod page_allocator;
pub mod stats;
pub mod valid_pointers;

use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use object_info::{BucketKind, HeapBlockKind};
use valid_pointers::ValidPointersMap;

/// Geometry of one block family. Two implementations: single-page small
/// blocks and multi-page medium blocks. Everything the valid-pointers map,
/// the blocks and the buckets need to know about sizes comes through here.
pub trait BlockAttributes: 'static + Send + Sync {
    const PAGE_COUNT: usize;
    const BUCKET_COUNT: usize;
    const MIN_OBJECT_SIZE: usize;
    const MAX_OBJECT_SIZE: usize;
    const BUCKET_GRANULARITY: usize;
    const IS_SMALL_BLOCK: bool;
    /// Bytes per block.
    const BLOCK_BYTES: usize;
    /// Granularity slots per block; the length of the mark/free bit vectors
    /// and of the valid-pointers tables.
    const MAX_SLOT_COUNT: usize;

    /// Object size of the given size class.
    fn bucket_size(bucket_index: usize) -> usize;

    /// Size class servicing the given (unrounded) request size.
    fn bucket_index(size: usize) -> usize;

    fn valid_pointers() -> &'static ValidPointersMap;

    fn block_kind(bucket: BucketKind) -> HeapBlockKind;
}

/// Single-page blocks for objects of 16..=768 bytes.
pub struct SmallAllocationBlockAttributes;

impl BlockAttributes for SmallAllocationBlockAttributes {
    const PAGE_COUNT: usize = SMALL_BLOCK_PAGE_COUNT;
    const BUCKET_COUNT: usize = SMALL_BUCKET_COUNT;
    const MIN_OBJECT_SIZE: usize = MIN_OBJECT_SIZE;
    const MAX_OBJECT_SIZE: usize = MAX_SMALL_OBJECT_SIZE;
    const BUCKET_GRANULARITY: usize = OBJECT_GRANULARITY;
    const IS_SMALL_BLOCK: bool = true;
    const BLOCK_BYTES: usize = SMALL_BLOCK_PAGE_COUNT * BYTES_IN_PAGE;
    const MAX_SLOT_COUNT: usize = Self::BLOCK_BYTES / OBJECT_GRANULARITY;

    fn bucket_size(bucket_index: usize) -> usize {
        debug_assert!(bucket_index < Self::BUCKET_COUNT);
        (bucket_index + 1) * OBJECT_GRANULARITY
    }

    fn bucket_index(size: usize) -> usize {
        debug_assert!(size <= Self::MAX_OBJECT_SIZE);
        let size_cat = std::cmp::max(raw_align_up(size, OBJECT_GRANULARITY), MIN_OBJECT_SIZE);
        size_cat / OBJECT_GRANULARITY - 1
    }

    fn valid_pointers() -> &'static ValidPointersMap {
        &valid_pointers::SMALL_VALID_POINTERS_MAP
    }

    fn block_kind(bucket: BucketKind) -> HeapBlockKind {
        HeapBlockKind::small(bucket)
    }
}

/// Eight-page blocks for objects of 1024..=9216 bytes.
pub struct MediumAllocationBlockAttributes;

impl BlockAttributes for MediumAllocationBlockAttributes {
    const PAGE_COUNT: usize = MEDIUM_BLOCK_PAGE_COUNT;
    const BUCKET_COUNT: usize = MEDIUM_BUCKET_COUNT;
    const MIN_OBJECT_SIZE: usize = MAX_SMALL_OBJECT_SIZE + MEDIUM_OBJECT_GRANULARITY;
    const MAX_OBJECT_SIZE: usize = MAX_MEDIUM_OBJECT_SIZE;
    const BUCKET_GRANULARITY: usize = MEDIUM_OBJECT_GRANULARITY;
    const IS_SMALL_BLOCK: bool = false;
    const BLOCK_BYTES: usize = MEDIUM_BLOCK_PAGE_COUNT * BYTES_IN_PAGE;
    const MAX_SLOT_COUNT: usize = Self::BLOCK_BYTES / OBJECT_GRANULARITY;

    fn bucket_size(bucket_index: usize) -> usize {
        debug_assert!(bucket_index < Self::BUCKET_COUNT);
        MAX_SMALL_OBJECT_SIZE + (bucket_index + 1) * MEDIUM_OBJECT_GRANULARITY
    }

    fn bucket_index(size: usize) -> usize {
        debug_assert!(size > MAX_SMALL_OBJECT_SIZE && size <= Self::MAX_OBJECT_SIZE);
        let over = size - MAX_SMALL_OBJECT_SIZE;
        raw_align_up(over, MEDIUM_OBJECT_GRANULARITY) / MEDIUM_OBJECT_GRANULARITY - 1
    }

    fn valid_pointers() -> &'static ValidPointersMap {
        &valid_pointers::MEDIUM_VALID_POINTERS_MAP
    }

    fn block_kind(bucket: BucketKind) -> HeapBlockKind {
        HeapBlockKind::medium(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_bucket_sizes_cover_range() {
        for i in 0..SmallAllocationBlockAttributes::BUCKET_COUNT {
            let size = SmallAllocationBlockAttributes::bucket_size(i);
            assert_eq!(SmallAllocationBlockAttributes::bucket_index(size), i);
            assert!(size <= MAX_SMALL_OBJECT_SIZE);
        }
        assert_eq!(SmallAllocationBlockAttributes::bucket_index(1), 0);
        assert_eq!(SmallAllocationBlockAttributes::bucket_index(17), 1);
        assert_eq!(SmallAllocationBlockAttributes::bucket_index(768), 47);
    }

    #[test]
    fn medium_bucket_sizes_cover_range() {
        for i in 0..MediumAllocationBlockAttributes::BUCKET_COUNT {
            let size = MediumAllocationBlockAttributes::bucket_size(i);
            assert_eq!(MediumAllocationBlockAttributes::bucket_index(size), i);
            assert!(size > MAX_SMALL_OBJECT_SIZE && size <= MAX_MEDIUM_OBJECT_SIZE);
        }
        assert_eq!(MediumAllocationBlockAttributes::bucket_index(769), 0);
        assert_eq!(MediumAllocationBlockAttributes::bucket_index(1024), 0);
        assert_eq!(MediumAllocationBlockAttributes::bucket_index(1025), 1);
        assert_eq!(MediumAllocationBlockAttributes::bucket_index(9216), 32);
    }

    #[test]
    fn every_size_maps_into_exactly_one_bucket() {
        // The bin-coverage walk: every allocatable size must land in a
        // bucket whose size is >= the request and whose predecessor is
        // smaller than the request.
        for size in 1..=MAX_SMALL_OBJECT_SIZE {
            let i = SmallAllocationBlockAttributes::bucket_index(size);
            let cat = SmallAllocationBlockAttributes::bucket_size(i);
            assert!(cat >= size);
            if i > 0 {
                assert!(SmallAllocationBlockAttributes::bucket_size(i - 1) < size);
            }
        }
        for size in MAX_SMALL_OBJECT_SIZE + 1..=MAX_MEDIUM_OBJECT_SIZE {
            let i = MediumAllocationBlockAttributes::bucket_index(size);
            let cat = MediumAllocationBlockAttributes::bucket_size(i);
            assert!(cat >= size);
            if i > 0 {
                assert!(MediumAllocationBlockAttributes::bucket_size(i - 1) < size);
            }
        }
    }
}
