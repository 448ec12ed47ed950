//! Size constants shared by the heap layout, the valid-pointers map and the
//! collector. All block geometry derives from the handful of values here.

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: usize = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: usize = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = BITS_IN_BYTE * BYTES_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the object allocation granularity. Every object size is rounded
/// up to a multiple of this, and every conservative candidate is rounded
/// down to it before the valid-pointers lookup.
pub const LOG_OBJECT_GRANULARITY: usize = 4;
/// The object allocation granularity in bytes.
pub const OBJECT_GRANULARITY: usize = 1 << LOG_OBJECT_GRANULARITY;

/// The smallest object size the heap hands out.
pub const MIN_OBJECT_SIZE: usize = OBJECT_GRANULARITY;

/// The largest object serviced by the small (single page) buckets.
pub const MAX_SMALL_OBJECT_SIZE: usize = 768;
/// Number of small size classes: 16, 32, .., 768.
pub const SMALL_BUCKET_COUNT: usize = MAX_SMALL_OBJECT_SIZE / OBJECT_GRANULARITY;

/// Size-class granularity for medium buckets.
pub const MEDIUM_OBJECT_GRANULARITY: usize = 256;
/// The largest object serviced by the medium (multi page) buckets. Anything
/// bigger gets its own large heap block.
pub const MAX_MEDIUM_OBJECT_SIZE: usize = 9216;
/// Number of medium size classes: 1024, 1280, .., 9216.
pub const MEDIUM_BUCKET_COUNT: usize =
    (MAX_MEDIUM_OBJECT_SIZE - MAX_SMALL_OBJECT_SIZE) / MEDIUM_OBJECT_GRANULARITY;

/// Pages per small heap block.
pub const SMALL_BLOCK_PAGE_COUNT: usize = 1;
/// Pages per medium heap block.
pub const MEDIUM_BLOCK_PAGE_COUNT: usize = 8;

/// Pages reserved per page-allocator segment.
pub const SEGMENT_PAGE_COUNT: usize = 256;

/// Sentinel for "this granularity slot is not an object start" in the
/// valid-pointers tables.
pub const INVALID_OBJECT_INDEX: u16 = u16::MAX;

/// Size of one mark-stack entry: an address plus a byte count.
pub const MARK_CANDIDATE_SIZE: usize = 2 * BYTES_IN_ADDRESS;

// The geometry only works out if these hold.
const_assert!(BYTES_IN_PAGE % OBJECT_GRANULARITY == 0);
const_assert!(MAX_SMALL_OBJECT_SIZE % OBJECT_GRANULARITY == 0);
const_assert!((MAX_MEDIUM_OBJECT_SIZE - MAX_SMALL_OBJECT_SIZE) % MEDIUM_OBJECT_GRANULARITY == 0);
const_assert!(MAX_MEDIUM_OBJECT_SIZE <= MEDIUM_BLOCK_PAGE_COUNT * BYTES_IN_PAGE);
const_assert!(SMALL_BUCKET_COUNT == 48);
const_assert!(MEDIUM_BUCKET_COUNT == 33);
