//! The valid-pointers map: per size class, a precomputed table answering
//! "is this granularity-aligned offset an object start, and if not, which
//! object contains it" with one array indexing.
//!
//! The tables are built once at startup and shared by every recycler in the
//! process. [`generate_valid_pointers_map_header`] writes them out as Rust
//! source for embedders that want the tables linked in statically.

use std::io::{self, Write};
use std::path::Path;

use crate::heap::{
    BlockAttributes, MediumAllocationBlockAttributes, SmallAllocationBlockAttributes,
};
use crate::util::bitvector::BitVector;
use crate::util::constants::*;

/// Per-page object layout summary, used by the dirty-page rescan walk.
#[derive(Copy, Clone, Debug, Default)]
pub struct BlockPageInfo {
    /// Index of the last object whose payload intersects this page.
    pub last_object_index_on_page: u16,
    /// Number of objects starting on this page.
    pub page_object_count: u16,
}

/// Lookup tables for one size class.
pub struct BucketValidPointers {
    bucket_size: usize,
    object_count: u16,
    /// slot -> object index if the slot is an object start, else sentinel.
    valid: Box<[u16]>,
    /// slot -> index of the object containing the slot, else sentinel.
    interior: Box<[u16]>,
    /// Set for every slot that is NOT an object start. Blocks seed their
    /// mark bit vectors from this so mark-bit walks need no table lookup.
    invalid_bits: BitVector,
    block_info: Box<[BlockPageInfo]>,
}

impl BucketValidPointers {
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn object_count(&self) -> u16 {
        self.object_count
    }

    /// Object index of an exact object start, or the sentinel.
    pub fn get_address_index(&self, block_offset: usize) -> u16 {
        if block_offset & (OBJECT_GRANULARITY - 1) != 0 {
            return INVALID_OBJECT_INDEX;
        }
        let slot = block_offset >> LOG_OBJECT_GRANULARITY;
        debug_assert!(slot < self.valid.len());
        self.valid[slot]
    }

    /// Object index of the object containing the offset, or the sentinel.
    pub fn get_interior_index(&self, block_offset: usize) -> u16 {
        let slot = block_offset >> LOG_OBJECT_GRANULARITY;
        debug_assert!(slot < self.interior.len());
        self.interior[slot]
    }

    pub fn invalid_bits(&self) -> &BitVector {
        &self.invalid_bits
    }

    pub fn block_info(&self, page: usize) -> &BlockPageInfo {
        &self.block_info[page]
    }
}

/// All size classes of one block family.
pub struct ValidPointersMap {
    buckets: Vec<BucketValidPointers>,
}

impl ValidPointersMap {
    pub fn bucket(&self, bucket_index: usize) -> &BucketValidPointers {
        &self.buckets[bucket_index]
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn build_bucket<A: BlockAttributes>(bucket_index: usize) -> BucketValidPointers {
    let bucket_size = A::bucket_size(bucket_index);
    let stride = bucket_size / OBJECT_GRANULARITY;
    let max_object_count = A::BLOCK_BYTES / bucket_size;
    debug_assert!(max_object_count <= INVALID_OBJECT_INDEX as usize);

    let mut valid = vec![INVALID_OBJECT_INDEX; A::MAX_SLOT_COUNT].into_boxed_slice();
    let mut interior = vec![INVALID_OBJECT_INDEX; A::MAX_SLOT_COUNT].into_boxed_slice();
    let mut invalid_bits = BitVector::new(A::MAX_SLOT_COUNT);
    invalid_bits.set_all();

    for j in 0..max_object_count {
        let start_slot = j * stride;
        valid[start_slot] = j as u16;
        invalid_bits.clear(start_slot);
        let end_slot = std::cmp::min(start_slot + stride, A::MAX_SLOT_COUNT);
        for k in start_slot..end_slot {
            interior[k] = j as u16;
        }
    }

    let mut block_info = vec![BlockPageInfo::default(); A::PAGE_COUNT].into_boxed_slice();
    for (page, info) in block_info.iter_mut().enumerate() {
        let page_start = page * BYTES_IN_PAGE;
        let page_end = page_start + BYTES_IN_PAGE;
        let mut count = 0u16;
        for j in 0..max_object_count {
            let object_start = j * bucket_size;
            if object_start >= page_start && object_start < page_end {
                count += 1;
            }
            if object_start < page_end {
                info.last_object_index_on_page = j as u16;
            }
        }
        info.page_object_count = count;
    }

    BucketValidPointers {
        bucket_size,
        object_count: max_object_count as u16,
        valid,
        interior,
        invalid_bits,
        block_info,
    }
}

fn build_map<A: BlockAttributes>() -> ValidPointersMap {
    ValidPointersMap {
        buckets: (0..A::BUCKET_COUNT).map(build_bucket::<A>).collect(),
    }
}

lazy_static! {
    pub static ref SMALL_VALID_POINTERS_MAP: ValidPointersMap =
        build_map::<SmallAllocationBlockAttributes>();
    pub static ref MEDIUM_VALID_POINTERS_MAP: ValidPointersMap =
        build_map::<MediumAllocationBlockAttributes>();
}

fn write_map<A: BlockAttributes>(
    out: &mut impl Write,
    map: &ValidPointersMap,
    family: &str,
) -> io::Result<()> {
    writeln!(
        out,
        "pub const {}_VALID_POINTERS: [[u16; {}]; {}] = [",
        family,
        2 * A::MAX_SLOT_COUNT,
        A::BUCKET_COUNT
    )?;
    for bucket in map.buckets.iter() {
        write!(out, "    [")?;
        for v in bucket.valid.iter().chain(bucket.interior.iter()) {
            write!(out, "{:#06x}, ", v)?;
        }
        writeln!(out, "],")?;
    }
    writeln!(out, "];")?;

    writeln!(
        out,
        "pub const {}_INVALID_BITS: [[usize; {}]; {}] = [",
        family,
        (A::MAX_SLOT_COUNT + BITS_IN_WORD - 1) / BITS_IN_WORD,
        A::BUCKET_COUNT
    )?;
    for bucket in map.buckets.iter() {
        write!(out, "    [")?;
        for w in bucket.invalid_bits.words() {
            write!(out, "{:#x}, ", w)?;
        }
        writeln!(out, "],")?;
    }
    writeln!(out, "];")?;

    writeln!(
        out,
        "pub const {}_BLOCK_INFO: [[(u16, u16); {}]; {}] = [",
        family,
        A::PAGE_COUNT,
        A::BUCKET_COUNT
    )?;
    for bucket in map.buckets.iter() {
        write!(out, "    [")?;
        for info in bucket.block_info.iter() {
            write!(
                out,
                "({:#06x}, {:#06x}), ",
                info.last_object_index_on_page, info.page_object_count
            )?;
        }
        writeln!(out, "],")?;
    }
    writeln!(out, "];")?;
    Ok(())
}

/// Write the tables as Rust source. Embedders can include the output and
/// skip the startup build.
pub fn generate_valid_pointers_map_header(path: &Path) -> io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "// Generated by recycler; do not edit.")?;
    write_map::<SmallAllocationBlockAttributes>(&mut file, &SMALL_VALID_POINTERS_MAP, "SMALL")?;
    write_map::<MediumAllocationBlockAttributes>(&mut file, &MEDIUM_VALID_POINTERS_MAP, "MEDIUM")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_bucket<A: BlockAttributes>(i: usize, bucket: &BucketValidPointers) {
        let bucket_size = A::bucket_size(i);
        let max_object_count = A::BLOCK_BYTES / bucket_size;
        for offset in (0..A::BLOCK_BYTES).step_by(OBJECT_GRANULARITY) {
            let is_start = offset % bucket_size == 0 && offset < max_object_count * bucket_size;
            let index = bucket.get_address_index(offset);
            if is_start {
                assert_eq!(index as usize, offset / bucket_size);
                assert!(!bucket.invalid_bits().is_set(offset >> LOG_OBJECT_GRANULARITY));
            } else {
                assert_eq!(index, INVALID_OBJECT_INDEX);
                assert!(bucket.invalid_bits().is_set(offset >> LOG_OBJECT_GRANULARITY));
            }
            let interior = bucket.get_interior_index(offset);
            if offset < max_object_count * bucket_size {
                assert_eq!(interior as usize, offset / bucket_size);
            } else {
                assert_eq!(interior, INVALID_OBJECT_INDEX);
            }
        }
    }

    #[test]
    fn small_map_is_correct_for_every_bucket_and_offset() {
        for i in 0..SmallAllocationBlockAttributes::BUCKET_COUNT {
            check_bucket::<SmallAllocationBlockAttributes>(i, SMALL_VALID_POINTERS_MAP.bucket(i));
        }
    }

    #[test]
    fn medium_map_is_correct_for_every_bucket_and_offset() {
        for i in 0..MediumAllocationBlockAttributes::BUCKET_COUNT {
            check_bucket::<MediumAllocationBlockAttributes>(i, MEDIUM_VALID_POINTERS_MAP.bucket(i));
        }
    }

    #[test]
    fn unaligned_offsets_are_never_starts() {
        let bucket = SMALL_VALID_POINTERS_MAP.bucket(0);
        assert_eq!(bucket.get_address_index(1), INVALID_OBJECT_INDEX);
        assert_eq!(bucket.get_address_index(15), INVALID_OBJECT_INDEX);
        // But they are interior to the object at slot 0.
        assert_eq!(bucket.get_interior_index(15), 0);
    }

    #[test]
    fn page_info_counts_add_up() {
        for i in 0..SmallAllocationBlockAttributes::BUCKET_COUNT {
            let bucket = SMALL_VALID_POINTERS_MAP.bucket(i);
            let total: usize = (0..SmallAllocationBlockAttributes::PAGE_COUNT)
                .map(|p| bucket.block_info(p).page_object_count as usize)
                .sum();
            assert_eq!(total, bucket.object_count() as usize);
        }
        for i in 0..MediumAllocationBlockAttributes::BUCKET_COUNT {
            let bucket = MEDIUM_VALID_POINTERS_MAP.bucket(i);
            let total: usize = (0..MediumAllocationBlockAttributes::PAGE_COUNT)
                .map(|p| bucket.block_info(p).page_object_count as usize)
                .sum();
            assert_eq!(total, bucket.object_count() as usize);
        }
    }
}
