use crate::util::constants::*;
use crate::util::Address;

/// Convert a page count to bytes.
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

/// Convert a byte count to the number of pages required to hold it.
pub const fn bytes_to_pages_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE
}

/// Round a raw size up to the given power-of-two alignment.
pub const fn raw_align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Round a raw size down to the given power-of-two alignment.
pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Is the value aligned to the given power-of-two alignment?
pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & (align - 1) == 0
}

/// Round an allocation request up to the object granularity.
pub const fn object_size_cat(size: usize) -> usize {
    let rounded = raw_align_up(size, OBJECT_GRANULARITY);
    if rounded < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        rounded
    }
}

/// Granularity-slot index of a byte offset within a block.
pub const fn granularity_index(offset: usize) -> usize {
    offset >> LOG_OBJECT_GRANULARITY
}

/// The page start containing the address.
pub fn page_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_cat_rounds_to_granularity() {
        assert_eq!(object_size_cat(0), MIN_OBJECT_SIZE);
        assert_eq!(object_size_cat(1), 16);
        assert_eq!(object_size_cat(16), 16);
        assert_eq!(object_size_cat(17), 32);
        assert_eq!(object_size_cat(768), 768);
        assert_eq!(object_size_cat(769), 784);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(bytes_to_pages_up(1), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE + 1), 2);
        assert_eq!(pages_to_bytes(3), 3 * BYTES_IN_PAGE);
    }
}
