//! Thin wrappers over the platform's virtual memory calls. The page
//! allocator reserves large address ranges up front and commits/decommits
//! pages inside them on demand; nothing here tracks state.

use crate::util::Address;

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_family = "unix")] {
        /// Reserve `bytes` of address space with no access rights. Returns
        /// `None` when the OS refuses the reservation.
        pub fn reserve(bytes: usize) -> Option<Address> {
            let ret = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    bytes,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if ret == libc::MAP_FAILED {
                None
            } else {
                Some(Address::from_mut_ptr(ret))
            }
        }

        /// Commit a previously reserved range as readable/writable zero pages.
        pub fn commit(start: Address, bytes: usize) -> bool {
            let ret = unsafe {
                libc::mprotect(
                    start.to_mut_ptr::<libc::c_void>(),
                    bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            ret == 0
        }

        /// Return the physical pages behind a committed range to the OS and
        /// remove access. The address range stays reserved.
        pub fn decommit(start: Address, bytes: usize) {
            unsafe {
                libc::madvise(start.to_mut_ptr::<libc::c_void>(), bytes, libc::MADV_DONTNEED);
                libc::mprotect(start.to_mut_ptr::<libc::c_void>(), bytes, libc::PROT_NONE);
            }
        }

        /// Release a whole reservation.
        pub fn release(start: Address, bytes: usize) {
            unsafe {
                libc::munmap(start.to_mut_ptr::<libc::c_void>(), bytes);
            }
        }
    } else {
        compile_error!("recycler only supports unix-family targets");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn reserve_commit_decommit_release() {
        let addr = reserve(4 * BYTES_IN_PAGE).expect("reserve failed");
        assert!(addr.is_aligned_to(BYTES_IN_PAGE));
        assert!(commit(addr, 2 * BYTES_IN_PAGE));
        unsafe {
            addr.store::<usize>(0xdead_beef);
            assert_eq!(addr.load::<usize>(), 0xdead_beef);
        }
        zero(addr, BYTES_IN_PAGE);
        assert_eq!(unsafe { addr.load::<usize>() }, 0);
        decommit(addr, 2 * BYTES_IN_PAGE);
        // Decommitted pages can be committed again and read back as zero.
        assert!(commit(addr, BYTES_IN_PAGE));
        assert_eq!(unsafe { addr.load::<usize>() }, 0);
        release(addr, 4 * BYTES_IN_PAGE);
    }
}
