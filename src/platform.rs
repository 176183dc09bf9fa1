use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The heap only needs one
/// big contiguous reservation that it can hand out bit by bit (see
/// [`crate::region::Arena`]) and return when it's dropped, it doesn't care
/// about the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely. The region must be at least page aligned.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns a region obtained from [`Self::request_memory`] with the same
    /// `length`.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`].
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll mutate a global variable and reuse it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convinience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convinience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Private to our process and not backed by any file. Pages are
            // only committed once they are touched, so reserving a large
            // arena up front is cheap.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => NonNull::new(address.cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.as_ptr().cast(), length) != 0 {
                log::warn!("munmap({address:p}, {length}) failed, region leaked");
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Read-Write only, like the mmap call on unix.
            let protection = Memory::PAGE_READWRITE;

            // Reserve and commit in one call. Committed pages still aren't
            // backed by physical memory until they are touched.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // MEM_RELEASE needs a length of 0 and releases the whole
            // reservation made by VirtualAlloc.
            if !Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).as_bool() {
                log::warn!("VirtualFree({address:p}) of {length} bytes failed, region leaked");
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod fallback {
    //! When using Miri, we can't rely on system calls such as `mmap` or
    //! `VirtualAlloc` because there's no FFI support, so instead we'll use the
    //! system allocator to mock low level memory management. It has to be
    //! [`alloc::System`] and not the global allocator, which might be us.

    use std::{
        alloc::{self, GlobalAlloc},
        ptr::NonNull,
    };

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> Option<alloc::Layout> {
        alloc::Layout::from_size_align(length, page_size()).ok()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::System.alloc(to_layout(length)?))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if let Some(layout) = to_layout(length) {
                alloc::System.dealloc(address.as_ptr(), layout);
            }
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn request_and_return() {
        let length = page_size() * 4;

        unsafe {
            let address = request_memory(length).unwrap();
            assert_eq!(address.as_ptr() as usize % page_size(), 0);

            address.as_ptr().write_bytes(0xAB, length);
            assert_eq!(*address.as_ptr().add(length - 1), 0xAB);

            return_memory(address, length);
        }
    }
}
