use std::{ptr::NonNull, sync::OnceLock};

/// Virtual memory page size of the computer. This is usually 4096 but
/// we can only learn it at runtime, so it is cached on first use.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Size of a huge page when the host supports the hint. Mappings shorter
/// than this never ask for huge pages.
pub(crate) const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// The host side of the allocator. Every slab pool owns exactly one
/// mapping obtained through here, requested once when the pool is created
/// and returned once when the pool is destroyed.
pub(crate) struct Kernel;

/// Mapping primitives each supported host provides. Pools only ever see
/// the free functions below, never the platform APIs.
trait PlatformMemory {
    /// Request an anonymous, private, read-write mapping of `len` bytes.
    /// When `huge` is set the kernel is asked to back it with huge pages;
    /// the request fails rather than silently ignoring the hint.
    fn request_memory(len: usize, huge: bool) -> Option<NonNull<u8>>;

    /// Returns the mapping of size `len` starting at `addr` to the kernel.
    ///
    /// **SAFETY**: `addr` and `len` must describe a live mapping previously
    /// returned by [`PlatformMemory::request_memory`].
    unsafe fn return_memory(addr: NonNull<u8>, len: usize);

    /// Page size of the host in bytes.
    fn page_size() -> usize;
}

/// Page size, queried once.
#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(Kernel::page_size)
}

/// Wrapper to use [`PlatformMemory::request_memory`].
#[inline]
pub(crate) fn request_memory(len: usize, huge: bool) -> Option<NonNull<u8>> {
    Kernel::request_memory(len, huge)
}

/// Wrapper to use [`PlatformMemory::return_memory`].
///
/// **SAFETY**: see [`PlatformMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(addr: NonNull<u8>, len: usize) {
    unsafe { Kernel::return_memory(addr, len) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};
    use tracing::error;

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const HUGE_FLAGS: c_int = libc::MAP_HUGETLB;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const HUGE_FLAGS: c_int = 0;

    impl PlatformMemory for Kernel {
        fn request_memory(len: usize, huge: bool) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            if huge && HUGE_FLAGS == 0 {
                return None;
            }

            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            if huge {
                flags |= HUGE_FLAGS;
            }

            // SAFETY: anonymous mapping with no fixed address, nothing
            // existing can be clobbered.
            let addr = unsafe { mmap(ADDR, len as size_t, PROT, flags, FD, OFFSET) };

            match addr {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, len: usize) {
            let rc = unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };
            if rc != 0 {
                error!(addr = ?addr, len, "munmap failed");
            }
        }

        fn page_size() -> usize {
            // SAFETY: sysconf has no preconditions.
            match unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } {
                size if size > 0 => size as usize,
                _ => 4096,
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use tracing::error;

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        fn request_memory(len: usize, huge: bool) -> Option<NonNull<u8>> {
            // Large pages need SeLockMemoryPrivilege, which a library
            // cannot assume. Let the caller fall back to regular pages.
            if huge {
                return None;
            }

            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // SAFETY: fresh reservation, no fixed address.
            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, protection) };

            NonNull::new(addr.cast())
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize) {
            let result =
                unsafe { Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE) };
            if let Err(err) = result {
                error!(addr = ?addr, %err, "VirtualFree failed");
            }
        }

        fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();

            // SAFETY: GetSystemInfo fully initializes the struct.
            unsafe {
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let size = page_size();

        assert!(size >= 4096);
        assert!(size.is_power_of_two());
        assert_eq!(size, page_size());
    }

    #[test]
    fn mapped_memory_is_writable() {
        let len = page_size();
        let addr = request_memory(len, false).expect("anonymous mapping");

        unsafe {
            addr.as_ptr().write(23);
            addr.as_ptr().add(len - 1).write(45);

            assert_eq!(23, *addr.as_ptr());
            assert_eq!(45, *addr.as_ptr().add(len - 1));

            return_memory(addr, len);
        }
    }

    #[test]
    fn mapped_memory_starts_zeroed() {
        let len = page_size() * 2;
        let addr = request_memory(len, false).expect("anonymous mapping");

        unsafe {
            let bytes = std::slice::from_raw_parts(addr.as_ptr(), len);
            assert!(bytes.iter().all(|&b| b == 0));

            return_memory(addr, len);
        }
    }
}
