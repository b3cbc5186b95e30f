//! Raw POSIX memory syscalls. The heap takes pages straight from `mmap` and
//! hands them back with `munmap`; the JIT arena additionally flips its
//! mapping executable with `mprotect`.

use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod sys {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// # Safety
    /// see valid mmap/munmap/mprotect usage
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    }
}

/// Map `size` bytes of zeroed, private, read-write memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous mapping, no fd involved.
    let p = unsafe {
        sys::mmap(
            core::ptr::null_mut(),
            size,
            sys::PROT_READ | sys::PROT_WRITE,
            sys::MAP_PRIVATE | sys::MAP_ANON,
            -1,
            0,
        )
    };
    if p as isize == sys::MAP_FAILED {
        None
    } else {
        NonNull::new(p as *mut u8)
    }
}

/// Return a mapping obtained from [`map_memory`] to the OS.
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr/size come from map_memory.
    let _ = unsafe { sys::munmap(ptr.as_ptr().cast(), size) };
}

/// Make a mapped region readable, writable and executable. The JIT keeps its
/// code arena in this state for the process lifetime.
#[must_use]
pub fn protect_memory_read_write_exec(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr/size describe a live mapping from `map_memory`.
    unsafe {
        sys::mprotect(
            ptr.as_ptr().cast(),
            size,
            sys::PROT_READ | sys::PROT_WRITE | sys::PROT_EXEC,
        ) == 0
    }
}
