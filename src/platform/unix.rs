//! Unix backend: anonymous private mmap.

use core::ffi::c_void;
use core::ptr;
use log::warn;

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        warn!("mmap of {} bytes failed: {}", size, errno::errno());
        return ptr::null_mut();
    }
    raw as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    let rc = unsafe { libc::munmap(ptr as *mut c_void, size) };
    if rc != 0 {
        warn!(
            "munmap failed: {} (addr {:p}, size {})",
            errno::errno(),
            ptr,
            size
        );
    }
}

/// mmap only guarantees system-page alignment, so over-allocate by `align`
/// and trim the leading and trailing slack back to the OS. What remains is
/// exactly `[aligned, aligned + size)`, so a plain munmap releases it.
pub unsafe fn page_alloc_aligned(size: usize, align: usize) -> *mut u8 {
    let raw = unsafe { page_alloc(size + align) };
    if raw.is_null() {
        return ptr::null_mut();
    }

    let raw_addr = raw as usize;
    let aligned = (raw_addr + align - 1) & !(align - 1);

    let lead = aligned - raw_addr;
    if lead > 0 {
        unsafe { libc::munmap(raw_addr as *mut c_void, lead) };
    }
    let trail = (raw_addr + size + align) - (aligned + size);
    if trail > 0 {
        unsafe { libc::munmap((aligned + size) as *mut c_void, trail) };
    }

    aligned as *mut u8
}
