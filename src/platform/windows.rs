//! Windows backend: VirtualAlloc / VirtualFree.

use core::ptr;
use log::warn;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let raw = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    if raw.is_null() {
        warn!("VirtualAlloc of {} bytes failed: error {}", size, unsafe {
            GetLastError()
        });
    }
    raw as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE frees the whole reservation; size must be 0.
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        warn!("VirtualFree failed: error {} (addr {:p})", unsafe {
            GetLastError()
        }, ptr);
    }
}

/// VirtualFree cannot trim a mapping, so alignment works by probing:
/// reserve an oversized region to learn a usable address, release it, and
/// re-allocate at the aligned address inside it. Racing allocations can
/// steal the address, hence the retry loop.
pub unsafe fn page_alloc_aligned(size: usize, align: usize) -> *mut u8 {
    for _ in 0..8 {
        let probe = unsafe {
            VirtualAlloc(ptr::null_mut(), size + align, MEM_RESERVE, PAGE_READWRITE)
        };
        if probe.is_null() {
            break;
        }
        let aligned = (probe as usize + align - 1) & !(align - 1);
        unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

        let mapped = unsafe {
            VirtualAlloc(
                aligned as *mut _,
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if !mapped.is_null() {
            return mapped as *mut u8;
        }
    }
    warn!(
        "aligned VirtualAlloc of {} bytes (align {}) failed: error {}",
        size,
        align,
        unsafe { GetLastError() }
    );
    ptr::null_mut()
}
