//! OS bypass for requests above `MAX_SMALL`.
//!
//! Large allocations never touch the thread cache, the central cache, or
//! the page heap: they map whole pages straight from the OS and unmap them
//! on free. The sized-free contract makes the round trip possible without
//! a header: the mapped length is a pure function of the request size.

use crate::config::{MAX_SMALL, PAGE_SIZE};
use crate::platform;
use crate::stat_inc;

/// Bytes actually mapped for a large request of `size` bytes.
#[inline]
pub fn mapped_size(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Map a large allocation. Null on OS failure.
pub fn alloc(size: usize) -> *mut u8 {
    debug_assert!(size > MAX_SMALL);
    stat_inc!(large_allocs);
    unsafe { platform::page_alloc(mapped_size(size)) }
}

/// Map a large allocation whose address is a multiple of `align`.
pub fn alloc_aligned(size: usize, align: usize) -> *mut u8 {
    stat_inc!(large_allocs);
    if align <= PAGE_SIZE {
        unsafe { platform::page_alloc(mapped_size(size)) }
    } else {
        unsafe { platform::page_alloc_aligned(mapped_size(size), align) }
    }
}

/// Unmap a large allocation. `size` must be the size it was allocated
/// with (sized free).
///
/// # Safety
///
/// `ptr` must have come from [`alloc`]/[`alloc_aligned`] with this `size`.
pub unsafe fn dealloc(ptr: *mut u8, size: usize) {
    unsafe { platform::page_dealloc(ptr, mapped_size(size)) };
}
