//! Reverse address map: page id -> owning span.
//!
//! A three-level radix tree over the page id (address >> PAGE_SHIFT). With
//! 48-bit virtual addresses and 4 KiB pages there are 36 bits of page id,
//! split 12/12/12. The root is embedded in the struct; interior and leaf
//! nodes are lazily allocated straight from the OS (they are permanent).
//!
//! Reads are lock-free (`AtomicPtr` + Acquire). Writes happen only under
//! the page-heap lock.

use crate::platform;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const LEVEL_BITS: usize = 12;
const LEVEL_LEN: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: usize = LEVEL_LEN - 1;

const ROOT_SHIFT: usize = 2 * LEVEL_BITS;
const MID_SHIFT: usize = LEVEL_BITS;

#[repr(C)]
struct MidNode {
    leaves: [AtomicPtr<LeafNode>; LEVEL_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEVEL_LEN],
}

/// page id -> `*mut Span`, covering every page of every live span.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; LEVEL_LEN],
}

impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; LEVEL_LEN],
        }
    }

    /// Look up the span owning `page_id`. Null when unmapped. Lock-free.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> ROOT_SHIFT;
        if root_idx >= LEVEL_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }

        let leaf =
            unsafe { (*mid).leaves[(page_id >> MID_SHIFT) & LEVEL_MASK].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*leaf).spans[page_id & LEVEL_MASK].load(Ordering::Acquire) }
    }

    /// Point `page_id` at `span` (or null to clear).
    ///
    /// # Safety
    ///
    /// Must run under the page-heap lock; concurrent writers would race on
    /// node creation.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = page_id >> ROOT_SHIFT;
        assert!(root_idx < LEVEL_LEN, "page id beyond mapped address space");

        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = Self::alloc_node::<MidNode>();
            assert!(!mid.is_null(), "out of memory growing the page map");
            // Release so lock-free readers observe a zeroed node.
            self.root[root_idx].store(mid, Ordering::Release);
        }

        let mid_slot = unsafe { &(*mid).leaves[(page_id >> MID_SHIFT) & LEVEL_MASK] };
        let mut leaf = mid_slot.load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = Self::alloc_node::<LeafNode>();
            assert!(!leaf.is_null(), "out of memory growing the page map");
            mid_slot.store(leaf, Ordering::Release);
        }

        unsafe { (*leaf).spans[page_id & LEVEL_MASK].store(span, Ordering::Release) };
    }

    /// Map every page the span covers to the span.
    ///
    /// # Safety
    ///
    /// Must run under the page-heap lock.
    pub unsafe fn register(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let end = unsafe { (*span).end_page() };
        for page_id in start..end {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Repoint a page range at a different span (used when a neighbor
    /// absorbs pages during coalescing).
    ///
    /// # Safety
    ///
    /// Must run under the page-heap lock.
    pub unsafe fn repoint(&self, start_page: usize, num_pages: usize, span: *mut Span) {
        for page_id in start_page..start_page + num_pages {
            unsafe { self.set(page_id, span) };
        }
    }

    // Nodes are whole-page allocations and page_alloc memory arrives
    // zeroed, which is exactly an array of null AtomicPtrs.
    fn alloc_node<N>() -> *mut N {
        let bytes = core::mem::size_of::<N>();
        debug_assert!(bytes % crate::config::PAGE_SIZE == 0);
        unsafe { platform::page_alloc(bytes) }.cast::<N>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{self, SpanState};

    #[test]
    fn test_empty_map() {
        let map = PageMap::new();
        assert!(map.get(0).is_null());
        assert!(map.get(12345).is_null());
        assert!(map.get(usize::MAX >> 16).is_null());
    }

    #[test]
    fn test_set_get_clear() {
        let map = PageMap::new();
        let s = span::new_descriptor();
        unsafe {
            map.set(77, s);
            assert_eq!(map.get(77), s);
            assert!(map.get(76).is_null());
            assert!(map.get(78).is_null());

            map.set(77, ptr::null_mut());
            assert!(map.get(77).is_null());
            span::recycle_descriptor(s);
        }
    }

    #[test]
    fn test_register_covers_every_page() {
        let map = PageMap::new();
        let s = span::new_descriptor();
        unsafe {
            (*s).start_page = 500;
            (*s).num_pages = 7;
            (*s).state = SpanState::InUse;
            map.register(s);

            for page in 500..507 {
                assert_eq!(map.get(page), s);
            }
            assert!(map.get(499).is_null());
            assert!(map.get(507).is_null());
            span::recycle_descriptor(s);
        }
    }

    #[test]
    fn test_repoint_range() {
        let map = PageMap::new();
        let a = span::new_descriptor();
        let b = span::new_descriptor();
        unsafe {
            (*a).start_page = 100;
            (*a).num_pages = 4;
            map.register(a);

            map.repoint(102, 2, b);
            assert_eq!(map.get(101), a);
            assert_eq!(map.get(102), b);
            assert_eq!(map.get(103), b);
            span::recycle_descriptor(a);
            span::recycle_descriptor(b);
        }
    }

    #[test]
    fn test_sparse_high_page_ids() {
        // Exercise all three levels with a page id near the top of the
        // 48-bit address space.
        let map = PageMap::new();
        let s = span::new_descriptor();
        unsafe {
            let page_id = (1usize << 35) | (3 << 12) | 9;
            map.set(page_id, s);
            assert_eq!(map.get(page_id), s);
            assert!(map.get(page_id - 1).is_null());
            assert!(map.get(page_id + 1).is_null());
            span::recycle_descriptor(s);
        }
    }
}
