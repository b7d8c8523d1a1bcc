//! Central cache: the allocator's middle tier.
//!
//! One shard per size class, each a span list behind its own spin mutex.
//! Thread caches pull batches out with [`CentralCache::fetch_range`] and
//! push batches back with [`CentralCache::release_range`]. A shard slices
//! fresh spans from the page heap on demand and returns fully idle spans
//! to it.
//!
//! Lock order is strictly shard -> page heap. The shard lock stays held
//! across page-heap calls on both the populate and the reclaim path, so
//! the span-empty test and the detach can never race with another
//! releaser.

use crate::config::{NUM_SIZE_CLASSES, PAGE_SHIFT, SIZE_CLASS_UNASSIGNED};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::{FreeObject, Span, SpanList};
use crate::stat_inc;
use crate::sync::SpinMutex;
use core::ptr;
use log::error;

/// Span list for one size class.
///
/// Spans with free objects are kept at the front; exhausted spans migrate
/// to the back, so a fetch normally finds work at the head.
struct Shard {
    spans: SpanList,
}

// SAFETY: only accessed through the per-shard SpinMutex.
unsafe impl Send for Shard {}

impl Shard {
    const fn new() -> Self {
        Self {
            spans: SpanList::new(),
        }
    }
}

/// All shards, indexed by size class.
pub struct CentralCache {
    shards: [SpinMutex<Shard>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            shards: [const { SpinMutex::new(Shard::new()) }; NUM_SIZE_CLASSES],
        }
    }

    /// Detach up to `want` objects of class `class` as a singly-linked
    /// chain. Returns `(got, head, tail)`; `got == 0` means the page heap
    /// could not provide a span (out of memory).
    ///
    /// # Safety
    ///
    /// `class` must be below `NUM_SIZE_CLASSES`; `page_heap` must be the
    /// instance every other tier uses.
    pub unsafe fn fetch_range(
        &self,
        class: usize,
        want: usize,
        page_heap: &SpinMutex<PageHeap>,
    ) -> (usize, *mut FreeObject, *mut FreeObject) {
        debug_assert!(want > 0);
        let mut shard = self.shards[class].lock();

        // Front discipline makes this scan O(1) in the common case.
        let mut span = shard.spans.head();
        while !span.is_null() && unsafe { (*span).free_objects.is_null() } {
            span = unsafe { (*span).next };
        }

        if span.is_null() {
            span = unsafe { self.populate(&mut shard, class, page_heap) };
            if span.is_null() {
                return (0, ptr::null_mut(), ptr::null_mut());
            }
        }

        unsafe {
            let head = (*span).free_objects;
            let m = want.min((*span).free_object_count()).max(1);

            // Walk m-1 links to find the batch tail. A premature null means
            // the chain is shorter than the span's accounting claims;
            // truncate the batch and continue with what we have.
            let mut tail = head;
            let mut got = 1;
            while got < m {
                let next = (*tail).next;
                if next.is_null() {
                    error!(
                        "corrupt free chain in class {} (span at page {:#x}): \
                         expected {} objects, found {}",
                        class,
                        (*span).start_page,
                        m,
                        got
                    );
                    break;
                }
                tail = next;
                got += 1;
            }

            (*span).free_objects = (*tail).next;
            (*tail).next = ptr::null_mut();
            (*span).use_count += got;

            // Exhausted spans sink to the back, out of the scan path.
            if (*span).free_objects.is_null() {
                shard.spans.remove(span);
                shard.spans.push_back(span);
            }

            (got, head, tail)
        }
    }

    /// Route a chain of `count` freed objects, each `bytes` wide, back to
    /// their owning spans. A span whose last object comes home is detached
    /// and handed to the page heap.
    ///
    /// # Safety
    ///
    /// `head` must be a chain of at least `count` objects previously
    /// produced by `fetch_range` for the class that serves `bytes`.
    pub unsafe fn release_range(
        &self,
        head: *mut FreeObject,
        count: usize,
        bytes: usize,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let class = size_class::class_index(bytes);
        let mut shard = self.shards[class].lock();

        let mut cur = head;
        let mut remaining = count;
        while !cur.is_null() && remaining > 0 {
            let next = unsafe { (*cur).next };
            remaining -= 1;

            let span = pagemap.get((cur as usize) >> PAGE_SHIFT);
            debug_assert!(!span.is_null(), "freed pointer belongs to no span");
            if span.is_null() {
                cur = next;
                continue;
            }

            unsafe {
                debug_assert_eq!(
                    (*span).size_class,
                    class,
                    "sized free does not match the owning span's class"
                );

                let was_exhausted = (*span).free_objects.is_null();
                (*cur).next = (*span).free_objects;
                (*span).free_objects = cur;
                (*span).use_count -= 1;

                if was_exhausted {
                    // Back to the front so fetches see it again.
                    shard.spans.remove(span);
                    shard.spans.push_front(span);
                }

                // Fully idle: give the pages back. Test and detach both
                // happen under the shard lock.
                if (*span).use_count == 0 {
                    stat_inc!(spans_reclaimed);
                    shard.spans.remove(span);
                    (*span).free_objects = ptr::null_mut();
                    (*span).size_class = SIZE_CLASS_UNASSIGNED;
                    page_heap.lock().deallocate_span(span);
                }
            }
            cur = next;
        }
    }

    /// Pull a fresh span for `class` from the page heap and slice it into
    /// a free chain. Called with the shard lock held.
    unsafe fn populate(
        &self,
        shard: &mut Shard,
        class: usize,
        page_heap: &SpinMutex<PageHeap>,
    ) -> *mut Span {
        let pages = size_class::span_pages(class);
        let span = unsafe { page_heap.lock().allocate_span(pages) };
        if span.is_null() {
            return ptr::null_mut();
        }

        stat_inc!(spans_sliced);
        unsafe {
            (*span).size_class = class;
            (*span).use_count = 0;

            // Chain every object through its first word, low to high.
            let size = size_class::class_size(class);
            let total = (*span).total_objects();
            debug_assert!(total >= 1);
            let base = (*span).start_addr();
            let mut chain: *mut FreeObject = ptr::null_mut();
            let mut i = total;
            while i > 0 {
                i -= 1;
                let obj = base.add(i * size) as *mut FreeObject;
                (*obj).next = chain;
                chain = obj;
            }
            (*span).free_objects = chain;

            shard.spans.push_front(span);
        }
        span
    }

    /// Spans currently assigned to `class` (any fullness).
    pub fn span_count(&self, class: usize) -> usize {
        self.shards[class].lock().spans.len()
    }

    /// Free objects currently parked in `class`'s spans, plus the objects
    /// those spans have out on loan. Used by invariant checks.
    pub fn object_counts(&self, class: usize) -> (usize, usize) {
        let shard = self.shards[class].lock();
        let mut free = 0;
        let mut loaned = 0;
        let mut cur = shard.spans.head();
        while !cur.is_null() {
            unsafe {
                free += (*cur).free_object_count();
                loaned += (*cur).use_count;
                cur = (*cur).next;
            }
        }
        (free, loaned)
    }

    /// Walk every span of `class` and check that its free chain length
    /// matches `total_objects - use_count`, and that every chained object
    /// is aligned and lies inside its span. Used by invariant tests.
    pub fn check_span_accounting(&self, class: usize) -> bool {
        let shard = self.shards[class].lock();
        let mut cur = shard.spans.head();
        while !cur.is_null() {
            unsafe {
                let lo = (*cur).start_addr() as usize;
                let hi = lo + (*cur).byte_size();
                let mut chain = (*cur).free_objects;
                let mut links = 0;
                while !chain.is_null() {
                    let addr = chain as usize;
                    if addr % crate::config::ALIGNMENT != 0 || addr < lo || addr >= hi {
                        return false;
                    }
                    links += 1;
                    chain = (*chain).next;
                }
                if links + (*cur).use_count != (*cur).total_objects() {
                    return false;
                }
                cur = (*cur).next;
            }
        }
        true
    }
}
