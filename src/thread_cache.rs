//! Thread cache: the allocator's front end.
//!
//! Each thread owns an array of intrusive free lists, one per size class,
//! with a parallel array of lengths. A hit costs a pointer pop and no
//! synchronization at all. Misses pull a batch from the central cache;
//! a list that outgrows twice its batch size drains half back.

use crate::central_cache::CentralCache;
use crate::config::NUM_SIZE_CLASSES;
use crate::large;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::FreeObject;
use crate::stat_inc;
use crate::sync::SpinMutex;
use core::ptr;

/// Per-thread free lists. Never shared; every method takes `&mut self`.
pub struct ThreadCache {
    /// Head of the free list per size class.
    heads: [*mut FreeObject; NUM_SIZE_CLASSES],
    /// Length of each list.
    counts: [u32; NUM_SIZE_CLASSES],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            heads: [ptr::null_mut(); NUM_SIZE_CLASSES],
            counts: [0; NUM_SIZE_CLASSES],
        }
    }

    /// Allocate `size` bytes. Zero-sized requests are served as the
    /// smallest class; requests above `MAX_SMALL` bypass to the OS.
    /// Null on out-of-memory.
    ///
    /// # Safety
    ///
    /// `central`, `page_heap` and `pagemap` must be the same instances on
    /// every call for the lifetime of this cache.
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        _pagemap: &PageMap,
    ) -> *mut u8 {
        if size_class::is_large(size) {
            return large::alloc(size);
        }

        let class = size_class::class_index(size);
        loop {
            let head = self.heads[class];
            if !head.is_null() {
                stat_inc!(thread_cache_hits);
                self.heads[class] = unsafe { (*head).next };
                self.counts[class] -= 1;
                return head as *mut u8;
            }
            if !unsafe { self.refill(class, central, page_heap) } {
                return ptr::null_mut();
            }
        }
    }

    /// Free `ptr`, which was allocated with this exact `size` (sized
    /// free). Requests above `MAX_SMALL` unmap directly.
    ///
    /// # Safety
    ///
    /// `ptr` must come from an `allocate(size, ..)` against the same
    /// central cache / page heap / page map, and must not be freed twice.
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        if size_class::is_large(size) {
            unsafe { large::dealloc(ptr, size) };
            return;
        }

        let class = size_class::class_index(size);
        let obj = ptr as *mut FreeObject;
        unsafe { (*obj).next = self.heads[class] };
        self.heads[class] = obj;
        self.counts[class] += 1;

        // A list holding more than two batches is carrying dead weight.
        let batch = size_class::batch_count(size_class::class_size(class));
        if self.counts[class] as usize > 2 * batch {
            unsafe { self.drain_excess(class, central, page_heap, pagemap) };
        }
    }

    /// Hand every cached object back to the central cache. Called when the
    /// owning thread exits; the cache is empty afterwards.
    ///
    /// # Safety
    ///
    /// Same environment requirements as `deallocate`.
    pub unsafe fn release_all(
        &mut self,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        for class in 0..NUM_SIZE_CLASSES {
            let head = self.heads[class];
            if head.is_null() {
                continue;
            }
            let count = self.counts[class] as usize;
            self.heads[class] = ptr::null_mut();
            self.counts[class] = 0;
            unsafe {
                central.release_range(
                    head,
                    count,
                    size_class::class_size(class),
                    page_heap,
                    pagemap,
                );
            }
        }
    }

    /// Pull one batch from the central cache onto the local list.
    /// False means the page heap is out of memory.
    #[cold]
    unsafe fn refill(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
    ) -> bool {
        stat_inc!(thread_cache_misses);
        let want = size_class::batch_count(size_class::class_size(class));
        let (got, head, _tail) = unsafe { central.fetch_range(class, want, page_heap) };
        if got == 0 {
            return false;
        }

        if self.heads[class].is_null() {
            self.heads[class] = head;
        } else {
            // Splice behind whatever is already cached.
            unsafe {
                let mut tail = self.heads[class];
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = head;
            }
        }
        self.counts[class] += got as u32;
        true
    }

    /// Keep the most recently freed half of the list, hand the rest back.
    unsafe fn drain_excess(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let count = self.counts[class] as usize;
        let keep = count / 2;
        debug_assert!(keep >= 1);

        // Cut after the keep-th node; the suffix goes back to the shard.
        let mut cut = self.heads[class];
        unsafe {
            for _ in 1..keep {
                cut = (*cut).next;
            }
            let excess = (*cut).next;
            (*cut).next = ptr::null_mut();
            self.counts[class] = keep as u32;

            stat_inc!(thread_cache_drains);
            central.release_range(
                excess,
                count - keep,
                size_class::class_size(class),
                page_heap,
                pagemap,
            );
        }
    }

    /// Length of the local list for `class`. Used by tests and invariant
    /// checks.
    #[inline]
    pub fn list_len(&self, class: usize) -> usize {
        self.counts[class] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_SMALL, PAGE_SHIFT};
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    struct Env {
        pagemap: &'static PageMap,
        page_heap: &'static SpinMutex<PageHeap>,
        central: &'static CentralCache,
    }

    fn make_env() -> Env {
        let pagemap = Box::leak(Box::new(PageMap::new()));
        let page_heap = Box::leak(Box::new(SpinMutex::new(PageHeap::new(pagemap))));
        let central = Box::leak(Box::new(CentralCache::new()));
        Env {
            pagemap,
            page_heap,
            central,
        }
    }

    unsafe fn alloc(tc: &mut ThreadCache, env: &Env, size: usize) -> *mut u8 {
        unsafe { tc.allocate(size, env.central, env.page_heap, env.pagemap) }
    }

    unsafe fn free(tc: &mut ThreadCache, env: &Env, ptr: *mut u8, size: usize) {
        unsafe { tc.deallocate(ptr, size, env.central, env.page_heap, env.pagemap) }
    }

    #[test]
    fn test_hot_path_is_lifo() {
        let env = make_env();
        let mut tc = Box::new(ThreadCache::new());
        unsafe {
            let p = alloc(&mut tc, &env, 40);
            assert!(!p.is_null());
            free(&mut tc, &env, p, 40);
            // The just-freed object is the next one out.
            let q = alloc(&mut tc, &env, 40);
            assert_eq!(p, q);
            free(&mut tc, &env, q, 40);
        }
    }

    #[test]
    fn test_zero_size_is_smallest_class() {
        let env = make_env();
        let mut tc = Box::new(ThreadCache::new());
        unsafe {
            let p = alloc(&mut tc, &env, 0);
            assert!(!p.is_null());
            // It came off the class-0 list.
            assert_eq!(tc.list_len(0), size_class::batch_count(8) - 1);
            free(&mut tc, &env, p, 0);
        }
    }

    #[test]
    fn test_refill_brings_one_batch() {
        let env = make_env();
        let mut tc = Box::new(ThreadCache::new());
        unsafe {
            let p = alloc(&mut tc, &env, 24);
            assert!(!p.is_null());
            // One batch fetched, one object handed out.
            assert_eq!(tc.list_len(2), size_class::batch_count(24) - 1);
            free(&mut tc, &env, p, 24);
        }
    }

    #[test]
    fn test_class_boundaries_round_trip() {
        // Sizes straddling class boundaries, the class cap, and the
        // large-object cliff.
        let env = make_env();
        let mut tc = Box::new(ThreadCache::new());
        let sizes = [1, 8, 9, 16, MAX_SMALL, MAX_SMALL + 1];
        let classes = [0, 0, 1, 1, NUM_SIZE_CLASSES - 1, usize::MAX];
        unsafe {
            let mut ptrs = Vec::new();
            for (&size, &class) in sizes.iter().zip(&classes) {
                let p = alloc(&mut tc, &env, size);
                assert!(!p.is_null(), "size {} failed", size);
                if class != usize::MAX {
                    let span = env.pagemap.get((p as usize) >> PAGE_SHIFT);
                    assert_eq!((*span).size_class, class, "size {}", size);
                } else {
                    // Bypassed: the pages are invisible to the map.
                    assert!(env.pagemap.get((p as usize) >> PAGE_SHIFT).is_null());
                }
                ptrs.push(p);
            }
            for (&size, p) in sizes.iter().zip(ptrs) {
                free(&mut tc, &env, p, size);
            }
            tc.release_all(env.central, env.page_heap, env.pagemap);
        }
    }

    #[test]
    fn test_drain_keeps_half() {
        let env = make_env();
        let mut tc = Box::new(ThreadCache::new());
        let size = 24usize;
        let batch = size_class::batch_count(size);
        let limit = 2 * batch;
        unsafe {
            // Pin enough objects that freeing them overflows the list.
            let mut ptrs = Vec::new();
            for _ in 0..4 * batch {
                ptrs.push(alloc(&mut tc, &env, size));
            }

            let mut drained = false;
            let mut prev = tc.list_len(2);
            for p in ptrs.drain(..) {
                free(&mut tc, &env, p, size);
                let now = tc.list_len(2);
                if now < prev {
                    // The drain cut the list back to half the trigger.
                    assert_eq!(now, (limit + 1) / 2);
                    drained = true;
                }
                assert!(now <= limit, "list exceeded {} after a free", limit);
                prev = now;
            }
            assert!(drained, "freeing 4 batches never triggered a drain");

            tc.release_all(env.central, env.page_heap, env.pagemap);
        }
    }

    #[test]
    fn test_bulk_cycle_reclaims_spans() {
        let env = make_env();
        let mut tc = Box::new(ThreadCache::new());
        let size = 24usize;
        let count = 10_000;
        let limit = 2 * size_class::batch_count(size);
        unsafe {
            let mut ptrs = Vec::with_capacity(count);
            for _ in 0..count {
                let p = alloc(&mut tc, &env, size);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            assert!(env.central.check_span_accounting(2));

            for p in ptrs.into_iter().rev() {
                free(&mut tc, &env, p, size);
            }
            // Drains bounded the list the whole way down.
            assert!(tc.list_len(2) <= limit);

            // Flush the cache: every span comes home and returns to the
            // page heap.
            tc.release_all(env.central, env.page_heap, env.pagemap);
            assert_eq!(tc.list_len(2), 0);
            assert_eq!(env.central.span_count(2), 0);
            let (free_objs, loaned) = env.central.object_counts(2);
            assert_eq!(free_objs, 0);
            assert_eq!(loaned, 0);
            assert!(env.page_heap.lock().free_span_count() >= 1);
        }
    }

    #[test]
    fn test_cross_thread_handover() {
        // Thread A allocates and frees; thread B reuses the storage.
        let env = make_env();
        let central = env.central;
        let page_heap = env.page_heap;
        let pagemap = env.pagemap;

        let a = std::thread::spawn(move || {
            let mut tc = Box::new(ThreadCache::new());
            unsafe {
                let mut ptrs = Vec::new();
                for _ in 0..1000 {
                    let p = tc.allocate(64, central, page_heap, pagemap);
                    assert!(!p.is_null());
                    ptrs.push(p);
                }
                for p in ptrs {
                    tc.deallocate(p, 64, central, page_heap, pagemap);
                }
                tc.release_all(central, page_heap, pagemap);
            }
        });
        a.join().unwrap();

        let b = std::thread::spawn(move || {
            let mut tc = Box::new(ThreadCache::new());
            unsafe {
                let mut ptrs = Vec::new();
                for _ in 0..1000 {
                    let p = tc.allocate(64, central, page_heap, pagemap);
                    assert!(!p.is_null());
                    ptrs.push(p as usize);
                }
                // Live allocations never overlap.
                ptrs.sort_unstable();
                for w in ptrs.windows(2) {
                    assert!(w[1] - w[0] >= 64);
                }
                for p in ptrs {
                    tc.deallocate(p as *mut u8, 64, central, page_heap, pagemap);
                }
                tc.release_all(central, page_heap, pagemap);
            }
        });
        b.join().unwrap();

        // Quiescent: nothing loaned anywhere.
        let class = size_class::class_index(64);
        let (_, loaned) = central.object_counts(class);
        assert_eq!(loaned, 0);
    }

    // Deterministic xorshift mix, same flavor the stress tests use.
    fn lcg_next(state: &mut u64) -> u64 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *state >> 11
    }

    #[test]
    fn test_randomized_interleaving_holds_invariants() {
        let env = make_env();
        let central = env.central;
        let page_heap = env.page_heap;
        let pagemap = env.pagemap;

        let threads = 4;
        let ops = 3000;

        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                std::thread::spawn(move || {
                    let mut tc = Box::new(ThreadCache::new());
                    let mut rng = 0x9E3779B97F4A7C15u64 ^ (tid as u64);
                    let mut live: Vec<(usize, usize)> = Vec::new();
                    let mut classes_touched = Vec::new();

                    unsafe {
                        for _ in 0..ops {
                            let roll = lcg_next(&mut rng);
                            if roll % 3 != 0 || live.is_empty() {
                                // Sizes across the whole range, including
                                // past the large-object cliff.
                                let size = 1 + (lcg_next(&mut rng) as usize) % (2 * MAX_SMALL);
                                let p = tc.allocate(size, central, page_heap, pagemap);
                                assert!(!p.is_null());
                                // First and last byte are ours to write.
                                *p = 0xC3;
                                *p.add(size.max(1) - 1) = 0x3C;
                                if !size_class::is_large(size) {
                                    classes_touched.push(size_class::class_index(size));
                                }
                                live.push((p as usize, size));
                            } else {
                                let idx = (lcg_next(&mut rng) as usize) % live.len();
                                let (p, size) = live.swap_remove(idx);
                                tc.deallocate(p as *mut u8, size, central, page_heap, pagemap);
                            }
                        }
                        for (p, size) in live {
                            tc.deallocate(p as *mut u8, size, central, page_heap, pagemap);
                        }
                        tc.release_all(central, page_heap, pagemap);
                    }
                    classes_touched
                })
            })
            .collect();

        let mut touched: Vec<usize> = Vec::new();
        for h in handles {
            touched.extend(h.join().unwrap());
        }
        touched.sort_unstable();
        touched.dedup();

        // Quiescence: every span's books balance, nothing is loaned out,
        // and no span lingers in any shard (they all went back to the
        // page heap when their last object came home).
        for &class in &touched {
            assert!(central.check_span_accounting(class), "class {}", class);
            let (free_objs, loaned) = central.object_counts(class);
            assert_eq!(loaned, 0, "class {} still has objects loaned", class);
            assert_eq!(free_objs, 0, "class {} kept an idle span", class);
            assert_eq!(central.span_count(class), 0);
        }
        assert!(page_heap.lock().free_span_count() >= 1);
    }
}
