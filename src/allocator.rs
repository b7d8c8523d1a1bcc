//! Top-level allocator: wires the tiers together.
//!
//! All mutable state lives in module-level statics guarded by spinlocks or
//! atomics; [`TierAlloc`] itself is zero-sized. The per-thread cache is a
//! `std::thread_local!` slot (const-init, no destructor of its own) paired
//! with a separate flush guard whose drop drains the cache back to the
//! central tier on thread exit. Without the `std` feature there is no TLS
//! and small allocations go straight to the central cache.

use crate::central_cache::CentralCache;
use crate::config::{ALIGNMENT, MAX_SMALL, PAGE_SIZE};
use crate::large;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::platform;
use crate::size_class;
use crate::span::FreeObject;
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_HEAP: SpinMutex<PageHeap> = SpinMutex::new(PageHeap::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use crate::thread_cache::ThreadCache;
        use core::cell::{Cell, UnsafeCell};

        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        enum SlotState {
            /// First use still pending; the flush guard is not registered.
            Boot,
            /// Normal operation.
            Active,
            /// Flushed on thread exit; fall back to the central cache.
            Drained,
        }

        /// The slot deliberately has no `Drop` impl: a type without drop
        /// glue gets no TLS destructor, so the slot stays accessible even
        /// while other destructors (including the flush guard) run.
        struct CacheSlot {
            state: Cell<SlotState>,
            cache: UnsafeCell<ThreadCache>,
        }

        std::thread_local! {
            static CACHE: CacheSlot = const {
                CacheSlot {
                    state: Cell::new(SlotState::Boot),
                    cache: UnsafeCell::new(ThreadCache::new()),
                }
            };
        }

        /// Registered lazily alongside the cache; its drop hands every
        /// cached object back when the thread dies.
        struct FlushGuard;

        impl Drop for FlushGuard {
            fn drop(&mut self) {
                let _ = CACHE.try_with(|slot| {
                    if slot.state.get() == SlotState::Active {
                        slot.state.set(SlotState::Drained);
                        unsafe {
                            (*slot.cache.get()).release_all(
                                &CENTRAL_CACHE,
                                &PAGE_HEAP,
                                &PAGE_MAP,
                            );
                        }
                    }
                });
            }
        }

        std::thread_local! {
            static FLUSH: FlushGuard = const { FlushGuard };
        }

        /// Fetch the raw thread-cache pointer, registering the flush guard
        /// on first use. None means this thread must use the central
        /// fallback (its cache was already drained, or TLS is gone).
        #[inline]
        fn thread_cache() -> Option<*mut ThreadCache> {
            CACHE
                .try_with(|slot| match slot.state.get() {
                    SlotState::Active => Some(slot.cache.get()),
                    SlotState::Boot => {
                        // Flip to Active *before* touching the guard:
                        // registering a TLS destructor can allocate, and
                        // that reentrant call must take the plain path
                        // instead of re-registering forever.
                        slot.state.set(SlotState::Active);
                        let _ = FLUSH.try_with(|_| {});
                        Some(slot.cache.get())
                    }
                    SlotState::Drained => None,
                })
                .ok()
                .flatten()
        }

        unsafe fn small_alloc(size: usize) -> *mut u8 {
            match thread_cache() {
                Some(tc) => unsafe {
                    (*tc).allocate(size, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
                },
                None => unsafe { central_alloc(size) },
            }
        }

        unsafe fn small_dealloc(ptr: *mut u8, size: usize) {
            match thread_cache() {
                Some(tc) => unsafe {
                    (*tc).deallocate(ptr, size, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
                },
                None => unsafe { central_dealloc(ptr, size) },
            }
        }
    } else {
        unsafe fn small_alloc(size: usize) -> *mut u8 {
            unsafe { central_alloc(size) }
        }

        unsafe fn small_dealloc(ptr: *mut u8, size: usize) {
            unsafe { central_dealloc(ptr, size) };
        }
    }
}

/// Lockful fallback used when no thread cache is available.
unsafe fn central_alloc(size: usize) -> *mut u8 {
    stat_inc!(thread_cache_misses);
    let class = size_class::class_index(size);
    let (got, head, _tail) = unsafe { CENTRAL_CACHE.fetch_range(class, 1, &PAGE_HEAP) };
    if got == 0 { ptr::null_mut() } else { head as *mut u8 }
}

unsafe fn central_dealloc(ptr: *mut u8, size: usize) {
    let obj = ptr as *mut FreeObject;
    unsafe {
        (*obj).next = ptr::null_mut();
        CENTRAL_CACHE.release_range(obj, 1, size, &PAGE_HEAP, &PAGE_MAP);
    }
}

/// Allocate `size` bytes. Returns null when the OS is out of memory.
///
/// Pair every successful call with [`deallocate`] passing the same size.
pub fn allocate(size: usize) -> *mut u8 {
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);
    if size_class::is_large(size) {
        return large::alloc(size);
    }
    unsafe { small_alloc(size) }
}

/// Free a pointer from [`allocate`]. `size` must be the size passed to
/// the matching `allocate` call (sized free).
///
/// # Safety-relevant contract
///
/// Passing a different size routes the object to the wrong size class;
/// debug builds catch the mismatch, release builds assume it never
/// happens.
pub fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    stat_inc!(dealloc_count);
    if size_class::is_large(size) {
        unsafe { large::dealloc(ptr, size) };
        return;
    }
    unsafe { small_dealloc(ptr, size) };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Route {
    /// Size-class machinery, using [`effective_size`].
    Small,
    /// Straight to the OS.
    Bypass,
}

/// The size whose class actually backs a `(size, align)` request.
#[inline]
fn effective_size(size: usize, align: usize) -> usize {
    if align <= ALIGNMENT { size } else { size.max(align) }
}

/// Decide how a `(size, align)` request is served. A pure function of the
/// layout, so `dealloc` recomputes exactly the route `alloc` took.
#[inline]
fn route(size: usize, align: usize) -> Route {
    if align <= ALIGNMENT {
        if size <= MAX_SMALL {
            return Route::Small;
        }
        return Route::Bypass;
    }
    // Class objects sit at page-aligned base + i * class_size, so the
    // class must be a multiple of the requested alignment.
    let effective = effective_size(size, align);
    if align <= PAGE_SIZE
        && effective <= MAX_SMALL
        && size_class::class_size(size_class::class_index(effective)) % align == 0
    {
        Route::Small
    } else {
        Route::Bypass
    }
}

/// Thread-caching allocator with sized deallocation.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tieralloc::TierAlloc = tieralloc::TierAlloc;
/// ```
pub struct TierAlloc;

unsafe impl GlobalAlloc for TierAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        match route(size, layout.align()) {
            Route::Small => unsafe { small_alloc(effective_size(size, layout.align())) },
            Route::Bypass => large::alloc_aligned(size, layout.align()),
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = layout.size();
        if size == 0 {
            return;
        }

        stat_inc!(dealloc_count);

        match route(size, layout.align()) {
            Route::Small => unsafe { small_dealloc(ptr, effective_size(size, layout.align())) },
            Route::Bypass => unsafe {
                platform::page_dealloc(ptr, large::mapped_size(size));
            },
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let align = layout.align();
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, align) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return align as *mut u8;
        }

        // Stay in place only when a later sized free with `new_size`
        // resolves to exactly the storage we already have.
        let old_size = layout.size();
        let in_place = match (route(old_size, align), route(new_size, align)) {
            (Route::Small, Route::Small) => {
                size_class::class_index(effective_size(old_size, align))
                    == size_class::class_index(effective_size(new_size, align))
            }
            (Route::Bypass, Route::Bypass) => {
                large::mapped_size(old_size) == large::mapped_size(new_size)
            }
            _ => false,
        };
        if in_place {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, align) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}
