#![no_std]

//! tieralloc: a three-tier, thread-caching memory allocator.
//!
//! The design follows the classic tcmalloc pipeline:
//! - Per-thread caches (fast path, no locks) — requires the `std` feature
//! - Central cache, one locked shard per size class
//! - Page heap (span management, split/coalesce, OS interface)
//!
//! Deallocation is *sized*: callers pass the size they allocated with, so
//! small frees never consult shared metadata.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: tieralloc::TierAlloc = tieralloc::TierAlloc;
//! ```
//!
//! or through the sized-free facade:
//!
//! ```ignore
//! let p = tieralloc::allocate(24);
//! tieralloc::deallocate(p, 24);
//! ```
//!
//! Diagnostics go through the [`log`] facade; verbosity is whatever the host
//! application configures (e.g. `log::set_max_level`). The allocator never
//! installs a logger itself.

#[cfg(any(test, feature = "std"))]
extern crate std;
#[cfg(test)]
extern crate alloc;

pub mod allocator;
pub mod central_cache;
pub mod config;
pub mod large;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod thread_cache;

mod macros;

pub use allocator::{TierAlloc, allocate, deallocate};
pub use config::{ALIGNMENT, MAX_SMALL, PAGE_SHIFT, PAGE_SIZE};
