//! Size class arithmetic.
//!
//! Classes are linear: class `i` serves requests in
//! `(i * ALIGNMENT, (i + 1) * ALIGNMENT]`, so the object size of class `i`
//! is `(i + 1) * ALIGNMENT`. Everything here is a pure function of the
//! request size or the class index; there is no table to keep in sync.

use crate::config::{
    ALIGNMENT, MAX_BATCH_BYTES, MAX_SMALL, MAX_SPAN_BYTES, MIN_BATCHES_PER_SPAN, PAGE_SIZE,
};

/// Round a request up to the next multiple of [`ALIGNMENT`].
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Map a request size to its class index.
///
/// Sizes of 0 are treated as [`ALIGNMENT`]. The result is only meaningful
/// for `bytes <= MAX_SMALL`; larger requests bypass the class machinery
/// entirely (see [`crate::large`]).
#[inline]
pub const fn class_index(bytes: usize) -> usize {
    let bytes = if bytes < ALIGNMENT { ALIGNMENT } else { bytes };
    (bytes + ALIGNMENT - 1) / ALIGNMENT - 1
}

/// Object size served by class `index`.
#[inline]
pub const fn class_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}

/// True when a request is too big for the small-object path.
#[inline]
pub const fn is_large(bytes: usize) -> bool {
    bytes > MAX_SMALL
}

/// Number of objects moved between the thread cache and the central cache
/// in one transfer, for objects of `size` bytes.
///
/// Targets roughly 2 KiB per batch for small objects, decaying to a single
/// object per transfer once the size passes 1 KiB, and never more than
/// `MAX_BATCH_BYTES` worth of memory in one move.
#[inline]
pub const fn batch_count(size: usize) -> usize {
    let base = if size <= 32 {
        64
    } else if size <= 64 {
        32
    } else if size <= 128 {
        16
    } else if size <= 256 {
        8
    } else if size <= 512 {
        4
    } else if size <= 1024 {
        2
    } else {
        1
    };

    let cap = MAX_BATCH_BYTES / size;
    let cap = if cap == 0 { 1 } else { cap };
    let n = if base < cap { base } else { cap };
    if n == 0 { 1 } else { n }
}

/// Page count of a fresh span carved for class `index`.
///
/// Sized so the span covers `MIN_BATCHES_PER_SPAN` refill batches, capped
/// at `MAX_SPAN_BYTES`. The cap loses to the size of a single object:
/// a span must always hold at least one.
#[inline]
pub const fn span_pages(index: usize) -> usize {
    let size = class_size(index);
    let batch = batch_count(size);

    let desired_bytes = batch * MIN_BATCHES_PER_SPAN * size;
    let by_desire = (desired_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let by_limit = MAX_SPAN_BYTES / PAGE_SIZE;
    let pages = if by_desire < by_limit { by_desire } else { by_limit };

    let one_object = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let pages = if pages < one_object { one_object } else { pages };
    if pages == 0 { 1 } else { pages }
}

/// Objects a span of `pages` pages holds when sliced for class `index`.
#[inline]
pub const fn objects_per_span(index: usize, pages: usize) -> usize {
    (pages * PAGE_SIZE) / class_size(index)
}
