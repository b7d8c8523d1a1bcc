//! Build-time configuration constants.
//!
//! The raw values come from `tieralloc.toml` (or the file named by the
//! `TIERALLOC_CONFIG` env var) and are validated and rendered into
//! `config_gen.rs` by `build.rs`. Derived quantities live here so the
//! generated file stays a flat list of integers.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Number of small size classes. Class `i` serves sizes in
/// `(i * ALIGNMENT, (i + 1) * ALIGNMENT]`.
pub const NUM_SIZE_CLASSES: usize = MAX_SMALL / ALIGNMENT;

/// Sentinel for a span not currently assigned to any size class.
pub const SIZE_CLASS_UNASSIGNED: usize = usize::MAX;

// A free object stores the next-pointer of the intrusive list in its first
// word, so the smallest object must be at least pointer-sized.
const _: () = assert!(ALIGNMENT >= core::mem::size_of::<*mut u8>());
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(MAX_SPAN_BYTES >= PAGE_SIZE);
const _: () = assert!(MAX_PAGES >= MIN_SYSTEM_PAGES);
const _: () = assert!(NUM_SIZE_CLASSES > 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_values() {
        // The stock tieralloc.toml ships the classic geometry.
        assert_eq!(PAGE_SIZE, 4096);
        assert_eq!(PAGE_SHIFT, 12);
        assert_eq!(ALIGNMENT, 8);
        assert_eq!(MAX_SMALL, 256 * 1024);
        assert_eq!(NUM_SIZE_CLASSES, 32768);
        assert_eq!(MAX_PAGES, 256);
    }

    #[test]
    fn test_derived_relations() {
        assert_eq!(NUM_SIZE_CLASSES, MAX_SMALL / ALIGNMENT);
        assert!(MAX_SMALL % ALIGNMENT == 0);
        assert!(MAX_SPAN_BYTES % PAGE_SIZE == 0);
        assert!(SIZE_CLASS_UNASSIGNED >= NUM_SIZE_CLASSES);
    }
}
