//! Compile-time tunables for the NVM slab allocator.
//!
//! Mirrors the source material's preference for `const` tunables over a
//! runtime-parsed configuration layer: the two-level heap shape (per-CPU
//! array width, slab geometry) is fixed at compile time.

/// Size of one slab extent, in bytes.
pub const SLAB_SIZE: usize = 2 * 1024 * 1024;

/// Supported block sizes, smallest first. Index into this array is the
/// size-class id used throughout the crate.
pub const SIZE_CLASSES: [usize; 10] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Largest request size the allocator will service.
pub const MAX_BLOCK_SIZE: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Maximum number of block indices a slab's ring buffer can cache.
pub const CACHE_SIZE: usize = 64;

/// Number of indices moved in one refill or drain.
pub const BATCH: usize = CACHE_SIZE / 2;

/// Upper bound on the number of CPUs the per-CPU heap array is sized for.
pub const MAX_CPUS: usize = 64;

/// Assumed cache line size, used to pad per-CPU heaps against false sharing.
pub const CACHE_LINE: usize = 64;

/// Default initial capacity of the Slab Index bucket array (prime, per the
/// source material's fixed-capacity hash table convention).
pub const SLAB_INDEX_CAPACITY: usize = 101;

/// Map a requested allocation size to a size-class id.
///
/// Uses `<=` comparisons against ascending class boundaries: an 8-byte
/// request maps to class 0, a 9-byte request to class 1, and so on. Returns
/// `None` for `size == 0` or `size > MAX_BLOCK_SIZE` -- callers must reject
/// rather than dispatch to a sentinel class.
pub fn size_to_class(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_BLOCK_SIZE {
        return None;
    }
    SIZE_CLASSES.iter().position(|&class_size| size <= class_size)
}

/// Round `offset` down to the nearest multiple of `SLAB_SIZE`.
pub const fn align_down_slab(offset: usize) -> usize {
    offset - (offset % SLAB_SIZE)
}
