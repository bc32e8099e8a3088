//! Fixed-size-class manager over one slab extent.
//!
//! Combines a bitmap of "reserved" bits (the source of truth) with a small
//! ring-buffer cache of pre-reserved free indices (the hot path), following
//! the same refill/drain-at-batch-boundaries shape as a per-CPU page cache,
//! just scoped to a single extent instead of a global pool.

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{BATCH, CACHE_SIZE, SIZE_CLASSES, SLAB_SIZE};
use crate::error::{Error, Result};

struct Ring {
    items: [u32; CACHE_SIZE],
    head: usize,
    count: usize,
}

impl Ring {
    const fn new() -> Self {
        Self {
            items: [0; CACHE_SIZE],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, idx: u32) {
        debug_assert!(self.count < CACHE_SIZE);
        let tail = (self.head + self.count) % CACHE_SIZE;
        self.items[tail] = idx;
        self.count += 1;
    }

    fn pop(&mut self) -> Option<u32> {
        if self.count == 0 {
            return None;
        }
        let idx = self.items[self.head];
        self.head = (self.head + 1) % CACHE_SIZE;
        self.count -= 1;
        Some(idx)
    }
}

struct SlabInner {
    allocated_count: usize,
    /// One bit per block; bit set means reserved (held by a caller or
    /// sitting in the ring buffer).
    bitmap: Vec<u64>,
    ring: Ring,
}

impl SlabInner {
    fn bit(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    fn clear_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }
}

/// Metadata for one `SLAB_SIZE` extent dedicated to a single size class.
pub struct Slab {
    pub base_offset: usize,
    pub size_class_id: usize,
    pub block_size: usize,
    pub total_blocks: usize,
    inner: Mutex<SlabInner>,
}

impl Slab {
    /// Create a new slab covering `base_offset` for the given size-class id.
    pub fn create(size_class_id: usize, base_offset: usize) -> Result<Self> {
        if size_class_id >= SIZE_CLASSES.len() {
            return Err(Error::InvalidArgument {
                reason: "size class id out of range",
            });
        }
        let block_size = SIZE_CLASSES[size_class_id];
        let total_blocks = SLAB_SIZE / block_size;
        let words = total_blocks.div_ceil(64);

        Ok(Self {
            base_offset,
            size_class_id,
            block_size,
            total_blocks,
            inner: Mutex::new(SlabInner {
                allocated_count: 0,
                bitmap: alloc::vec![0u64; words],
                ring: Ring::new(),
            }),
        })
    }

    /// Allocate one block, returning its index within the slab.
    ///
    /// Refills the ring from the bitmap if empty. Returns `None` only if the
    /// slab is truly full (every block is held or cached); callers are
    /// expected to have already checked [`Slab::is_full`] before invoking
    /// this, so `None` here indicates a race with a concurrent allocation.
    pub fn alloc(&self) -> Option<usize> {
        let mut inner = self.inner.lock();

        if inner.ring.count == 0 {
            Self::refill(&mut inner, self.total_blocks);
        }

        let idx = inner.ring.pop()?;
        inner.allocated_count += 1;
        Some(idx as usize)
    }

    /// Scan the bitmap lowest-bit-first for up to `BATCH` clear bits,
    /// reserving each by setting its bit and pushing it to the ring.
    fn refill(inner: &mut SlabInner, total_blocks: usize) {
        let mut pushed = 0;
        for idx in 0..total_blocks {
            if pushed >= BATCH {
                break;
            }
            if !inner.bit(idx) {
                inner.set_bit(idx);
                inner.ring.push(idx as u32);
                pushed += 1;
            }
        }
    }

    /// Release a block back to the slab. Does not clear its bitmap bit; the
    /// block remains reserved-as-cached on the ring.
    pub fn free(&self, block_idx: usize) -> Result<()> {
        if block_idx >= self.total_blocks {
            return Err(Error::OutOfRange {
                index: block_idx,
                bound: self.total_blocks,
            });
        }

        let mut inner = self.inner.lock();

        if inner.ring.count == CACHE_SIZE {
            Self::drain(&mut inner);
        }

        inner.ring.push(block_idx as u32);
        inner.allocated_count = inner.allocated_count.saturating_sub(1);
        Ok(())
    }

    /// Drain the ring from its head (oldest-cached-first) down to `BATCH`
    /// entries, clearing the bitmap bit of each evicted index.
    fn drain(inner: &mut SlabInner) {
        while inner.ring.count > BATCH {
            if let Some(idx) = inner.ring.pop() {
                inner.clear_bit(idx as usize);
            } else {
                break;
            }
        }
    }

    /// Idempotently mark `block_idx` as held, for crash recovery. If the bit
    /// is already set this is a no-op.
    pub fn restore_mark(&self, block_idx: usize) -> Result<()> {
        if block_idx >= self.total_blocks {
            return Err(Error::OutOfRange {
                index: block_idx,
                bound: self.total_blocks,
            });
        }

        let mut inner = self.inner.lock();
        if !inner.bit(block_idx) {
            inner.set_bit(block_idx);
            inner.allocated_count += 1;
        }
        Ok(())
    }

    /// Relaxed hint: true if every block is held by a caller.
    pub fn is_full(&self) -> bool {
        self.inner.lock().allocated_count >= self.total_blocks
    }

    /// Relaxed hint: true if no block is currently held by a caller (the
    /// ring may still hold pre-reserved indices).
    pub fn is_empty(&self) -> bool {
        self.inner.lock().allocated_count == 0
    }

    /// Current count of blocks held by callers.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().allocated_count
    }

    /// Number of indices currently cached in the ring buffer.
    pub fn ring_count(&self) -> usize {
        self.inner.lock().ring.count
    }

    /// Number of set bits in the bitmap.
    pub fn bitmap_popcount(&self) -> usize {
        self.inner
            .lock()
            .bitmap
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    /// True if bit `idx` of the bitmap is set. Exposed for invariant checks.
    pub fn bit_set(&self, idx: usize) -> bool {
        self.inner.lock().bit(idx)
    }
}
