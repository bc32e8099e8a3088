//! Segregated-fit space manager over a contiguous NVM offset range.
//!
//! Tracks free slab-sized extents as an address-ordered list of
//! `(offset, size)` segments, coalescing neighbors on release and supporting
//! a targeted carve-out for recovery.

use alloc::vec::Vec;

use spin::Mutex;

use crate::config::SLAB_SIZE;
use crate::error::{Error, Result};

/// One contiguous run of free offsets, `size` always a positive multiple of
/// `SLAB_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSegment {
    pub offset: usize,
    pub size: usize,
}

/// Address-ordered free-segment list guarded by a single mutex.
///
/// The list is kept as a `Vec` sorted ascending by `offset` rather than a
/// hand-rolled doubly-linked list: every operation here is a sequential
/// scan-and-splice (first-fit, coalesce-on-free), not a LIFO push/pop, so a
/// sorted vector gives the same O(F) bound with far less unsafe code.
pub struct SpaceManager {
    segments: Mutex<Vec<FreeSegment>>,
}

impl SpaceManager {
    /// Initialize the free list with a single segment `[start_offset,
    /// start_offset + total_size)`.
    ///
    /// `total_size` is truncated down to the nearest multiple of
    /// `SLAB_SIZE`; the remainder, if any, is permanently unmanaged.
    pub fn create(total_size: usize, start_offset: usize) -> Result<Self> {
        if total_size < SLAB_SIZE {
            return Err(Error::InvalidArgument {
                reason: "total_size smaller than SLAB_SIZE",
            });
        }
        let usable = total_size - (total_size % SLAB_SIZE);
        let mut segments = Vec::new();
        segments.push(FreeSegment {
            offset: start_offset,
            size: usable,
        });
        Ok(Self {
            segments: Mutex::new(segments),
        })
    }

    /// First-fit allocation of one `SLAB_SIZE` extent.
    pub fn alloc_slab(&self) -> Result<usize> {
        let mut segments = self.segments.lock();
        for i in 0..segments.len() {
            if segments[i].size >= SLAB_SIZE {
                let offset = segments[i].offset;
                if segments[i].size == SLAB_SIZE {
                    segments.remove(i);
                } else {
                    segments[i].offset += SLAB_SIZE;
                    segments[i].size -= SLAB_SIZE;
                }
                return Ok(offset);
            }
        }
        Err(Error::Exhausted)
    }

    /// Release a previously allocated `SLAB_SIZE` extent back to the free
    /// list, merging with an abutting predecessor and/or successor.
    pub fn free_slab(&self, offset: usize) {
        let mut segments = self.segments.lock();
        let insert_at = segments
            .iter()
            .position(|s| s.offset > offset)
            .unwrap_or(segments.len());
        segments.insert(
            insert_at,
            FreeSegment {
                offset,
                size: SLAB_SIZE,
            },
        );
        Self::coalesce_around(&mut segments, insert_at);
    }

    /// Recovery-only: carve `[offset, offset + SLAB_SIZE)` out of whichever
    /// free segment covers it, splitting or shrinking as needed.
    pub fn alloc_at(&self, offset: usize) -> Result<()> {
        let mut segments = self.segments.lock();
        let end = offset + SLAB_SIZE;

        for i in 0..segments.len() {
            let seg = segments[i];
            let seg_end = seg.offset + seg.size;
            if seg.offset <= offset && end <= seg_end {
                if seg.offset == offset && seg_end == end {
                    segments.remove(i);
                } else if seg.offset == offset {
                    segments[i].offset = end;
                    segments[i].size = seg_end - end;
                } else if seg_end == end {
                    segments[i].size = offset - seg.offset;
                } else {
                    segments[i].size = offset - seg.offset;
                    segments.insert(
                        i + 1,
                        FreeSegment {
                            offset: end,
                            size: seg_end - end,
                        },
                    );
                }
                return Ok(());
            }
        }
        Err(Error::Unavailable {
            base_offset: offset,
        })
    }

    /// Snapshot of the current free list, for tests and diagnostics.
    pub fn segments(&self) -> Vec<FreeSegment> {
        self.segments.lock().clone()
    }

    /// Sum of all free segment sizes.
    pub fn free_bytes(&self) -> usize {
        self.segments.lock().iter().map(|s| s.size).sum()
    }

    /// Merge `segments[idx]` with its predecessor and/or successor if they
    /// abut, in place.
    fn coalesce_around(segments: &mut Vec<FreeSegment>, idx: usize) {
        if idx + 1 < segments.len() {
            let cur = segments[idx];
            let next = segments[idx + 1];
            if cur.offset + cur.size == next.offset {
                segments[idx].size += next.size;
                segments.remove(idx + 1);
            }
        }
        if idx > 0 {
            let prev = segments[idx - 1];
            let cur = segments[idx];
            if prev.offset + prev.size == cur.offset {
                segments[idx - 1].size += cur.size;
                segments.remove(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_truncates_to_slab_multiple() {
        let sm = SpaceManager::create(SLAB_SIZE * 3 + 100, 0).unwrap();
        assert_eq!(sm.free_bytes(), SLAB_SIZE * 3);
    }

    #[test]
    fn create_rejects_undersized_region() {
        assert!(SpaceManager::create(SLAB_SIZE - 1, 0).is_err());
    }

    #[test]
    fn alloc_then_free_restores_free_list() {
        let sm = SpaceManager::create(SLAB_SIZE * 4, 0).unwrap();
        let before = sm.segments();
        let offset = sm.alloc_slab().unwrap();
        assert_eq!(offset, 0);
        sm.free_slab(offset);
        assert_eq!(sm.segments(), before);
    }

    #[test]
    fn exhaustion_reports_error_without_corruption() {
        let sm = SpaceManager::create(SLAB_SIZE, 0).unwrap();
        let offset = sm.alloc_slab().unwrap();
        assert!(sm.alloc_slab().is_err());
        sm.free_slab(offset);
        assert!(sm.alloc_slab().is_ok());
    }

    #[test]
    fn coalesce_on_free_slab_scenario() {
        // Scenario 4 from the allocator's test matrix.
        let sm = SpaceManager::create(SLAB_SIZE * 10, 0).unwrap();
        let a = sm.alloc_slab().unwrap();
        let b = sm.alloc_slab().unwrap();
        let c = sm.alloc_slab().unwrap();
        assert_eq!((a, b, c), (0, SLAB_SIZE, 2 * SLAB_SIZE));

        sm.free_slab(b);
        assert_eq!(sm.segments().len(), 2);

        sm.free_slab(a);
        assert_eq!(sm.segments().len(), 2);

        sm.free_slab(c);
        let segs = sm.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].offset, 0);
        assert_eq!(segs[0].size, SLAB_SIZE * 10);
    }

    #[test]
    fn alloc_at_exact_match() {
        let sm = SpaceManager::create(SLAB_SIZE * 4, 0).unwrap();
        sm.alloc_slab().unwrap();
        assert!(sm.alloc_at(0).is_err());
        assert!(sm.alloc_at(SLAB_SIZE).is_ok());
        assert!(sm.alloc_at(SLAB_SIZE).is_err());
    }

    #[test]
    fn alloc_at_interior_splits_segment() {
        let sm = SpaceManager::create(SLAB_SIZE * 10, 0).unwrap();
        sm.alloc_at(2 * SLAB_SIZE).unwrap();
        let segs = sm.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0], FreeSegment { offset: 0, size: 2 * SLAB_SIZE });
        assert_eq!(
            segs[1],
            FreeSegment {
                offset: 3 * SLAB_SIZE,
                size: 7 * SLAB_SIZE
            }
        );
    }

    #[test]
    fn alloc_at_rejects_unavailable_extent() {
        let sm = SpaceManager::create(SLAB_SIZE * 4, 0).unwrap();
        sm.alloc_slab().unwrap();
        assert!(matches!(
            sm.alloc_at(0),
            Err(Error::Unavailable { base_offset: 0 })
        ));
    }
}
