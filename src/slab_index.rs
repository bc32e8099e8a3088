//! Concurrent offset-to-slab index.
//!
//! A fixed-capacity separate-chaining hash table keyed by a slab's
//! `base_offset`. Each bucket is an `Option<Box<Node>>` chain, the same
//! shape the source material uses for its buddy free lists, just indexed
//! by hash instead of order. No dynamic rehash: capacity is fixed for the
//! life of the index.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::RwLock;

use crate::config::SLAB_SIZE;
use crate::error::{Error, Result};
use crate::slab::Slab;

struct Node {
    base_offset: usize,
    slab: Arc<Slab>,
    next: Option<Box<Node>>,
}

/// Fixed-capacity separate-chaining hash table, `base_offset -> Arc<Slab>`.
pub struct SlabIndex {
    buckets: alloc::vec::Vec<RwLock<Option<Box<Node>>>>,
    capacity: usize,
}

impl SlabIndex {
    /// Create an index with the given bucket capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buckets = alloc::vec::Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buckets.push(RwLock::new(None));
        }
        Self { buckets, capacity }
    }

    fn bucket_for(&self, base_offset: usize) -> usize {
        (base_offset / SLAB_SIZE) % self.capacity
    }

    /// Insert a new `(base_offset, slab)` entry.
    ///
    /// Errors with [`Error::Duplicate`] if an entry for `base_offset`
    /// already exists.
    pub fn insert(&self, base_offset: usize, slab: Arc<Slab>) -> Result<()> {
        let idx = self.bucket_for(base_offset);
        let mut head = self.buckets[idx].write();

        let mut cursor = head.as_deref();
        while let Some(node) = cursor {
            if node.base_offset == base_offset {
                return Err(Error::Duplicate { base_offset });
            }
            cursor = node.next.as_deref();
        }

        let new_node = Box::new(Node {
            base_offset,
            slab,
            next: head.take(),
        });
        *head = Some(new_node);
        Ok(())
    }

    /// Look up the slab covering `base_offset`, if indexed.
    pub fn lookup(&self, base_offset: usize) -> Option<Arc<Slab>> {
        let idx = self.bucket_for(base_offset);
        let head = self.buckets[idx].read();

        let mut cursor = head.as_deref();
        while let Some(node) = cursor {
            if node.base_offset == base_offset {
                return Some(node.slab.clone());
            }
            cursor = node.next.as_deref();
        }
        None
    }

    /// Remove and return the entry for `base_offset`, if present.
    pub fn remove(&self, base_offset: usize) -> Option<Arc<Slab>> {
        let idx = self.bucket_for(base_offset);
        let mut head = self.buckets[idx].write();

        if head.as_ref().is_some_and(|n| n.base_offset == base_offset) {
            let node = head.take().unwrap();
            *head = node.next;
            return Some(node.slab);
        }

        let mut cursor = head.as_mut();
        while let Some(node) = cursor {
            if node
                .next
                .as_ref()
                .is_some_and(|n| n.base_offset == base_offset)
            {
                let target = node.next.take().unwrap();
                node.next = target.next;
                return Some(target.slab);
            }
            cursor = node.next.as_mut();
        }
        None
    }

    /// Number of buckets in the table.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of entries across all buckets. O(capacity) scan.
    pub fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            let head = bucket.read();
            let mut cursor = head.as_deref();
            while let Some(node) = cursor {
                total += 1;
                cursor = node.next.as_deref();
            }
        }
        total
    }

    /// True if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
