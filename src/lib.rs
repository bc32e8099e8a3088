//! A slab allocator for a byte-addressable non-volatile memory (NVM) region.
//!
//! The allocator is organized as a two-level cache hierarchy: a central
//! heap (a [`space_manager::SpaceManager`] over the raw offset range plus a
//! [`slab_index::SlabIndex`] mapping slab-base offsets to slabs) backs a
//! per-CPU fast path that hands out blocks from one [`slab::Slab`] at a
//! time. Freed slabs are retained under deferred reclaim rather than
//! returned to the Space Manager. An offline recovery path reconstructs
//! volatile metadata from an externally persisted `(address, size)` log.
//!
//! This crate receives a pre-mapped region from its caller (an opaque base
//! pointer and byte length) and exposes only the operations in
//! [`allocator`]; it does not itself map memory, does not persist its own
//! metadata, and installs no `#[global_allocator]` of its own.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod config;
pub mod error;
pub mod log_service;
pub mod slab;
pub mod slab_index;
pub mod space_manager;

mod sync;

pub use allocator::{allocate, free, init, restore, shutdown, Allocator};
pub use config::{
    BATCH, CACHE_LINE, CACHE_SIZE, MAX_BLOCK_SIZE, MAX_CPUS, SIZE_CLASSES, SLAB_INDEX_CAPACITY,
    SLAB_SIZE,
};
pub use error::{Error, Result};
