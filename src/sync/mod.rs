//! Synchronization primitives shared across the allocator's modules.

pub mod once_lock;

pub use once_lock::GlobalState;
