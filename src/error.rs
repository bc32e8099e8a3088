//! Error types for the NVM slab allocator.

use core::fmt;

/// Allocator error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "allocator errors must be handled, not silently discarded"]
pub enum Error {
    /// Zero size, oversized size, null base, or unaligned total size.
    InvalidArgument { reason: &'static str },
    /// API called before `init` or after `shutdown`.
    Uninitialized,
    /// Second `init` without an intervening `shutdown`.
    AlreadyInitialized,
    /// The Space Manager has no free extent of at least `SLAB_SIZE`.
    Exhausted,
    /// Slab metadata, index node, or segment node allocation failed.
    OutOfHostMemory,
    /// Slab Index insert of an already-present key.
    Duplicate { base_offset: usize },
    /// `alloc_at` target extent is not fully free.
    Unavailable { base_offset: usize },
    /// `restore` found a slab at the target base with a different size
    /// class than the one implied by the record being restored.
    Mismatch {
        base_offset: usize,
        expected_class: usize,
        found_class: usize,
    },
    /// Block index exceeds `total_blocks`.
    OutOfRange { index: usize, bound: usize },
    /// `free` of an address whose slab is not indexed.
    UnmanagedAddress { address: usize },
}

/// Result type alias for allocator operations.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { reason } => write!(f, "invalid argument: {}", reason),
            Self::Uninitialized => write!(f, "allocator not initialized"),
            Self::AlreadyInitialized => write!(f, "allocator already initialized"),
            Self::Exhausted => write!(f, "space manager exhausted: no free extent of slab size"),
            Self::OutOfHostMemory => write!(f, "host memory allocation failed"),
            Self::Duplicate { base_offset } => {
                write!(f, "slab index already has an entry at offset {:#x}", base_offset)
            }
            Self::Unavailable { base_offset } => {
                write!(f, "extent at offset {:#x} is not fully free", base_offset)
            }
            Self::Mismatch {
                base_offset,
                expected_class,
                found_class,
            } => write!(
                f,
                "size class mismatch restoring slab at {:#x}: expected class {}, found class {}",
                base_offset, expected_class, found_class
            ),
            Self::OutOfRange { index, bound } => {
                write!(f, "block index {} out of range (bound {})", index, bound)
            }
            Self::UnmanagedAddress { address } => {
                write!(f, "address {:#x} is not managed by this allocator", address)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_does_not_panic() {
        let errs = [
            Error::InvalidArgument { reason: "zero size" },
            Error::Uninitialized,
            Error::AlreadyInitialized,
            Error::Exhausted,
            Error::OutOfHostMemory,
            Error::Duplicate { base_offset: 0 },
            Error::Unavailable { base_offset: 0 },
            Error::Mismatch {
                base_offset: 0,
                expected_class: 1,
                found_class: 2,
            },
            Error::OutOfRange { index: 10, bound: 4 },
            Error::UnmanagedAddress { address: 0xdead },
        ];
        for e in errs {
            let _ = alloc::format!("{}", e);
        }
    }
}
