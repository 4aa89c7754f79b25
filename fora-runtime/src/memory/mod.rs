//! # Memory
//!
//! Offset pools and the shared vector-data budget built on them.

pub mod manager;
pub mod pool;

pub use manager::{ManagerStatsSnapshot, PoolAllocation, PoolKind, VectorDataMemoryManager};
pub use pool::MemoryPool;

use thiserror::Error;

/// Memory allocation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// No free block is large enough.
    #[error("allocation of {requested} bytes failed (largest free block: {largest_free})")]
    BadAlloc {
        /// Rounded request size, or the raw size if rounding overflowed.
        requested: usize,
        /// Largest free block at the time of the request.
        largest_free: usize,
    },

    /// Internal pool indices disagree.
    #[error("memory pool inconsistent: {0}")]
    Inconsistent(String),
}

/// Round `size` up to a multiple of `alignment`, with zero taking one unit.
/// `None` when the rounded size does not fit in a `usize`.
pub(crate) fn align_up(size: usize, alignment: usize) -> Option<usize> {
    let mask = alignment - 1;
    size.max(1).checked_add(mask).map(|s| s & !mask)
}
