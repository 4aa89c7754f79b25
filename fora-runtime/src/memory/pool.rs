//! # Best-Fit Offset Pool
//!
//! Hands out aligned byte ranges from a fixed address space `[0, total_size)`.
//! The pool only does bookkeeping; the caller decides what backs an offset.
//!
//! ## Indices
//!
//! | Map | Key | Value | Used for |
//! |-----|-----|-------|----------|
//! | `allocated` | offset | size | `free` lookup |
//! | `free_by_offset` | offset | size | merging with the block above |
//! | `free_by_size` | (size, offset) | - | best-fit search |
//! | `free_by_end` | offset + size | offset | merging with the block below |
//!
//! Allocation takes the smallest free block that fits and splits off the
//! remainder. Freeing merges with both neighbours, so two free blocks never
//! touch. All operations run under one mutex.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::debug;

use super::{align_up, MemoryError};

/// A fixed-size best-fit allocator over offsets.
pub struct MemoryPool {
    total_size: usize,
    alignment: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    allocated: BTreeMap<usize, usize>,
    free_by_offset: BTreeMap<usize, usize>,
    free_by_size: BTreeSet<(usize, usize)>,
    free_by_end: BTreeMap<usize, usize>,
    bytes_allocated: usize,
}

impl PoolState {
    fn add_free(&mut self, offset: usize, size: usize) {
        self.free_by_offset.insert(offset, size);
        self.free_by_size.insert((size, offset));
        self.free_by_end.insert(offset + size, offset);
    }

    fn remove_free(&mut self, offset: usize) -> usize {
        let size = self
            .free_by_offset
            .remove(&offset)
            .unwrap_or_else(|| panic!("MemoryPool: no free block at offset {offset}"));
        self.free_by_size.remove(&(size, offset));
        self.free_by_end.remove(&(offset + size));
        size
    }
}

impl MemoryPool {
    /// Create a pool covering `total_size` bytes.
    ///
    /// # Panics
    /// Panics if `alignment` is not a power of two or `total_size` is not a
    /// multiple of it.
    pub fn new(total_size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        assert!(
            total_size % alignment == 0,
            "pool size {total_size} is not a multiple of alignment {alignment}"
        );

        let mut state = PoolState::default();
        if total_size > 0 {
            state.add_free(0, total_size);
        }

        Self {
            total_size,
            alignment,
            state: Mutex::new(state),
        }
    }

    /// Total size of the address space.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Allocation granularity.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Round `size` up to the pool's alignment. Zero rounds up to one unit.
    /// `None` if the rounded size would overflow.
    pub fn rounded_size(&self, size: usize) -> Option<usize> {
        align_up(size, self.alignment)
    }

    /// Reserve a block of at least `size` bytes and return its offset.
    pub fn allocate(&self, size: usize) -> Result<usize, MemoryError> {
        let Some(rounded) = self.rounded_size(size) else {
            debug!(requested = size, "pool allocation size overflows");
            return Err(MemoryError::BadAlloc {
                requested: size,
                largest_free: self.max_allocatable_block_size(),
            });
        };
        let size = rounded;
        let mut state = self.state.lock();

        let Some(&(block_size, offset)) = state.free_by_size.range((size, 0)..).next() else {
            let largest = state.free_by_size.iter().next_back().map_or(0, |&(s, _)| s);
            debug!(requested = size, largest_free = largest, "pool allocation failed");
            return Err(MemoryError::BadAlloc {
                requested: size,
                largest_free: largest,
            });
        };

        state.remove_free(offset);
        if block_size > size {
            state.add_free(offset + size, block_size - size);
        }
        state.allocated.insert(offset, size);
        state.bytes_allocated += size;

        Ok(offset)
    }

    /// Release the block starting at `offset`.
    ///
    /// # Panics
    /// Panics if no block is allocated at `offset`.
    pub fn free(&self, offset: usize) {
        let mut state = self.state.lock();

        let size = state
            .allocated
            .remove(&offset)
            .unwrap_or_else(|| panic!("MemoryPool: free of unallocated offset {offset}"));
        state.bytes_allocated -= size;

        let mut start = offset;
        let mut len = size;

        if let Some(&above) = state.free_by_offset.get(&(offset + size)) {
            state.remove_free(offset + size);
            len += above;
        }

        if let Some(&below) = state.free_by_end.get(&offset) {
            let below_size = state.remove_free(below);
            start = below;
            len += below_size;
        }

        state.add_free(start, len);
    }

    /// Size of the allocated block at `offset`, if any.
    pub fn block_size(&self, offset: usize) -> Option<usize> {
        self.state.lock().allocated.get(&offset).copied()
    }

    /// Largest request that would currently succeed.
    pub fn max_allocatable_block_size(&self) -> usize {
        self.state
            .lock()
            .free_by_size
            .iter()
            .next_back()
            .map_or(0, |&(size, _)| size)
    }

    /// Bytes currently handed out, after rounding.
    pub fn bytes_allocated(&self) -> usize {
        self.state.lock().bytes_allocated
    }

    /// Number of live allocations.
    pub fn allocated_block_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    /// Number of free blocks.
    pub fn free_block_count(&self) -> usize {
        self.state.lock().free_by_offset.len()
    }

    /// Walk every index and verify the blocks tile the address space.
    ///
    /// O(n) in the number of blocks; meant for tests and debug checks.
    pub fn check_internal_consistency(&self) -> Result<(), MemoryError> {
        let state = self.state.lock();
        let fail = |msg: String| Err(MemoryError::Inconsistent(msg));

        if state.free_by_offset.len() != state.free_by_size.len()
            || state.free_by_offset.len() != state.free_by_end.len()
        {
            return fail(format!(
                "free index sizes disagree: offset={} size={} end={}",
                state.free_by_offset.len(),
                state.free_by_size.len(),
                state.free_by_end.len()
            ));
        }

        for (&offset, &size) in &state.free_by_offset {
            if !state.free_by_size.contains(&(size, offset)) {
                return fail(format!("free block {offset}+{size} missing from size index"));
            }
            if state.free_by_end.get(&(offset + size)) != Some(&offset) {
                return fail(format!("free block {offset}+{size} missing from end index"));
            }
        }

        let mut blocks: Vec<(usize, usize, bool)> = state
            .allocated
            .iter()
            .map(|(&o, &s)| (o, s, true))
            .chain(state.free_by_offset.iter().map(|(&o, &s)| (o, s, false)))
            .collect();
        blocks.sort_unstable();

        let mut cursor = 0usize;
        let mut prev_free = false;
        let mut allocated_sum = 0usize;
        for &(offset, size, allocated) in &blocks {
            if size == 0 || size % self.alignment != 0 {
                return fail(format!("block {offset}+{size} is not a positive aligned size"));
            }
            if offset != cursor {
                return fail(format!("expected block at {cursor}, found one at {offset}"));
            }
            if !allocated && prev_free {
                return fail(format!("free block at {offset} touches the free block below it"));
            }
            if allocated {
                allocated_sum += size;
            }
            prev_free = !allocated;
            cursor = offset + size;
        }

        if cursor != self.total_size {
            return fail(format!("blocks end at {cursor}, pool size is {}", self.total_size));
        }
        if allocated_sum != state.bytes_allocated {
            return fail(format!(
                "allocated blocks sum to {allocated_sum}, counter says {}",
                state.bytes_allocated
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("total_size", &self.total_size)
            .field("alignment", &self.alignment)
            .field("bytes_allocated", &self.bytes_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let pool = MemoryPool::new(1024, 16);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(17).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        assert_eq!(pool.block_size(b), Some(32));
        assert_eq!(pool.bytes_allocated(), 48);
        pool.check_internal_consistency().unwrap();
    }

    #[test]
    fn test_zero_size_takes_one_unit() {
        let pool = MemoryPool::new(64, 16);
        let a = pool.allocate(0).unwrap();
        assert_eq!(pool.block_size(a), Some(16));
    }

    #[test]
    fn test_bad_alloc_reports_largest_free() {
        let pool = MemoryPool::new(256, 16);
        let a = pool.allocate(128).unwrap();
        let _b = pool.allocate(64).unwrap();
        pool.free(a);

        match pool.allocate(200) {
            Err(MemoryError::BadAlloc { requested, largest_free }) => {
                assert_eq!(requested, 208);
                assert_eq!(largest_free, 128);
            }
            other => panic!("expected BadAlloc, got {:?}", other),
        }
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let pool = MemoryPool::new(1024, 16);
        let a = pool.allocate(256).unwrap();
        let _sep1 = pool.allocate(16).unwrap();
        let b = pool.allocate(64).unwrap();
        let _sep2 = pool.allocate(16).unwrap();
        pool.free(a);
        pool.free(b);

        // 64-byte hole fits exactly and is chosen over the 256-byte one.
        assert_eq!(pool.allocate(48).unwrap(), b);
        pool.check_internal_consistency().unwrap();
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let pool = MemoryPool::new(512, 16);
        let a = pool.allocate(128).unwrap();
        let b = pool.allocate(128).unwrap();
        let c = pool.allocate(128).unwrap();
        let _d = pool.allocate(128).unwrap();

        pool.free(a);
        pool.free(c);
        assert_eq!(pool.free_block_count(), 2);

        pool.free(b);
        assert_eq!(pool.free_block_count(), 1);
        assert_eq!(pool.max_allocatable_block_size(), 384);
        pool.check_internal_consistency().unwrap();
    }

    #[test]
    fn test_full_release_restores_single_block() {
        let pool = MemoryPool::new(4096, 64);
        let offsets: Vec<_> = (1..20).map(|i| pool.allocate(i * 10).unwrap()).collect();
        for o in offsets.iter().rev().step_by(2) {
            pool.free(*o);
            pool.check_internal_consistency().unwrap();
        }
        for o in offsets.iter().rev().skip(1).step_by(2) {
            pool.free(*o);
            pool.check_internal_consistency().unwrap();
        }
        assert_eq!(pool.bytes_allocated(), 0);
        assert_eq!(pool.max_allocatable_block_size(), 4096);
    }

    #[test]
    #[should_panic(expected = "free of unallocated offset")]
    fn test_double_free_panics() {
        let pool = MemoryPool::new(64, 16);
        let a = pool.allocate(16).unwrap();
        pool.free(a);
        pool.free(a);
    }

    #[test]
    fn test_huge_request_is_bad_alloc() {
        let pool = MemoryPool::new(1024, 16);
        let _a = pool.allocate(100).unwrap();
        for size in [usize::MAX, usize::MAX - 3, 1025] {
            match pool.allocate(size) {
                Err(MemoryError::BadAlloc { largest_free, .. }) => assert_eq!(largest_free, 1024 - 112),
                other => panic!("expected BadAlloc for {size}, got {other:?}"),
            }
        }
        assert_eq!(pool.bytes_allocated(), 112);
        assert_eq!(pool.free_block_count(), 1);
        pool.check_internal_consistency().unwrap();
    }

    #[test]
    fn test_empty_pool() {
        let pool = MemoryPool::new(0, 8);
        assert!(pool.allocate(1).is_err());
        assert_eq!(pool.max_allocatable_block_size(), 0);
        pool.check_internal_consistency().unwrap();
    }
}
