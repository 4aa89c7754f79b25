//! # Vector Data Memory Manager
//!
//! The shared memory budget that pagelets and value arrays draw from. A
//! bounded manager reserves every allocation in a [`MemoryPool`] whose size
//! is the budget, so an exhausted budget surfaces as
//! [`MemoryError::BadAlloc`] at the requesting call. An unbounded manager
//! skips the pool and only keeps counters.
//!
//! Each [`PoolAllocation`] owns its bytes and returns its reservation when
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::debug;

use super::pool::MemoryPool;
use super::{align_up, MemoryError};
use crate::config::MemoryConfig;

/// What an allocation is used for. Each kind has its own byte counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Packed element storage inside a value array.
    PackedValues,
    /// Slot table for boxed values.
    BoxedValues,
    /// Out-of-line string bytes.
    StringData,
}

impl PoolKind {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            PoolKind::PackedValues => 0,
            PoolKind::BoxedValues => 1,
            PoolKind::StringData => 2,
        }
    }
}

/// Counters shared by every allocation from one manager.
#[derive(Debug, Default)]
pub struct ManagerStats {
    bytes_by_kind: [AtomicU64; PoolKind::COUNT],
    live_allocations: AtomicU64,
    total_allocations: AtomicU64,
    failed_allocations: AtomicU64,
}

/// Point-in-time copy of [`ManagerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStatsSnapshot {
    /// Bytes held by packed value storage.
    pub packed_bytes: u64,
    /// Bytes held by boxed value slots.
    pub boxed_bytes: u64,
    /// Bytes held by string data.
    pub string_bytes: u64,
    /// Allocations not yet released.
    pub live_allocations: u64,
    /// Allocations ever granted.
    pub total_allocations: u64,
    /// Requests refused for lack of space.
    pub failed_allocations: u64,
}

/// Shared byte budget for vector data.
pub struct VectorDataMemoryManager {
    pool: Option<MemoryPool>,
    alignment: usize,
    stats: ManagerStats,
}

static FREE_STORE: OnceLock<Arc<VectorDataMemoryManager>> = OnceLock::new();

impl VectorDataMemoryManager {
    /// A manager limited to `max_bytes`, rounded up to the alignment where
    /// that fits and down otherwise.
    pub fn new(max_bytes: usize, alignment: usize) -> Arc<Self> {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let rounded = match max_bytes {
            0 => 0,
            n => align_up(n, alignment).unwrap_or(n & !(alignment - 1)),
        };
        Arc::new(Self {
            pool: Some(MemoryPool::new(rounded, alignment)),
            alignment,
            stats: ManagerStats::default(),
        })
    }

    /// A manager with no byte limit.
    pub fn unbounded(alignment: usize) -> Arc<Self> {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        Arc::new(Self {
            pool: None,
            alignment,
            stats: ManagerStats::default(),
        })
    }

    /// Build from configuration. A zero budget means unbounded.
    pub fn from_config(config: &MemoryConfig) -> Arc<Self> {
        if config.vdmm_max_bytes == 0 {
            Self::unbounded(config.pool_alignment)
        } else {
            Self::new(config.vdmm_max_bytes, config.pool_alignment)
        }
    }

    /// The process-wide unbounded manager.
    pub fn free_store() -> Arc<Self> {
        FREE_STORE
            .get_or_init(|| Self::unbounded(MemoryConfig::default().pool_alignment))
            .clone()
    }

    /// Reserve `bytes` for `kind`.
    pub fn allocate(self: &Arc<Self>, kind: PoolKind, bytes: usize) -> Result<PoolAllocation, MemoryError> {
        let (offset, size) = match &self.pool {
            Some(pool) => {
                let offset = pool.allocate(bytes).map_err(|e| {
                    self.stats.failed_allocations.fetch_add(1, Ordering::Relaxed);
                    debug!(?kind, bytes, "vector memory budget exhausted");
                    e
                })?;
                let size = pool.block_size(offset).unwrap_or(bytes);
                (Some(offset), size)
            }
            None => {
                let size = align_up(bytes, self.alignment).ok_or_else(|| {
                    self.stats.failed_allocations.fetch_add(1, Ordering::Relaxed);
                    MemoryError::BadAlloc {
                        requested: bytes,
                        largest_free: usize::MAX,
                    }
                })?;
                (None, size)
            }
        };

        self.stats.bytes_by_kind[kind.index()].fetch_add(size as u64, Ordering::Relaxed);
        self.stats.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.stats.total_allocations.fetch_add(1, Ordering::Relaxed);

        Ok(PoolAllocation {
            manager: Arc::clone(self),
            kind,
            offset,
            data: vec![0u8; size].into_boxed_slice(),
        })
    }

    fn release(&self, kind: PoolKind, offset: Option<usize>, size: usize) {
        if let (Some(pool), Some(offset)) = (&self.pool, offset) {
            pool.free(offset);
        }
        self.stats.bytes_by_kind[kind.index()].fetch_sub(size as u64, Ordering::Relaxed);
        self.stats.live_allocations.fetch_sub(1, Ordering::Relaxed);
    }

    /// Byte limit, or `None` when unbounded.
    pub fn max_bytes(&self) -> Option<usize> {
        self.pool.as_ref().map(MemoryPool::total_size)
    }

    /// Allocation granularity.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes currently reserved across all kinds.
    pub fn bytes_used(&self) -> u64 {
        self.stats
            .bytes_by_kind
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Bytes currently reserved for one kind.
    pub fn bytes_used_by(&self, kind: PoolKind) -> u64 {
        self.stats.bytes_by_kind[kind.index()].load(Ordering::Relaxed)
    }

    /// Largest single allocation that would currently succeed.
    pub fn max_allocatable_block_size(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(usize::MAX, MemoryPool::max_allocatable_block_size)
    }

    /// The backing pool, if bounded.
    pub fn pool(&self) -> Option<&MemoryPool> {
        self.pool.as_ref()
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> ManagerStatsSnapshot {
        let s = &self.stats;
        ManagerStatsSnapshot {
            packed_bytes: self.bytes_used_by(PoolKind::PackedValues),
            boxed_bytes: self.bytes_used_by(PoolKind::BoxedValues),
            string_bytes: self.bytes_used_by(PoolKind::StringData),
            live_allocations: s.live_allocations.load(Ordering::Relaxed),
            total_allocations: s.total_allocations.load(Ordering::Relaxed),
            failed_allocations: s.failed_allocations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for VectorDataMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorDataMemoryManager")
            .field("max_bytes", &self.max_bytes())
            .field("bytes_used", &self.bytes_used())
            .finish()
    }
}

/// A block of bytes reserved against a manager's budget.
///
/// The length is the rounded reservation, which may exceed the request.
pub struct PoolAllocation {
    manager: Arc<VectorDataMemoryManager>,
    kind: PoolKind,
    offset: Option<usize>,
    data: Box<[u8]>,
}

impl PoolAllocation {
    /// Reserved length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the reservation is empty. Reservations are never empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// What the block is used for.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// The manager this block is charged to.
    pub fn manager(&self) -> &Arc<VectorDataMemoryManager> {
        &self.manager
    }

    /// Read access.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Reserve a larger block of the same kind and copy the first `keep`
    /// bytes into it. `self` is released only if the new reservation succeeds.
    pub fn grow(&mut self, new_len: usize, keep: usize) -> Result<(), MemoryError> {
        let mut next = self.manager.allocate(self.kind, new_len)?;
        let keep = keep.min(self.data.len()).min(next.data.len());
        next.data[..keep].copy_from_slice(&self.data[..keep]);
        std::mem::swap(self, &mut next);
        Ok(())
    }
}

impl Drop for PoolAllocation {
    fn drop(&mut self) {
        self.manager.release(self.kind, self.offset, self.data.len());
    }
}

impl std::fmt::Debug for PoolAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocation")
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}
