//! Property-based tests for the FORA runtime.
//!
//! Uses proptest to drive pools, tagged cells and caches through random
//! operation sequences and check their invariants after every step.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fora_runtime::cache::{OfflineCache, SimpleOfflineCache};
use fora_runtime::memory::MemoryPool;
use fora_runtime::model::Value;
use fora_runtime::scheduler::CallbackScheduler;
use fora_runtime::serialize::SerializedObject;
use fora_runtime::tagged::{RawTagged, Tagged};
use fora_runtime::vector::PageId;
use proptest::prelude::*;

const POOL_SIZE: usize = 64 * 1024;
const ALIGN: usize = 16;

#[derive(Debug, Clone)]
enum PoolOp {
    Allocate(usize),
    /// Free the live block at this index modulo the live count.
    Free(usize),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => (0usize..4096).prop_map(PoolOp::Allocate),
        2 => any::<usize>().prop_map(PoolOp::Free),
    ]
}

#[derive(Debug)]
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fora_runtime::tagged_union! {
    #[derive(Debug)]
    enum Cell: CellTag {
        Tracked(DropCounter),
    }
}

fn page(tag: u64) -> (PageId, Arc<SerializedObject>) {
    let so = SerializedObject::serialize(&Value::tuple(vec![
        Value::Int64(tag as i64),
        Value::string("x".repeat(40)),
    ]));
    (PageId::for_object(&so), so)
}

proptest! {
    /// Allocated and free blocks tile the pool after every operation
    #[test]
    fn pool_tiling_holds(ops in prop::collection::vec(pool_op(), 1..200)) {
        let pool = MemoryPool::new(POOL_SIZE, ALIGN);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Allocate(size) => {
                    if let Ok(offset) = pool.allocate(size) {
                        prop_assert_eq!(offset % ALIGN, 0);
                        live.push((offset, pool.rounded_size(size).unwrap()));
                    }
                }
                PoolOp::Free(i) => {
                    if !live.is_empty() {
                        let (offset, _) = live.swap_remove(i % live.len());
                        pool.free(offset);
                    }
                }
            }
            prop_assert!(pool.check_internal_consistency().is_ok());
            let expected: usize = live.iter().map(|&(_, s)| s).sum();
            prop_assert_eq!(pool.bytes_allocated(), expected);
        }

        for (offset, _) in live.drain(..) {
            pool.free(offset);
        }
        prop_assert_eq!(pool.bytes_allocated(), 0);
        prop_assert_eq!(pool.free_block_count(), 1);
        prop_assert_eq!(pool.max_allocatable_block_size(), POOL_SIZE);
    }

    /// Live blocks never overlap
    #[test]
    fn pool_blocks_disjoint(sizes in prop::collection::vec(1usize..2048, 1..64)) {
        let pool = MemoryPool::new(POOL_SIZE, ALIGN);
        let mut blocks: Vec<(usize, usize)> = sizes
            .iter()
            .filter_map(|&s| pool.allocate(s).ok().map(|o| (o, pool.rounded_size(s).unwrap())))
            .collect();
        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        if let Some(&(offset, size)) = blocks.last() {
            prop_assert!(offset + size <= POOL_SIZE);
        }
    }

    /// A cell is destroyed exactly when decrements reach increments + 1
    #[test]
    fn refcount_liveness(increments in 0usize..32) {
        let drops = Arc::new(AtomicUsize::new(0));
        let raw = RawTagged::create((), Cell::Tracked(DropCounter(Arc::clone(&drops))));

        unsafe {
            for _ in 0..increments {
                raw.increment_refcount();
            }
            for _ in 0..increments {
                prop_assert!(!raw.decrement_refcount());
                prop_assert_eq!(drops.load(Ordering::SeqCst), 0);
            }
            prop_assert!(raw.decrement_refcount());
            raw.destroy();
        }
        prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    /// RAII clones keep the cell alive until the last handle drops
    #[test]
    fn tagged_clones_share_one_cell(clones in 1usize..16) {
        let drops = Arc::new(AtomicUsize::new(0));
        let first = Tagged::new((), Cell::Tracked(DropCounter(Arc::clone(&drops))));
        let handles: Vec<_> = (0..clones).map(|_| first.clone()).collect();
        prop_assert_eq!(first.refcount(), clones + 1);

        drop(first);
        for h in handles {
            prop_assert_eq!(drops.load(Ordering::SeqCst), 0);
            drop(h);
        }
        prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    /// The LRU tier never holds more than its budget
    #[test]
    fn lru_stays_within_budget(
        budget_items in 2u64..6,
        stores in prop::collection::vec(0u64..12, 1..60),
    ) {
        let item = page(0).0.bytecount();
        let cache = SimpleOfflineCache::new(item * budget_items + item / 2, CallbackScheduler::inline());

        for tag in stores {
            let (id, so) = page(tag);
            cache.store(id, &so).unwrap();
            prop_assert!(cache.cache_size_used_bytes() < cache.max_bytes());
            prop_assert!(cache.already_exists(&id));
        }
        let stats = cache.stats();
        prop_assert!(stats.item_count <= budget_items);
    }
}
