//! Integration tests for the offline cache tiers.
//!
//! Both tiers are driven through `dyn OfflineCache` so the shared contract
//! (budgets, silent overwrite, idempotent drops, one notification per page
//! leaving the cache) is checked the same way for each.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fora_runtime::cache::{CacheError, DiskOfflineCache, OfflineCache, SimpleOfflineCache};
use fora_runtime::memory::VectorDataMemoryManager;
use fora_runtime::model::Value;
use fora_runtime::scheduler::CallbackScheduler;
use fora_runtime::serialize::SerializedObject;
use fora_runtime::vector::{PageId, PageletBuilder, VectorPage, VectorPageBuilder};

fn page_object(tag: i64) -> (PageId, Arc<SerializedObject>) {
    let so = SerializedObject::serialize(&Value::tuple(vec![
        Value::Int64(tag),
        Value::string("c".repeat(48)),
    ]));
    (PageId::for_object(&so), so)
}

fn item_size() -> u64 {
    page_object(0).0.bytecount()
}

fn counting(cache: &dyn OfflineCache) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    cache.on_page_dropped().subscribe(move |_: &PageId| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    count
}

fn check_budget_of_two_and_a_half(cache: &dyn OfflineCache, budget: u64) {
    let pages: Vec<_> = (0..3).map(page_object).collect();
    for (id, so) in &pages {
        cache.store(*id, so).unwrap();
    }
    assert_eq!(cache.cache_item_count(), 2);
    assert!(cache.cache_size_used_bytes() <= budget);
    assert_eq!(cache.cache_items_dropped(), 1);
    assert!(cache.already_exists(&pages[2].0));
}

fn check_drop_contract(cache: &dyn OfflineCache, scheduler: &CallbackScheduler) {
    let drops = counting(cache);
    let (id, so) = page_object(77);
    cache.store(id, &so).unwrap();
    cache.store(id, &so).unwrap();
    assert_eq!(cache.cache_item_count(), 1);

    assert!(cache.drop_page(&id).unwrap());
    assert!(!cache.drop_page(&id).unwrap());
    assert!(!cache.already_exists(&id));
    assert!(cache.load_if_exists(&id).unwrap().is_none());

    scheduler.block_until_idle();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(cache.cache_bytes_dropped(), id.bytecount());
}

#[test]
fn test_simple_cache_evicts_oldest_of_three() {
    let budget = item_size() * 5 / 2;
    let cache = SimpleOfflineCache::new(budget, CallbackScheduler::inline());
    check_budget_of_two_and_a_half(&cache, budget);
    assert!(!cache.already_exists(&page_object(0).0));
    assert!(cache.already_exists(&page_object(1).0));
}

#[test]
fn test_disk_cache_respects_byte_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let budget = item_size() * 5 / 2;
    let cache = DiskOfflineCache::new(tmp.path(), budget, 1000, CallbackScheduler::inline()).unwrap();
    check_budget_of_two_and_a_half(&cache, budget);
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 2);
}

#[test]
fn test_simple_cache_drop_contract() {
    let scheduler = CallbackScheduler::new("cache-test", 1);
    let cache = SimpleOfflineCache::new(1 << 20, Arc::clone(&scheduler));
    check_drop_contract(&cache, &scheduler);
    scheduler.shutdown();
}

#[test]
fn test_disk_cache_drop_contract() {
    let tmp = tempfile::tempdir().unwrap();
    let scheduler = CallbackScheduler::new("cache-test", 1);
    let cache = DiskOfflineCache::new(tmp.path(), 1 << 20, 1000, Arc::clone(&scheduler)).unwrap();
    check_drop_contract(&cache, &scheduler);
    assert_eq!(cache.open_file_handles(), 0);
    scheduler.shutdown();
}

#[test]
fn test_item_too_large_in_both_tiers() {
    let tmp = tempfile::tempdir().unwrap();
    let size = item_size();
    let (id, so) = page_object(1);

    let simple = SimpleOfflineCache::new(size, CallbackScheduler::inline());
    assert!(matches!(simple.store(id, &so), Err(CacheError::ItemTooLarge { .. })));

    let disk = DiskOfflineCache::new(tmp.path(), size - 1, 10, CallbackScheduler::inline()).unwrap();
    assert!(matches!(disk.store(id, &so), Err(CacheError::ItemTooLarge { .. })));
    assert_eq!(disk.cache_item_count(), 0);
}

#[test]
fn test_pages_spill_from_ram_to_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let memory = VectorDataMemoryManager::unbounded(16);
    let pages: Vec<Arc<VectorPage>> = (0..4)
        .map(|p| {
            let mut pagelet = PageletBuilder::new(&memory);
            for i in 0..64 {
                pagelet.append(&Value::Int64(p * 1000 + i)).unwrap();
            }
            let mut page = VectorPageBuilder::new(&memory);
            page.append_pagelet(pagelet.freeze());
            page.freeze()
        })
        .collect();
    let objects: Vec<_> = pages
        .iter()
        .map(|p| {
            let so = p.serialize();
            (PageId::for_object(&so), so)
        })
        .collect();

    let scheduler = CallbackScheduler::inline();
    let ram = Arc::new(SimpleOfflineCache::new(objects[0].0.bytecount() * 3 / 2, Arc::clone(&scheduler)));
    let disk = Arc::new(DiskOfflineCache::new(tmp.path(), 1 << 20, 100, Arc::clone(&scheduler)).unwrap());

    let spill_to = Arc::clone(&disk);
    let stash: Arc<parking_lot::Mutex<Vec<(PageId, Arc<SerializedObject>)>>> = Default::default();
    let pending = Arc::clone(&stash);
    ram.on_page_dropped().subscribe(move |id: &PageId| {
        let object = pending
            .lock()
            .iter()
            .find(|(p, _)| p == id)
            .map(|(_, so)| Arc::clone(so));
        if let Some(so) = object {
            spill_to.store(*id, &so).unwrap();
        }
    });

    for (id, so) in &objects {
        stash.lock().push((*id, Arc::clone(so)));
        ram.store(*id, so).unwrap();
    }

    assert_eq!(ram.cache_item_count(), 1);
    assert_eq!(disk.cache_item_count(), 3);
    for (page, (id, _)) in pages.iter().zip(&objects) {
        let so = match ram.load_if_exists(id).unwrap() {
            Some(so) => so,
            None => disk.load_if_exists(id).unwrap().unwrap(),
        };
        let back = VectorPage::deserialize(&memory, &so).unwrap();
        assert_eq!(back.hash(), page.hash());
    }
    assert!(disk.total_bytes_loaded() > 0);
}
