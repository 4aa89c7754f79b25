//! In-memory LRU tier.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::{CacheError, OfflineCache};
use crate::config::CacheConfig;
use crate::event::EventBroadcaster;
use crate::scheduler::CallbackScheduler;
use crate::serialize::{SerializedObject, SerializedObjectFlattener};
use crate::vector::PageId;

struct Entry {
    object: Arc<SerializedObject>,
    bytes: u64,
    touched: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<PageId, Entry>,
    by_touch: BTreeMap<u64, PageId>,
    clock: u64,
    bytes_used: u64,
}

impl LruState {
    fn touch(&mut self, page: &PageId) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(page) {
            self.by_touch.remove(&entry.touched);
            entry.touched = clock;
            self.by_touch.insert(clock, *page);
        }
    }

    fn remove(&mut self, page: &PageId) -> Option<Entry> {
        let entry = self.entries.remove(page)?;
        self.by_touch.remove(&entry.touched);
        self.bytes_used -= entry.bytes;
        Some(entry)
    }

    fn oldest(&self) -> Option<PageId> {
        self.by_touch.values().next().copied()
    }
}

/// Keeps serialized pages in RAM and evicts the least recently touched page
/// while the bytes held reach the budget.
///
/// Sizes are flattened sizes. An item whose size alone reaches the budget is
/// refused with [`CacheError::ItemTooLarge`].
pub struct SimpleOfflineCache {
    max_bytes: u64,
    state: Mutex<LruState>,
    bytes_dropped: AtomicU64,
    items_dropped: AtomicU64,
    bytes_loaded: AtomicU64,
    dropped: EventBroadcaster<PageId>,
}

impl SimpleOfflineCache {
    /// A cache holding less than `max_bytes`, announcing drops on `scheduler`.
    pub fn new(max_bytes: u64, scheduler: Arc<CallbackScheduler>) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(LruState::default()),
            bytes_dropped: AtomicU64::new(0),
            items_dropped: AtomicU64::new(0),
            bytes_loaded: AtomicU64::new(0),
            dropped: EventBroadcaster::new(scheduler),
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &CacheConfig, scheduler: Arc<CallbackScheduler>) -> Self {
        Self::new(config.ram_max_bytes, scheduler)
    }

    /// Budget in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Flattened bytes handed out by successful loads.
    pub fn total_bytes_loaded(&self) -> u64 {
        self.bytes_loaded.load(Ordering::Relaxed)
    }

    fn record_drop(&self, page: PageId, bytes: u64) {
        self.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
        self.items_dropped.fetch_add(1, Ordering::Relaxed);
        self.dropped.broadcast(page);
    }
}

impl OfflineCache for SimpleOfflineCache {
    fn store(&self, page: PageId, data: &Arc<SerializedObject>) -> Result<(), CacheError> {
        let bytes = SerializedObjectFlattener::flatten_once(data).total_byte_count() as u64;
        if bytes >= self.max_bytes {
            return Err(CacheError::ItemTooLarge {
                size: bytes,
                max: self.max_bytes,
            });
        }

        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            state.remove(&page);
            state.clock += 1;
            let touched = state.clock;
            state.entries.insert(
                page,
                Entry {
                    object: Arc::clone(data),
                    bytes,
                    touched,
                },
            );
            state.by_touch.insert(touched, page);
            state.bytes_used += bytes;

            while state.bytes_used >= self.max_bytes {
                let Some(victim) = state.oldest() else { break };
                if let Some(entry) = state.remove(&victim) {
                    evicted.push((victim, entry.bytes));
                }
            }
        }
        trace!(%page, bytes, "stored page in memory cache");

        for (victim, bytes) in evicted {
            debug!(page = %victim, bytes, "evicted page from memory cache");
            self.record_drop(victim, bytes);
        }
        Ok(())
    }

    fn drop_page(&self, page: &PageId) -> Result<bool, CacheError> {
        let removed = self.state.lock().remove(page);
        match removed {
            Some(entry) => {
                info!(%page, bytes = entry.bytes, "dropped page from memory cache");
                self.record_drop(*page, entry.bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn already_exists(&self, page: &PageId) -> bool {
        let mut state = self.state.lock();
        if !state.entries.contains_key(page) {
            return false;
        }
        state.touch(page);
        true
    }

    fn load_if_exists(&self, page: &PageId) -> Result<Option<Arc<SerializedObject>>, CacheError> {
        let mut state = self.state.lock();
        let Some((object, bytes)) = state.entries.get(page).map(|e| (Arc::clone(&e.object), e.bytes)) else {
            return Ok(None);
        };
        state.touch(page);
        self.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
        Ok(Some(object))
    }

    fn cache_size_used_bytes(&self) -> u64 {
        self.state.lock().bytes_used
    }

    fn cache_item_count(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }

    fn cache_bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    fn cache_items_dropped(&self) -> u64 {
        self.items_dropped.load(Ordering::Relaxed)
    }

    fn on_page_dropped(&self) -> &EventBroadcaster<PageId> {
        &self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    fn object(tag: i64) -> (PageId, Arc<SerializedObject>) {
        let so = SerializedObject::serialize(&Value::tuple(vec![Value::Int64(tag), Value::string("p".repeat(30))]));
        (PageId::for_object(&so), so)
    }

    fn item_size() -> u64 {
        object(0).0.bytecount()
    }

    #[test]
    fn test_store_and_load() {
        let cache = SimpleOfflineCache::new(1 << 20, CallbackScheduler::inline());
        let (id, so) = object(1);
        cache.store(id, &so).unwrap();
        assert!(cache.already_exists(&id));
        assert_eq!(cache.cache_item_count(), 1);
        assert_eq!(cache.cache_size_used_bytes(), id.bytecount());

        let back = cache.load_if_exists(&id).unwrap().unwrap();
        assert_eq!(*back, *so);
        assert_eq!(cache.total_bytes_loaded(), id.bytecount());

        cache.load_if_exists(&id).unwrap().unwrap();
        let (missing, _) = object(2);
        assert!(cache.load_if_exists(&missing).unwrap().is_none());
        assert_eq!(cache.total_bytes_loaded(), 2 * id.bytecount());
    }

    #[test]
    fn test_lru_evicts_first_of_three() {
        let size = item_size();
        let cache = SimpleOfflineCache::new(size * 5 / 2, CallbackScheduler::inline());
        let pages: Vec<_> = (0..3).map(object).collect();
        for (id, so) in &pages {
            cache.store(*id, so).unwrap();
        }
        assert!(!cache.already_exists(&pages[0].0));
        assert!(cache.already_exists(&pages[1].0));
        assert!(cache.already_exists(&pages[2].0));
        assert!(cache.cache_size_used_bytes() <= cache.max_bytes());
        assert_eq!(cache.cache_items_dropped(), 1);
    }

    #[test]
    fn test_load_refreshes_recency() {
        let size = item_size();
        let cache = SimpleOfflineCache::new(size * 5 / 2, CallbackScheduler::inline());
        let pages: Vec<_> = (0..3).map(object).collect();
        cache.store(pages[0].0, &pages[0].1).unwrap();
        cache.store(pages[1].0, &pages[1].1).unwrap();
        cache.load_if_exists(&pages[0].0).unwrap();
        cache.store(pages[2].0, &pages[2].1).unwrap();

        assert!(cache.already_exists(&pages[0].0));
        assert!(!cache.already_exists(&pages[1].0));
    }

    #[test]
    fn test_existence_check_refreshes_recency() {
        let size = item_size();
        let cache = SimpleOfflineCache::new(size * 5 / 2, CallbackScheduler::inline());
        let pages: Vec<_> = (0..3).map(object).collect();
        cache.store(pages[0].0, &pages[0].1).unwrap();
        cache.store(pages[1].0, &pages[1].1).unwrap();
        assert!(cache.already_exists(&pages[0].0));
        cache.store(pages[2].0, &pages[2].1).unwrap();

        assert_eq!(cache.cache_item_count(), 2);
        assert!(cache.load_if_exists(&pages[0].0).unwrap().is_some());
        assert!(cache.load_if_exists(&pages[1].0).unwrap().is_none());
    }

    #[test]
    fn test_item_too_large_fails_fast() {
        let size = item_size();
        let cache = SimpleOfflineCache::new(size, CallbackScheduler::inline());
        let (id, so) = object(0);
        let err = cache.store(id, &so).unwrap_err();
        assert!(matches!(err, CacheError::ItemTooLarge { size: s, max } if s == size && max == size));
        assert_eq!(cache.cache_item_count(), 0);
    }

    #[test]
    fn test_overwrite_is_silent() {
        let cache = SimpleOfflineCache::new(1 << 20, CallbackScheduler::inline());
        let (id, so) = object(4);
        cache.store(id, &so).unwrap();
        cache.store(id, &so).unwrap();
        assert_eq!(cache.cache_item_count(), 1);
        assert_eq!(cache.cache_size_used_bytes(), id.bytecount());
        assert_eq!(cache.cache_items_dropped(), 0);
    }

    #[test]
    fn test_drop_is_idempotent() {
        let cache = SimpleOfflineCache::new(1 << 20, CallbackScheduler::inline());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.on_page_dropped().subscribe(move |p: &PageId| sink.lock().push(*p));

        let (id, so) = object(5);
        cache.store(id, &so).unwrap();
        assert!(cache.drop_page(&id).unwrap());
        assert!(!cache.drop_page(&id).unwrap());

        assert_eq!(*seen.lock(), vec![id]);
        assert_eq!(cache.cache_bytes_dropped(), id.bytecount());
        assert_eq!(cache.stats().item_count, 0);
    }
}
