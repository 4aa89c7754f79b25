//! # Offline Caches
//!
//! Pages that leave working memory are parked in an [`OfflineCache`] keyed
//! by [`PageId`]. Two tiers are provided:
//!
//! | Tier | Storage | Eviction |
//! |------|---------|----------|
//! | [`SimpleOfflineCache`] | serialized objects in RAM | strict LRU |
//! | [`DiskOfflineCache`] | one flattened file per page | hash-seeded pseudo-random |
//!
//! Every page that leaves a cache, whether dropped explicitly or evicted,
//! is announced exactly once through [`OfflineCache::on_page_dropped`].

pub mod disk;
pub mod simple;

pub use disk::{DiskOfflineCache, DiskTelemetry};
pub use simple::SimpleOfflineCache;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::event::EventBroadcaster;
use crate::serialize::{SerializeError, SerializedObject};
use crate::vector::PageId;

/// Offline cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The item alone would fill the cache.
    #[error("item of {size} bytes does not fit a cache of {max} bytes")]
    ItemTooLarge {
        /// Flattened item size.
        size: u64,
        /// Cache budget.
        max: u64,
    },

    /// Filesystem failure.
    #[error("cache i/o error: {0}")]
    Io(#[from] io::Error),

    /// A stored entry could not be decoded.
    #[error("corrupt cache entry: {0}")]
    Corrupt(#[from] SerializeError),

    /// The disk cache directory already holds files.
    #[error("cache directory {} is not empty", .0.display())]
    DirectoryNotEmpty(PathBuf),

    /// Every eviction candidate stayed busy.
    #[error("eviction made no progress after {passes} passes")]
    EvictionStalled {
        /// Passes attempted.
        passes: u32,
    },

    /// Unusable budget or path.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Bytes currently stored.
    pub bytes_used: u64,
    /// Items currently stored.
    pub item_count: u64,
    /// Bytes that have left the cache.
    pub bytes_dropped: u64,
    /// Items that have left the cache.
    pub items_dropped: u64,
}

/// A store of serialized pages keyed by [`PageId`].
pub trait OfflineCache: Send + Sync {
    /// Store `data` under `page`, replacing any previous entry.
    fn store(&self, page: PageId, data: &Arc<SerializedObject>) -> Result<(), CacheError>;

    /// Remove `page`. Returns `false` when it was not present.
    fn drop_page(&self, page: &PageId) -> Result<bool, CacheError>;

    /// Whether `page` is stored.
    fn already_exists(&self, page: &PageId) -> bool;

    /// The stored object, if present.
    fn load_if_exists(&self, page: &PageId) -> Result<Option<Arc<SerializedObject>>, CacheError>;

    /// Bytes currently stored.
    fn cache_size_used_bytes(&self) -> u64;

    /// Items currently stored.
    fn cache_item_count(&self) -> u64;

    /// Bytes that have left the cache.
    fn cache_bytes_dropped(&self) -> u64;

    /// Items that have left the cache.
    fn cache_items_dropped(&self) -> u64;

    /// Announces each page that leaves the cache.
    fn on_page_dropped(&self) -> &EventBroadcaster<PageId>;

    /// All counters at once.
    fn stats(&self) -> CacheStats {
        CacheStats {
            bytes_used: self.cache_size_used_bytes(),
            item_count: self.cache_item_count(),
            bytes_dropped: self.cache_bytes_dropped(),
            items_dropped: self.cache_items_dropped(),
        }
    }
}
