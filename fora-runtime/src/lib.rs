//! # FORA Runtime Core
//!
//! The in-process value layer of the FORA runtime:
//!
//! - **Tagged values**: reference-counted tagged unions behind every
//!   structural node (types, judgments, expressions, control-flow graphs)
//! - **Vector memory**: a best-fit offset pool and the shared
//!   [`VectorDataMemoryManager`] budget that vector data draws on
//! - **Pages**: packed value arrays, frozen pagelets and vector pages
//! - **Serialization**: hash-addressed serialized objects with explicit
//!   contexts, memo storage, and deduplicating flatten/inflate
//! - **Offline caches**: RAM (LRU) and disk tiers keyed by [`PageId`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        FORA RUNTIME                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │    model     │──▶│  serialize   │──▶│    cache     │      │
//! │  │ (tagged.rs)  │   │ (flatten.rs) │   │  (disk.rs)   │      │
//! │  └──────────────┘   └──────────────┘   └──────────────┘      │
//! │         │                  ▲                  │              │
//! │         ▼                  │                  ▼              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │    vector    │──▶│    memory    │   │    event     │      │
//! │  │  (page.rs)   │   │  (pool.rs)   │   │(scheduler.rs)│      │
//! │  └──────────────┘   └──────────────┘   └──────────────┘      │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod event;
pub mod hash;
pub mod log;
pub mod memory;
pub mod model;
pub mod scheduler;
pub mod serialize;
pub mod slot_table;
pub mod tagged;
pub mod vector;

// Re-exports
pub use cache::{CacheError, DiskOfflineCache, OfflineCache, SimpleOfflineCache};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use event::{EventBroadcaster, SubscriptionId};
pub use hash::{ContentHash, ContentHasher};
pub use memory::{MemoryError, MemoryPool, PoolAllocation, PoolKind, VectorDataMemoryManager};
pub use model::{ControlFlowGraph, Expression, Judgment, Type, Value};
pub use scheduler::CallbackScheduler;
pub use serialize::{
    ByteBlock, ReadNext, SerializeError, SerializedObject, SerializedObjectContext, SerializedObjectFlattener,
    SerializedObjectInflater,
};
pub use slot_table::{SlotError, SlotTable};
pub use tagged::{RawTagged, Tagged, TaggedError};
pub use vector::{ForaValueArray, PageId, Pagelet, PageletBuilder, VectorDataId, VectorPage, VectorPageBuilder};

use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors assembling a [`Runtime`].
#[derive(Debug, Error)]
pub enum InitError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A cache tier could not be opened.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The shared services one process needs to hold and park pages.
pub struct Runtime {
    /// Configuration the runtime was built from.
    pub config: RuntimeConfig,
    /// Budget for vector data.
    pub memory: Arc<VectorDataMemoryManager>,
    /// Delivers cache drop notifications.
    pub scheduler: Arc<CallbackScheduler>,
    /// In-memory cache tier.
    pub ram_cache: Arc<SimpleOfflineCache>,
    /// Disk cache tier, when a path is configured.
    pub disk_cache: Option<Arc<DiskOfflineCache>>,
}

/// Build a runtime from `config`.
///
/// Installs the log subscriber if none is set and records `config` as the
/// process-wide configuration.
pub fn init_with_runtime_config(config: RuntimeConfig) -> Result<Runtime, InitError> {
    config.validate()?;
    log::init(&config.log);
    let _ = RUNTIME_CONFIG.set(config.clone());

    let memory = VectorDataMemoryManager::from_config(&config.memory);
    let scheduler = CallbackScheduler::from_config("fora-callbacks", &config.scheduler);
    let ram_cache = Arc::new(SimpleOfflineCache::from_config(&config.cache, Arc::clone(&scheduler)));
    let disk_cache = match config.cache.disk_path {
        Some(_) => Some(Arc::new(DiskOfflineCache::from_config(
            &config.cache,
            Arc::clone(&scheduler),
        )?)),
        None => None,
    };

    tracing::info!(
        version = VERSION,
        vdmm_max_bytes = config.memory.vdmm_max_bytes,
        disk = disk_cache.is_some(),
        "fora runtime initialized"
    );

    Ok(Runtime {
        config,
        memory,
        scheduler,
        ram_cache,
        disk_cache,
    })
}

/// Build a runtime from `FORA_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the variables read.
pub fn init_from_env() -> Result<Runtime, InitError> {
    init_with_runtime_config(RuntimeConfig::from_env())
}

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// The configuration of the first runtime built in this process.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}
