//! On-disk tier: one flattened file per page.
//!
//! Files are named `<hex guid>_<bytecount>` inside a directory that must be
//! empty when the cache is created. Writes go to a temporary file that is
//! renamed into place, so a reader never sees a partial file.
//!
//! Eviction keeps no recency metadata. A cursor hash is derived from the
//! incoming page and an eviction counter, and the first idle page at or
//! after the cursor (wrapping around) is removed. Pages being read or
//! written are never evicted; a drop requested while a page is busy is
//! deferred until its last I/O finishes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::{CacheError, OfflineCache};
use crate::config::CacheConfig;
use crate::event::EventBroadcaster;
use crate::hash::ContentHasher;
use crate::scheduler::CallbackScheduler;
use crate::serialize::{ByteBlock, SerializedObject, SerializedObjectFlattener, SerializedObjectInflater};
use crate::vector::PageId;

/// Eviction gives up after this many passes that found only busy pages.
const MAX_STALLED_PASSES: u32 = 100;

/// How long one stalled pass waits for I/O to finish.
const STALL_WAIT: Duration = Duration::from_millis(10);

#[derive(Default)]
struct DiskState {
    files: BTreeMap<PageId, u64>,
    bytes_used: u64,
    busy: HashMap<PageId, u32>,
    deferred_drops: HashSet<PageId>,
    evictions: u64,
}

#[derive(Debug, Default)]
struct Telemetry {
    bytes_loaded: AtomicU64,
    bytes_dumped: AtomicU64,
    files_dumped: AtomicU64,
    open_file_handles: AtomicU64,
    bytes_dropped: AtomicU64,
    items_dropped: AtomicU64,
}

/// Point-in-time disk I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskTelemetry {
    /// Bytes read back from disk.
    pub total_bytes_loaded: u64,
    /// Bytes written to disk.
    pub total_bytes_dumped: u64,
    /// Files written.
    pub total_files_dumped: u64,
    /// Files open right now.
    pub open_file_handles: u64,
}

/// A file handle counted in `open_file_handles` while it lives.
struct TrackedFile<'a> {
    file: File,
    open: &'a AtomicU64,
}

impl<'a> TrackedFile<'a> {
    fn new(file: File, open: &'a AtomicU64) -> Self {
        open.fetch_add(1, Ordering::Relaxed);
        Self { file, open }
    }
}

impl Drop for TrackedFile<'_> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Stores each page as a file and evicts over a byte and an item budget.
pub struct DiskOfflineCache {
    dir: PathBuf,
    max_bytes: u64,
    max_items: u64,
    state: Mutex<DiskState>,
    io_finished: Condvar,
    telemetry: Telemetry,
    tmp_counter: AtomicU64,
    dropped: EventBroadcaster<PageId>,
}

impl DiskOfflineCache {
    /// Create a cache in `dir`, which is created if missing and must be empty.
    pub fn new(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        max_items: u64,
        scheduler: Arc<CallbackScheduler>,
    ) -> Result<Self, CacheError> {
        if max_bytes == 0 || max_items == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "disk cache budgets must be positive (bytes: {max_bytes}, items: {max_items})"
            )));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if fs::read_dir(&dir)?.next().is_some() {
            return Err(CacheError::DirectoryNotEmpty(dir));
        }
        info!(dir = %dir.display(), max_bytes, max_items, "opened disk cache");

        Ok(Self {
            dir,
            max_bytes,
            max_items,
            state: Mutex::new(DiskState::default()),
            io_finished: Condvar::new(),
            telemetry: Telemetry::default(),
            tmp_counter: AtomicU64::new(0),
            dropped: EventBroadcaster::new(scheduler),
        })
    }

    /// Build from configuration. Fails when no path is configured.
    pub fn from_config(config: &CacheConfig, scheduler: Arc<CallbackScheduler>) -> Result<Self, CacheError> {
        let dir = config
            .disk_path
            .clone()
            .ok_or_else(|| CacheError::InvalidConfig("no disk cache path configured".into()))?;
        Self::new(dir, config.disk_max_bytes, config.disk_max_items, scheduler)
    }

    /// Base directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Byte budget.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Item budget.
    pub fn max_items(&self) -> u64 {
        self.max_items
    }

    /// Bytes read back from disk.
    pub fn total_bytes_loaded(&self) -> u64 {
        self.telemetry.bytes_loaded.load(Ordering::Relaxed)
    }

    /// Bytes written to disk.
    pub fn total_bytes_dumped(&self) -> u64 {
        self.telemetry.bytes_dumped.load(Ordering::Relaxed)
    }

    /// Files written.
    pub fn total_files_dumped(&self) -> u64 {
        self.telemetry.files_dumped.load(Ordering::Relaxed)
    }

    /// Files open right now.
    pub fn open_file_handles(&self) -> u64 {
        self.telemetry.open_file_handles.load(Ordering::Relaxed)
    }

    /// All I/O counters at once.
    pub fn telemetry(&self) -> DiskTelemetry {
        DiskTelemetry {
            total_bytes_loaded: self.total_bytes_loaded(),
            total_bytes_dumped: self.total_bytes_dumped(),
            total_files_dumped: self.total_files_dumped(),
            open_file_handles: self.open_file_handles(),
        }
    }

    /// Path of the file holding `page`.
    pub fn path_for(&self, page: &PageId) -> PathBuf {
        self.dir.join(page.filename())
    }

    // ========================================================================
    // I/O
    // ========================================================================

    fn write_file(&self, page: &PageId, data: &ByteBlock) -> io::Result<()> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(".{}.tmp{n}", page.filename()));

        let written = (|| {
            let mut out = TrackedFile::new(File::create(&tmp)?, &self.telemetry.open_file_handles);
            for chunk in data.chunks() {
                out.file.write_all(chunk)?;
            }
            drop(out);
            fs::rename(&tmp, self.path_for(page))
        })();

        match written {
            Ok(()) => {
                self.telemetry
                    .bytes_dumped
                    .fetch_add(data.total_byte_count() as u64, Ordering::Relaxed);
                self.telemetry.files_dumped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn read_file(&self, page: &PageId) -> io::Result<Vec<u8>> {
        let mut input = TrackedFile::new(File::open(self.path_for(page))?, &self.telemetry.open_file_handles);
        let mut bytes = Vec::with_capacity(usize::try_from(page.bytecount()).unwrap_or(0));
        input.file.read_to_end(&mut bytes)?;
        self.telemetry
            .bytes_loaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    // ========================================================================
    // Bookkeeping (called with the state lock held)
    // ========================================================================

    fn begin_io(&self, page: &PageId) {
        *self.state.lock().busy.entry(*page).or_insert(0) += 1;
    }

    fn end_io(&self, state: &mut DiskState, page: &PageId, dropped: &mut Vec<(PageId, u64)>) {
        let idle = match state.busy.get_mut(page) {
            Some(n) => {
                *n -= 1;
                *n == 0
            }
            None => false,
        };
        if idle {
            state.busy.remove(page);
            if state.deferred_drops.contains(page) {
                debug!(%page, "running deferred drop");
                self.remove_locked(state, page, dropped);
            }
        }
        self.io_finished.notify_all();
    }

    fn request_drop_locked(&self, state: &mut DiskState, page: &PageId, dropped: &mut Vec<(PageId, u64)>) -> bool {
        if !state.files.contains_key(page) || state.deferred_drops.contains(page) {
            return false;
        }
        if state.busy.contains_key(page) {
            debug!(%page, "deferring drop of busy page");
            state.deferred_drops.insert(*page);
        } else {
            self.remove_locked(state, page, dropped);
        }
        true
    }

    fn remove_locked(&self, state: &mut DiskState, page: &PageId, dropped: &mut Vec<(PageId, u64)>) {
        state.deferred_drops.remove(page);
        let Some(size) = state.files.remove(page) else {
            return;
        };
        state.bytes_used -= size;
        if let Err(e) = fs::remove_file(self.path_for(page)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(%page, error = %e, "failed to remove cache file");
            }
        }
        dropped.push((*page, size));
    }

    fn pick_victim(state: &DiskState, keep: &PageId) -> Option<PageId> {
        let mut h = ContentHasher::new();
        h.update_str("fora.disk-evict");
        h.update_hash(&keep.guid());
        h.update_u64(state.evictions);
        let cursor = PageId::new(h.finalize(), 0);

        state
            .files
            .range(cursor..)
            .chain(state.files.range(..cursor))
            .map(|(p, _)| *p)
            .find(|p| p != keep && !state.busy.contains_key(p))
    }

    fn evict(
        &self,
        state: &mut MutexGuard<'_, DiskState>,
        keep: &PageId,
        dropped: &mut Vec<(PageId, u64)>,
    ) -> Result<(), CacheError> {
        let mut stalled = 0;
        while state.bytes_used > self.max_bytes || state.files.len() as u64 > self.max_items {
            match Self::pick_victim(state, keep) {
                Some(victim) => {
                    state.evictions += 1;
                    debug!(page = %victim, "evicting page from disk cache");
                    self.remove_locked(state, &victim, dropped);
                }
                None => {
                    stalled += 1;
                    if stalled >= MAX_STALLED_PASSES {
                        warn!(passes = stalled, "disk cache eviction stalled");
                        return Err(CacheError::EvictionStalled { passes: stalled });
                    }
                    self.io_finished.wait_for(state, STALL_WAIT);
                }
            }
        }
        Ok(())
    }

    fn record_drops(&self, dropped: Vec<(PageId, u64)>) {
        for (page, bytes) in dropped {
            self.telemetry.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
            self.telemetry.items_dropped.fetch_add(1, Ordering::Relaxed);
            self.dropped.broadcast(page);
        }
    }
}

impl OfflineCache for DiskOfflineCache {
    fn store(&self, page: PageId, data: &Arc<SerializedObject>) -> Result<(), CacheError> {
        let flat = SerializedObjectFlattener::flatten_once(data);
        let size = flat.total_byte_count() as u64;
        if size > self.max_bytes {
            return Err(CacheError::ItemTooLarge {
                size,
                max: self.max_bytes,
            });
        }

        self.begin_io(&page);
        let written = self.write_file(&page, &flat);

        let mut dropped = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let result = match written {
                Ok(()) => {
                    let old = state.files.insert(page, size);
                    if let Some(old) = old {
                        state.bytes_used -= old;
                    }
                    state.bytes_used += size;
                    // The fresh file replaces the one a pending drop was waiting on.
                    if state.deferred_drops.remove(&page) {
                        debug!(%page, "store supersedes deferred drop");
                        dropped.push((page, old.unwrap_or(size)));
                    }
                    trace!(%page, size, "stored page on disk");
                    Ok(())
                }
                Err(e) => Err(CacheError::from(e)),
            };
            self.end_io(&mut state, &page, &mut dropped);
            match result {
                Ok(()) => self.evict(&mut state, &page, &mut dropped),
                Err(e) => Err(e),
            }
        };
        self.record_drops(dropped);
        result
    }

    fn drop_page(&self, page: &PageId) -> Result<bool, CacheError> {
        let mut dropped = Vec::new();
        let requested = self.request_drop_locked(&mut self.state.lock(), page, &mut dropped);
        if requested {
            info!(%page, "dropped page from disk cache");
        }
        self.record_drops(dropped);
        Ok(requested)
    }

    fn already_exists(&self, page: &PageId) -> bool {
        let state = self.state.lock();
        state.files.contains_key(page) && !state.deferred_drops.contains(page)
    }

    fn load_if_exists(&self, page: &PageId) -> Result<Option<Arc<SerializedObject>>, CacheError> {
        {
            let mut state = self.state.lock();
            if !state.files.contains_key(page) || state.deferred_drops.contains(page) {
                return Ok(None);
            }
            *state.busy.entry(*page).or_insert(0) += 1;
        }

        let result = self
            .read_file(page)
            .map_err(CacheError::from)
            .and_then(|bytes| Ok(SerializedObjectInflater::inflate_once(&bytes)?));

        let mut dropped = Vec::new();
        {
            let mut state = self.state.lock();
            if let Err(e) = &result {
                warn!(%page, error = %e, "unreadable cache file, dropping page");
                self.request_drop_locked(&mut state, page, &mut dropped);
            }
            self.end_io(&mut state, page, &mut dropped);
        }
        self.record_drops(dropped);

        if result.is_ok() {
            trace!(%page, "loaded page from disk");
        }
        result.map(Some)
    }

    fn cache_size_used_bytes(&self) -> u64 {
        self.state.lock().bytes_used
    }

    fn cache_item_count(&self) -> u64 {
        self.state.lock().files.len() as u64
    }

    fn cache_bytes_dropped(&self) -> u64 {
        self.telemetry.bytes_dropped.load(Ordering::Relaxed)
    }

    fn cache_items_dropped(&self) -> u64 {
        self.telemetry.items_dropped.load(Ordering::Relaxed)
    }

    fn on_page_dropped(&self) -> &EventBroadcaster<PageId> {
        &self.dropped
    }
}
