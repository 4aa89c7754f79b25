//! Memo storage: large shared values stored once per serialized object and
//! referenced by index, keyed by the content hash of their canonical bytes.
//!
//! Entries hold canonical bytes rather than typed values, so a memo table
//! can be flattened, deduplicated and inflated without knowing its kinds.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::context::{ContentKeyed, IndexedTable};
use super::wire::{CanonicalWriter, WireSink, WireSource};
use super::SerializeError;
use crate::hash::{ContentHash, ContentHasher};

/// A value stored in memo storage instead of inline.
pub trait Memoizable: Clone + Send + Sync + 'static {
    /// Memo table name. Must be unique per implementing type.
    const KIND: &'static str;

    /// Hash of the canonical encoding. Override to return a cached value;
    /// the result must equal the default.
    fn memo_hash(&self) -> ContentHash {
        ContentHash::of(&CanonicalWriter::encode_memo(self))
    }

    /// Write the value.
    fn encode_memo<S: WireSink>(&self, sink: &mut S);

    /// Read the value.
    fn decode_memo<R: WireSource>(source: &mut R) -> Result<Self, SerializeError>;
}

/// One stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoEntry {
    /// Hash of `bytes`.
    pub hash: ContentHash,
    /// Canonical encoding.
    pub bytes: Arc<[u8]>,
}

impl MemoEntry {
    /// Wrap canonical bytes, computing their hash.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            hash: ContentHash::of(&bytes),
            bytes: bytes.into(),
        }
    }
}

impl ContentKeyed for MemoEntry {
    fn content_hash(&self) -> ContentHash {
        self.hash
    }
}

/// Per-kind tables of memo entries.
#[derive(Debug, Clone, Default)]
pub struct MemoStorage {
    kinds: BTreeMap<String, IndexedTable<MemoEntry>>,
}

impl MemoStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value` in its kind's table, encoding it on first sight.
    pub fn memoize<M: Memoizable>(&mut self, value: &M) -> u32 {
        let hash = value.memo_hash();
        let table = self.kinds.entry(M::KIND.to_owned()).or_default();
        if let Some(index) = table.index_of(&hash) {
            return index;
        }
        let bytes = CanonicalWriter::encode_memo(value);
        debug_assert_eq!(ContentHash::of(&bytes), hash, "memo_hash disagrees with encoding");
        table.insert(MemoEntry {
            hash,
            bytes: bytes.into(),
        })
    }

    /// Insert a decoded entry under `kind`.
    pub fn insert(&mut self, kind: &str, entry: MemoEntry) -> u32 {
        match self.kinds.get_mut(kind) {
            Some(table) => table.insert(entry),
            None => self.kinds.entry(kind.to_owned()).or_default().insert(entry),
        }
    }

    /// Entry `index` of `kind`.
    pub fn get(&self, kind: &str, index: u32) -> Option<&MemoEntry> {
        self.kinds.get(kind).and_then(|t| t.get(index))
    }

    /// Tables in kind order.
    pub fn kinds(&self) -> impl Iterator<Item = (&str, &IndexedTable<MemoEntry>)> {
        self.kinds.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.kinds.values().map(IndexedTable::len).sum()
    }

    /// Whether no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of entry byte lengths.
    pub fn total_bytes(&self) -> usize {
        self.kinds
            .values()
            .flat_map(IndexedTable::iter)
            .map(|e| e.bytes.len())
            .sum()
    }

    pub(crate) fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.update_u64(self.kinds.len() as u64);
        for (kind, table) in &self.kinds {
            hasher.update_str(kind);
            table.hash_into(hasher);
        }
    }
}
