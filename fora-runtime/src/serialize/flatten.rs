//! # Flattening
//!
//! Turns a [`SerializedObject`] into a self-describing byte block and back.
//!
//! ## Layout
//!
//! ```text
//! "FSO1"
//! types | judgments | expressions | cfgs     each: varint n, n × entry
//! memo:    varint kinds, kinds × (str kind, varint n, n × entry)
//! payload: varint chunks, chunks × (varint len, bytes)
//!
//! entry := 0x00 hash[32] node          first sighting
//!        | 0x01 varint node-number     already emitted
//!
//! memo entry := 0x00 hash[32] varint len bytes | 0x01 varint seen-index
//! ```
//!
//! `node` is the canonical shared-node encoding from [`super::wire`]. The
//! flattener keeps one node numbering for its whole life, so a node is
//! written once whether it first appears as a table entry, inside another
//! node, or in an earlier object; every later appearance is its number. The
//! matching inflater must see the same blocks in the same order. Table
//! entries are checked against their recorded hash, so corrupted entries are
//! rejected rather than silently admitted.

use std::collections::HashMap;
use std::sync::Arc;

use super::byte_block::ByteBlock;
use super::context::{IndexedTable, SerializedObjectContext};
use super::memo::{MemoEntry, MemoStorage};
use super::object::SerializedObject;
use super::wire::{CanonicalReader, CanonicalWriter, DecodedNodes, EmittedNodes, SharedNode, Wire, WireSink, WireSource};
use super::SerializeError;
use crate::hash::ContentHash;
use crate::memory::VectorDataMemoryManager;
use crate::model::{ControlFlowGraph, Expression, Judgment, Type};

const MAGIC: &[u8; 4] = b"FSO1";
const ENTRY_NEW: u8 = 0;
const ENTRY_SEEN: u8 = 1;

// ============================================================================
// Flattener
// ============================================================================

#[derive(Debug, Default)]
struct SeenHashes {
    index: HashMap<ContentHash, u32>,
}

impl SeenHashes {
    /// Back-reference index if seen, otherwise record and return `None`.
    fn check(&mut self, hash: ContentHash) -> Option<u32> {
        if let Some(&i) = self.index.get(&hash) {
            return Some(i);
        }
        let next = self.index.len() as u32;
        self.index.insert(hash, next);
        None
    }
}

/// Flattens serialized objects, emitting each distinct shared node once.
#[derive(Debug, Default)]
pub struct SerializedObjectFlattener {
    nodes: EmittedNodes,
    memo: HashMap<String, SeenHashes>,
}

impl SerializedObjectFlattener {
    /// A flattener with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten with a throwaway flattener.
    pub fn flatten_once(object: &SerializedObject) -> ByteBlock {
        Self::new().flatten(object)
    }

    /// Flatten `object`, sharing entries with earlier calls.
    pub fn flatten(&mut self, object: &SerializedObject) -> ByteBlock {
        let ctx = object.context();
        let mut head = CanonicalWriter::with_emitted(std::mem::take(&mut self.nodes));
        head.put(MAGIC);

        write_table(&mut head, ctx.types());
        write_table(&mut head, ctx.judgments());
        write_table(&mut head, ctx.expressions());
        write_table(&mut head, ctx.cfgs());

        let memo = ctx.memo();
        head.put_varint(memo.kinds().count() as u64);
        for (kind, table) in memo.kinds() {
            head.put_str(kind);
            head.put_varint(table.len() as u64);
            let seen = self.memo.entry(kind.to_owned()).or_default();
            for entry in table.iter() {
                match seen.check(entry.hash) {
                    Some(i) => {
                        head.put_u8(ENTRY_SEEN);
                        head.put_varint(i.into());
                    }
                    None => {
                        head.put_u8(ENTRY_NEW);
                        head.put_hash(&entry.hash);
                        head.put_bytes(&entry.bytes);
                    }
                }
            }
        }

        let payload = object.payload();
        head.put_varint(payload.chunk_count() as u64);

        let (mut pending, nodes) = head.into_parts();
        self.nodes = nodes;

        let mut block = ByteBlock::new();
        for chunk in payload.chunks() {
            let mut len = CanonicalWriter::new();
            len.put_varint(chunk.len() as u64);
            pending.extend_from_slice(&len.into_bytes());
            block.push(std::mem::take(&mut pending));
            block.push(Arc::clone(chunk));
        }
        block.push(pending);
        block
    }
}

fn write_table<T: SharedNode + Wire>(out: &mut CanonicalWriter, table: &IndexedTable<T>) {
    out.put_varint(table.len() as u64);
    for item in table.iter() {
        match out.emitted().index_of(item) {
            Some(i) => {
                out.put_u8(ENTRY_SEEN);
                out.put_varint(i.into());
            }
            None => {
                out.put_u8(ENTRY_NEW);
                out.put_hash(&item.content_hash());
                item.encode(out);
            }
        }
    }
}

// ============================================================================
// Inflater
// ============================================================================

/// Inverse of [`SerializedObjectFlattener`].
///
/// Any error poisons the inflater, since its history no longer matches the
/// flattener's.
pub struct SerializedObjectInflater {
    memory: Arc<VectorDataMemoryManager>,
    nodes: DecodedNodes,
    memo: HashMap<String, Vec<MemoEntry>>,
    poisoned: bool,
}

impl SerializedObjectInflater {
    /// An inflater decoding table entries with the free-store manager.
    pub fn new() -> Self {
        Self::with_memory(VectorDataMemoryManager::free_store())
    }

    /// An inflater charging decoded data to `memory`.
    pub fn with_memory(memory: Arc<VectorDataMemoryManager>) -> Self {
        Self {
            memory,
            nodes: DecodedNodes::default(),
            memo: HashMap::new(),
            poisoned: false,
        }
    }

    /// Inflate with a throwaway inflater.
    pub fn inflate_once(bytes: &[u8]) -> Result<Arc<SerializedObject>, SerializeError> {
        Self::new().inflate(bytes)
    }

    /// Inflate a block produced by [`ByteBlock::to_contiguous`].
    pub fn inflate_block(&mut self, block: &ByteBlock) -> Result<Arc<SerializedObject>, SerializeError> {
        self.inflate(&block.to_contiguous())
    }

    /// Inflate the next block from the paired flattener.
    pub fn inflate(&mut self, bytes: &[u8]) -> Result<Arc<SerializedObject>, SerializeError> {
        if self.poisoned {
            return Err(SerializeError::Malformed(
                "inflater poisoned by an earlier error".into(),
            ));
        }
        let result = self.inflate_inner(bytes);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Whether an earlier error has disabled this inflater.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn inflate_inner(&mut self, bytes: &[u8]) -> Result<Arc<SerializedObject>, SerializeError> {
        let nodes = std::mem::take(&mut self.nodes);
        let mut r = CanonicalReader::with_decoded(bytes, Arc::clone(&self.memory), nodes);
        let result = self.read_object(&mut r);
        self.nodes = r.into_decoded();
        result
    }

    fn read_object(&mut self, r: &mut CanonicalReader<'_>) -> Result<Arc<SerializedObject>, SerializeError> {
        if r.take(MAGIC.len())? != MAGIC {
            return Err(SerializeError::BadMagic);
        }

        let types = read_table::<Type>(r)?;
        let judgments = read_table::<Judgment>(r)?;
        let expressions = read_table::<Expression>(r)?;
        let cfgs = read_table::<ControlFlowGraph>(r)?;

        let mut memo = MemoStorage::new();
        let kinds = r.get_len(1)?;
        for _ in 0..kinds {
            let kind = r.get_str()?;
            let count = r.get_len(1)?;
            let known = self.memo.entry(kind.clone()).or_default();
            for _ in 0..count {
                let entry = match r.get_u8()? {
                    ENTRY_NEW => {
                        let hash = r.get_hash()?;
                        let bytes = r.get_bytes()?;
                        if ContentHash::of(&bytes) != hash {
                            return Err(SerializeError::HashMismatch { kind: "memo" });
                        }
                        let entry = MemoEntry {
                            hash,
                            bytes: bytes.into(),
                        };
                        known.push(entry.clone());
                        entry
                    }
                    ENTRY_SEEN => {
                        let index = r.get_varint()?;
                        usize::try_from(index)
                            .ok()
                            .and_then(|i| known.get(i))
                            .cloned()
                            .ok_or(SerializeError::MissingIndex { kind: "memo", index })?
                    }
                    tag => {
                        return Err(SerializeError::InvalidTag {
                            what: "memo entry",
                            tag: tag.into(),
                        })
                    }
                };
                memo.insert(&kind, entry);
            }
        }

        let mut payload = ByteBlock::new();
        let chunks = r.get_len(1)?;
        for _ in 0..chunks {
            let len = r.get_len(1)?;
            payload.push(r.take(len)?.to_vec());
        }
        r.finish()?;

        let context = SerializedObjectContext::from_parts(types, judgments, expressions, cfgs, memo);
        Ok(Arc::new(SerializedObject::new(payload, context)))
    }
}

impl Default for SerializedObjectInflater {
    fn default() -> Self {
        Self::new()
    }
}

fn read_table<T: SharedNode + Wire>(r: &mut CanonicalReader<'_>) -> Result<IndexedTable<T>, SerializeError> {
    let mut table = IndexedTable::default();
    let count = r.get_len(1)?;
    for _ in 0..count {
        let item = match r.get_u8()? {
            ENTRY_NEW => {
                let hash = r.get_hash()?;
                let item = T::decode(r)?;
                if item.content_hash() != hash {
                    return Err(SerializeError::HashMismatch { kind: T::KIND });
                }
                item
            }
            ENTRY_SEEN => {
                let index = r.get_varint()?;
                r.node_at::<T>(index)?
            }
            tag => {
                return Err(SerializeError::InvalidTag {
                    what: "table entry",
                    tag: tag.into(),
                })
            }
        };
        table.insert(item);
    }
    Ok(table)
}
