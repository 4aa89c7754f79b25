//! # Serialization Context
//!
//! A [`SerializedObjectContext`] owns the index tables for one serialized
//! object. It is passed explicitly: [`ContextSerializer`] borrows it mutably
//! while writing, [`ContextDeserializer`] borrows it shared while reading.
//!
//! On write, the first reference to a shared node appends it to its table;
//! every reference, first or not, is written as the node's index. Tables are
//! keyed by content hash, so structurally equal nodes share one index even
//! when they are distinct allocations.
//!
//! On read, the context is the one captured in the [`SerializedObject`]
//! being decoded, so indices resolve to the same nodes they were assigned to.
//!
//! [`SerializedObject`]: super::SerializedObject

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use super::byte_block::ByteBlock;
use super::memo::{MemoStorage, Memoizable};
use super::wire::{CanonicalReader, Wire, WireSink, WireSource};
use super::SerializeError;
use crate::hash::{ContentHash, ContentHasher};
use crate::memory::VectorDataMemoryManager;
use crate::model::{ControlFlowGraph, Expression, Judgment, Type};

/// Values that carry their own content hash.
pub trait ContentKeyed {
    /// The value's content hash.
    fn content_hash(&self) -> ContentHash;
}

impl ContentKeyed for Type {
    fn content_hash(&self) -> ContentHash {
        self.hash()
    }
}

impl ContentKeyed for Judgment {
    fn content_hash(&self) -> ContentHash {
        self.hash()
    }
}

impl ContentKeyed for Expression {
    fn content_hash(&self) -> ContentHash {
        self.hash()
    }
}

impl ContentKeyed for ControlFlowGraph {
    fn content_hash(&self) -> ContentHash {
        self.hash()
    }
}

// ============================================================================
// Indexed Table
// ============================================================================

/// An insertion-ordered set keyed by content hash, addressed by `u32` index.
#[derive(Debug, Clone)]
pub struct IndexedTable<T> {
    by_hash: HashMap<ContentHash, u32>,
    items: Vec<T>,
}

impl<T> Default for IndexedTable<T> {
    fn default() -> Self {
        Self {
            by_hash: HashMap::new(),
            items: Vec::new(),
        }
    }
}

impl<T: ContentKeyed> IndexedTable<T> {
    /// Index of `item`, appending it if unseen.
    pub fn insert(&mut self, item: T) -> u32 {
        let hash = item.content_hash();
        if let Some(&index) = self.by_hash.get(&hash) {
            return index;
        }
        let index = self.items.len() as u32;
        self.by_hash.insert(hash, index);
        self.items.push(item);
        index
    }

    /// Index of the item with `hash`.
    pub fn index_of(&self, hash: &ContentHash) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    /// Item at `index`.
    pub fn get(&self, index: u32) -> Option<&T> {
        self.items.get(index as usize)
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub(crate) fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.update_u64(self.items.len() as u64);
        for item in &self.items {
            hasher.update_hash(&item.content_hash());
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Index tables and memo storage for one serialized object.
#[derive(Debug, Clone, Default)]
pub struct SerializedObjectContext {
    types: IndexedTable<Type>,
    judgments: IndexedTable<Judgment>,
    expressions: IndexedTable<Expression>,
    cfgs: IndexedTable<ControlFlowGraph>,
    memo: MemoStorage,
}

impl SerializedObjectContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a context from decoded tables.
    pub fn from_parts(
        types: IndexedTable<Type>,
        judgments: IndexedTable<Judgment>,
        expressions: IndexedTable<Expression>,
        cfgs: IndexedTable<ControlFlowGraph>,
        memo: MemoStorage,
    ) -> Self {
        Self {
            types,
            judgments,
            expressions,
            cfgs,
            memo,
        }
    }

    /// Encode `value` against this context and return the payload bytes.
    pub fn serialize<T: Wire>(&mut self, value: &T) -> ByteBlock {
        let mut ser = ContextSerializer::new(self);
        value.encode(&mut ser);
        ser.finish()
    }

    /// Decode a value from `payload`, which must be consumed completely.
    pub fn deserialize<T: Wire>(
        &self,
        payload: &ByteBlock,
        memory: &Arc<VectorDataMemoryManager>,
    ) -> Result<T, SerializeError> {
        let bytes = payload.to_contiguous();
        let mut de = ContextDeserializer::new(self, &bytes, Arc::clone(memory));
        let value = T::decode(&mut de)?;
        de.finish()?;
        Ok(value)
    }

    /// Types referenced so far.
    pub fn types(&self) -> &IndexedTable<Type> {
        &self.types
    }

    /// Judgments referenced so far.
    pub fn judgments(&self) -> &IndexedTable<Judgment> {
        &self.judgments
    }

    /// Expressions referenced so far.
    pub fn expressions(&self) -> &IndexedTable<Expression> {
        &self.expressions
    }

    /// Control-flow graphs referenced so far.
    pub fn cfgs(&self) -> &IndexedTable<ControlFlowGraph> {
        &self.cfgs
    }

    /// Memo storage.
    pub fn memo(&self) -> &MemoStorage {
        &self.memo
    }

    pub(crate) fn hash_into(&self, hasher: &mut ContentHasher) {
        self.types.hash_into(hasher);
        self.judgments.hash_into(hasher);
        self.expressions.hash_into(hasher);
        self.cfgs.hash_into(hasher);
        self.memo.hash_into(hasher);
    }
}

// ============================================================================
// Serializer
// ============================================================================

/// Writes a payload, replacing shared nodes by context indices.
pub struct ContextSerializer<'a> {
    ctx: &'a mut SerializedObjectContext,
    out: Vec<u8>,
}

impl<'a> ContextSerializer<'a> {
    /// Start a payload against `ctx`.
    pub fn new(ctx: &'a mut SerializedObjectContext) -> Self {
        Self { ctx, out: Vec::new() }
    }

    /// Finish the payload.
    pub fn finish(self) -> ByteBlock {
        ByteBlock::from(self.out)
    }
}

impl WireSink for ContextSerializer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn put_type(&mut self, ty: &Type) {
        let index = self.ctx.types.insert(ty.clone());
        self.put_varint(index.into());
    }

    fn put_judgment(&mut self, jov: &Judgment) {
        let index = self.ctx.judgments.insert(jov.clone());
        self.put_varint(index.into());
    }

    fn put_expression(&mut self, expr: &Expression) {
        let index = self.ctx.expressions.insert(expr.clone());
        self.put_varint(index.into());
    }

    fn put_cfg(&mut self, cfg: &ControlFlowGraph) {
        let index = self.ctx.cfgs.insert(cfg.clone());
        self.put_varint(index.into());
    }

    fn put_memo<M: Memoizable>(&mut self, value: &M) {
        let index = self.ctx.memo.memoize(value);
        self.put_varint(index.into());
    }
}

// ============================================================================
// Deserializer
// ============================================================================

/// Reads a payload, resolving indices through a context.
///
/// Memoized values are decoded once per deserializer and shared afterwards.
pub struct ContextDeserializer<'a> {
    ctx: &'a SerializedObjectContext,
    bytes: &'a [u8],
    pos: usize,
    depth: u32,
    memory: Arc<VectorDataMemoryManager>,
    decoded_memos: HashMap<(&'static str, u32), Box<dyn Any + Send + Sync>>,
}

impl<'a> ContextDeserializer<'a> {
    /// Read `bytes` against `ctx`.
    pub fn new(ctx: &'a SerializedObjectContext, bytes: &'a [u8], memory: Arc<VectorDataMemoryManager>) -> Self {
        Self {
            ctx,
            bytes,
            pos: 0,
            depth: 0,
            memory,
            decoded_memos: HashMap::new(),
        }
    }

    /// Fail if any input is left.
    pub fn finish(&self) -> Result<(), SerializeError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            n => Err(SerializeError::TrailingBytes(n)),
        }
    }

    fn get_index(&mut self) -> Result<u32, SerializeError> {
        let raw = self.get_varint()?;
        u32::try_from(raw).map_err(|_| SerializeError::MissingIndex {
            kind: "any",
            index: raw,
        })
    }

    fn lookup<T: Clone>(table: &IndexedTable<T>, kind: &'static str, index: u32) -> Result<T, SerializeError>
    where
        T: ContentKeyed,
    {
        table.get(index).cloned().ok_or(SerializeError::MissingIndex {
            kind,
            index: index.into(),
        })
    }
}

impl WireSource for ContextDeserializer<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], SerializeError> {
        let end = self.pos.checked_add(n).ok_or(SerializeError::UnexpectedEof)?;
        let slice = self.bytes.get(self.pos..end).ok_or(SerializeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn memory(&self) -> &Arc<VectorDataMemoryManager> {
        &self.memory
    }

    fn get_type(&mut self) -> Result<Type, SerializeError> {
        let index = self.get_index()?;
        Self::lookup(&self.ctx.types, "type", index)
    }

    fn get_judgment(&mut self) -> Result<Judgment, SerializeError> {
        let index = self.get_index()?;
        Self::lookup(&self.ctx.judgments, "judgment", index)
    }

    fn get_expression(&mut self) -> Result<Expression, SerializeError> {
        let index = self.get_index()?;
        Self::lookup(&self.ctx.expressions, "expression", index)
    }

    fn get_cfg(&mut self) -> Result<ControlFlowGraph, SerializeError> {
        let index = self.get_index()?;
        Self::lookup(&self.ctx.cfgs, "control flow graph", index)
    }

    fn get_memo<M: Memoizable>(&mut self) -> Result<M, SerializeError> {
        let index = self.get_index()?;
        if let Some(cached) = self.decoded_memos.get(&(M::KIND, index)) {
            if let Some(value) = cached.downcast_ref::<M>() {
                return Ok(value.clone());
            }
        }

        let ctx = self.ctx;
        let entry = ctx.memo.get(M::KIND, index).ok_or(SerializeError::MissingIndex {
            kind: M::KIND,
            index: index.into(),
        })?;
        let value: M = CanonicalReader::decode_memo_all(&entry.bytes, Arc::clone(&self.memory))?;
        self.decoded_memos.insert((M::KIND, index), Box::new(value.clone()));
        Ok(value)
    }

    fn depth_mut(&mut self) -> &mut u32 {
        &mut self.depth
    }
}
