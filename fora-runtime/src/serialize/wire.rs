//! # Wire Primitives
//!
//! Every serializable type is written once against [`WireSink`] and read
//! once against [`WireSource`]. What happens at a shared node (a [`Type`],
//! [`Judgment`], [`Expression`], [`ControlFlowGraph`] or memoized value)
//! depends on the implementation:
//!
//! | Implementation | Shared node becomes |
//! |----------------|---------------------|
//! | [`CanonicalWriter`] / [`CanonicalReader`] | its structure on first sight, a back-reference after |
//! | [`HashingSink`] | its content hash |
//! | `ContextSerializer` / `ContextDeserializer` | an index into the context |
//!
//! Integers are unsigned LEB128; signed integers are zigzag encoded first.
//!
//! ## Canonical shared nodes
//!
//! ```text
//! node := 0x00 body            first occurrence in this encoding
//!       | 0x01 varint index    earlier node of the same family
//! ```
//!
//! Nodes are numbered per family in the order their bodies finish, so a
//! node's children are numbered before it. A DAG is therefore written in
//! space linear in its distinct nodes. The numbering can be carried across
//! encodings with [`EmittedNodes`] and [`DecodedNodes`]; the flattener does
//! this to share nodes between table entries and between objects.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::ContentKeyed;
use super::memo::Memoizable;
use super::SerializeError;
use crate::hash::{ContentHash, ContentHasher};
use crate::memory::VectorDataMemoryManager;
use crate::model::{ControlFlowGraph, Expression, Judgment, Type};

// ============================================================================
// Varints
// ============================================================================

/// Nesting depth past which decoding fails instead of recursing further.
pub const MAX_DECODE_DEPTH: u32 = 256;

const NODE_INLINE: u8 = 0;
const NODE_BACKREF: u8 = 1;

/// Encode `value` as unsigned LEB128 into `buf`, returning the length used.
pub fn encode_uleb128(mut value: u64, buf: &mut [u8; 10]) -> usize {
    let mut i = 0;
    loop {
        let mut b = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            b |= 0x80;
        }
        buf[i] = b;
        i += 1;
        if value == 0 {
            return i;
        }
    }
}

/// Decode unsigned LEB128, pulling one byte at a time from `next_byte`.
///
/// Returns `Ok(None)` if input ends before the first byte; ending later is
/// [`SerializeError::UnexpectedEof`].
pub fn read_uleb128<F>(mut next_byte: F) -> Result<Option<u64>, SerializeError>
where
    F: FnMut() -> Result<Option<u8>, SerializeError>,
{
    let mut value: u64 = 0;
    for i in 0..10 {
        let b = match next_byte()? {
            Some(b) => b,
            None if i == 0 => return Ok(None),
            None => return Err(SerializeError::UnexpectedEof),
        };
        let payload = b & 0x7f;
        if i == 9 && payload > 1 {
            return Err(SerializeError::InvalidVarint);
        }
        value |= u64::from(payload) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(SerializeError::InvalidVarint)
}

/// Decode unsigned LEB128 from `bytes` at `offset`, advancing it.
pub fn decode_uleb128(bytes: &[u8], offset: &mut usize) -> Result<u64, SerializeError> {
    let value = read_uleb128(|| {
        let b = bytes.get(*offset).copied();
        if b.is_some() {
            *offset += 1;
        }
        Ok(b)
    })?;
    value.ok_or(SerializeError::UnexpectedEof)
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

// ============================================================================
// Traits
// ============================================================================

/// Destination for encoded values.
pub trait WireSink {
    /// Append raw bytes.
    fn put(&mut self, bytes: &[u8]);

    /// Write a shared type node.
    fn put_type(&mut self, ty: &Type);

    /// Write a shared judgment node.
    fn put_judgment(&mut self, jov: &Judgment);

    /// Write a shared expression node.
    fn put_expression(&mut self, expr: &Expression);

    /// Write a shared control-flow graph.
    fn put_cfg(&mut self, cfg: &ControlFlowGraph);

    /// Write a memoizable value.
    fn put_memo<M: Memoizable>(&mut self, value: &M);

    /// Append one byte.
    fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    /// Append a bool as one byte.
    fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Append an unsigned varint.
    fn put_varint(&mut self, v: u64) {
        let mut buf = [0u8; 10];
        let n = encode_uleb128(v, &mut buf);
        self.put(&buf[..n]);
    }

    /// Append a zigzag signed varint.
    fn put_svarint(&mut self, v: i64) {
        self.put_varint(zigzag(v));
    }

    /// Append an f64 bit pattern, little-endian.
    fn put_f64(&mut self, v: f64) {
        self.put(&v.to_bits().to_le_bytes());
    }

    /// Append an f32 bit pattern, little-endian.
    fn put_f32(&mut self, v: f32) {
        self.put(&v.to_bits().to_le_bytes());
    }

    /// Append a length-prefixed byte string.
    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_varint(bytes.len() as u64);
        self.put(bytes);
    }

    /// Append a length-prefixed UTF-8 string.
    fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Append a content hash.
    fn put_hash(&mut self, hash: &ContentHash) {
        self.put(hash.as_bytes());
    }
}

/// Source of encoded values.
pub trait WireSource {
    /// Consume exactly `n` bytes.
    fn take(&mut self, n: usize) -> Result<&[u8], SerializeError>;

    /// Bytes not yet consumed.
    fn remaining(&self) -> usize;

    /// Manager that decoded vector data is charged to.
    fn memory(&self) -> &Arc<VectorDataMemoryManager>;

    /// Read a shared type node.
    fn get_type(&mut self) -> Result<Type, SerializeError>;

    /// Read a shared judgment node.
    fn get_judgment(&mut self) -> Result<Judgment, SerializeError>;

    /// Read a shared expression node.
    fn get_expression(&mut self) -> Result<Expression, SerializeError>;

    /// Read a shared control-flow graph.
    fn get_cfg(&mut self) -> Result<ControlFlowGraph, SerializeError>;

    /// Read a memoizable value.
    fn get_memo<M: Memoizable>(&mut self) -> Result<M, SerializeError>;

    /// Nesting depth of the decode in progress.
    fn depth_mut(&mut self) -> &mut u32;

    /// Run `read` one nesting level deeper, failing past [`MAX_DECODE_DEPTH`].
    fn nested<T, F>(&mut self, read: F) -> Result<T, SerializeError>
    where
        F: FnOnce(&mut Self) -> Result<T, SerializeError>,
    {
        let depth = self.depth_mut();
        if *depth >= MAX_DECODE_DEPTH {
            return Err(SerializeError::Malformed(format!(
                "nesting deeper than {MAX_DECODE_DEPTH} levels"
            )));
        }
        *depth += 1;
        let result = read(self);
        *self.depth_mut() -= 1;
        result
    }

    /// Read one byte.
    fn get_u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a bool.
    fn get_bool(&mut self) -> Result<bool, SerializeError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(SerializeError::InvalidTag {
                what: "bool",
                tag: tag.into(),
            }),
        }
    }

    /// Read an unsigned varint.
    fn get_varint(&mut self) -> Result<u64, SerializeError> {
        read_uleb128(|| self.get_u8().map(Some))?.ok_or(SerializeError::UnexpectedEof)
    }

    /// Read a zigzag signed varint.
    fn get_svarint(&mut self) -> Result<i64, SerializeError> {
        Ok(unzigzag(self.get_varint()?))
    }

    /// Read a count or length that must fit in the remaining input when
    /// each unit occupies at least `min_unit_bytes`.
    fn get_len(&mut self, min_unit_bytes: usize) -> Result<usize, SerializeError> {
        let len = self.get_varint()?;
        let remaining = self.remaining();
        if min_unit_bytes > 0 && len > (remaining / min_unit_bytes) as u64 {
            return Err(SerializeError::LengthOverflow { len, remaining });
        }
        usize::try_from(len).map_err(|_| SerializeError::LengthOverflow { len, remaining })
    }

    /// Read an f64.
    fn get_f64(&mut self) -> Result<f64, SerializeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(f64::from_bits(u64::from_le_bytes(b)))
    }

    /// Read an f32.
    fn get_f32(&mut self) -> Result<f32, SerializeError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(f32::from_bits(u32::from_le_bytes(b)))
    }

    /// Read a length-prefixed byte string.
    fn get_bytes(&mut self) -> Result<Vec<u8>, SerializeError> {
        let len = self.get_len(1)?;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    fn get_str(&mut self) -> Result<String, SerializeError> {
        String::from_utf8(self.get_bytes()?).map_err(|_| SerializeError::InvalidUtf8)
    }

    /// Read a content hash.
    fn get_hash(&mut self) -> Result<ContentHash, SerializeError> {
        let mut b = [0u8; 32];
        b.copy_from_slice(self.take(ContentHash::LEN)?);
        Ok(ContentHash::from_bytes(b))
    }
}

/// A value with one encoding, written against the wire traits.
pub trait Wire: Sized {
    /// Write `self`.
    fn encode<S: WireSink>(&self, sink: &mut S);

    /// Read a value.
    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError>;
}

// ============================================================================
// Wire impls for std types
// ============================================================================

impl Wire for u64 {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_varint(*self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_varint()
    }
}

impl Wire for i64 {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_svarint(*self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_svarint()
    }
}

impl Wire for bool {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_bool(*self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_bool()
    }
}

impl Wire for String {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_str(self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_str()
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            None => sink.put_u8(0),
            Some(v) => {
                sink.put_u8(1);
                v.encode(sink);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        match source.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(source)?)),
            tag => Err(SerializeError::InvalidTag {
                what: "option",
                tag: tag.into(),
            }),
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_varint(self.len() as u64);
        for v in self {
            v.encode(sink);
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        let len = source.get_len(1)?;
        (0..len).map(|_| T::decode(source)).collect()
    }
}

impl Wire for Type {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_type(self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_type()
    }
}

impl Wire for Judgment {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_judgment(self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_judgment()
    }
}

impl Wire for Expression {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_expression(self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_expression()
    }
}

impl Wire for ControlFlowGraph {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_cfg(self);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        source.get_cfg()
    }
}

// ============================================================================
// Canonical encoding
// ============================================================================

/// A shared-node family with its own canonical back-reference numbering.
pub trait SharedNode: ContentKeyed + Clone {
    /// Slot in [`EmittedNodes`].
    const FAMILY: usize;

    /// Name used in errors.
    const KIND: &'static str;

    /// Write the node's own structure.
    fn write_body<S: WireSink>(&self, sink: &mut S);

    /// Read a node's structure.
    fn read_body<R: WireSource>(source: &mut R) -> Result<Self, SerializeError>;

    /// This family's decoded nodes.
    fn decoded(nodes: &mut DecodedNodes) -> &mut Vec<Self>;
}

macro_rules! shared_node {
    ($ty:ty, $family:expr, $kind:expr, $field:ident) => {
        impl SharedNode for $ty {
            const FAMILY: usize = $family;
            const KIND: &'static str = $kind;

            fn write_body<S: WireSink>(&self, sink: &mut S) {
                self.encode_body(sink);
            }

            fn read_body<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
                <$ty>::decode_body(source)
            }

            fn decoded(nodes: &mut DecodedNodes) -> &mut Vec<Self> {
                &mut nodes.$field
            }
        }
    };
}

shared_node!(Type, 0, "type", types);
shared_node!(Judgment, 1, "judgment", judgments);
shared_node!(Expression, 2, "expression", expressions);
shared_node!(ControlFlowGraph, 3, "control flow graph", cfgs);

/// Numbers assigned to shared nodes already written, per family.
#[derive(Debug, Default)]
pub struct EmittedNodes {
    families: [HashMap<ContentHash, u32>; 4],
}

impl EmittedNodes {
    /// Number of `node` if it has been written.
    pub fn index_of<N: SharedNode>(&self, node: &N) -> Option<u32> {
        self.families[N::FAMILY].get(&node.content_hash()).copied()
    }

    fn record<N: SharedNode>(&mut self, node: &N) {
        let seen = &mut self.families[N::FAMILY];
        let next = seen.len() as u32;
        seen.entry(node.content_hash()).or_insert(next);
    }
}

/// Shared nodes already read, per family, in numbering order.
#[derive(Debug, Clone, Default)]
pub struct DecodedNodes {
    types: Vec<Type>,
    judgments: Vec<Judgment>,
    expressions: Vec<Expression>,
    cfgs: Vec<ControlFlowGraph>,
}

impl DecodedNodes {
    /// Node `index` of family `N`.
    pub fn get<N: SharedNode>(&mut self, index: u64) -> Result<N, SerializeError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| N::decoded(self).get(i))
            .cloned()
            .ok_or(SerializeError::MissingIndex { kind: N::KIND, index })
    }
}

/// Writes each distinct shared node once and back-references repeats.
/// The output depends only on the value.
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    out: Vec<u8>,
    emitted: EmittedNodes,
}

impl CanonicalWriter {
    /// An empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer continuing the numbering in `emitted`.
    pub fn with_emitted(emitted: EmittedNodes) -> Self {
        Self { out: Vec::new(), emitted }
    }

    /// Canonical bytes of `value`.
    pub fn encode<T: Wire>(value: &T) -> Vec<u8> {
        let mut w = Self::new();
        value.encode(&mut w);
        w.out
    }

    /// Canonical bytes of a memoizable value.
    pub fn encode_memo<M: Memoizable>(value: &M) -> Vec<u8> {
        let mut w = Self::new();
        value.encode_memo(&mut w);
        w.out
    }

    /// Nodes written so far.
    pub fn emitted(&self) -> &EmittedNodes {
        &self.emitted
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.out.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Take the output.
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    /// Take the output and the node numbering.
    pub fn into_parts(self) -> (Vec<u8>, EmittedNodes) {
        (self.out, self.emitted)
    }

    fn put_shared<N: SharedNode>(&mut self, node: &N) {
        if let Some(index) = self.emitted.index_of(node) {
            self.put_u8(NODE_BACKREF);
            self.put_varint(index.into());
            return;
        }
        self.put_u8(NODE_INLINE);
        node.write_body(self);
        self.emitted.record(node);
    }
}

impl WireSink for CanonicalWriter {
    fn put(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn put_type(&mut self, ty: &Type) {
        self.put_shared(ty);
    }

    fn put_judgment(&mut self, jov: &Judgment) {
        self.put_shared(jov);
    }

    fn put_expression(&mut self, expr: &Expression) {
        self.put_shared(expr);
    }

    fn put_cfg(&mut self, cfg: &ControlFlowGraph) {
        self.put_shared(cfg);
    }

    fn put_memo<M: Memoizable>(&mut self, value: &M) {
        value.encode_memo(self);
    }
}

/// Reads the output of [`CanonicalWriter`].
pub struct CanonicalReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: u32,
    memory: Arc<VectorDataMemoryManager>,
    decoded: DecodedNodes,
}

impl<'a> CanonicalReader<'a> {
    /// Read from `bytes`, charging vector data to `memory`.
    pub fn new(bytes: &'a [u8], memory: Arc<VectorDataMemoryManager>) -> Self {
        Self::with_decoded(bytes, memory, DecodedNodes::default())
    }

    /// A reader continuing the numbering in `decoded`.
    pub fn with_decoded(bytes: &'a [u8], memory: Arc<VectorDataMemoryManager>, decoded: DecodedNodes) -> Self {
        Self {
            bytes,
            pos: 0,
            depth: 0,
            memory,
            decoded,
        }
    }

    /// Decode one value that must span all of `bytes`.
    pub fn decode_all<T: Wire>(bytes: &'a [u8], memory: Arc<VectorDataMemoryManager>) -> Result<T, SerializeError> {
        let mut r = Self::new(bytes, memory);
        let value = T::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }

    /// Decode one memoizable value that must span all of `bytes`.
    pub fn decode_memo_all<M: Memoizable>(
        bytes: &'a [u8],
        memory: Arc<VectorDataMemoryManager>,
    ) -> Result<M, SerializeError> {
        let mut r = Self::new(bytes, memory);
        let value = M::decode_memo(&mut r)?;
        r.finish()?;
        Ok(value)
    }

    /// Fail if any input is left.
    pub fn finish(&self) -> Result<(), SerializeError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            n => Err(SerializeError::TrailingBytes(n)),
        }
    }

    /// An earlier node of family `N` by number.
    pub fn node_at<N: SharedNode>(&mut self, index: u64) -> Result<N, SerializeError> {
        self.decoded.get(index)
    }

    /// Give back the node numbering.
    pub fn into_decoded(self) -> DecodedNodes {
        self.decoded
    }

    fn get_shared<N: SharedNode>(&mut self) -> Result<N, SerializeError> {
        match self.get_u8()? {
            NODE_INLINE => {
                let node = self.nested(|r| N::read_body(r))?;
                N::decoded(&mut self.decoded).push(node.clone());
                Ok(node)
            }
            NODE_BACKREF => {
                let index = self.get_varint()?;
                self.node_at(index)
            }
            tag => Err(SerializeError::InvalidTag {
                what: N::KIND,
                tag: tag.into(),
            }),
        }
    }
}

impl WireSource for CanonicalReader<'_> {
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
        self.get_shared()
    }

    fn get_judgment(&mut self) -> Result<Judgment, SerializeError> {
        self.get_shared()
    }

    fn get_expression(&mut self) -> Result<Expression, SerializeError> {
        self.get_shared()
    }

    fn get_cfg(&mut self) -> Result<ControlFlowGraph, SerializeError> {
        self.get_shared()
    }

    fn get_memo<M: Memoizable>(&mut self) -> Result<M, SerializeError> {
        M::decode_memo(self)
    }

    fn depth_mut(&mut self) -> &mut u32 {
        &mut self.depth
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// Feeds an encoding straight into a [`ContentHasher`], writing shared nodes
/// as their hashes. Node hashes therefore cost O(own size), not O(tree size).
pub struct HashingSink {
    hasher: ContentHasher,
}

impl HashingSink {
    /// A sink whose digest is domain-separated by `domain`.
    pub fn new(domain: &str) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update_str(domain);
        Self { hasher }
    }

    /// Hash `value` under `domain`.
    pub fn hash_of<T: Wire>(domain: &str, value: &T) -> ContentHash {
        let mut sink = Self::new(domain);
        value.encode(&mut sink);
        sink.finalize()
    }

    /// Finish and return the digest.
    pub fn finalize(self) -> ContentHash {
        self.hasher.finalize()
    }
}

impl WireSink for HashingSink {
    fn put(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn put_type(&mut self, ty: &Type) {
        self.hasher.update_hash(&ty.hash());
    }

    fn put_judgment(&mut self, jov: &Judgment) {
        self.hasher.update_hash(&jov.hash());
    }

    fn put_expression(&mut self, expr: &Expression) {
        self.hasher.update_hash(&expr.hash());
    }

    fn put_cfg(&mut self, cfg: &ControlFlowGraph) {
        self.hasher.update_hash(&cfg.hash());
    }

    fn put_memo<M: Memoizable>(&mut self, value: &M) {
        self.hasher.update_hash(&value.memo_hash());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uleb128_values() {
        for v in [0u64, 1, 127, 128, 300, 16_384, u64::MAX] {
            let mut buf = [0u8; 10];
            let n = encode_uleb128(v, &mut buf);
            let mut off = 0;
            assert_eq!(decode_uleb128(&buf[..n], &mut off).unwrap(), v);
            assert_eq!(off, n);
        }
    }

    #[test]
    fn test_uleb128_rejects_overflow() {
        let buf = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x02];
        let mut off = 0;
        assert!(matches!(
            decode_uleb128(&buf, &mut off),
            Err(SerializeError::InvalidVarint)
        ));
    }

    #[test]
    fn test_zigzag() {
        for v in [0i64, 1, -1, 63, -64, i64::MIN, i64::MAX] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
    }

    #[test]
    fn test_canonical_primitives() {
        let mut w = CanonicalWriter::new();
        w.put_svarint(-5);
        w.put_str("pagelet");
        w.put_f64(1.5);
        w.put_bool(true);
        let bytes = w.into_bytes();

        let mut r = CanonicalReader::new(&bytes, VectorDataMemoryManager::free_store());
        assert_eq!(r.get_svarint().unwrap(), -5);
        assert_eq!(r.get_str().unwrap(), "pagelet");
        assert_eq!(r.get_f64().unwrap(), 1.5);
        assert!(r.get_bool().unwrap());
        r.finish().unwrap();
    }

    #[test]
    fn test_truncated_input() {
        let bytes = CanonicalWriter::encode(&"a longer string".to_string());
        let short = &bytes[..bytes.len() - 3];
        let err = CanonicalReader::decode_all::<String>(short, VectorDataMemoryManager::free_store())
            .unwrap_err();
        assert!(matches!(err, SerializeError::LengthOverflow { .. }));
    }

    #[test]
    fn test_absurd_length_rejected() {
        let mut w = CanonicalWriter::new();
        w.put_varint(u64::MAX / 2);
        let bytes = w.into_bytes();
        let err = CanonicalReader::decode_all::<Vec<u64>>(&bytes, VectorDataMemoryManager::free_store())
            .unwrap_err();
        assert!(matches!(err, SerializeError::LengthOverflow { .. }));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = CanonicalWriter::encode(&7u64);
        bytes.push(0);
        let err = CanonicalReader::decode_all::<u64>(&bytes, VectorDataMemoryManager::free_store())
            .unwrap_err();
        assert!(matches!(err, SerializeError::TrailingBytes(1)));
    }

    fn doubling_type(levels: usize) -> Type {
        (0..levels).fold(Type::int64(), |t, _| Type::tuple(vec![t.clone(), t]))
    }

    #[test]
    fn test_repeated_children_written_once() {
        let sizes: Vec<usize> = [8, 16, 32]
            .iter()
            .map(|&k| CanonicalWriter::encode(&doubling_type(k)).len())
            .collect();
        // Each level adds one inline tuple and one back-reference.
        assert_eq!(sizes[2] - sizes[1], 2 * (sizes[1] - sizes[0]), "{sizes:?}");
        assert!(sizes[2] < 32 * 16, "{sizes:?}");

        let t = doubling_type(32);
        let back: Type = CanonicalReader::decode_all(&CanonicalWriter::encode(&t), VectorDataMemoryManager::free_store())
            .unwrap();
        assert_eq!(back, t);
        assert_eq!(back.depth(), 32);
    }

    #[test]
    fn test_emitted_numbering_carries_over() {
        let inner = Type::tuple(vec![Type::float64(), Type::int64()]);
        let outer = Type::alternative("pair", inner.clone());

        let mut w = CanonicalWriter::new();
        inner.encode(&mut w);
        let (first, emitted) = w.into_parts();
        assert!(emitted.index_of(&inner).is_some());

        let mut w = CanonicalWriter::with_emitted(emitted);
        outer.encode(&mut w);
        let second = w.into_bytes();
        assert!(second.len() < CanonicalWriter::encode(&outer).len());

        let mut r = CanonicalReader::new(&first, VectorDataMemoryManager::free_store());
        assert_eq!(Type::decode(&mut r).unwrap(), inner);
        let decoded = r.into_decoded();
        let mut r = CanonicalReader::with_decoded(&second, VectorDataMemoryManager::free_store(), decoded);
        assert_eq!(Type::decode(&mut r).unwrap(), outer);

        let err = CanonicalReader::decode_all::<Type>(&second, VectorDataMemoryManager::free_store()).unwrap_err();
        assert!(matches!(err, SerializeError::MissingIndex { .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let ok = (0..MAX_DECODE_DEPTH - 1).fold(Type::int64(), |t, i| Type::alternative(format!("a{i}"), t));
        let bytes = CanonicalWriter::encode(&ok);
        assert_eq!(
            CanonicalReader::decode_all::<Type>(&bytes, VectorDataMemoryManager::free_store()).unwrap(),
            ok
        );

        // Alternative headers nested far past the limit, never terminated.
        let mut w = CanonicalWriter::new();
        for _ in 0..100_000 {
            w.put_u8(NODE_INLINE);
            w.put_u8(8);
            w.put_str("a");
        }
        let err = CanonicalReader::decode_all::<Type>(&w.into_bytes(), VectorDataMemoryManager::free_store())
            .unwrap_err();
        assert!(matches!(err, SerializeError::Malformed(_)), "{err:?}");
    }
}
