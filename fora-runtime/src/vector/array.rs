//! Chunked value storage.
//!
//! A [`ForaValueArray`] is a sequence of chunks. Runs of values with the same
//! POD type are packed into contiguous little-endian bytes; everything else
//! is boxed. Chunk capacity doubles as it fills, and decoding allocates every
//! chunk at its exact size, so a decoded array never holds more than the
//! array it was encoded from.

use std::fmt;
use std::sync::Arc;

use super::VectorError;
use crate::memory::{MemoryError, PoolAllocation, PoolKind, VectorDataMemoryManager};
use crate::model::{Type, Value};
use crate::serialize::{SerializeError, Wire, WireSink, WireSource};

/// Bytes charged per boxed value.
const BOXED_SLOT_BYTES: usize = std::mem::size_of::<Value>();

/// Element capacity of a freshly started chunk.
const INITIAL_CAPACITY: usize = 8;

struct PackedChunk {
    ty: Type,
    stride: usize,
    count: usize,
    data: PoolAllocation,
}

impl PackedChunk {
    fn capacity(&self) -> usize {
        self.data.len() / self.stride
    }

    fn reserve(&mut self, extra: usize) -> Result<(), MemoryError> {
        let needed = self.count + extra;
        if needed > self.capacity() {
            let new_cap = needed.max(self.capacity() * 2);
            self.data.grow(new_cap * self.stride, self.count * self.stride)?;
        }
        Ok(())
    }

    fn value(&self, index: usize) -> Value {
        Value::read_pod(&self.ty, &self.data.as_slice()[index * self.stride..])
    }
}

struct BoxedChunk {
    values: Vec<Value>,
    slots: PoolAllocation,
    string_bytes: usize,
    strings: Option<PoolAllocation>,
}

impl BoxedChunk {
    fn new(memory: &Arc<VectorDataMemoryManager>, capacity: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            values: Vec::with_capacity(capacity),
            slots: memory.allocate(PoolKind::BoxedValues, BOXED_SLOT_BYTES * capacity.max(1))?,
            string_bytes: 0,
            strings: None,
        })
    }

    fn push(&mut self, value: Value) -> Result<(), MemoryError> {
        let needed = self.values.len() + 1;
        let capacity = self.slots.len() / BOXED_SLOT_BYTES;
        if needed > capacity {
            self.slots.grow(BOXED_SLOT_BYTES * needed.max(capacity * 2), 0)?;
        }
        if let Value::String(s) = &value {
            self.charge_string(s.len(), true)?;
        }
        self.values.push(value);
        Ok(())
    }

    fn charge_string(&mut self, len: usize, slack: bool) -> Result<(), MemoryError> {
        if len == 0 {
            return Ok(());
        }
        let needed = self.string_bytes + len;
        match &mut self.strings {
            Some(strings) if strings.len() >= needed => {}
            Some(strings) => {
                let target = if slack { needed.max(strings.len() * 2) } else { needed };
                strings.grow(target, 0)?;
            }
            None => {
                let manager = self.slots.manager().clone();
                self.strings = Some(manager.allocate(PoolKind::StringData, needed)?);
            }
        }
        self.string_bytes = needed;
        Ok(())
    }

    fn bytes_reserved(&self) -> usize {
        self.slots.len() + self.strings.as_ref().map_or(0, PoolAllocation::len)
    }
}

enum Chunk {
    Packed(PackedChunk),
    Boxed(BoxedChunk),
}

impl Chunk {
    fn len(&self) -> usize {
        match self {
            Chunk::Packed(p) => p.count,
            Chunk::Boxed(b) => b.values.len(),
        }
    }

    fn value(&self, index: usize) -> Value {
        match self {
            Chunk::Packed(p) => p.value(index),
            Chunk::Boxed(b) => b.values[index].clone(),
        }
    }

    fn bytes_reserved(&self) -> usize {
        match self {
            Chunk::Packed(p) => p.data.len(),
            Chunk::Boxed(b) => b.bytes_reserved(),
        }
    }
}

/// Summary of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Element type for packed chunks, `None` for boxed ones.
    pub packed_type: Option<Type>,
    /// Number of values.
    pub len: usize,
    /// Bytes reserved from the memory manager.
    pub bytes_reserved: usize,
}

/// A growable sequence of values drawing on a [`VectorDataMemoryManager`].
pub struct ForaValueArray {
    memory: Arc<VectorDataMemoryManager>,
    chunks: Vec<Chunk>,
    starts: Vec<usize>,
    len: usize,
}

impl ForaValueArray {
    /// An empty array charged to `memory`.
    pub fn new(memory: &Arc<VectorDataMemoryManager>) -> Self {
        Self {
            memory: Arc::clone(memory),
            chunks: Vec::new(),
            starts: Vec::new(),
            len: 0,
        }
    }

    /// Append one value.
    pub fn append(&mut self, value: &Value) -> Result<(), MemoryError> {
        let ty = value.type_of();
        match ty.pod_size() {
            Some(stride) if !matches!(self.chunks.last(), Some(Chunk::Boxed(_))) => {
                let slot = self.reserve_packed(&ty, stride, 1)?;
                value.write_pod(slot);
                Ok(())
            }
            _ => self.push_boxed(value.clone()),
        }
    }

    /// Reserve `count` packed elements of `ty` and return their bytes for the
    /// caller to fill. The bytes start zeroed.
    pub fn append_uninitialized(&mut self, ty: &Type, count: usize) -> Result<&mut [u8], VectorError> {
        let stride = ty.pod_size().ok_or_else(|| VectorError::NotPod(ty.to_string()))?;
        Ok(self.reserve_packed(ty, stride, count)?)
    }

    fn reserve_packed(&mut self, ty: &Type, stride: usize, count: usize) -> Result<&mut [u8], MemoryError> {
        let reuse = matches!(self.chunks.last(), Some(Chunk::Packed(p)) if p.ty == *ty);
        if !reuse {
            let data = self
                .memory
                .allocate(PoolKind::PackedValues, stride * count.max(INITIAL_CAPACITY))?;
            self.starts.push(self.len);
            self.chunks.push(Chunk::Packed(PackedChunk {
                ty: ty.clone(),
                stride,
                count: 0,
                data,
            }));
        }
        let Some(Chunk::Packed(chunk)) = self.chunks.last_mut() else {
            unreachable!("tail chunk is packed");
        };
        chunk.reserve(count)?;
        let start = chunk.count * stride;
        chunk.count += count;
        self.len += count;
        Ok(&mut chunk.data.as_mut_slice()[start..start + count * stride])
    }

    fn push_boxed(&mut self, value: Value) -> Result<(), MemoryError> {
        if !matches!(self.chunks.last(), Some(Chunk::Boxed(_))) {
            let chunk = BoxedChunk::new(&self.memory, INITIAL_CAPACITY)?;
            self.starts.push(self.len);
            self.chunks.push(Chunk::Boxed(chunk));
        }
        let Some(Chunk::Boxed(chunk)) = self.chunks.last_mut() else {
            unreachable!("tail chunk is boxed");
        };
        chunk.push(value)?;
        self.len += 1;
        Ok(())
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no values.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Value at `index`.
    pub fn get(&self, index: usize) -> Option<Value> {
        if index >= self.len {
            return None;
        }
        let c = self.starts.partition_point(|&s| s <= index) - 1;
        Some(self.chunks[c].value(index - self.starts[c]))
    }

    /// All values in order.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.chunks.iter().flat_map(|c| (0..c.len()).map(move |i| c.value(i)))
    }

    /// Bytes reserved from the memory manager.
    pub fn bytes_used(&self) -> usize {
        self.chunks.iter().map(Chunk::bytes_reserved).sum()
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Per-chunk summaries.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        self.chunks.iter().map(|c| ChunkInfo {
            packed_type: match c {
                Chunk::Packed(p) => Some(p.ty.clone()),
                Chunk::Boxed(_) => None,
            },
            len: c.len(),
            bytes_reserved: c.bytes_reserved(),
        })
    }

    /// The manager this array is charged to.
    pub fn memory(&self) -> &Arc<VectorDataMemoryManager> {
        &self.memory
    }
}

impl Wire for ForaValueArray {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_varint(self.chunks.len() as u64);
        for chunk in &self.chunks {
            match chunk {
                Chunk::Packed(p) => {
                    sink.put_u8(0);
                    sink.put_type(&p.ty);
                    sink.put_varint(p.count as u64);
                    sink.put(&p.data.as_slice()[..p.count * p.stride]);
                }
                Chunk::Boxed(b) => {
                    sink.put_u8(1);
                    sink.put_varint(b.values.len() as u64);
                    for v in &b.values {
                        v.encode(sink);
                    }
                }
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        let memory = Arc::clone(source.memory());
        let mut array = ForaValueArray::new(&memory);
        let chunk_count = source.get_len(2)?;
        for _ in 0..chunk_count {
            let chunk = match source.get_u8()? {
                0 => {
                    let ty = source.get_type()?;
                    let stride = ty
                        .pod_size()
                        .ok_or_else(|| SerializeError::Malformed(format!("packed chunk of non-POD type {ty}")))?;
                    let count = source.get_len(stride)?;
                    if count == 0 {
                        return Err(SerializeError::Malformed("empty packed chunk".into()));
                    }
                    let bytes = count * stride;
                    let mut data = memory.allocate(PoolKind::PackedValues, bytes)?;
                    data.as_mut_slice()[..bytes].copy_from_slice(source.take(bytes)?);
                    Chunk::Packed(PackedChunk { ty, stride, count, data })
                }
                1 => {
                    let count = source.get_len(1)?;
                    if count == 0 {
                        return Err(SerializeError::Malformed("empty boxed chunk".into()));
                    }
                    let mut chunk = BoxedChunk::new(&memory, count)?;
                    for _ in 0..count {
                        let value = Value::decode(source)?;
                        if let Value::String(s) = &value {
                            chunk.charge_string(s.len(), false)?;
                        }
                        chunk.values.push(value);
                    }
                    Chunk::Boxed(chunk)
                }
                tag => {
                    return Err(SerializeError::InvalidTag {
                        what: "value array chunk",
                        tag: tag.into(),
                    })
                }
            };
            array.starts.push(array.len);
            array.len += chunk.len();
            array.chunks.push(chunk);
        }
        Ok(array)
    }
}

impl fmt::Debug for ForaValueArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForaValueArray")
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .field("bytes_used", &self.bytes_used())
            .finish()
    }
}
