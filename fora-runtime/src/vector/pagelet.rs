//! Pagelets: the unit of vector data that is frozen, shared and memoized.

use std::fmt;
use std::sync::Arc;

use super::{ForaValueArray, VectorError};
use crate::hash::ContentHash;
use crate::memory::{MemoryError, VectorDataMemoryManager};
use crate::model::{Type, Value};
use crate::serialize::{CanonicalWriter, Memoizable, SerializeError, Wire, WireSink, WireSource};

/// The mutable stage of a pagelet. One producer appends, then freezes.
pub struct PageletBuilder {
    values: ForaValueArray,
}

impl PageletBuilder {
    /// An empty builder charged to `memory`.
    pub fn new(memory: &Arc<VectorDataMemoryManager>) -> Self {
        Self {
            values: ForaValueArray::new(memory),
        }
    }

    /// Append one value.
    pub fn append(&mut self, value: &Value) -> Result<(), MemoryError> {
        self.values.append(value)
    }

    /// Reserve `count` packed elements of `ty` for the caller to fill.
    pub fn append_uninitialized(&mut self, ty: &Type, count: usize) -> Result<&mut [u8], VectorError> {
        self.values.append_uninitialized(ty, count)
    }

    /// Values appended so far.
    pub fn values(&self) -> &ForaValueArray {
        &self.values
    }

    /// Number of values appended so far.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Make the pagelet immutable.
    pub fn freeze(self) -> Arc<Pagelet> {
        Arc::new(Pagelet::from_values(self.values))
    }
}

/// An immutable run of values.
pub struct Pagelet {
    values: ForaValueArray,
    hash: ContentHash,
}

impl Pagelet {
    fn from_values(values: ForaValueArray) -> Self {
        let hash = ContentHash::of(&CanonicalWriter::encode(&values));
        Self { values, hash }
    }

    /// The values.
    pub fn values(&self) -> &ForaValueArray {
        &self.values
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the pagelet is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bytes reserved from the memory manager.
    pub fn bytes_used(&self) -> usize {
        self.values.bytes_used()
    }

    /// Hash of the canonical encoding of the values.
    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

impl Memoizable for Arc<Pagelet> {
    const KIND: &'static str = "pagelet";

    fn memo_hash(&self) -> ContentHash {
        self.hash
    }

    fn encode_memo<S: WireSink>(&self, sink: &mut S) {
        self.values.encode(sink);
    }

    fn decode_memo<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(Arc::new(Pagelet::from_values(ForaValueArray::decode(source)?)))
    }
}

impl fmt::Debug for Pagelet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pagelet")
            .field("hash", &self.hash)
            .field("len", &self.len())
            .field("bytes_used", &self.bytes_used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::CanonicalReader;

    #[test]
    fn test_freeze_preserves_values() {
        let memory = VectorDataMemoryManager::unbounded(16);
        let mut b = PageletBuilder::new(&memory);
        for i in 0..10 {
            b.append(&Value::Float64(f64::from(i) * 0.5)).unwrap();
        }
        b.append(&Value::string("tail")).unwrap();
        assert_eq!(b.len(), 11);

        let p = b.freeze();
        assert_eq!(p.len(), 11);
        assert_eq!(p.values().get(4), Some(Value::Float64(2.0)));
        assert_eq!(p.values().get(10), Some(Value::string("tail")));
    }

    #[test]
    fn test_hash_is_content_based() {
        let memory = VectorDataMemoryManager::unbounded(16);
        let build = |n: i64| {
            let mut b = PageletBuilder::new(&memory);
            for i in 0..n {
                b.append(&Value::Int64(i)).unwrap();
            }
            b.freeze()
        };
        assert_eq!(build(20).hash(), build(20).hash());
        assert_ne!(build(20).hash(), build(21).hash());
    }

    #[test]
    fn test_memo_hash_matches_canonical_bytes() {
        let memory = VectorDataMemoryManager::unbounded(16);
        let mut b = PageletBuilder::new(&memory);
        b.append(&Value::tuple(vec![Value::Int32(1), Value::Bool(false)])).unwrap();
        b.append(&Value::Type(Type::int64())).unwrap();
        let p = b.freeze();

        let bytes = CanonicalWriter::encode_memo(&p);
        assert_eq!(ContentHash::of(&bytes), p.memo_hash());

        let back: Arc<Pagelet> = CanonicalReader::decode_memo_all(&bytes, memory).unwrap();
        assert_eq!(back.hash(), p.hash());
    }
}
