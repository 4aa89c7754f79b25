//! # Serialized Objects
//!
//! An immutable bundle of payload bytes plus the context (index tables and
//! memo storage) those bytes refer to. Identity is the content hash, which is
//! computed on first use and cached; there are no mutators, so the cached
//! value cannot go stale.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use super::byte_block::ByteBlock;
use super::context::SerializedObjectContext;
use super::wire::Wire;
use super::SerializeError;
use crate::hash::{ContentHash, ContentHasher};
use crate::memory::VectorDataMemoryManager;

/// Payload bytes and the context they were written against.
pub struct SerializedObject {
    payload: ByteBlock,
    context: SerializedObjectContext,
    hash: OnceLock<ContentHash>,
}

impl SerializedObject {
    /// Bundle a payload with its context.
    pub fn new(payload: ByteBlock, context: SerializedObjectContext) -> Self {
        Self {
            payload,
            context,
            hash: OnceLock::new(),
        }
    }

    /// Serialize `value` against a fresh context.
    pub fn serialize<T: Wire>(value: &T) -> Arc<Self> {
        let mut context = SerializedObjectContext::new();
        let payload = context.serialize(value);
        Arc::new(Self::new(payload, context))
    }

    /// Decode the value, charging vector data to `memory`.
    pub fn deserialize<T: Wire>(&self, memory: &Arc<VectorDataMemoryManager>) -> Result<T, SerializeError> {
        self.context.deserialize(&self.payload, memory)
    }

    /// The payload bytes.
    pub fn payload(&self) -> &ByteBlock {
        &self.payload
    }

    /// The index tables and memo storage.
    pub fn context(&self) -> &SerializedObjectContext {
        &self.context
    }

    /// A fresh context holding this object's tables, for decoding values
    /// written against them.
    pub fn seeded_context(&self) -> SerializedObjectContext {
        self.context.clone()
    }

    /// Payload plus memo bytes. Shared nodes are not counted.
    pub fn byte_count(&self) -> usize {
        self.payload.total_byte_count() + self.context.memo().total_bytes()
    }

    /// Content hash over payload, tables and memo storage.
    pub fn hash(&self) -> ContentHash {
        *self.hash.get_or_init(|| {
            let mut hasher = ContentHasher::new();
            hasher.update_str("SerializedObject");
            self.context.hash_into(&mut hasher);
            self.payload.hash_into(&mut hasher);
            hasher.finalize()
        })
    }
}

impl PartialEq for SerializedObject {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for SerializedObject {}

impl PartialOrd for SerializedObject {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SerializedObject {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash().cmp(&other.hash())
    }
}

impl Hash for SerializedObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        SerializedObject::hash(self).hash(state);
    }
}

impl fmt::Debug for SerializedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedObject")
            .field("hash", &self.hash())
            .field("payload_bytes", &self.payload.total_byte_count())
            .field("types", &self.context.types().len())
            .field("judgments", &self.context.judgments().len())
            .field("expressions", &self.context.expressions().len())
            .field("cfgs", &self.context.cfgs().len())
            .field("memo_entries", &self.context.memo().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Expression, Judgment, Type, Value};

    fn sample() -> Value {
        let t = Type::tuple(vec![Type::int64(), Type::string()]);
        Value::tuple(vec![
            Value::Type(t.clone()),
            Value::Type(t),
            Value::Expression(Expression::apply(
                Expression::variable("f"),
                vec![Expression::constant(Value::Int64(1))],
            )),
            Value::string("s".repeat(500)),
        ])
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let a = SerializedObject::serialize(&sample());
        let b = SerializedObject::serialize(&sample());
        assert_eq!(SerializedObject::hash(&a), SerializedObject::hash(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_roundtrip() {
        let so = SerializedObject::serialize(&sample());
        assert_eq!(so.context().types().len(), 1);
        assert_eq!(so.context().expressions().len(), 1);
        assert_eq!(so.context().memo().len(), 1);

        let back: Value = so.deserialize(&VectorDataMemoryManager::free_store()).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_hash_depends_on_tables() {
        let a = SerializedObject::serialize(&Type::int64());
        let b = SerializedObject::serialize(&Type::float64());
        // Both payloads are the single index 0.
        assert_eq!(a.payload(), b.payload());
        assert_ne!(SerializedObject::hash(&a), SerializedObject::hash(&b));
    }

    #[test]
    fn test_hash_is_cached() {
        let so = SerializedObject::serialize(&Judgment::of_type(Type::int64()));
        let first = SerializedObject::hash(&so);
        assert_eq!(SerializedObject::hash(&so), first);
        assert!(so.hash.get().is_some());
    }

    #[test]
    fn test_seeded_context_decodes_payload() {
        let so = SerializedObject::serialize(&vec![Type::int64(), Type::bool()]);
        let ctx = so.seeded_context();
        let back: Vec<Type> = ctx
            .deserialize(so.payload(), &VectorDataMemoryManager::free_store())
            .unwrap();
        assert_eq!(back, vec![Type::int64(), Type::bool()]);
    }
}
