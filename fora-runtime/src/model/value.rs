//! Runtime values.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::types::{IntegerType, TypeBody};
use super::{Expression, Type};
use crate::serialize::{Memoizable, SerializeError, Wire, WireSink, WireSource};

/// Strings at least this long are written through memo storage.
pub const MEMO_STRING_THRESHOLD: usize = 64;

// ============================================================================
// Strings
// ============================================================================

/// An immutable shared string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FString(Arc<str>);

impl FString {
    /// The string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for FString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<String> for FString {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for FString {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl fmt::Debug for FString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for FString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Memoizable for FString {
    const KIND: &'static str = "string";

    fn encode_memo<S: WireSink>(&self, sink: &mut S) {
        sink.put_str(&self.0);
    }

    fn decode_memo<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(Self::from(source.get_str()?))
    }
}

impl Wire for FString {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        if self.len() >= MEMO_STRING_THRESHOLD {
            sink.put_u8(1);
            sink.put_memo(self);
        } else {
            sink.put_u8(0);
            sink.put_str(&self.0);
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        match source.get_u8()? {
            0 => Ok(Self::from(source.get_str()?)),
            1 => source.get_memo(),
            tag => Err(SerializeError::InvalidTag {
                what: "string",
                tag: tag.into(),
            }),
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// A dynamically typed runtime value.
///
/// Floats compare by bit pattern, so `NaN == NaN` holds for identical NaNs
/// and `0.0 != -0.0`.
#[derive(Debug, Clone)]
pub enum Value {
    /// The unit value.
    Nothing,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int64(i64),
    /// A signed 32-bit integer.
    Int32(i32),
    /// A byte.
    UInt8(u8),
    /// A 64-bit float.
    Float64(f64),
    /// A 32-bit float.
    Float32(f32),
    /// A string.
    String(FString),
    /// A symbol.
    Symbol(Arc<str>),
    /// A tuple of values.
    Tuple(Arc<[Value]>),
    /// A type as a value.
    Type(Type),
    /// A quoted expression.
    Expression(Expression),
}

impl Value {
    /// Build a tuple.
    pub fn tuple(elements: Vec<Value>) -> Value {
        Value::Tuple(elements.into())
    }

    /// Build a string value.
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(FString::from(s.into()))
    }

    /// Build a symbol.
    pub fn symbol(s: &str) -> Value {
        Value::Symbol(s.into())
    }

    /// The value's type.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Nothing => Type::nothing(),
            Value::Bool(_) => Type::bool(),
            Value::Int64(_) => Type::int64(),
            Value::Int32(_) => Type::int32(),
            Value::UInt8(_) => Type::uint8(),
            Value::Float64(_) => Type::float64(),
            Value::Float32(_) => Type::float32(),
            Value::String(_) => Type::string(),
            Value::Symbol(_) => Type::symbol(),
            Value::Tuple(vs) => Type::tuple(vs.iter().map(Value::type_of).collect()),
            Value::Type(_) => Type::metatype(),
            Value::Expression(_) => Type::expression(),
        }
    }

    /// Write the packed form of a value whose type is POD into `out`,
    /// returning the number of bytes written.
    ///
    /// # Panics
    /// Panics if `out` is shorter than the type's packed size.
    pub(crate) fn write_pod(&self, out: &mut [u8]) -> usize {
        match self {
            Value::Bool(b) => {
                out[0] = u8::from(*b);
                1
            }
            Value::UInt8(v) => {
                out[0] = *v;
                1
            }
            Value::Int32(v) => put_le(out, &v.to_le_bytes()),
            Value::Int64(v) => put_le(out, &v.to_le_bytes()),
            Value::Float32(v) => put_le(out, &v.to_bits().to_le_bytes()),
            Value::Float64(v) => put_le(out, &v.to_bits().to_le_bytes()),
            Value::Tuple(vs) => {
                let mut n = 0;
                for v in vs.iter() {
                    n += v.write_pod(&mut out[n..]);
                }
                n
            }
            _ => 0,
        }
    }

    /// Read a packed value of POD type `ty` from the front of `bytes`.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than the type's packed size.
    pub(crate) fn read_pod(ty: &Type, bytes: &[u8]) -> Value {
        match ty.body() {
            TypeBody::Integer(IntegerType { bits: 1, .. }) => Value::Bool(bytes[0] != 0),
            TypeBody::Integer(IntegerType { bits: 8, .. }) => Value::UInt8(bytes[0]),
            TypeBody::Integer(IntegerType { bits: 32, .. }) => Value::Int32(i32::from_le_bytes(take_le(bytes))),
            TypeBody::Integer(_) => Value::Int64(i64::from_le_bytes(take_le(bytes))),
            TypeBody::Float(f) if f.bits == 32 => Value::Float32(f32::from_bits(u32::from_le_bytes(take_le(bytes)))),
            TypeBody::Float(_) => Value::Float64(f64::from_bits(u64::from_le_bytes(take_le(bytes)))),
            TypeBody::Tuple(t) => {
                let mut offset = 0;
                let elements = t
                    .elements
                    .iter()
                    .map(|e| {
                        let v = Value::read_pod(e, &bytes[offset..]);
                        offset += e.pod_size().unwrap_or(0);
                        v
                    })
                    .collect();
                Value::tuple(elements)
            }
            _ => Value::Nothing,
        }
    }
}

fn put_le(out: &mut [u8], bytes: &[u8]) -> usize {
    out[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}

fn take_le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut b = [0u8; N];
    b.copy_from_slice(&bytes[..N]);
    b
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::UInt8(a), Value::UInt8(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Expression(a), Value::Expression(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Wire for Value {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            Value::Nothing => sink.put_u8(0),
            Value::Bool(b) => {
                sink.put_u8(1);
                sink.put_bool(*b);
            }
            Value::Int64(v) => {
                sink.put_u8(2);
                sink.put_svarint(*v);
            }
            Value::Int32(v) => {
                sink.put_u8(3);
                sink.put_svarint(i64::from(*v));
            }
            Value::UInt8(v) => {
                sink.put_u8(4);
                sink.put_u8(*v);
            }
            Value::Float64(v) => {
                sink.put_u8(5);
                sink.put_f64(*v);
            }
            Value::Float32(v) => {
                sink.put_u8(6);
                sink.put_f32(*v);
            }
            Value::String(s) => {
                sink.put_u8(7);
                s.encode(sink);
            }
            Value::Symbol(s) => {
                sink.put_u8(8);
                sink.put_str(s);
            }
            Value::Tuple(vs) => {
                sink.put_u8(9);
                sink.put_varint(vs.len() as u64);
                for v in vs.iter() {
                    v.encode(sink);
                }
            }
            Value::Type(t) => {
                sink.put_u8(10);
                sink.put_type(t);
            }
            Value::Expression(e) => {
                sink.put_u8(11);
                sink.put_expression(e);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(match source.get_u8()? {
            0 => Value::Nothing,
            1 => Value::Bool(source.get_bool()?),
            2 => Value::Int64(source.get_svarint()?),
            3 => {
                let v = source.get_svarint()?;
                Value::Int32(i32::try_from(v).map_err(|_| SerializeError::Malformed(format!("int32 out of range: {v}")))?)
            }
            4 => Value::UInt8(source.get_u8()?),
            5 => Value::Float64(source.get_f64()?),
            6 => Value::Float32(source.get_f32()?),
            7 => Value::String(FString::decode(source)?),
            8 => Value::Symbol(source.get_str()?.into()),
            9 => {
                let len = source.get_len(1)?;
                let elements = source.nested(|s| (0..len).map(|_| Value::decode(s)).collect::<Result<Vec<_>, _>>())?;
                Value::tuple(elements)
            }
            10 => Value::Type(source.get_type()?),
            11 => Value::Expression(source.get_expression()?),
            tag => {
                return Err(SerializeError::InvalidTag {
                    what: "value",
                    tag: tag.into(),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VectorDataMemoryManager;
    use crate::serialize::{CanonicalReader, CanonicalWriter};

    fn roundtrip(v: &Value) -> Value {
        let bytes = CanonicalWriter::encode(v);
        CanonicalReader::decode_all(&bytes, VectorDataMemoryManager::free_store()).unwrap()
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
        assert_ne!(Value::Float64(1.0), Value::Float32(1.0));
    }

    #[test]
    fn test_type_of() {
        let v = Value::tuple(vec![Value::Int64(1), Value::Bool(true), Value::string("x")]);
        assert_eq!(
            v.type_of(),
            Type::tuple(vec![Type::int64(), Type::bool(), Type::string()])
        );
        assert_eq!(Value::Type(Type::int64()).type_of(), Type::metatype());
    }

    #[test]
    fn test_pod_roundtrip() {
        let v = Value::tuple(vec![Value::Int32(-7), Value::Float64(2.5), Value::Bool(true), Value::UInt8(9)]);
        let ty = v.type_of();
        let size = ty.pod_size().unwrap();
        assert_eq!(size, 14);

        let mut buf = vec![0u8; size];
        assert_eq!(v.write_pod(&mut buf), size);
        assert_eq!(Value::read_pod(&ty, &buf), v);
    }

    #[test]
    fn test_wire_roundtrip_mixed() {
        let v = Value::tuple(vec![
            Value::Nothing,
            Value::Int32(i32::MIN),
            Value::Float32(1.25),
            Value::symbol("sym"),
            Value::string("short"),
            Value::string("long".repeat(40)),
            Value::Type(Type::tuple(vec![Type::string()])),
        ]);
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn test_long_strings_use_memo() {
        let mut ctx = crate::serialize::SerializedObjectContext::new();
        ctx.serialize(&Value::string("a".repeat(MEMO_STRING_THRESHOLD - 1)));
        assert!(ctx.memo().is_empty());
        ctx.serialize(&Value::string("a".repeat(MEMO_STRING_THRESHOLD)));
        assert_eq!(ctx.memo().len(), 1);
    }

    #[test]
    fn test_int32_range_checked() {
        let mut w = CanonicalWriter::new();
        w.put_u8(3);
        w.put_svarint(i64::from(i32::MAX) + 1);
        let bytes = w.into_bytes();
        let err = CanonicalReader::decode_all::<Value>(&bytes, VectorDataMemoryManager::free_store()).unwrap_err();
        assert!(matches!(err, SerializeError::Malformed(_)));
    }
}
