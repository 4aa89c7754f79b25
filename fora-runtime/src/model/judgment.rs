//! Judgments: what is known statically about a value.

use super::{depth_over, Node, NodeBody, Type, Value};
use crate::serialize::{SerializeError, Wire, WireSink, WireSource};

/// The value has exactly this type.
#[derive(Debug, Clone)]
pub struct KnownJudgment {
    /// The type.
    pub ty: Type,
}

/// The value is exactly this constant.
#[derive(Debug, Clone)]
pub struct ConstantJudgment {
    /// The constant.
    pub value: Value,
}

/// The value satisfies one of several judgments.
#[derive(Debug, Clone)]
pub struct UnionJudgment {
    /// Alternatives, sorted by hash without duplicates.
    pub alternatives: Vec<Judgment>,
}

/// The value is a tuple with per-element judgments.
#[derive(Debug, Clone)]
pub struct TupleJudgment {
    /// Element judgments.
    pub elements: Vec<Judgment>,
}

crate::tagged_union! {
    /// Structure of a [`Judgment`].
    #[derive(Debug)]
    pub enum JudgmentBody: JudgmentTag {
        /// Nothing is known.
        Unknown,
        /// The type is known.
        Known(KnownJudgment),
        /// The value is known.
        Constant(ConstantJudgment),
        /// One of several.
        Union(UnionJudgment),
        /// Tuple of judgments.
        Tuple(TupleJudgment),
    }
}

/// A judgment of value.
pub type Judgment = Node<JudgmentBody>;

impl NodeBody for JudgmentBody {
    const DOMAIN: &'static str = "fora.judgment";

    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            JudgmentBody::Unknown => sink.put_u8(0),
            JudgmentBody::Known(k) => {
                sink.put_u8(1);
                sink.put_type(&k.ty);
            }
            JudgmentBody::Constant(c) => {
                sink.put_u8(2);
                c.value.encode(sink);
            }
            JudgmentBody::Union(u) => {
                sink.put_u8(3);
                u.alternatives.encode(sink);
            }
            JudgmentBody::Tuple(t) => {
                sink.put_u8(4);
                t.elements.encode(sink);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(match source.get_u8()? {
            0 => JudgmentBody::Unknown,
            1 => JudgmentBody::Known(KnownJudgment { ty: source.get_type()? }),
            2 => JudgmentBody::Constant(ConstantJudgment {
                value: Value::decode(source)?,
            }),
            3 => {
                let alternatives = Vec::<Judgment>::decode(source)?;
                if alternatives.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(SerializeError::Malformed("union alternatives not canonical".into()));
                }
                JudgmentBody::Union(UnionJudgment { alternatives })
            }
            4 => JudgmentBody::Tuple(TupleJudgment {
                elements: Vec::<Judgment>::decode(source)?,
            }),
            tag => {
                return Err(SerializeError::InvalidTag {
                    what: "judgment",
                    tag: tag.into(),
                })
            }
        })
    }

    fn depth(&self) -> u32 {
        match self {
            JudgmentBody::Union(u) => depth_over(&u.alternatives),
            JudgmentBody::Tuple(t) => depth_over(&t.elements),
            _ => 0,
        }
    }
}

impl Judgment {
    /// Nothing known.
    pub fn unknown() -> Judgment {
        Judgment::new(JudgmentBody::Unknown)
    }

    /// Type known.
    pub fn of_type(ty: Type) -> Judgment {
        Judgment::new(JudgmentBody::Known(KnownJudgment { ty }))
    }

    /// Value known.
    pub fn constant(value: Value) -> Judgment {
        Judgment::new(JudgmentBody::Constant(ConstantJudgment { value }))
    }

    /// Tuple of element judgments.
    pub fn tuple(elements: Vec<Judgment>) -> Judgment {
        Judgment::new(JudgmentBody::Tuple(TupleJudgment { elements }))
    }

    /// Union of `alternatives`. Nested unions are flattened and duplicates
    /// removed; a union containing `Unknown` is `Unknown`, and a single
    /// alternative is returned as is.
    pub fn union(alternatives: Vec<Judgment>) -> Judgment {
        let mut flat = Vec::with_capacity(alternatives.len());
        for alt in alternatives {
            match alt.body() {
                JudgmentBody::Unknown => return Judgment::unknown(),
                JudgmentBody::Union(u) => flat.extend(u.alternatives.iter().cloned()),
                _ => flat.push(alt),
            }
        }
        flat.sort();
        flat.dedup();
        match flat.len() {
            0 => Judgment::unknown(),
            1 => flat.remove(0),
            _ => Judgment::new(JudgmentBody::Union(UnionJudgment { alternatives: flat })),
        }
    }

    /// Whether `value` satisfies this judgment.
    pub fn covers(&self, value: &Value) -> bool {
        match self.body() {
            JudgmentBody::Unknown => true,
            JudgmentBody::Known(k) => value.type_of() == k.ty,
            JudgmentBody::Constant(c) => &c.value == value,
            JudgmentBody::Union(u) => u.alternatives.iter().any(|a| a.covers(value)),
            JudgmentBody::Tuple(t) => match value {
                Value::Tuple(vs) => vs.len() == t.elements.len() && t.elements.iter().zip(vs.iter()).all(|(j, v)| j.covers(v)),
                _ => false,
            },
        }
    }

    /// The type every covered value has, if there is exactly one.
    pub fn type_if_known(&self) -> Option<Type> {
        match self.body() {
            JudgmentBody::Unknown => None,
            JudgmentBody::Known(k) => Some(k.ty.clone()),
            JudgmentBody::Constant(c) => Some(c.value.type_of()),
            JudgmentBody::Tuple(t) => t
                .elements
                .iter()
                .map(Judgment::type_if_known)
                .collect::<Option<Vec<_>>>()
                .map(Type::tuple),
            JudgmentBody::Union(u) => {
                let mut types = u.alternatives.iter().map(Judgment::type_if_known);
                let first = types.next()??;
                types.all(|t| t.as_ref() == Some(&first)).then_some(first)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VectorDataMemoryManager;
    use crate::serialize::{CanonicalReader, CanonicalWriter};

    #[test]
    fn test_covers() {
        let j = Judgment::of_type(Type::int64());
        assert!(j.covers(&Value::Int64(4)));
        assert!(!j.covers(&Value::Float64(4.0)));

        let c = Judgment::constant(Value::Int64(4));
        assert!(c.covers(&Value::Int64(4)));
        assert!(!c.covers(&Value::Int64(5)));

        let t = Judgment::tuple(vec![Judgment::unknown(), c]);
        assert!(t.covers(&Value::tuple(vec![Value::string("x"), Value::Int64(4)])));
        assert!(!t.covers(&Value::tuple(vec![Value::Int64(4)])));
    }

    #[test]
    fn test_union_is_canonical() {
        let a = Judgment::of_type(Type::int64());
        let b = Judgment::of_type(Type::float64());
        let ab = Judgment::union(vec![a.clone(), b.clone()]);
        let ba = Judgment::union(vec![b.clone(), a.clone(), a.clone()]);
        assert_eq!(ab, ba);

        let nested = Judgment::union(vec![ab.clone(), a.clone()]);
        assert_eq!(nested, ab);

        assert_eq!(Judgment::union(vec![a.clone()]), a);
        assert_eq!(Judgment::union(vec![a, Judgment::unknown()]), Judgment::unknown());
    }

    #[test]
    fn test_type_if_known() {
        assert_eq!(Judgment::unknown().type_if_known(), None);
        assert_eq!(
            Judgment::constant(Value::Bool(true)).type_if_known(),
            Some(Type::bool())
        );

        let same = Judgment::union(vec![
            Judgment::constant(Value::Int64(1)),
            Judgment::constant(Value::Int64(2)),
        ]);
        assert_eq!(same.type_if_known(), Some(Type::int64()));

        let mixed = Judgment::union(vec![
            Judgment::constant(Value::Int64(1)),
            Judgment::of_type(Type::string()),
        ]);
        assert_eq!(mixed.type_if_known(), None);
    }

    #[test]
    fn test_canonical_roundtrip() {
        let j = Judgment::tuple(vec![
            Judgment::union(vec![Judgment::of_type(Type::int64()), Judgment::constant(Value::Nothing)]),
            Judgment::constant(Value::string("k".repeat(100))),
        ]);
        let bytes = CanonicalWriter::encode(&j);
        let back: Judgment = CanonicalReader::decode_all(&bytes, VectorDataMemoryManager::free_store()).unwrap();
        assert_eq!(back, j);
        assert_eq!(back.depth(), 2);
    }
}
