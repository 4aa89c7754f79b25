//! Runtime types.

use std::fmt;
use std::sync::OnceLock;

use super::{depth_over, ModelError, Node, NodeBody};
use crate::serialize::{SerializeError, Wire, WireSink, WireSource};

/// A fixed-width integer type. `bits == 1` is the boolean type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerType {
    /// Width in bits: 1, 8, 16, 32 or 64.
    pub bits: u8,
    /// Whether the integer is signed.
    pub signed: bool,
}

/// An IEEE float type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatType {
    /// Width in bits: 32 or 64.
    pub bits: u8,
}

/// A tuple type with optionally named elements.
#[derive(Debug, Clone)]
pub struct TupleType {
    /// Element types.
    pub elements: Vec<Type>,
    /// Element names, same length as `elements`.
    pub names: Vec<Option<String>>,
}

/// A symbol-tagged alternative.
#[derive(Debug, Clone)]
pub struct AlternativeType {
    /// The alternative's symbol.
    pub symbol: String,
    /// Payload type.
    pub payload: Type,
}

crate::tagged_union! {
    /// Structure of a [`Type`].
    #[derive(Debug)]
    pub enum TypeBody: TypeTag {
        /// The empty type.
        Nothing,
        /// Strings.
        String,
        /// Symbols.
        Symbol,
        /// The type of types.
        Metatype,
        /// Quoted expressions.
        Expression,
        /// Integers and booleans.
        Integer(IntegerType),
        /// Floats.
        Float(FloatType),
        /// Tuples.
        Tuple(TupleType),
        /// Alternatives.
        Alternative(AlternativeType),
    }
}

/// A runtime type.
pub type Type = Node<TypeBody>;

impl NodeBody for TypeBody {
    const DOMAIN: &'static str = "fora.type";

    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            TypeBody::Nothing => sink.put_u8(0),
            TypeBody::String => sink.put_u8(1),
            TypeBody::Symbol => sink.put_u8(2),
            TypeBody::Metatype => sink.put_u8(3),
            TypeBody::Expression => sink.put_u8(4),
            TypeBody::Integer(i) => {
                sink.put_u8(5);
                sink.put_u8(i.bits);
                sink.put_bool(i.signed);
            }
            TypeBody::Float(f) => {
                sink.put_u8(6);
                sink.put_u8(f.bits);
            }
            TypeBody::Tuple(t) => {
                sink.put_u8(7);
                t.elements.encode(sink);
                for name in &t.names {
                    match name {
                        None => sink.put_u8(0),
                        Some(n) => {
                            sink.put_u8(1);
                            sink.put_str(n);
                        }
                    }
                }
            }
            TypeBody::Alternative(a) => {
                sink.put_u8(8);
                sink.put_str(&a.symbol);
                sink.put_type(&a.payload);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        let tag = source.get_u8()?;
        Ok(match tag {
            0 => TypeBody::Nothing,
            1 => TypeBody::String,
            2 => TypeBody::Symbol,
            3 => TypeBody::Metatype,
            4 => TypeBody::Expression,
            5 => {
                let bits = source.get_u8()?;
                let signed = source.get_bool()?;
                if !matches!(bits, 1 | 8 | 16 | 32 | 64) {
                    return Err(SerializeError::InvalidTag {
                        what: "integer width",
                        tag: bits.into(),
                    });
                }
                TypeBody::Integer(IntegerType { bits, signed })
            }
            6 => {
                let bits = source.get_u8()?;
                if !matches!(bits, 32 | 64) {
                    return Err(SerializeError::InvalidTag {
                        what: "float width",
                        tag: bits.into(),
                    });
                }
                TypeBody::Float(FloatType { bits })
            }
            7 => {
                let elements = Vec::<Type>::decode(source)?;
                let names = (0..elements.len())
                    .map(|_| Option::<String>::decode(source))
                    .collect::<Result<Vec<_>, _>>()?;
                TypeBody::Tuple(TupleType { elements, names })
            }
            8 => {
                let symbol = source.get_str()?;
                let payload = source.get_type()?;
                TypeBody::Alternative(AlternativeType { symbol, payload })
            }
            tag => {
                return Err(SerializeError::InvalidTag {
                    what: "type",
                    tag: tag.into(),
                })
            }
        })
    }

    fn depth(&self) -> u32 {
        match self {
            TypeBody::Tuple(t) => depth_over(&t.elements),
            TypeBody::Alternative(a) => a.payload.depth() + 1,
            _ => 0,
        }
    }
}

macro_rules! well_known {
    ($(#[$meta:meta])* $name:ident => $body:expr) => {
        $(#[$meta])*
        pub fn $name() -> Type {
            static CELL: OnceLock<Type> = OnceLock::new();
            CELL.get_or_init(|| Type::new($body)).clone()
        }
    };
}

impl Type {
    well_known!(
        /// The empty type.
        nothing => TypeBody::Nothing
    );
    well_known!(
        /// Strings.
        string => TypeBody::String
    );
    well_known!(
        /// Symbols.
        symbol => TypeBody::Symbol
    );
    well_known!(
        /// The type of types.
        metatype => TypeBody::Metatype
    );
    well_known!(
        /// Quoted expressions.
        expression => TypeBody::Expression
    );
    well_known!(
        /// Booleans.
        bool => TypeBody::Integer(IntegerType { bits: 1, signed: false })
    );
    well_known!(
        /// Unsigned bytes.
        uint8 => TypeBody::Integer(IntegerType { bits: 8, signed: false })
    );
    well_known!(
        /// Signed 32-bit integers.
        int32 => TypeBody::Integer(IntegerType { bits: 32, signed: true })
    );
    well_known!(
        /// Signed 64-bit integers.
        int64 => TypeBody::Integer(IntegerType { bits: 64, signed: true })
    );
    well_known!(
        /// 32-bit floats.
        float32 => TypeBody::Float(FloatType { bits: 32 })
    );
    well_known!(
        /// 64-bit floats.
        float64 => TypeBody::Float(FloatType { bits: 64 })
    );

    /// An unnamed tuple.
    pub fn tuple(elements: Vec<Type>) -> Type {
        let names = vec![None; elements.len()];
        Type::new(TypeBody::Tuple(TupleType { elements, names }))
    }

    /// A tuple with per-element names.
    pub fn named_tuple(elements: Vec<Type>, names: Vec<Option<String>>) -> Result<Type, ModelError> {
        if elements.len() != names.len() {
            return Err(ModelError::NameCountMismatch {
                elements: elements.len(),
                names: names.len(),
            });
        }
        Ok(Type::new(TypeBody::Tuple(TupleType { elements, names })))
    }

    /// An alternative tagged by `symbol`.
    pub fn alternative(symbol: impl Into<String>, payload: Type) -> Type {
        Type::new(TypeBody::Alternative(AlternativeType {
            symbol: symbol.into(),
            payload,
        }))
    }

    /// Size in bytes of a packed instance, or `None` when values of this
    /// type must be stored boxed.
    pub fn pod_size(&self) -> Option<usize> {
        match self.body() {
            TypeBody::Integer(i) => match (i.bits, i.signed) {
                (1, false) | (8, false) => Some(1),
                (32, true) => Some(4),
                (64, true) => Some(8),
                _ => None,
            },
            TypeBody::Float(f) => Some(usize::from(f.bits / 8)),
            TypeBody::Tuple(t) => {
                let mut total = 0;
                for e in &t.elements {
                    total += e.pod_size()?;
                }
                (total > 0).then_some(total)
            }
            _ => None,
        }
    }

    /// Whether values of this type can be packed.
    pub fn is_pod(&self) -> bool {
        self.pod_size().is_some()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.body() {
            TypeBody::Nothing => f.write_str("Nothing"),
            TypeBody::String => f.write_str("String"),
            TypeBody::Symbol => f.write_str("Symbol"),
            TypeBody::Metatype => f.write_str("Type"),
            TypeBody::Expression => f.write_str("Expression"),
            TypeBody::Integer(IntegerType { bits: 1, .. }) => f.write_str("Bool"),
            TypeBody::Integer(i) => write!(f, "{}Int{}", if i.signed { "" } else { "U" }, i.bits),
            TypeBody::Float(fl) => write!(f, "Float{}", fl.bits),
            TypeBody::Tuple(t) => {
                f.write_str("(")?;
                for (i, (e, name)) in t.elements.iter().zip(&t.names).enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some(n) = name {
                        write!(f, "{n}: ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(")")
            }
            TypeBody::Alternative(a) => write!(f, "#{}({})", a.symbol, a.payload),
        }
    }
}
