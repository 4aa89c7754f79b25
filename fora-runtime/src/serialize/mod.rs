//! # Object-Graph Serialization
//!
//! ```text
//! value ──serialize──▶ SerializedObject ──flatten──▶ ByteBlock
//!   ▲                   (payload + index maps)           │
//!   └────deserialize─── SerializedObject ◀──inflate──────┘
//! ```
//!
//! - [`wire`]: sink/source traits every serializable type is written against.
//! - [`context`]: the explicit per-call context that replaces shared nodes
//!   (types, judgments, expressions, control-flow graphs) with small indices.
//! - [`memo`]: content-hash keyed storage for large shared values.
//! - [`object`]: the immutable, hash-addressed [`SerializedObject`].
//! - [`flatten`]: self-describing byte blocks, deduplicated by content hash
//!   across one flattener's lifetime.
//! - [`stream`]: framed object streams with an explicit end-of-stream result.

pub mod byte_block;
pub mod context;
pub mod flatten;
pub mod memo;
pub mod object;
pub mod stream;
pub mod wire;

pub use byte_block::ByteBlock;
pub use context::{ContextDeserializer, ContextSerializer, IndexedTable, SerializedObjectContext};
pub use flatten::{SerializedObjectFlattener, SerializedObjectInflater};
pub use memo::{MemoEntry, MemoStorage, Memoizable};
pub use object::SerializedObject;
pub use stream::{FlatObjectReader, FlatObjectWriter, ReadNext};
pub use wire::{
    CanonicalReader, CanonicalWriter, DecodedNodes, EmittedNodes, HashingSink, SharedNode, Wire, WireSink, WireSource,
    MAX_DECODE_DEPTH,
};

use std::io;

use thiserror::Error;

use crate::memory::MemoryError;
use crate::tagged::TaggedError;

/// Serialization errors.
///
/// Everything except [`Memory`](Self::Memory) and [`Io`](Self::Io)
/// indicates malformed or truncated input.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// Input ended inside a value.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// A varint ran past ten bytes or overflowed.
    #[error("invalid varint")]
    InvalidVarint,

    /// An enum discriminant outside the known range.
    #[error("invalid {what} tag {tag}")]
    InvalidTag {
        /// What was being decoded.
        what: &'static str,
        /// The offending tag.
        tag: u64,
    },

    /// A reference to an index the context does not hold.
    #[error("no {kind} at index {index}")]
    MissingIndex {
        /// Table name.
        kind: &'static str,
        /// Requested index.
        index: u64,
    },

    /// Decoded content does not match its recorded hash.
    #[error("content hash mismatch in {kind} entry")]
    HashMismatch {
        /// Table name.
        kind: &'static str,
    },

    /// Flattened data does not start with the expected magic.
    #[error("bad magic bytes")]
    BadMagic,

    /// A string field is not UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A length field exceeds the remaining input.
    #[error("length {len} exceeds remaining {remaining} bytes")]
    LengthOverflow {
        /// Declared length.
        len: u64,
        /// Bytes left.
        remaining: usize,
    },

    /// Bytes left over after the top-level value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Structurally invalid content.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// A node accessed as the wrong variant.
    #[error(transparent)]
    Tagged(#[from] TaggedError),

    /// Vector memory could not be reserved for decoded data.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Underlying reader or writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SerializeError {
    /// Whether the error means the input itself is bad, as opposed to a
    /// resource or I/O failure while handling it.
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, SerializeError::Memory(_) | SerializeError::Io(_))
    }
}
