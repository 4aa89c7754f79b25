//! # Value Model
//!
//! Structural nodes ([`Type`], [`Judgment`], [`Expression`], control-flow
//! nodes) are [`Node`]s: a reference-counted tagged cell whose common block
//! carries the node's content hash and depth. Equality, ordering and hashing
//! go through the content hash, so two separately built but identical nodes
//! compare equal and share one index during serialization.
//!
//! [`Value`] is the dynamically typed runtime value stored in vectors and
//! embedded in judgments and expressions.

pub mod cfg;
pub mod expression;
pub mod judgment;
pub mod types;
pub mod value;

pub use cfg::{
    ApplyNode, BranchNode, CfgArg, CfgNode, CfgNodeBody, CfgNodeTag, Continuation, ControlFlowGraph, JumpNode,
    ReturnNode,
};
pub use expression::{
    ApplyExpr, ConstantExpr, Expression, ExpressionBody, ExpressionTag, IfExpr, LetExpr, TupleExpr, VariableExpr,
};
pub use judgment::{ConstantJudgment, Judgment, JudgmentBody, JudgmentTag, KnownJudgment, TupleJudgment, UnionJudgment};
pub use types::{AlternativeType, FloatType, IntegerType, TupleType, Type, TypeBody, TypeTag};
pub use value::{FString, Value};

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use crate::hash::ContentHash;
use crate::serialize::{HashingSink, SerializeError, WireSink, WireSource};
use crate::tagged::{Tagged, TaggedBody, TaggedError, Variant};

/// Errors building model values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// A continuation names a block the graph does not contain.
    #[error("control flow graph '{graph}' has no block '{label}'")]
    UnknownLabel {
        /// Graph name.
        graph: String,
        /// Missing label.
        label: String,
    },

    /// Tuple names and elements differ in length.
    #[error("tuple has {elements} elements but {names} names")]
    NameCountMismatch {
        /// Element count.
        elements: usize,
        /// Name count.
        names: usize,
    },
}

impl From<ModelError> for SerializeError {
    fn from(e: ModelError) -> Self {
        SerializeError::Malformed(e.to_string())
    }
}

/// Fields shared by every node variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCommon {
    /// Content hash of the node.
    pub hash: ContentHash,
    /// Longest path to a leaf; leaves are depth 0.
    pub depth: u32,
}

/// A body enum that can live in a [`Node`].
pub trait NodeBody: TaggedBody + Sized {
    /// Hash domain, distinct per node family.
    const DOMAIN: &'static str;

    /// Write the body. Child nodes go through the sink's shared-node methods.
    fn encode<S: WireSink>(&self, sink: &mut S);

    /// Read a body.
    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError>;

    /// Depth of the deepest child plus one, or 0 for leaves.
    fn depth(&self) -> u32;
}

/// A hash-identified, reference-counted structural node.
pub struct Node<B: NodeBody>(Tagged<NodeCommon, B>);

impl<B: NodeBody> Node<B> {
    /// Build a node, computing its hash from `body`.
    pub fn new(body: B) -> Self {
        let mut sink = HashingSink::new(B::DOMAIN);
        body.encode(&mut sink);
        let common = NodeCommon {
            hash: sink.finalize(),
            depth: body.depth(),
        };
        Self(Tagged::new(common, body))
    }

    /// Content hash.
    pub fn hash(&self) -> ContentHash {
        self.0.common().hash
    }

    /// Depth of the node.
    pub fn depth(&self) -> u32 {
        self.0.common().depth
    }

    /// Variant discriminant.
    pub fn tag(&self) -> B::Tag {
        self.0.tag()
    }

    /// Variant body.
    pub fn body(&self) -> &B {
        self.0.body()
    }

    /// Checked access to one variant's payload.
    pub fn data<V: Variant<B>>(&self) -> Result<&V, TaggedError> {
        self.0.data::<V>()
    }

    /// Whether both handles share one allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// Number of live handles to this allocation.
    pub fn refcount(&self) -> usize {
        self.0.refcount()
    }

    /// Write this node's structure.
    pub fn encode_body<S: WireSink>(&self, sink: &mut S) {
        self.body().encode(sink);
    }

    /// Read a node's structure.
    pub fn decode_body<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(Self::new(B::decode(source)?))
    }
}

impl<B: NodeBody> Clone for Node<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: NodeBody> PartialEq for Node<B> {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl<B: NodeBody> Eq for Node<B> {}

impl<B: NodeBody> PartialOrd for Node<B> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<B: NodeBody> Ord for Node<B> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash().cmp(&other.hash())
    }
}

impl<B: NodeBody> Hash for Node<B> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Node::hash(self).hash(state);
    }
}

impl<B: NodeBody + fmt::Debug> fmt::Debug for Node<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.body(), f)
    }
}

/// Depth of a node with the given children.
pub(crate) fn depth_over<'a, B: NodeBody + 'a>(children: impl IntoIterator<Item = &'a Node<B>>) -> u32 {
    children.into_iter().map(|c| c.depth() + 1).max().unwrap_or(0)
}
