//! Control-flow graphs.
//!
//! A graph is a named entry node plus labelled blocks. Nodes pass arguments
//! to their successors through [`Continuation`]s; every label a continuation
//! names must exist in the graph.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{ModelError, Node, NodeBody, Value};
use crate::hash::ContentHash;
use crate::serialize::{HashingSink, SerializeError, Wire, WireSink, WireSource};

/// An argument passed along an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgArg {
    /// The current block's argument at this index.
    Arg(u32),
    /// A literal.
    Constant(Value),
}

impl Wire for CfgArg {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            CfgArg::Arg(i) => {
                sink.put_u8(0);
                sink.put_varint((*i).into());
            }
            CfgArg::Constant(v) => {
                sink.put_u8(1);
                v.encode(sink);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        match source.get_u8()? {
            0 => {
                let raw = source.get_varint()?;
                let index = u32::try_from(raw).map_err(|_| SerializeError::Malformed(format!("argument index {raw}")))?;
                Ok(CfgArg::Arg(index))
            }
            1 => Ok(CfgArg::Constant(Value::decode(source)?)),
            tag => Err(SerializeError::InvalidTag {
                what: "cfg argument",
                tag: tag.into(),
            }),
        }
    }
}

/// Transfer to a labelled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    /// Target block.
    pub label: String,
    /// Arguments for the target.
    pub args: Vec<CfgArg>,
}

impl Continuation {
    /// Jump to `label` with `args`.
    pub fn new(label: impl Into<String>, args: Vec<CfgArg>) -> Self {
        Self {
            label: label.into(),
            args,
        }
    }
}

impl Wire for Continuation {
    fn encode<S: WireSink>(&self, sink: &mut S) {
        sink.put_str(&self.label);
        self.args.encode(sink);
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(Self {
            label: source.get_str()?,
            args: Vec::<CfgArg>::decode(source)?,
        })
    }
}

/// Unconditional transfer.
#[derive(Debug, Clone)]
pub struct JumpNode {
    /// Successor.
    pub target: Continuation,
}

/// Two-way branch on a boolean argument.
#[derive(Debug, Clone)]
pub struct BranchNode {
    /// Index of the tested argument.
    pub arg: u32,
    /// Taken when true.
    pub if_true: Continuation,
    /// Taken when false.
    pub if_false: Continuation,
}

/// Call, with separate normal and exceptional successors.
#[derive(Debug, Clone)]
pub struct ApplyNode {
    /// Callee.
    pub function: CfgArg,
    /// Arguments.
    pub args: Vec<CfgArg>,
    /// Successor on return; receives the result appended to its args.
    pub normal: Continuation,
    /// Successor on throw.
    pub exception: Continuation,
}

/// Leave the graph.
#[derive(Debug, Clone)]
pub struct ReturnNode {
    /// Returned value.
    pub value: CfgArg,
    /// Whether this is an exceptional return.
    pub is_exception: bool,
}

crate::tagged_union! {
    /// Structure of a [`CfgNode`].
    #[derive(Debug)]
    pub enum CfgNodeBody: CfgNodeTag {
        /// Jump.
        Jump(JumpNode),
        /// Branch.
        Branch(BranchNode),
        /// Apply.
        Apply(ApplyNode),
        /// Return.
        Return(ReturnNode),
    }
}

/// One block of a control-flow graph.
pub type CfgNode = Node<CfgNodeBody>;

impl NodeBody for CfgNodeBody {
    const DOMAIN: &'static str = "fora.cfg.node";

    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            CfgNodeBody::Jump(j) => {
                sink.put_u8(0);
                j.target.encode(sink);
            }
            CfgNodeBody::Branch(b) => {
                sink.put_u8(1);
                sink.put_varint(b.arg.into());
                b.if_true.encode(sink);
                b.if_false.encode(sink);
            }
            CfgNodeBody::Apply(a) => {
                sink.put_u8(2);
                a.function.encode(sink);
                a.args.encode(sink);
                a.normal.encode(sink);
                a.exception.encode(sink);
            }
            CfgNodeBody::Return(r) => {
                sink.put_u8(3);
                r.value.encode(sink);
                sink.put_bool(r.is_exception);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(match source.get_u8()? {
            0 => CfgNodeBody::Jump(JumpNode {
                target: Continuation::decode(source)?,
            }),
            1 => {
                let raw = source.get_varint()?;
                let arg = u32::try_from(raw).map_err(|_| SerializeError::Malformed(format!("branch argument {raw}")))?;
                CfgNodeBody::Branch(BranchNode {
                    arg,
                    if_true: Continuation::decode(source)?,
                    if_false: Continuation::decode(source)?,
                })
            }
            2 => CfgNodeBody::Apply(ApplyNode {
                function: CfgArg::decode(source)?,
                args: Vec::<CfgArg>::decode(source)?,
                normal: Continuation::decode(source)?,
                exception: Continuation::decode(source)?,
            }),
            3 => CfgNodeBody::Return(ReturnNode {
                value: CfgArg::decode(source)?,
                is_exception: source.get_bool()?,
            }),
            tag => {
                return Err(SerializeError::InvalidTag {
                    what: "cfg node",
                    tag: tag.into(),
                })
            }
        })
    }

    fn depth(&self) -> u32 {
        0
    }
}

impl CfgNode {
    /// Unconditional jump.
    pub fn jump(target: Continuation) -> CfgNode {
        CfgNode::new(CfgNodeBody::Jump(JumpNode { target }))
    }

    /// Branch on argument `arg`.
    pub fn branch(arg: u32, if_true: Continuation, if_false: Continuation) -> CfgNode {
        CfgNode::new(CfgNodeBody::Branch(BranchNode { arg, if_true, if_false }))
    }

    /// Call `function` with `args`.
    pub fn apply(function: CfgArg, args: Vec<CfgArg>, normal: Continuation, exception: Continuation) -> CfgNode {
        CfgNode::new(CfgNodeBody::Apply(ApplyNode {
            function,
            args,
            normal,
            exception,
        }))
    }

    /// Return `value`.
    pub fn ret(value: CfgArg, is_exception: bool) -> CfgNode {
        CfgNode::new(CfgNodeBody::Return(ReturnNode { value, is_exception }))
    }

    /// Successor continuations in declaration order.
    pub fn successors(&self) -> Vec<&Continuation> {
        match self.body() {
            CfgNodeBody::Jump(j) => vec![&j.target],
            CfgNodeBody::Branch(b) => vec![&b.if_true, &b.if_false],
            CfgNodeBody::Apply(a) => vec![&a.normal, &a.exception],
            CfgNodeBody::Return(_) => Vec::new(),
        }
    }
}

// ============================================================================
// Graph
// ============================================================================

struct CfgData {
    name: String,
    entry: CfgNode,
    blocks: BTreeMap<String, CfgNode>,
    hash: ContentHash,
}

/// An immutable, hash-identified control-flow graph.
#[derive(Clone)]
pub struct ControlFlowGraph(Arc<CfgData>);

impl ControlFlowGraph {
    /// Build a graph, checking that every continuation targets a block.
    pub fn new(
        name: impl Into<String>,
        entry: CfgNode,
        blocks: BTreeMap<String, CfgNode>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        for node in std::iter::once(&entry).chain(blocks.values()) {
            for cont in node.successors() {
                if !blocks.contains_key(&cont.label) {
                    return Err(ModelError::UnknownLabel {
                        graph: name,
                        label: cont.label.clone(),
                    });
                }
            }
        }

        let mut sink = HashingSink::new("fora.cfg");
        write_graph(&mut sink, &name, &entry, &blocks);
        let hash = sink.finalize();
        Ok(Self(Arc::new(CfgData {
            name,
            entry,
            blocks,
            hash,
        })))
    }

    /// Content hash.
    pub fn hash(&self) -> ContentHash {
        self.0.hash
    }

    /// Graph name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Entry node.
    pub fn entry(&self) -> &CfgNode {
        &self.0.entry
    }

    /// Block by label.
    pub fn block(&self, label: &str) -> Option<&CfgNode> {
        self.0.blocks.get(label)
    }

    /// Blocks in label order.
    pub fn blocks(&self) -> impl Iterator<Item = (&str, &CfgNode)> {
        self.0.blocks.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of labelled blocks.
    pub fn block_count(&self) -> usize {
        self.0.blocks.len()
    }

    /// Write the graph's structure.
    pub fn encode_body<S: WireSink>(&self, sink: &mut S) {
        write_graph(sink, &self.0.name, &self.0.entry, &self.0.blocks);
    }

    /// Read a graph's structure.
    pub fn decode_body<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        let name = source.get_str()?;
        let entry = CfgNode::decode_body(source)?;
        let count = source.get_len(2)?;
        let mut blocks = BTreeMap::new();
        for _ in 0..count {
            let label = source.get_str()?;
            let node = CfgNode::decode_body(source)?;
            if blocks.insert(label.clone(), node).is_some() {
                return Err(SerializeError::Malformed(format!("duplicate block '{label}'")));
            }
        }
        Ok(Self::new(name, entry, blocks)?)
    }
}

fn write_graph<S: WireSink>(sink: &mut S, name: &str, entry: &CfgNode, blocks: &BTreeMap<String, CfgNode>) {
    sink.put_str(name);
    entry.encode_body(sink);
    sink.put_varint(blocks.len() as u64);
    for (label, node) in blocks {
        sink.put_str(label);
        node.encode_body(sink);
    }
}

impl PartialEq for ControlFlowGraph {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for ControlFlowGraph {}

impl PartialOrd for ControlFlowGraph {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ControlFlowGraph {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash().cmp(&other.hash())
    }
}

impl Hash for ControlFlowGraph {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl fmt::Debug for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlFlowGraph")
            .field("name", &self.0.name)
            .field("hash", &self.0.hash)
            .field("blocks", &self.0.blocks.len())
            .finish()
    }
}
