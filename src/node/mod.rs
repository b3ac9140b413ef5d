//! On-disk/in-memory node formats: inner, inner-prefix, leaf/binary,
//! and value nodes, plus the shared cacheline-base table.
//!
//! Inner and inner-prefix nodes share one representation
//! ([`inner::InnerNode`]) distinguished only by whether `prefix` is
//! non-empty — a closed sum type over a single struct rather than two
//! near-duplicate ones, favoring a tag-and-switch dispatch over virtual
//! dispatch so size-specific layouts stay cache-friendly.

pub mod cline;
pub mod inner;
pub mod leaf;
pub mod value;

pub use cline::ClineTable;
pub use inner::{Branch, InnerNode};
pub use leaf::{ApplyMode, LeafEntry, LeafNode, LeafValue, MAX_LEAF_ENTRIES};
pub use value::ValueNode;

use crate::cbt::NodeType;

/// A decoded node body, tagged by [`NodeType`]. `Free` never appears here
/// (a freed control block has no node body to decode).
#[derive(Debug, Clone)]
pub enum NodeBody {
    /// Inner or inner-prefix radix branch.
    Inner(InnerNode),
    /// Leaf / binary (bucket) node.
    Leaf(LeafNode),
    /// Out-of-line value.
    Value(ValueNode),
}

impl NodeBody {
    /// The [`NodeType`] this body encodes as.
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeBody::Inner(inner) if inner.is_prefix_node() => NodeType::InnerPrefix,
            NodeBody::Inner(_) => NodeType::Inner,
            NodeBody::Leaf(_) => NodeType::Leaf,
            NodeBody::Value(_) => NodeType::Value,
        }
    }

    /// Encode this body to its persisted byte form.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            NodeBody::Inner(inner) => inner.encode(out),
            NodeBody::Leaf(leaf) => leaf.encode(out),
            NodeBody::Value(value) => value.encode(out),
        }
    }

    /// Decode a body previously written by [`NodeBody::encode`], given the
    /// control block's recorded [`NodeType`].
    pub fn decode(ty: NodeType, bytes: &[u8]) -> Self {
        match ty {
            NodeType::Inner | NodeType::InnerPrefix => NodeBody::Inner(InnerNode::decode(bytes)),
            NodeType::Leaf => NodeBody::Leaf(LeafNode::decode(bytes)),
            NodeType::Value => NodeBody::Value(ValueNode::decode(bytes)),
            NodeType::Free => panic!("attempted to decode a freed control block's node body"),
        }
    }
}
