use ethereum_types::H256;
use strata_common::Account;

use crate::nibbles::Nibbles;

/// Index of a node inside a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// In-memory representation of a retained trie node.
///
/// Retained nodes exist for callers that need the materialized sub-trie
/// (witness production); the root hash never depends on them. The trie is
/// strictly tree-shaped, so children are arena indices, never back-pointers.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf {
        key: Nibbles,
        value: Vec<u8>,
    },
    Account {
        key: Nibbles,
        account: Account,
        storage: Option<NodeId>,
        code: Option<NodeId>,
    },
    Extension {
        key: Nibbles,
        child: NodeId,
    },
    Branch {
        mask: u16,
        /// One entry per set bit of `mask`, in digit order.
        children: Vec<NodeId>,
    },
    /// A sub-trie known only by its hash.
    Hash {
        hash: H256,
        witness_len: u64,
    },
    Code(Vec<u8>),
}

/// Append-only arena holding the nodes of one computation; dropped together
/// with the scan result.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_indices_are_stable() {
        let mut arena = NodeArena::default();
        let leaf = arena.push(Node::Leaf {
            key: Nibbles::from_hex(vec![1, 2, 16]),
            value: vec![0xff],
        });
        let ext = arena.push(Node::Extension {
            key: Nibbles::from_hex(vec![3]),
            child: leaf,
        });
        match arena.get(ext) {
            Node::Extension { child, .. } => {
                assert!(matches!(arena.get(*child), Node::Leaf { .. }))
            }
            _ => panic!("expected extension"),
        }
        assert_eq!(arena.len(), 2);
    }
}
