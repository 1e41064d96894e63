//! Node keys: opaque root-to-leaf paths that survive tree refreshes.
//!
//! One segment per level below the root.  Under an ENCODED_INPUT parent the
//! segment is the child's index among the parent's committed children (4
//! bytes, big-endian); under any other parent it is the child's start offset
//! (8 bytes, big-endian).  The parent's kind tells the reader which width
//! comes next, so there are no separators.

use std::fmt;

use super::{NodeId, NodeKind, ResultTree, View};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodeKey(Vec<u8>);

impl NodeKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl ResultTree {
    /// Path key of a committed node.
    ///
    /// `None` if the node or one of its ancestors is not yet published in
    /// its parent's committed children.
    pub fn key(&self, id: NodeId) -> Option<NodeKey> {
        let chain = self.ancestors(id);
        let mut key = Vec::with_capacity(chain.len() * 8);
        for pair in chain.windows(2) {
            let (parent, child) = (pair[0], pair[1]);
            let refs = self.child_refs(parent, View::Committed);
            let index = refs.iter().position(|c| c.id == child)?;
            if self.kind(parent) == NodeKind::EncodedInput {
                key.extend_from_slice(&(index as u32).to_be_bytes());
            } else {
                key.extend_from_slice(&refs[index].start.to_be_bytes());
            }
        }
        Some(NodeKey(key))
    }

    /// Walk `key` down from the root over committed children.
    ///
    /// Returns the root-first chain ending at the addressed node, or `None`
    /// if a segment does not resolve or the key is truncated.
    pub fn resolve_path(&self, key: &NodeKey) -> Option<Vec<NodeId>> {
        let mut chain = vec![self.root()];
        let mut rest  = key.as_bytes();
        while !rest.is_empty() {
            let parent = *chain.last()?;
            let refs   = self.child_refs(parent, View::Committed);
            let child  = if self.kind(parent) == NodeKind::EncodedInput {
                let (seg, tail) = split(rest, 4)?;
                rest = tail;
                let index = u32::from_be_bytes(seg.try_into().ok()?) as usize;
                refs.get(index)?.id
            } else {
                let (seg, tail) = split(rest, 8)?;
                rest = tail;
                let start = u64::from_be_bytes(seg.try_into().ok()?);
                let at = refs.partition_point(|c| c.start < start);
                match refs.get(at) {
                    Some(c) if c.start == start => c.id,
                    _                           => return None,
                }
            };
            chain.push(child);
        }
        Some(chain)
    }
}

fn split(bytes: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    (bytes.len() >= n).then(|| bytes.split_at(n))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::format::RawData;
    use crate::input::InputRange;
    use crate::tree::Origin;

    #[test]
    fn keys_mix_offsets_and_indices() {
        let t = ResultTree::new(InputRange::from_bytes(vec![0u8; 64], "root"));
        let fmt = t.add_node(t.root(), Origin::Format(Arc::new(RawData)), 16);
        let enc = t.add_node(fmt, Origin::Encoded("zstd".into()), 20);
        let a   = t.add_node(enc, Origin::Input(InputRange::from_bytes(vec![1u8; 8], "a")), 0);
        let b   = t.add_node(enc, Origin::Input(InputRange::from_bytes(vec![2u8; 8], "b")), 0);
        t.update_and_commit(a, None, false);
        t.update_and_commit(b, None, false);
        t.update_and_commit(enc, Some(40), false);
        t.update_and_commit(fmt, Some(40), true);

        let key = t.key(b).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&16u64.to_be_bytes());
        expected.extend_from_slice(&20u64.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(key.as_bytes(), &expected[..]);
        assert_eq!(t.resolve_path(&key), Some(vec![t.root(), fmt, enc, b]));
    }

    #[test]
    fn root_key_is_empty() {
        let t = ResultTree::new(InputRange::from_bytes(vec![0u8; 4], "root"));
        let key = t.key(t.root()).unwrap();
        assert!(key.is_root());
        assert_eq!(t.resolve_path(&key), Some(vec![t.root()]));
    }

    #[test]
    fn unpublished_nodes_have_no_key() {
        let t = ResultTree::new(InputRange::from_bytes(vec![0u8; 4], "root"));
        let n = t.add_node(t.root(), Origin::Format(Arc::new(RawData)), 0);
        assert_eq!(t.key(n), None);
    }

    #[test]
    fn bad_keys_do_not_resolve() {
        let t = ResultTree::new(InputRange::from_bytes(vec![0u8; 4], "root"));
        assert_eq!(t.resolve_path(&NodeKey::from_bytes(vec![0u8; 3])), None);
        assert_eq!(t.resolve_path(&NodeKey::from_bytes(7u64.to_be_bytes().to_vec())), None);
    }

    #[test]
    fn hex_round_trip() {
        let k = NodeKey::from_bytes(vec![0xde, 0xad]);
        assert_eq!(k.to_string(), "dead");
        assert_eq!(NodeKey::from_hex("dead").unwrap(), k);
    }
}
