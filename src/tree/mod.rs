//! The result tree, a hierarchical, incrementally committed map of what was
//! recognized where.
//!
//! # Arena
//! Nodes live in an append-only arena and refer to each other by [`NodeId`].
//! A node is owned by its parent's child list; the parent link is a plain
//! index used only to propagate commits and values upward, so the tree can
//! never form a cycle.  Slots of nodes that were discarded before they were
//! ever published are recycled.
//!
//! # Commit protocol
//! Every node carries two snapshots behind its own lock:
//!
//! - `committed`: what observers see; `None` until the first promotion,
//! - `current`: the working copy; `None` while it equals `committed`.
//!
//! The first write after a commit copies `committed` into `current`.
//! [`ResultTree::update_and_commit`] promotes `current` to `committed`.  The
//! first promotion of a node registers it in its parent's child list, and
//! every promotion of a FORMAT or ENCODED_INPUT node grows the parent's
//! `end`; both land in the parent's *working* copy.  Only a full commit goes
//! on to promote the ancestors, publishing the whole chain at once.
//!
//! No method ever holds two node locks at the same time.

pub mod key;
pub mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::format::FormatPlugin;
use crate::input::InputRange;

pub use self::key::NodeKey;
pub use self::value::Value;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A whole input: the scanned file or one decoded nested stream.
    Input,
    /// A recognized structure.
    Format,
    /// A span whose bytes encode one or more nested inputs.
    EncodedInput,
}

/// Which snapshot of a node to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Committed,
    Current,
}

/// What a node was created from.
#[derive(Clone)]
pub enum Origin {
    Input(InputRange),
    Format(Arc<dyn FormatPlugin>),
    /// Decoder description, e.g. `zstd` or `stored+zstd`.
    Encoded(String),
}

impl Origin {
    pub fn kind(&self) -> NodeKind {
        match self {
            Origin::Input(_)   => NodeKind::Input,
            Origin::Format(_)  => NodeKind::Format,
            Origin::Encoded(_) => NodeKind::EncodedInput,
        }
    }

    fn label(&self) -> String {
        match self {
            Origin::Input(r)   => r.name().to_owned(),
            Origin::Format(p)  => p.name().to_owned(),
            Origin::Encoded(d) => format!("encoded ({d})"),
        }
    }
}

// ── Node state ───────────────────────────────────────────────────────────────

/// Child entry, kept sorted by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub start: u64,
    pub id:    NodeId,
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    end:      u64,
    name:     Option<String>,
    children: Vec<ChildRef>,
    values:   BTreeMap<String, Value>,
    decoded:  Option<Value>,
}

impl Snapshot {
    fn empty(end: u64) -> Self {
        Self { end, name: None, children: Vec::new(), values: BTreeMap::new(), decoded: None }
    }
}

struct NodeState {
    start:     u64,
    committed: Option<Snapshot>,
    current:   Option<Snapshot>,
    published: bool,
    discarded: bool,
}

impl NodeState {
    fn working(&self) -> &Snapshot {
        match (&self.current, &self.committed) {
            (Some(s), _) | (None, Some(s)) => s,
            (None, None) => unreachable!("node without any snapshot"),
        }
    }

    fn working_mut(&mut self) -> &mut Snapshot {
        let start     = self.start;
        let committed = &self.committed;
        self.current.get_or_insert_with(|| {
            committed.clone().unwrap_or_else(|| Snapshot::empty(start))
        })
    }

    fn view(&self, view: View) -> Option<&Snapshot> {
        match view {
            View::Committed => self.committed.as_ref(),
            View::Current   => Some(self.working()),
        }
    }
}

struct Node {
    origin: Origin,
    parent: Option<NodeId>,
    state:  Mutex<NodeState>,
}

impl Node {
    fn kind(&self) -> NodeKind {
        self.origin.kind()
    }
}

/// Result of promoting one node.
#[derive(Debug, Clone, Copy)]
struct Promotion {
    start: u64,
    end:   u64,
    first: bool,
}

/// Committed, point-in-time copy of one node for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id:       NodeId,
    pub kind:     NodeKind,
    pub start:    u64,
    pub end:      u64,
    pub name:     String,
    pub children: Vec<NodeId>,
}

// ── ResultTree ───────────────────────────────────────────────────────────────

pub struct ResultTree {
    nodes: RwLock<Vec<Arc<Node>>>,
    free:  Mutex<Vec<NodeId>>,
}

impl ResultTree {
    /// A tree whose root is a committed INPUT node for `input`.
    pub fn new(input: InputRange) -> Self {
        let end = input.len();
        let root = Node {
            origin: Origin::Input(input),
            parent: None,
            state:  Mutex::new(NodeState {
                start:     0,
                committed: Some(Snapshot::empty(end)),
                current:   None,
                published: true,
                discarded: false,
            }),
        };
        Self {
            nodes: RwLock::new(vec![Arc::new(root)]),
            free:  Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn node(&self, id: NodeId) -> Arc<Node> {
        match self.nodes.read().get(id.index()) {
            Some(node) => Arc::clone(node),
            None       => panic!("unknown result node {id}"),
        }
    }

    // ── Construction ─────────────────────────────────────────────────────────

    /// Create an unpublished node under `parent`.
    ///
    /// FORMAT and ENCODED_INPUT nodes start empty (`end == start`); INPUT
    /// nodes span their whole input.  Nothing is visible until the node is
    /// committed.
    pub fn add_node(&self, parent: NodeId, origin: Origin, start: u64) -> NodeId {
        let end = match &origin {
            Origin::Input(r) => start + r.len(),
            _                => start,
        };
        let node = Arc::new(Node {
            origin,
            parent: Some(parent),
            state:  Mutex::new(NodeState {
                start,
                committed: None,
                current:   Some(Snapshot::empty(end)),
                published: false,
                discarded: false,
            }),
        });

        let recycled = self.free.lock().pop();
        let mut nodes = self.nodes.write();
        match recycled {
            Some(id) => {
                nodes[id.index()] = node;
                id
            }
            None => {
                let id = NodeId(u32::try_from(nodes.len()).expect("result tree exceeds u32 nodes"));
                nodes.push(node);
                id
            }
        }
    }

    /// Move the start of a node that has never been published.
    ///
    /// # Panics
    /// If the node was already published.
    pub fn relocate(&self, id: NodeId, start: u64) {
        let node = self.node(id);
        let mut st = node.state.lock();
        assert!(!st.published, "cannot relocate published node {id}");
        st.start = start;
        let w = st.working_mut();
        w.end = w.end.max(start);
    }

    /// Drop a node and its registered descendants after a failed decode.
    ///
    /// The node is unlinked from its parent's working children; a parent
    /// that had already published it drops it at its next commit.
    pub fn discard(&self, id: NodeId) {
        let node = self.node(id);
        let (published, children) = {
            let mut st = node.state.lock();
            if st.discarded {
                return;
            }
            st.discarded = true;
            let children: Vec<NodeId> = st.working().children.iter().map(|c| c.id).collect();
            (st.published, children)
        };

        if let Some(parent) = node.parent {
            let pnode = self.node(parent);
            let mut st = pnode.state.lock();
            if st.working().children.iter().any(|c| c.id == id) {
                st.working_mut().children.retain(|c| c.id != id);
            }
        }
        for child in children {
            self.discard(child);
        }
        if !published {
            self.free.lock().push(id);
        }
    }

    // ── Commit protocol ──────────────────────────────────────────────────────

    /// Grow `end` to at least `min_end`, then publish the node if its state
    /// changed.  With `full_commit`, every ancestor with pending changes is
    /// published too.
    ///
    /// Returns the highest node actually promoted, or `None` if nothing
    /// changed.
    pub fn update_and_commit(&self, id: NodeId, min_end: Option<u64>, full_commit: bool) -> Option<NodeId> {
        let node = self.node(id);
        let mut top = None;

        if let Some(p) = self.promote(&node, min_end) {
            top = Some(id);
            if let Some(parent) = node.parent {
                self.attach(parent, id, node.kind(), p);
            }
        }

        if full_commit {
            let mut cursor = node.parent;
            while let Some(pid) = cursor {
                let pnode = self.node(pid);
                if let Some(p) = self.promote(&pnode, None) {
                    top = Some(pid);
                    if let Some(grand) = pnode.parent {
                        self.attach(grand, pid, pnode.kind(), p);
                    }
                }
                cursor = pnode.parent;
            }
        }
        top
    }

    fn promote(&self, node: &Node, min_end: Option<u64>) -> Option<Promotion> {
        let mut st = node.state.lock();
        if st.discarded {
            return None;
        }
        if let Some(end) = min_end {
            if end > st.working().end {
                st.working_mut().end = end;
            }
        }
        let current = st.current.take()?;
        if st.committed.as_ref() == Some(&current) {
            return None;
        }
        let end   = current.end;
        let first = !st.published;
        st.committed = Some(current);
        st.published = true;
        Some(Promotion { start: st.start, end, first })
    }

    /// Record a child's promotion in the parent's working state.
    fn attach(&self, parent: NodeId, child: NodeId, kind: NodeKind, p: Promotion) {
        let pnode = self.node(parent);
        let mut neighbours = Vec::new();
        {
            let mut st = pnode.state.lock();
            if st.discarded {
                return;
            }
            if p.first {
                let w   = st.working_mut();
                let idx = w.children.partition_point(|c| c.start <= p.start);
                w.children.insert(idx, ChildRef { start: p.start, id: child });
                if kind != NodeKind::Input {
                    if idx > 0 {
                        neighbours.push(w.children[idx - 1].id);
                    }
                    if let Some(next) = w.children.get(idx + 1) {
                        neighbours.push(next.id);
                    }
                }
            }
            if kind != NodeKind::Input && p.end > st.working().end {
                st.working_mut().end = p.end;
            }
        }
        for other in neighbours {
            self.warn_on_overlap(parent, child, p, other);
        }
    }

    /// Overlapping siblings come from format bugs; they are kept, not rejected.
    fn warn_on_overlap(&self, parent: NodeId, child: NodeId, p: Promotion, other: NodeId) {
        let onode = self.node(other);
        if onode.kind() == NodeKind::Input {
            return;
        }
        let (ostart, oend) = {
            let st = onode.state.lock();
            (st.start, st.working().end)
        };
        if p.start < oend && ostart < p.end {
            warn!(
                %parent, %child, %other,
                child_range = ?(p.start..p.end),
                other_range = ?(ostart..oend),
                "overlapping sibling results"
            );
        }
    }

    // ── Observation ──────────────────────────────────────────────────────────

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn start(&self, id: NodeId) -> u64 {
        self.node(id).state.lock().start
    }

    pub fn end(&self, id: NodeId, view: View) -> Option<u64> {
        let node = self.node(id);
        let st = node.state.lock();
        st.view(view).map(|s| s.end)
    }

    pub fn is_committed(&self, id: NodeId) -> bool {
        self.node(id).state.lock().committed.is_some()
    }

    /// Committed children, sorted by start.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.child_refs(id, View::Committed).into_iter().map(|c| c.id).collect()
    }

    pub fn child_refs(&self, id: NodeId, view: View) -> Vec<ChildRef> {
        let node = self.node(id);
        let st = node.state.lock();
        st.view(view).map(|s| s.children.clone()).unwrap_or_default()
    }

    /// Display label: the committed name if one was set, otherwise derived
    /// from what the node was created from.
    pub fn name(&self, id: NodeId) -> String {
        let node = self.node(id);
        let named = node.state.lock().committed.as_ref().and_then(|s| s.name.clone());
        named.unwrap_or_else(|| node.origin.label())
    }

    pub fn origin(&self, id: NodeId) -> Origin {
        self.node(id).origin.clone()
    }

    pub fn format(&self, id: NodeId) -> Option<Arc<dyn FormatPlugin>> {
        match &self.node(id).origin {
            Origin::Format(p) => Some(Arc::clone(p)),
            _                 => None,
        }
    }

    /// The input an INPUT node spans.
    pub fn input(&self, id: NodeId) -> Option<InputRange> {
        match &self.node(id).origin {
            Origin::Input(r) => Some(r.clone()),
            _                => None,
        }
    }

    /// The nearest INPUT node at or above `id`, and its input.
    pub fn owning_input(&self, id: NodeId) -> (NodeId, InputRange) {
        let mut cursor = id;
        loop {
            let node = self.node(cursor);
            if let Origin::Input(r) = &node.origin {
                return (cursor, r.clone());
            }
            cursor = node.parent.expect("every result node descends from an input");
        }
    }

    /// Root-first chain of ids ending at `id`.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = vec![id];
        let mut cursor = self.node(id).parent;
        while let Some(p) = cursor {
            chain.push(p);
            cursor = self.node(p).parent;
        }
        chain.reverse();
        chain
    }

    pub fn view(&self, id: NodeId) -> Option<NodeView> {
        let node = self.node(id);
        let (start, snap) = {
            let st = node.state.lock();
            (st.start, st.committed.clone()?)
        };
        Some(NodeView {
            id,
            kind:     node.kind(),
            start,
            end:      snap.end,
            name:     snap.name.unwrap_or_else(|| node.origin.label()),
            children: snap.children.iter().map(|c| c.id).collect(),
        })
    }

    // ── Values ───────────────────────────────────────────────────────────────

    fn assert_format(&self, node: &Node, id: NodeId, what: &str) {
        assert!(
            node.kind() == NodeKind::Format,
            "cannot bind {what} on {:?} node {id}; only FORMAT nodes carry attributes",
            node.kind(),
        );
    }

    pub fn set_name(&self, id: NodeId, name: impl Into<String>) {
        let node = self.node(id);
        node.state.lock().working_mut().name = Some(name.into());
    }

    /// Store a result value on a FORMAT node.
    ///
    /// # Panics
    /// On INPUT and ENCODED_INPUT nodes.
    pub fn set_value(&self, id: NodeId, key: impl Into<String>, value: Value) {
        let node = self.node(id);
        self.assert_format(&node, id, "a result value");
        node.state.lock().working_mut().values.insert(key.into(), value);
    }

    /// Store the value the node itself decoded to.
    ///
    /// # Panics
    /// On INPUT and ENCODED_INPUT nodes.
    pub fn set_decoded_value(&self, id: NodeId, value: Value) {
        let node = self.node(id);
        self.assert_format(&node, id, "a decoded value");
        node.state.lock().working_mut().decoded = Some(value);
    }

    pub fn decoded_value(&self, id: NodeId, view: View) -> Option<Value> {
        let node = self.node(id);
        let st = node.state.lock();
        st.view(view).and_then(|s| s.decoded.clone())
    }

    /// Values stored on the node itself.
    pub fn values(&self, id: NodeId, view: View) -> BTreeMap<String, Value> {
        let node = self.node(id);
        let st = node.state.lock();
        st.view(view).map(|s| s.values.clone()).unwrap_or_default()
    }

    /// Look `key` up on the node, then on each ancestor in turn.
    ///
    /// INPUT nodes never change after creation, so they are always read
    /// from their working state regardless of `view`.
    pub fn value(&self, id: NodeId, key: &str, view: View) -> Option<Value> {
        let mut cursor = Some(id);
        while let Some(cid) = cursor {
            let node = self.node(cid);
            let found = {
                let st = node.state.lock();
                let view = if node.kind() == NodeKind::Input { View::Current } else { view };
                st.view(view).and_then(|s| s.values.get(key).cloned())
            };
            if found.is_some() {
                return found;
            }
            cursor = node.parent;
        }
        None
    }
}
