//! Rendering committed results: the session handed to a plugin's `render`,
//! a text listing, and a JSON export.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};

use serde::Serialize;

use crate::tree::{NodeId, NodeKind, ResultTree, Value, View};

/// What a plugin sees while rendering one committed node.
pub struct RenderSession<'a> {
    tree:    &'a ResultTree,
    node:    NodeId,
    context: HashMap<String, Value>,
}

impl<'a> RenderSession<'a> {
    pub fn new(tree: &'a ResultTree, node: NodeId) -> Self {
        Self { tree, node, context: HashMap::new() }
    }

    pub fn tree(&self) -> &ResultTree {
        self.tree
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> String {
        self.tree.name(self.node)
    }

    pub fn start(&self) -> u64 {
        self.tree.start(self.node)
    }

    pub fn end(&self) -> u64 {
        self.tree.end(self.node, View::Committed).unwrap_or_else(|| self.start())
    }

    pub fn children(&self) -> Vec<NodeId> {
        self.tree.children(self.node)
    }

    pub fn bind_context_value(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    /// Context binding, else the committed value on the node or an ancestor.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.context
            .get(key)
            .cloned()
            .or_else(|| self.tree.value(self.node, key, View::Committed))
    }

    pub fn decoded_value(&self) -> Option<Value> {
        self.tree.decoded_value(self.node, View::Committed)
    }

    /// Up to `len` bytes of the node, starting `offset` bytes into it.
    pub fn read_bytes(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let (_, input) = self.tree.owning_input(self.node);
        let (start, end) = match self.tree.kind(self.node) {
            NodeKind::Input => (0, input.len()),
            _               => (self.start(), self.end()),
        };
        let from = start.saturating_add(offset).min(end);
        input.read_vec(from, len.min(end - from))
    }
}

// ── Text listing ─────────────────────────────────────────────────────────────

/// Write an indented listing of the committed tree, one node per line.
pub fn render_tree(tree: &ResultTree, out: &mut dyn Write) -> io::Result<()> {
    render_node(tree, tree.root(), 0, out)
}

fn render_node(tree: &ResultTree, id: NodeId, depth: usize, out: &mut dyn Write) -> io::Result<()> {
    let Some(view) = tree.view(id) else {
        return Ok(());
    };
    write!(out, "{:indent$}{:#010x}..{:#010x}  ", "", view.start, view.end, indent = depth * 2)?;
    match view.kind {
        NodeKind::Input => write!(out, "input {} ({} bytes)", view.name, view.end - view.start)?,
        NodeKind::EncodedInput => write!(out, "{}", view.name)?,
        NodeKind::Format => match tree.format(id) {
            Some(plugin) => plugin.render(out, &mut RenderSession::new(tree, id))?,
            None         => write!(out, "{}", view.name)?,
        },
    }
    writeln!(out)?;
    for child in view.children {
        render_node(tree, child, depth + 1, out)?;
    }
    Ok(())
}

// ── JSON export ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct JsonNode {
    pub key:      String,
    pub kind:     NodeKind,
    pub name:     String,
    pub start:    u64,
    pub end:      u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub values:   BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded:  Option<Value>,
    pub children: Vec<JsonNode>,
}

/// Committed subtree under `id`, or `None` if `id` is not committed.
pub fn json_node(tree: &ResultTree, id: NodeId) -> Option<JsonNode> {
    let view = tree.view(id)?;
    Some(JsonNode {
        key:      tree.key(id).map(|k| k.to_string()).unwrap_or_default(),
        kind:     view.kind,
        name:     view.name,
        start:    view.start,
        end:      view.end,
        values:   tree.values(id, View::Committed),
        decoded:  tree.decoded_value(id, View::Committed),
        children: view.children.into_iter().filter_map(|c| json_node(tree, c)).collect(),
    })
}

pub fn export_json<W: Write>(tree: &ResultTree, out: W) -> serde_json::Result<()> {
    serde_json::to_writer_pretty(out, &json_node(tree, tree.root()))
}
