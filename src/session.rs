//! Decode session: the state of one plugin-driven decode.
//!
//! A session reads one input through the task's [`RangeReader`], bounded by
//! a limit (the end of the region being scanned).  It keeps a stack of
//! scopes, one per result composite in progress; the base scope belongs to
//! the INPUT node being scanned.
//!
//! - [`decode_composite`](DecodeSession::decode_composite) pushes a FORMAT
//!   node and a scope, runs the plugin, pops, and commits.  Leaving the
//!   outermost composite is a full commit; nested ones commit locally.
//! - [`decode_encoded_input`](DecodeSession::decode_encoded_input) creates an
//!   ENCODED_INPUT node, materializes its decoded inputs through the decode
//!   cache, and queues them.  Queued inputs are only handed to the scanner
//!   after the enclosing composite has been committed.
//! - A failed composite is discarded together with everything it created,
//!   and the position is restored.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::ByteOrder;
use tracing::debug;

use crate::cache::{DecodeCache, InputDecoderTable, InputMapper};
use crate::format::{DecodeError, FormatPlugin, FormatSet};
use crate::input::{InputRange, RangeReader};
use crate::matcher::FormatMatcher;
use crate::tree::{NodeId, NodeKind, Origin, ResultTree, Value, View};

/// Shared state every session of one scan works against.
pub struct DecodeContext {
    pub tree:    Arc<ResultTree>,
    pub cache:   Arc<DecodeCache>,
    pub formats: Arc<FormatSet>,
}

/// A decoded input waiting to be scanned.
#[derive(Debug, Clone)]
pub struct PendingInput {
    pub node:  NodeId,
    pub input: InputRange,
}

struct Scope {
    node:    NodeId,
    context: HashMap<String, Value>,
}

pub struct DecodeSession<'a> {
    ctx:       &'a DecodeContext,
    reader:    &'a mut RangeReader,
    matcher:   &'a mut FormatMatcher,
    position:  u64,
    limit:     u64,
    scopes:    Vec<Scope>,
    pending:   Vec<PendingInput>,
    published: Vec<NodeId>,
}

impl<'a> DecodeSession<'a> {
    /// A session over `reader`'s input, owned by INPUT node `input_node`,
    /// positioned at `position` and bounded by `limit`.
    ///
    /// # Panics
    /// If `position > limit` or `limit` exceeds the input.
    pub fn new(
        ctx:        &'a DecodeContext,
        reader:     &'a mut RangeReader,
        matcher:    &'a mut FormatMatcher,
        input_node: NodeId,
        position:   u64,
        limit:      u64,
    ) -> Self {
        assert!(
            position <= limit && limit <= reader.len(),
            "invalid decode window {position}..{limit} over {} bytes",
            reader.len(),
        );
        Self {
            ctx,
            reader,
            matcher,
            position,
            limit,
            scopes:    vec![Scope { node: input_node, context: HashMap::new() }],
            pending:   Vec::new(),
            published: Vec::new(),
        }
    }

    // ── Position and reads ───────────────────────────────────────────────────

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.position
    }

    /// Length of the whole input, which may extend past the limit.
    pub fn input_len(&self) -> u64 {
        self.reader.len()
    }

    pub fn input(&self) -> &InputRange {
        self.reader.range()
    }

    pub fn seek(&mut self, position: u64) -> Result<(), DecodeError> {
        if position > self.limit {
            return Err(DecodeError::OutOfRange { position, limit: self.limit });
        }
        self.position = position;
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<(), DecodeError> {
        let target = self.position.checked_add(n)
            .ok_or(DecodeError::OutOfRange { position: u64::MAX, limit: self.limit })?;
        self.seek(target)
    }

    fn fill(&mut self, position: u64, buf: &mut [u8]) -> Result<(), DecodeError> {
        let needed    = buf.len() as u64;
        let available = self.limit.saturating_sub(position);
        if needed > available {
            return Err(DecodeError::Insufficient { position, needed, available });
        }
        let got = self.reader.read_at(position, buf)?;
        if got < buf.len() {
            return Err(DecodeError::Insufficient { position, needed, available: got as u64 });
        }
        Ok(())
    }

    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<(), DecodeError> {
        self.fill(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Read `n` bytes at the position without consuming them.
    pub fn peek_bytes(&mut self, n: u64) -> Result<Vec<u8>, DecodeError> {
        let available = self.remaining();
        if n > available {
            return Err(DecodeError::Insufficient { position: self.position, needed: n, available });
        }
        let mut buf = vec![0u8; n as usize];
        self.fill(self.position, &mut buf)?;
        Ok(buf)
    }

    pub fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>, DecodeError> {
        let buf = self.peek_bytes(n)?;
        self.position += n;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let mut b = [0u8; 1];
        self.read_into(&mut b)?;
        Ok(b[0])
    }

    pub fn read_u16<B: ByteOrder>(&mut self) -> Result<u16, DecodeError> {
        let mut b = [0u8; 2];
        self.read_into(&mut b)?;
        Ok(B::read_u16(&b))
    }

    pub fn read_u32<B: ByteOrder>(&mut self) -> Result<u32, DecodeError> {
        let mut b = [0u8; 4];
        self.read_into(&mut b)?;
        Ok(B::read_u32(&b))
    }

    pub fn read_u64<B: ByteOrder>(&mut self) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        self.read_into(&mut b)?;
        Ok(B::read_u64(&b))
    }

    // ── Scopes ───────────────────────────────────────────────────────────────

    pub fn tree(&self) -> &ResultTree {
        &self.ctx.tree
    }

    /// Node of the innermost scope.
    pub fn current_node(&self) -> NodeId {
        self.scope(0).node
    }

    /// Number of result composites in progress.
    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    fn scope(&self, level: usize) -> &Scope {
        let len = self.scopes.len();
        assert!(level < len, "ancestor level {level} beyond scope depth {len}");
        &self.scopes[len - 1 - level]
    }

    /// Set the display name of the current result node.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.ctx.tree.set_name(self.current_node(), name);
    }

    /// Move the start of the current result node forward to `start`, for
    /// formats that locate their own beginning.  The bytes skipped over are
    /// left to the scanner.
    ///
    /// # Panics
    /// Outside a result composite, or if the node was already published.
    pub fn relocate_start(&mut self, start: u64) -> Result<(), DecodeError> {
        let node = self.current_node();
        assert!(
            self.ctx.tree.kind(node) == NodeKind::Format,
            "relocate_start outside a result composite",
        );
        if start > self.limit {
            return Err(DecodeError::OutOfRange { position: start, limit: self.limit });
        }
        self.ctx.tree.relocate(node, start);
        self.position = self.position.max(start);
        Ok(())
    }

    /// Publish the current node's progress locally, without committing its
    /// ancestors.
    pub fn commit_progress(&mut self) {
        let node = self.current_node();
        if self.ctx.tree.kind(node) != NodeKind::Input {
            self.ctx.tree.update_and_commit(node, Some(self.position), false);
        }
    }

    // ── Composite decodes ────────────────────────────────────────────────────

    /// Decode `plugin` as a result composite at the current position, as a
    /// child of the current scope's node.
    pub fn decode_composite(&mut self, plugin: &Arc<dyn FormatPlugin>) -> Result<NodeId, DecodeError> {
        let parent = self.current_node();
        self.decode_result(plugin, parent)
    }

    /// Decode `plugin` at `position`, as a child of the scope `ancestor_level`
    /// levels above the current one.  The session position is restored
    /// afterwards.
    ///
    /// # Panics
    /// If `ancestor_level` is beyond the scope stack.
    pub fn decode_composite_at(
        &mut self,
        plugin:         &Arc<dyn FormatPlugin>,
        position:       u64,
        ancestor_level: usize,
    ) -> Result<NodeId, DecodeError> {
        let parent = self.scope(ancestor_level).node;
        let saved  = self.position;
        self.seek(position)?;
        let result = self.decode_result(plugin, parent);
        self.position = saved;
        result
    }

    fn decode_result(&mut self, plugin: &Arc<dyn FormatPlugin>, parent: NodeId) -> Result<NodeId, DecodeError> {
        let tree  = Arc::clone(&self.ctx.tree);
        let start = self.position;
        let outer = self.scopes.len() == 1;
        let mark  = self.pending.len();
        let node  = tree.add_node(parent, Origin::Format(Arc::clone(plugin)), start);

        self.scopes.push(Scope { node, context: HashMap::new() });
        let outcome = plugin.decode(self);
        self.scopes.pop();

        let outcome = outcome.and_then(|()| {
            let end = self.position.max(tree.start(node));
            if outer && end == tree.start(node) {
                return Err(DecodeError::Empty);
            }
            Ok(end)
        });
        match outcome {
            Ok(end) => {
                if let Some(top) = tree.update_and_commit(node, Some(end), outer) {
                    if outer {
                        self.published.push(top);
                    }
                }
                Ok(node)
            }
            Err(e) => {
                tree.discard(node);
                self.pending.truncate(mark);
                self.position = start;
                Err(e)
            }
        }
    }

    /// Run `plugin` in place, without a result node or scope of its own.
    /// Values it binds land on the enclosing result node.
    pub fn decode_inline(&mut self, plugin: &dyn FormatPlugin) -> Result<(), DecodeError> {
        let start  = self.position;
        let result = plugin.decode(self);
        if result.is_err() {
            self.position = start;
        }
        result
    }

    /// Match formats at the current position and decode the first candidate
    /// that succeeds.  `Ok(None)` if none did.
    pub fn decode_embedded(&mut self) -> Result<Option<NodeId>, DecodeError> {
        let candidates = self.matcher.candidates(&mut *self.reader, self.position, false)?;
        for plugin in candidates {
            match self.decode_composite(&plugin) {
                Ok(node)              => return Ok(Some(node)),
                Err(e) if e.is_io()   => return Err(e),
                Err(e) => {
                    debug!(format = plugin.name(), position = self.position, error = %e, "embedded candidate rejected");
                }
            }
        }
        Ok(None)
    }

    /// Decode the encoded span described by `table` at the current position.
    ///
    /// Creates an ENCODED_INPUT node covering the encoded bytes and one INPUT
    /// child per non-empty decoded input, queued for scanning.  The position
    /// moves past the encoded bytes.
    pub fn decode_encoded_input(
        &mut self,
        table:  &InputDecoderTable,
        mapper: &dyn InputMapper,
    ) -> Result<NodeId, DecodeError> {
        let tree   = Arc::clone(&self.ctx.tree);
        let start  = self.position;
        let outer  = self.scopes.len() == 1;
        let node   = tree.add_node(self.current_node(), Origin::Encoded(table.describe()), start);
        let bounded = self.reader.range().truncated(self.limit);

        let decoded = match self.ctx.cache.decode_inputs(mapper, table, &bounded, start) {
            Ok(decoded) => decoded,
            Err(e) => {
                tree.discard(node);
                return Err(e.into());
            }
        };

        let mark = self.pending.len();
        for input in decoded.inputs.into_iter().filter(|i| !i.is_empty()) {
            let child = tree.add_node(node, Origin::Input(input.clone()), 0);
            tree.update_and_commit(child, None, false);
            self.pending.push(PendingInput { node: child, input });
        }
        self.position = decoded.decode_position;
        if let Some(top) = tree.update_and_commit(node, Some(self.position), outer) {
            if outer {
                self.published.push(top);
            }
        }
        debug!(
            encoded = %table.describe(),
            start,
            end     = self.position,
            inputs  = self.pending.len() - mark,
            "decoded encoded input"
        );
        Ok(node)
    }

    // ── Values ───────────────────────────────────────────────────────────────

    /// Bind a value visible only while the current composite decodes.
    pub fn bind_context_value(&mut self, key: impl Into<String>, value: Value) {
        let len = self.scopes.len();
        self.scopes[len - 1].context.insert(key.into(), value);
    }

    /// Store a value on the current result node, inherited by its
    /// descendants and kept for rendering.
    ///
    /// # Panics
    /// Outside a result composite.
    pub fn bind_result_value(&mut self, key: impl Into<String>, value: Value) {
        self.ctx.tree.set_value(self.current_node(), key, value);
    }

    /// Store the value the current result node decodes to.
    ///
    /// # Panics
    /// Outside a result composite.
    pub fn bind_decoded_value(&mut self, value: Value) {
        self.ctx.tree.set_decoded_value(self.current_node(), value);
    }

    /// Context binding of the current scope, else the nearest result value
    /// from the work in progress.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.get_value_in(key, View::Current)
    }

    pub fn get_value_in(&self, key: &str, view: View) -> Option<Value> {
        let scope = self.scope(0);
        if let Some(v) = scope.context.get(key) {
            return Some(v.clone());
        }
        self.ctx.tree.value(scope.node, key, view)
    }

    // ── Hand-off ─────────────────────────────────────────────────────────────

    /// Decoded inputs of committed composites, ready to be scanned.
    pub fn take_pending(&mut self) -> Vec<PendingInput> {
        std::mem::take(&mut self.pending)
    }

    /// Nodes published by full commits since the last call.
    pub fn take_published(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.published)
    }
}
