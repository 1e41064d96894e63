//! Decoder tables and decoded-input mappers.
//!
//! A format plugin describes an encoded span as an ordered list of
//! `(decoder, offset, encoded size, decoded size)` entries.  Offsets are
//! relative to the position the span starts at.  Either size may be unknown
//! and is then determined while decoding.

use std::fmt;
use std::sync::Arc;

use crate::codec::{DecoderKind, StoredDecoder, StreamDecoder, ZeroFillDecoder};
use crate::input::InputRange;

// ── InputDecoderTable ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct InputDecoderEntry {
    pub decoder:      Arc<dyn StreamDecoder>,
    pub offset:       u64,
    pub encoded_size: Option<u64>,
    pub decoded_size: Option<u64>,
}

impl fmt::Debug for InputDecoderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDecoderEntry")
            .field("decoder",      &self.decoder.name())
            .field("offset",       &self.offset)
            .field("encoded_size", &self.encoded_size)
            .field("decoded_size", &self.decoded_size)
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct InputDecoderTable {
    entries: Vec<InputDecoderEntry>,
}

impl InputDecoderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    ///
    /// A stored or zero-fill entry that directly continues the previous entry
    /// of the same kind is merged into it instead of being appended.
    pub fn add(
        &mut self,
        decoder:      Arc<dyn StreamDecoder>,
        offset:       u64,
        encoded_size: Option<u64>,
        decoded_size: Option<u64>,
    ) -> &mut Self {
        if let Some(last) = self.entries.last_mut() {
            if let Some(merged) = coalesce(last, decoder.kind(), offset, encoded_size, decoded_size) {
                *last = merged;
                return self;
            }
        }
        self.entries.push(InputDecoderEntry { decoder, offset, encoded_size, decoded_size });
        self
    }

    pub fn add_stored(&mut self, offset: u64, size: u64) -> &mut Self {
        self.add(Arc::new(StoredDecoder), offset, Some(size), None)
    }

    pub fn add_zero_fill(&mut self, offset: u64, size: u64) -> &mut Self {
        self.add(Arc::new(ZeroFillDecoder), offset, Some(0), Some(size))
    }

    pub fn entries(&self) -> &[InputDecoderEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decoder names joined with `+`, used to label encoded-input nodes.
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.entries.iter().map(|e| e.decoder.name()).collect();
        if names.is_empty() { "empty".to_owned() } else { names.join("+") }
    }
}

fn coalesce(
    last:         &InputDecoderEntry,
    kind:         DecoderKind,
    offset:       u64,
    encoded_size: Option<u64>,
    decoded_size: Option<u64>,
) -> Option<InputDecoderEntry> {
    if !kind.is_passthrough() || last.decoder.kind() != kind {
        return None;
    }
    let (last_enc, enc) = (last.encoded_size?, encoded_size?);
    if last.offset + last_enc != offset {
        return None;
    }
    let decoded = match (last.decoded_size, decoded_size) {
        (Some(a), Some(b)) => Some(a + b),
        _                  => None,
    };
    if kind == DecoderKind::ZeroFill && decoded.is_none() {
        return None;
    }
    Some(InputDecoderEntry {
        decoder:      Arc::clone(&last.decoder),
        offset:       last.offset,
        encoded_size: Some(last_enc + enc),
        decoded_size: decoded,
    })
}

// ── Mappers ──────────────────────────────────────────────────────────────────

/// Splits one decoded stream into the inputs that get scanned.
pub trait InputMapper: Send + Sync {
    fn map(&self, decoded: InputRange) -> Vec<InputRange>;
}

/// The decoded stream is one input.
pub struct SingleInput;

impl InputMapper for SingleInput {
    fn map(&self, decoded: InputRange) -> Vec<InputRange> {
        vec![decoded]
    }
}

/// Named `(offset, length)` slices of the decoded stream, e.g. the members of
/// a solid block.  Slices reaching past the decoded end are clamped.
#[derive(Debug, Clone, Default)]
pub struct SliceMapper {
    slices: Vec<(String, u64, u64)>,
}

impl SliceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slice(mut self, name: impl Into<String>, offset: u64, len: u64) -> Self {
        self.slices.push((name.into(), offset, len));
        self
    }
}

impl InputMapper for SliceMapper {
    fn map(&self, decoded: InputRange) -> Vec<InputRange> {
        self.slices
            .iter()
            .map(|(name, off, len)| decoded.sub_range(*off, off.saturating_add(*len), name.as_str()))
            .collect()
    }
}
