//! Format plugin contract and registry.
//!
//! A format plugin recognizes one kind of structure.  The scan engine only
//! needs four things from it:
//!
//! - a cheap discriminator: header patterns, trailer patterns, input-name
//!   regexes, or none at all (always a candidate),
//! - a match window size and a `matches` test on that window,
//! - `decode`, driven through a [`DecodeSession`],
//! - `render`, driven through a [`RenderSession`].
//!
//! Plugins receive the active session explicitly; there is no ambient
//! "current decode" to look up.

pub mod block;
pub mod pattern;
pub mod raw;

use std::io::{self, Write};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::cache::CacheError;
use crate::render::RenderSession;
use crate::session::DecodeSession;

pub use self::block::BlockFormat;
pub use self::pattern::BytePattern;
pub use self::raw::RawData;

// ── Error type ───────────────────────────────────────────────────────────────

/// Why a decode attempt failed.
///
/// Everything except [`Io`](DecodeError::Io) and [`Cache`](DecodeError::Cache)
/// is local to the format: the scanner logs it and tries the next candidate.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("need {needed} bytes at {position}, only {available} available")]
    Insufficient { position: u64, needed: u64, available: u64 },
    #[error("position {position} outside the decodable range (limit {limit})")]
    OutOfRange { position: u64, limit: u64 },
    #[error("unexpected value: {0}")]
    Mismatch(String),
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("decode produced no data")]
    Empty,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// I/O-class failures abort scanning of the affected input.
    pub fn is_io(&self) -> bool {
        matches!(self, DecodeError::Io(_))
    }
}

// ── Plugin contract ──────────────────────────────────────────────────────────

pub trait FormatPlugin: Send + Sync {
    /// Display name, also used as the default node label.
    fn name(&self) -> &str;

    /// When true, fewer than `match_size` available bytes rule the plugin out.
    fn is_fixed_size(&self) -> bool {
        false
    }

    /// Bytes at the candidate position needed by [`matches`](Self::matches).
    fn match_size(&self) -> usize {
        0
    }

    /// Final cheap test on the window read at the candidate position.
    fn matches(&self, window: &[u8]) -> bool {
        let _ = window;
        true
    }

    fn header_patterns(&self) -> &[BytePattern] {
        &[]
    }

    /// Patterns tested against the end of the input, at position 0 only.
    fn trailer_patterns(&self) -> &[BytePattern] {
        &[]
    }

    fn name_patterns(&self) -> &[Regex] {
        &[]
    }

    /// Only valid at offset 0 of an input.
    fn is_absolute(&self) -> bool {
        false
    }

    fn decode(&self, session: &mut DecodeSession<'_>) -> Result<(), DecodeError>;

    fn render(&self, out: &mut dyn Write, session: &mut RenderSession<'_>) -> io::Result<()> {
        write!(out, "{}", session.name())
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// The ordered set of plugins a scan tries.
///
/// Registration order is the tie-break among candidates of equal priority.
#[derive(Clone, Default)]
pub struct FormatSet {
    plugins:        Vec<Arc<dyn FormatPlugin>>,
    max_header:     usize,
    max_trailer:    usize,
}

impl FormatSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The formats `binscan` ships with.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(BlockFormat::new()));
        set
    }

    pub fn register(&mut self, plugin: Arc<dyn FormatPlugin>) -> &mut Self {
        let header = plugin.header_patterns().iter().map(BytePattern::len).max().unwrap_or(0);
        let trailer = plugin.trailer_patterns().iter().map(BytePattern::len).max().unwrap_or(0);
        self.max_header  = self.max_header.max(header).max(plugin.match_size());
        self.max_trailer = self.max_trailer.max(trailer);
        self.plugins.push(plugin);
        self
    }

    pub fn with(mut self, plugin: Arc<dyn FormatPlugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn plugins(&self) -> &[Arc<dyn FormatPlugin>] {
        &self.plugins
    }

    /// Largest header window any plugin needs (header pattern or match size).
    pub fn max_header_size(&self) -> usize {
        self.max_header
    }

    pub fn max_trailer_size(&self) -> usize {
        self.max_trailer
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
