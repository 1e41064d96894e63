//! `data`: the label for bytes no format recognized.
//!
//! The scanner never picks this plugin as a candidate; it creates `data`
//! nodes itself for every unrecognized run so the tree covers the input.

use std::io::{self, Write};

use super::{DecodeError, FormatPlugin};
use crate::render::RenderSession;
use crate::session::DecodeSession;

/// Bytes shown by [`render`](FormatPlugin::render).
const PREVIEW_LEN: u64 = 16;

#[derive(Debug, Default, Clone, Copy)]
pub struct RawData;

impl FormatPlugin for RawData {
    fn name(&self) -> &str {
        "data"
    }

    /// Claims everything up to the decode limit.
    fn decode(&self, s: &mut DecodeSession<'_>) -> Result<(), DecodeError> {
        match s.remaining() {
            0 => Err(DecodeError::Empty),
            n => s.skip(n),
        }
    }

    fn render(&self, out: &mut dyn Write, s: &mut RenderSession<'_>) -> io::Result<()> {
        let len     = s.end() - s.start();
        let preview = s.read_bytes(0, len.min(PREVIEW_LEN))?;
        write!(out, "{} ({len} bytes) {}", s.name(), hex::encode(&preview))?;
        if len > PREVIEW_LEN {
            write!(out, "..")?;
        }
        Ok(())
    }
}
