//! Format candidate matcher.
//!
//! For a position in an input, decide which plugins are worth a full decode
//! attempt and in what order:
//!
//! 1. plugins whose trailer pattern matches the end of the input (position 0
//!    of a fresh pass only),
//! 2. plugins whose header pattern matches at the position,
//! 3. plugins whose name regex matches the input name,
//! 4. plugins with no discriminator at all.
//!
//! A plugin that has discriminators but none of them matched is not a
//! candidate.  Registration order breaks ties within a category.

use std::io;
use std::sync::Arc;

use crate::format::{FormatPlugin, FormatSet};
use crate::input::RangeReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Category {
    Trailer,
    Header,
    Name,
    Unconditional,
}

/// Matches candidates for one scan task.  The scratch windows are reused
/// across positions, so each task owns its own matcher.
pub struct FormatMatcher {
    formats: Arc<FormatSet>,
    header:  Vec<u8>,
    trailer: Vec<u8>,
}

impl FormatMatcher {
    pub fn new(formats: Arc<FormatSet>) -> Self {
        let header  = vec![0u8; formats.max_header_size()];
        let trailer = vec![0u8; formats.max_trailer_size()];
        Self { formats, header, trailer }
    }

    pub fn formats(&self) -> &Arc<FormatSet> {
        &self.formats
    }

    /// Ordered candidates at `position`.
    ///
    /// `fresh` marks the start of a pass over a whole input, the only time
    /// trailers are probed.
    pub fn candidates(
        &mut self,
        reader:   &mut RangeReader,
        position: u64,
        fresh:    bool,
    ) -> io::Result<Vec<Arc<dyn FormatPlugin>>> {
        let len = reader.len();
        let want = (len.saturating_sub(position)).min(self.header.len() as u64) as usize;
        let header_len = reader.read_at(position, &mut self.header[..want])?;

        let mut trailer_len = 0;
        if position == 0 && fresh && !self.trailer.is_empty() {
            let want = len.min(self.trailer.len() as u64) as usize;
            trailer_len = reader.read_at(len - want as u64, &mut self.trailer[..want])?;
        }

        let window   = &self.header[..header_len];
        let trailer  = &self.trailer[..trailer_len];
        let name     = reader.range().name();

        let mut found: Vec<(Category, Arc<dyn FormatPlugin>)> = Vec::new();
        for plugin in self.formats.plugins() {
            if plugin.is_absolute() && position != 0 {
                continue;
            }
            let Some(category) = categorize(plugin.as_ref(), window, trailer, name) else {
                continue;
            };
            let need = plugin.match_size();
            if plugin.is_fixed_size() && window.len() < need {
                continue;
            }
            if !plugin.matches(&window[..need.min(window.len())]) {
                continue;
            }
            found.push((category, Arc::clone(plugin)));
        }
        found.sort_by_key(|(category, _)| *category);
        Ok(found.into_iter().map(|(_, p)| p).collect())
    }
}

fn categorize(plugin: &dyn FormatPlugin, window: &[u8], trailer: &[u8], name: &str) -> Option<Category> {
    let trailers = plugin.trailer_patterns();
    let headers  = plugin.header_patterns();
    let names    = plugin.name_patterns();

    if trailers.iter().any(|p| p.matches_suffix(trailer)) {
        Some(Category::Trailer)
    } else if headers.iter().any(|p| p.matches_prefix(window)) {
        Some(Category::Header)
    } else if names.iter().any(|re| re.is_match(name)) {
        Some(Category::Name)
    } else if trailers.is_empty() && headers.is_empty() && names.is_empty() {
        Some(Category::Unconditional)
    } else {
        None
    }
}
