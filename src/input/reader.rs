//! Per-task read-ahead over an [`InputRange`].
//!
//! Every scan task builds its own `RangeReader`; the page buffer is never
//! shared, so concurrent tasks reading the same input do not fight over
//! read-ahead state.  The underlying source is still read concurrently.

use std::io;

use super::InputRange;

pub struct RangeReader {
    range:      InputRange,
    page_size:  usize,
    page_start: u64,
    page:       Vec<u8>,
}

impl RangeReader {
    pub fn new(range: InputRange, page_size: usize) -> Self {
        Self {
            range,
            page_size: page_size.max(1),
            page_start: 0,
            page:       Vec::new(),
        }
    }

    pub fn range(&self) -> &InputRange {
        &self.range
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Read up to `buf.len()` bytes at `pos`; short only at the end of range.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() >= self.page_size {
            return self.range.read_at(pos, buf);
        }
        let mut filled = 0;
        while filled < buf.len() {
            let at = pos + filled as u64;
            if !self.page_holds(at) {
                self.fill_page(at)?;
                if self.page.is_empty() {
                    break;
                }
            }
            let off = (at - self.page_start) as usize;
            let n   = (self.page.len() - off).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.page[off..off + n]);
            filled += n;
        }
        Ok(filled)
    }

    fn page_holds(&self, pos: u64) -> bool {
        pos >= self.page_start && pos < self.page_start + self.page.len() as u64
    }

    fn fill_page(&mut self, pos: u64) -> io::Result<()> {
        self.page.resize(self.page_size, 0);
        let n = self.range.read_at(pos, &mut self.page)?;
        self.page.truncate(n);
        self.page_start = pos;
        Ok(())
    }
}
