//! Random-access byte providers and the bounded views scanned over them.
//!
//! An [`InputSource`] is anything that can answer positioned reads from many
//! threads at once.  An [`InputRange`] is a named `[start, end)` window onto a
//! source; taking a sub-range of a range composes the offsets and shares the
//! source, so no bytes are ever duplicated.
//!
//! Positions passed to [`InputRange::read_at`] are relative to the range
//! itself.  Reads return at most the requested bytes and never cross `end`.
//!
//! Buffered, read-ahead access lives in [`reader::RangeReader`], which is
//! owned by exactly one scan task at a time.

pub mod reader;

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

pub use reader::RangeReader;

// ── Sources ──────────────────────────────────────────────────────────────────

/// Thread-safe positioned byte provider.
pub trait InputSource: Send + Sync {
    /// Total number of readable bytes.
    fn len(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at absolute `pos`.
    ///
    /// Returns the number of bytes copied; `0` means `pos` is at or past the
    /// end of the source.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file on disk.  Reads seek under a lock, so the handle can be shared.
pub struct FileSource {
    file: Mutex<File>,
    len:  u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let len  = file.metadata()?.len();
        Ok(Self { file: Mutex::new(file), len })
    }
}

impl InputSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.len - pos) as usize);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        read_fully(&mut *file, &mut buf[..want])
    }
}

/// Bytes held in memory.
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl InputSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if pos >= self.data.len() as u64 {
            return Ok(0);
        }
        let tail = &self.data[pos as usize..];
        let n    = tail.len().min(buf.len());
        buf[..n].copy_from_slice(&tail[..n]);
        Ok(n)
    }
}

/// Synthetic all-zero content, used for sparse regions.
pub struct ZeroSource {
    len: u64,
}

impl ZeroSource {
    pub fn new(len: u64) -> Self {
        Self { len }
    }
}

impl InputSource for ZeroSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if pos >= self.len {
            return Ok(0);
        }
        let n = buf.len().min((self.len - pos) as usize);
        buf[..n].fill(0);
        Ok(n)
    }
}

/// Like `read_exact`, but a short read at end of stream is not an error.
pub(crate) fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── InputRange ───────────────────────────────────────────────────────────────

/// Named, bounded view `[start, end)` over an [`InputSource`].
///
/// Cloning is cheap: the source is reference counted.
#[derive(Clone)]
pub struct InputRange {
    source: Arc<dyn InputSource>,
    name:   Arc<str>,
    start:  u64,
    end:    u64,
}

impl InputRange {
    /// View covering the whole source.
    pub fn new(source: Arc<dyn InputSource>, name: impl Into<Arc<str>>) -> Self {
        let end = source.len();
        Self { source, name: name.into(), start: 0, end }
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path   = path.as_ref();
        let source = FileSource::open(path)?;
        Ok(Self::new(Arc::new(source), path.display().to_string()))
    }

    pub fn from_bytes(data: impl Into<Arc<[u8]>>, name: impl Into<Arc<str>>) -> Self {
        Self::new(Arc::new(MemorySource::new(data)), name)
    }

    pub fn zeros(len: u64, name: impl Into<Arc<str>>) -> Self {
        Self::new(Arc::new(ZeroSource::new(len)), name)
    }

    /// A view of `[start, end)` relative to this range, sharing the source.
    ///
    /// Bounds are clamped to this range so a sub-range can never widen it.
    pub fn sub_range(&self, start: u64, end: u64, name: impl Into<Arc<str>>) -> Self {
        let len   = self.len();
        let start = start.min(len);
        let end   = end.clamp(start, len);
        Self {
            source: Arc::clone(&self.source),
            name:   name.into(),
            start:  self.start + start,
            end:    self.start + end,
        }
    }

    /// Same bytes as [`sub_range`](Self::sub_range), keeping this range's name.
    pub fn truncated(&self, end: u64) -> Self {
        self.sub_range(0, end, Arc::clone(&self.name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Read up to `buf.len()` bytes at `pos` (relative to this range).
    ///
    /// # Panics
    /// If `pos` lies beyond the end of the range.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        assert!(
            pos <= self.len(),
            "read position {pos} beyond end of input '{}' ({} bytes)",
            self.name,
            self.len(),
        );
        let avail = (self.len() - pos).min(buf.len() as u64) as usize;
        if avail == 0 {
            return Ok(0);
        }
        let abs = self.start + pos;
        let mut filled = 0;
        while filled < avail {
            let n = self.source.read_at(abs + filled as u64, &mut buf[filled..avail])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("input '{}' shorter than its declared length", self.name),
                ));
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read exactly `len` bytes at `pos`, or fewer if the range ends first.
    pub fn read_vec(&self, pos: u64, len: u64) -> io::Result<Vec<u8>> {
        let len = len.min(self.len().saturating_sub(pos));
        let mut buf = vec![0u8; len as usize];
        let n = self.read_at(pos, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl fmt::Debug for InputRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputRange")
            .field("name",  &self.name)
            .field("start", &self.start)
            .field("end",   &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_ranges_compose_offsets() {
        let data: Vec<u8> = (0u8..100).collect();
        let root  = InputRange::from_bytes(data, "root");
        let outer = root.sub_range(10, 60, "outer");
        let inner = outer.sub_range(5, 15, "inner");

        assert_eq!(inner.len(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(inner.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [15, 16, 17, 18]);
    }

    #[test]
    fn reads_stop_at_range_end() {
        let root = InputRange::from_bytes(vec![7u8; 32], "root");
        let view = root.sub_range(0, 8, "view");
        let mut buf = [0u8; 16];
        assert_eq!(view.read_at(6, &mut buf).unwrap(), 2);
        assert_eq!(view.read_at(8, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sub_range_is_clamped() {
        let root = InputRange::from_bytes(vec![1u8; 10], "root");
        let view = root.sub_range(4, 400, "view");
        assert_eq!(view.len(), 6);
    }

    #[test]
    #[should_panic(expected = "beyond end")]
    fn read_past_end_panics() {
        let root = InputRange::from_bytes(vec![1u8; 10], "root");
        let mut buf = [0u8; 1];
        let _ = root.read_at(11, &mut buf);
    }

    #[test]
    fn zero_source_reads_zeros() {
        let z = InputRange::zeros(5, "sparse");
        let mut buf = [9u8; 8];
        assert_eq!(z.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[0u8; 5]);
    }
}
