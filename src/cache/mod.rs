//! Decode cache: materializes nested encoded streams to pooled temp files.
//!
//! # Pool
//! Cache files are anonymous temp files kept in a pool.  A decode leases the
//! first idle file (or creates a new one), appends its output, and releases
//! the lease when done.  Files are reused across decodes and are only
//! removed when the cache itself is dropped and no decoded input still
//! refers to them.
//!
//! The pool lock is held only for the lease decision.  Decoding and file I/O
//! happen outside it, so decodes on distinct files run in parallel.
//!
//! # Extents
//! Each file tracks the length of its last successful write (its extent).
//! A decode first truncates the file back to that extent, so a decode that
//! failed halfway leaves nothing behind for the retry to trip over.  After
//! the decoded bytes, a sentinel marker is appended and included in the new
//! extent.
//!
//! # Trivial entries
//! A single stored entry is exposed as a zero-copy sub-range of the encoded
//! input; a single zero-fill entry as a synthetic all-zero input.  Neither
//! touches a cache file.

pub mod buffer;
pub mod table;

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::codec::{CodecError, DecoderKind};
use crate::input::{read_fully, InputRange, InputSource};

use self::buffer::WriteBuffer;
pub use self::table::{InputDecoderEntry, InputDecoderTable, InputMapper, SingleInput, SliceMapper};

/// Written after every decoded stream.
pub const CACHE_SENTINEL: [u8; 8] = *b"\xCA\xC4\xE5END\0\0";

/// Default number of bytes buffered before a cache-file write.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 1024 * 1024;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("decoder '{decoder}' failed: {source}")]
    Decoder {
        decoder: String,
        #[source]
        source:  CodecError,
    },
    #[error("decoder '{decoder}' produced {actual} bytes, expected {expected}")]
    SizeMismatch { decoder: String, expected: u64, actual: u64 },
    #[error("decoder '{decoder}' needs a known decoded size")]
    MissingSize { decoder: String },
    #[error("encoded data for '{decoder}' at offset {offset} runs past the end of the input")]
    Truncated { decoder: String, offset: u64 },
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Name of the decoder that failed, when one did.
    pub fn decoder(&self) -> Option<&str> {
        match self {
            CacheError::Decoder { decoder, .. }
            | CacheError::SizeMismatch { decoder, .. }
            | CacheError::MissingSize { decoder }
            | CacheError::Truncated { decoder, .. } => Some(decoder.as_str()),
            CacheError::Io(_) => None,
        }
    }
}

// ── Result ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DecodedInputs {
    /// Mapped decoded inputs, in mapper order.  May include empty inputs.
    pub inputs:          Vec<InputRange>,
    /// `start + encoded_size`.
    pub decode_position: u64,
    /// Encoded bytes covered, measured from `start`.
    pub encoded_size:    u64,
}

// ── Cache files ──────────────────────────────────────────────────────────────

pub struct CacheFile {
    id:     usize,
    file:   Mutex<File>,
    busy:   AtomicBool,
    extent: AtomicU64,
}

impl CacheFile {
    fn new(id: usize, file: File) -> Self {
        Self {
            id,
            file:   Mutex::new(file),
            busy:   AtomicBool::new(true),
            extent: AtomicU64::new(0),
        }
    }

    fn try_lease(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn extent(&self) -> u64 {
        self.extent.load(Ordering::Acquire)
    }

    /// Drop anything past the last recorded extent.
    fn truncate_to_extent(&self) -> io::Result<u64> {
        let extent = self.extent();
        self.file.lock().set_len(extent)?;
        Ok(extent)
    }
}

impl InputSource for CacheFile {
    fn len(&self) -> u64 {
        self.extent()
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let extent = self.extent();
        if pos >= extent || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((extent - pos) as usize);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        read_fully(&mut *file, &mut buf[..want])
    }
}

/// Exclusive use of one cache file for the duration of a decode.
struct CacheLease {
    file: Arc<CacheFile>,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.file.busy.store(false, Ordering::Release);
    }
}

/// Positioned writes into a leased cache file; locks per chunk.
struct CacheWriter<'a> {
    file: &'a CacheFile,
    pos:  u64,
}

impl Write for CacheWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.file.lock();
        file.seek(SeekFrom::Start(self.pos))?;
        file.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.file.lock().flush()
    }
}

// ── DecodeCache ──────────────────────────────────────────────────────────────

pub struct DecodeCache {
    dir:         Option<PathBuf>,
    write_chunk: usize,
    pool:        Mutex<Vec<Arc<CacheFile>>>,
}

impl Default for DecodeCache {
    fn default() -> Self {
        Self::new(None, DEFAULT_WRITE_CHUNK_SIZE)
    }
}

impl DecodeCache {
    /// `dir` of `None` uses the system temp directory.
    pub fn new(dir: Option<PathBuf>, write_chunk: usize) -> Self {
        Self {
            dir,
            write_chunk: write_chunk.max(1),
            pool:        Mutex::new(Vec::new()),
        }
    }

    /// Decode the span described by `table`, starting at `start` in `input`.
    ///
    /// Zero entries give an empty result; one entry decodes directly; more
    /// entries are decoded in order into one combined stream.  The decoded
    /// stream is split into inputs by `mapper`.
    pub fn decode_inputs(
        &self,
        mapper: &dyn InputMapper,
        table:  &InputDecoderTable,
        input:  &InputRange,
        start:  u64,
    ) -> Result<DecodedInputs, CacheError> {
        let (decoded, encoded_size) = match table.entries() {
            []      => {
                return Ok(DecodedInputs { inputs: Vec::new(), decode_position: start, encoded_size: 0 });
            }
            [entry] => self.decode_single(entry, input, start)?,
            entries => self.decode_into_cache(entries, input, start)?,
        };
        Ok(DecodedInputs {
            inputs:          mapper.map(decoded),
            decode_position: start + encoded_size,
            encoded_size,
        })
    }

    fn decode_single(
        &self,
        entry: &InputDecoderEntry,
        input: &InputRange,
        start: u64,
    ) -> Result<(InputRange, u64), CacheError> {
        let abs  = start + entry.offset;
        let name = decoded_name(input, entry.decoder.name(), abs);
        match entry.decoder.kind() {
            DecoderKind::Stored => {
                if abs > input.len() {
                    return Err(truncated(entry, abs));
                }
                let size = entry.encoded_size
                    .or(entry.decoded_size)
                    .unwrap_or(input.len() - abs);
                if let Some(expected) = entry.decoded_size.filter(|&d| d != size) {
                    return Err(CacheError::SizeMismatch {
                        decoder:  entry.decoder.name().to_owned(),
                        expected,
                        actual:   size,
                    });
                }
                if abs + size > input.len() {
                    return Err(truncated(entry, abs));
                }
                Ok((input.sub_range(abs, abs + size, name), entry.offset + size))
            }
            DecoderKind::ZeroFill => {
                let size = entry.decoded_size.ok_or_else(|| CacheError::MissingSize {
                    decoder: entry.decoder.name().to_owned(),
                })?;
                let encoded = entry.encoded_size.unwrap_or(0);
                Ok((InputRange::zeros(size, name), entry.offset + encoded))
            }
            DecoderKind::Transform => self.decode_into_cache(std::slice::from_ref(entry), input, start),
        }
    }

    fn decode_into_cache(
        &self,
        entries: &[InputDecoderEntry],
        input:   &InputRange,
        start:   u64,
    ) -> Result<(InputRange, u64), CacheError> {
        let lease = self.acquire()?;
        let file  = &lease.file;
        let base  = file.truncate_to_extent()?;

        let mut out = WriteBuffer::new(CacheWriter { file, pos: base }, self.write_chunk);
        let mut encoded_end = 0u64;
        for entry in entries {
            let consumed = decode_entry(entry, input, start, &mut out)?;
            encoded_end = encoded_end.max(entry.offset + consumed);
        }
        let written = out.bytes_written;
        out.write_all(&CACHE_SENTINEL)?;
        out.flush()?;
        file.extent.store(base + written + CACHE_SENTINEL.len() as u64, Ordering::Release);

        debug!(
            cache_file = file.id,
            offset     = base,
            written,
            encoded    = encoded_end,
            "decoded nested stream into cache"
        );

        let describe: Vec<&str> = entries.iter().map(|e| e.decoder.name()).collect();
        let name   = decoded_name(input, &describe.join("+"), start);
        let source: Arc<dyn InputSource> = Arc::clone(file) as Arc<dyn InputSource>;
        let range  = InputRange::new(source, name.as_str()).sub_range(base, base + written, name);
        Ok((range, encoded_end))
    }

    fn acquire(&self) -> Result<CacheLease, CacheError> {
        let mut pool = self.pool.lock();
        if let Some(file) = pool.iter().find(|f| f.try_lease()) {
            return Ok(CacheLease { file: Arc::clone(file) });
        }
        let handle = match &self.dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None      => tempfile::tempfile()?,
        };
        let file = Arc::new(CacheFile::new(pool.len(), handle));
        pool.push(Arc::clone(&file));
        debug!(cache_file = file.id, "created cache file");
        Ok(CacheLease { file })
    }

    /// Number of cache files created so far.
    pub fn file_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Current extent of every cache file, in creation order.
    pub fn extents(&self) -> Vec<u64> {
        self.pool.lock().iter().map(|f| f.extent()).collect()
    }
}

/// Decode one entry into `out`, returning the encoded bytes it covered.
fn decode_entry<W: Write>(
    entry: &InputDecoderEntry,
    input: &InputRange,
    start: u64,
    out:   &mut W,
) -> Result<u64, CacheError> {
    let abs = start + entry.offset;
    if abs > input.len() {
        return Err(truncated(entry, abs));
    }
    let avail = input.len() - abs;
    let want  = entry.encoded_size.unwrap_or(avail);
    if want > avail {
        return Err(truncated(entry, abs));
    }
    let encoded = input.read_vec(abs, want)?;

    let decoder = entry.decoder.name();
    let stats = entry.decoder
        .decode(&encoded, entry.decoded_size, out)
        .map_err(|source| CacheError::Decoder { decoder: decoder.to_owned(), source })?;
    if let Some(expected) = entry.decoded_size {
        if stats.written != expected {
            return Err(CacheError::SizeMismatch {
                decoder:  decoder.to_owned(),
                expected,
                actual:   stats.written,
            });
        }
    }
    Ok(entry.encoded_size.unwrap_or(stats.consumed))
}

fn truncated(entry: &InputDecoderEntry, offset: u64) -> CacheError {
    CacheError::Truncated { decoder: entry.decoder.name().to_owned(), offset }
}

fn decoded_name(input: &InputRange, decoder: &str, offset: u64) -> String {
    format!("{}/{}@{:#x}", input.name(), decoder, offset)
}
