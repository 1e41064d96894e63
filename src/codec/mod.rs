//! Nested-stream codecs.
//!
//! The scan engine never interprets encoded payloads itself: a format plugin
//! describes an encoded span with one or more [`StreamDecoder`]s and the
//! decode cache streams their output to disk.  This module provides the
//! decoders `binscan` ships with, plus the matching compressors so test data
//! and wrapped blocks can be produced.
//!
//! # Codec ids
//! The one-byte [`CodecId`] is what the `BLCK` container stores on disk.
//! Values are permanent; an id is never reused.
//!
//! | id | codec |
//! |----|-------|
//! | 0 | stored (no transform) |
//! | 1 | zstd |
//! | 2 | lz4, size-prepended block |
//! | 3 | brotli |
//! | 4 | lzma |
//! | 5 | run-length |

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Zero-fill decoder needs a known decoded size")]
    MissingSize,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Decoder contract ─────────────────────────────────────────────────────────

/// How the decode cache may treat a decoder.
///
/// `Stored` and `ZeroFill` are no-ops the cache can satisfy without writing a
/// cache file; adjacent entries of either kind are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Stored,
    ZeroFill,
    Transform,
}

impl DecoderKind {
    pub fn is_passthrough(self) -> bool {
        !matches!(self, DecoderKind::Transform)
    }
}

/// Byte counts reported by one decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeStats {
    /// Encoded bytes actually used.  May be less than the slice handed in
    /// when the encoded size was not known up front.
    pub consumed: u64,
    /// Decoded bytes written to the output.
    pub written:  u64,
}

pub trait StreamDecoder: Send + Sync {
    /// Identity used in diagnostics and cache errors.
    fn name(&self) -> &str;

    fn kind(&self) -> DecoderKind {
        DecoderKind::Transform
    }

    /// Decode `encoded` into `out`.
    ///
    /// `decoded_size` is a hint; `None` means "determine while decoding".
    fn decode(
        &self,
        encoded:      &[u8],
        decoded_size: Option<u64>,
        out:          &mut dyn Write,
    ) -> Result<DecodeStats, CodecError>;
}

/// Encoded bytes are the decoded bytes.
pub struct StoredDecoder;

impl StreamDecoder for StoredDecoder {
    fn name(&self) -> &str { "stored" }
    fn kind(&self) -> DecoderKind { DecoderKind::Stored }

    fn decode(&self, encoded: &[u8], decoded_size: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let n = decoded_size.map_or(encoded.len(), |s| (s as usize).min(encoded.len()));
        out.write_all(&encoded[..n])?;
        Ok(DecodeStats { consumed: n as u64, written: n as u64 })
    }
}

/// Sparse region: no encoded bytes, `decoded_size` zeros.
pub struct ZeroFillDecoder;

impl StreamDecoder for ZeroFillDecoder {
    fn name(&self) -> &str { "zero-fill" }
    fn kind(&self) -> DecoderKind { DecoderKind::ZeroFill }

    fn decode(&self, _encoded: &[u8], decoded_size: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let size = decoded_size.ok_or(CodecError::MissingSize)?;
        io::copy(&mut io::repeat(0).take(size), out)?;
        Ok(DecodeStats { consumed: 0, written: size })
    }
}

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodecId {
    Stored = 0,
    Zstd   = 1,
    Lz4    = 2,
    Brotli = 3,
    Lzma   = 4,
    Rle    = 5,
}

impl CodecId {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => CodecId::Stored,
            1 => CodecId::Zstd,
            2 => CodecId::Lz4,
            3 => CodecId::Brotli,
            4 => CodecId::Lzma,
            5 => CodecId::Rle,
            _ => return None,
        })
    }

    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::Stored => "stored",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
            CodecId::Rle    => "rle",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "stored" | "none" => Some(CodecId::Stored),
            "zstd"            => Some(CodecId::Zstd),
            "lz4"             => Some(CodecId::Lz4),
            "brotli"          => Some(CodecId::Brotli),
            "lzma"            => Some(CodecId::Lzma),
            "rle"             => Some(CodecId::Rle),
            _                 => None,
        }
    }

    /// The decoder for payloads written with this codec.
    pub fn decoder(self) -> Arc<dyn StreamDecoder> {
        match self {
            CodecId::Stored => Arc::new(StoredDecoder),
            CodecId::Zstd   => Arc::new(ZstdCodec),
            CodecId::Lz4    => Arc::new(Lz4Codec),
            CodecId::Brotli => Arc::new(BrotliCodec),
            CodecId::Lzma   => Arc::new(LzmaCodec),
            CodecId::Rle    => Arc::new(RleCodec),
        }
    }
}

// ── Compressors ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
}

/// Resolve a CodecId to its compressor.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::Stored => Box::new(StoredCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Lzma   => Box::new(LzmaCodec),
        CodecId::Rle    => Box::new(RleCodec),
    }
}

pub struct StoredCodec;
impl Codec for StoredCodec {
    fn codec_id(&self) -> CodecId { CodecId::Stored }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
}

impl StreamDecoder for ZstdCodec {
    fn name(&self) -> &str { "zstd" }

    // Single frame only: the reader hands back whatever follows the frame,
    // which gives the exact encoded length when the caller did not know it.
    fn decode(&self, encoded: &[u8], _: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let mut decoder = zstd::stream::read::Decoder::with_buffer(encoded)
            .map_err(|e| CodecError::Decompression(e.to_string()))?
            .single_frame();
        let written = io::copy(&mut decoder, out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        let rest = decoder.finish();
        Ok(DecodeStats { consumed: (encoded.len() - rest.len()) as u64, written })
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
}

impl StreamDecoder for Lz4Codec {
    fn name(&self) -> &str { "lz4" }

    fn decode(&self, encoded: &[u8], _: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let data = lz4_flex::decompress_size_prepended(encoded)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        out.write_all(&data)?;
        Ok(DecodeStats { consumed: encoded.len() as u64, written: data.len() as u64 })
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
}

impl StreamDecoder for BrotliCodec {
    fn name(&self) -> &str { "brotli" }

    fn decode(&self, encoded: &[u8], _: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let mut reader = brotli::Decompressor::new(encoded, 4096);
        let written = io::copy(&mut reader, out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(DecodeStats { consumed: encoded.len() as u64, written })
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
}

impl StreamDecoder for LzmaCodec {
    fn name(&self) -> &str { "lzma" }

    fn decode(&self, encoded: &[u8], _: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let mut cursor  = io::Cursor::new(encoded);
        let mut counter = CountingWriter { inner: out, written: 0 };
        lzma_rs::lzma_decompress(&mut cursor, &mut counter)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(DecodeStats { consumed: cursor.position(), written: counter.written })
    }
}

pub struct RleCodec;
impl Codec for RleCodec {
    fn codec_id(&self) -> CodecId { CodecId::Rle }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(rle_encode(data))
    }
}

impl StreamDecoder for RleCodec {
    fn name(&self) -> &str { "rle" }

    fn decode(&self, encoded: &[u8], _: Option<u64>, out: &mut dyn Write)
        -> Result<DecodeStats, CodecError>
    {
        let written = rle_decode_into(encoded, out)?;
        Ok(DecodeStats { consumed: encoded.len() as u64, written })
    }
}

struct CountingWriter<'a> {
    inner:   &'a mut dyn Write,
    written: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ── Run-length codec ─────────────────────────────────────────────────────────

/// Run-length encode `data`.
///
/// The encoded format is a sequence of frames:
/// ```text
/// LIT frame: 0x00 <u16 LE count> <count raw bytes>
/// RUN frame: 0x01 <u16 LE count> <byte>
/// ```
pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 4 + 16);
    let mut i   = 0usize;

    while i < data.len() {
        let byte    = data[i];
        let run_len = data[i..].iter().take(65535).take_while(|&&b| b == byte).count();

        if run_len >= 4 {
            out.push(0x01);
            out.extend_from_slice(&(run_len as u16).to_le_bytes());
            out.push(byte);
            i += run_len;
            continue;
        }

        // Literal until the next run of four or the frame fills up.
        let lit_start = i;
        while i < data.len() && i - lit_start < 65535 {
            let b = data[i];
            if data[i..].iter().take(4).take_while(|&&x| x == b).count() >= 4 {
                break;
            }
            i += 1;
        }
        out.push(0x00);
        out.extend_from_slice(&((i - lit_start) as u16).to_le_bytes());
        out.extend_from_slice(&data[lit_start..i]);
    }
    out
}

fn rle_decode_into(data: &[u8], out: &mut dyn Write) -> Result<u64, CodecError> {
    let corrupt = || CodecError::Decompression("truncated rle frame".into());
    let mut i       = 0usize;
    let mut written = 0u64;

    while i < data.len() {
        let frame = data[i];
        let count = data.get(i + 1..i + 3).ok_or_else(corrupt)?;
        let count = u16::from_le_bytes([count[0], count[1]]) as usize;
        i += 3;

        match frame {
            0x00 => {
                let lit = data.get(i..i + count).ok_or_else(corrupt)?;
                out.write_all(lit)?;
                i += count;
            }
            0x01 => {
                let byte = *data.get(i).ok_or_else(corrupt)?;
                io::copy(&mut io::repeat(byte).take(count as u64), out)?;
                i += 1;
            }
            other => {
                return Err(CodecError::Decompression(format!("bad rle frame type {other:#04x}")));
            }
        }
        written += count as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(id: CodecId, encoded: &[u8]) -> (Vec<u8>, DecodeStats) {
        let mut out = Vec::new();
        let stats = id.decoder().decode(encoded, None, &mut out).unwrap();
        (out, stats)
    }

    #[test]
    fn every_codec_decodes_its_own_output() {
        let data: Vec<u8> = b"nested stream payload ".iter().cycle().take(5000).copied().collect();
        for id in [CodecId::Stored, CodecId::Zstd, CodecId::Lz4, CodecId::Brotli, CodecId::Lzma, CodecId::Rle] {
            let encoded = get_codec(id).compress(&data, 3).unwrap();
            let (decoded, stats) = decode_all(id, &encoded);
            assert_eq!(decoded, data, "codec {}", id.name());
            assert_eq!(stats.written, data.len() as u64);
        }
    }

    #[test]
    fn zstd_reports_exact_consumption() {
        let mut encoded = get_codec(CodecId::Zstd).compress(b"hello frame", 3).unwrap();
        let frame_len = encoded.len() as u64;
        encoded.extend_from_slice(b"TRAILING GARBAGE");
        let (decoded, stats) = decode_all(CodecId::Zstd, &encoded);
        assert_eq!(decoded, b"hello frame");
        assert_eq!(stats.consumed, frame_len);
    }

    #[test]
    fn rle_compresses_runs() {
        let mut data = vec![0xAAu8; 10000];
        data.extend(b"tail");
        let encoded = rle_encode(&data);
        assert!(encoded.len() < 32);
        let (decoded, _) = decode_all(CodecId::Rle, &encoded);
        assert_eq!(decoded, data);
    }

    #[test]
    fn rle_rejects_truncated_frames() {
        let mut out = Vec::new();
        assert!(RleCodec.decode(&[0x00, 0x05, 0x00, 1, 2], None, &mut out).is_err());
    }

    #[test]
    fn zero_fill_needs_size() {
        let mut out = Vec::new();
        assert!(matches!(ZeroFillDecoder.decode(&[], None, &mut out), Err(CodecError::MissingSize)));
        let stats = ZeroFillDecoder.decode(&[], Some(7), &mut out).unwrap();
        assert_eq!(stats.written, 7);
        assert_eq!(out, vec![0u8; 7]);
    }

    #[test]
    fn codec_ids_round_trip_through_bytes_and_names() {
        for v in 0u8..6 {
            let id = CodecId::from_u8(v).unwrap();
            assert_eq!(id as u8, v);
            assert_eq!(CodecId::from_name(id.name()), Some(id));
        }
        assert_eq!(CodecId::from_u8(6), None);
    }
}
