//! `BLCK` containers: one compressed payload behind a fixed 28-byte header.
//!
//! ```text
//! offset  size  field
//!      0     4  magic        0x424C434B, little-endian ("KCLB" on disk)
//!      4     4  payload_size encoded bytes following the header
//!      8     4  file_id
//!     12     8  file_offset
//!     20     1  codec        CodecId
//!     21     1  level        i8, informational
//!     22     2  flags        reserved, 0
//!     24     4  crc32        CRC-32 of the encoded payload
//! ```
//!
//! The payload is decoded as an encoded input; its decoded bytes are scanned
//! again as a nested input.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use super::{BytePattern, DecodeError, FormatPlugin};
use crate::cache::{InputDecoderTable, SingleInput};
use crate::codec::{get_codec, CodecError, CodecId};
use crate::render::RenderSession;
use crate::session::DecodeSession;

pub const BLOCK_MAGIC: u32 = 0x424C434B;
pub const BLOCK_HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic:        u32,
    pub payload_size: u32,
    pub file_id:      u32,
    pub file_offset:  u64,
    pub codec:        u8,
    pub level:        i8,
    pub flags:        u16,
    pub crc32:        u32,
}

impl BlockHeader {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u32::<LittleEndian>(self.payload_size)?;
        w.write_u32::<LittleEndian>(self.file_id)?;
        w.write_u64::<LittleEndian>(self.file_offset)?;
        w.write_u8(self.codec)?;
        w.write_i8(self.level)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        Ok(())
    }

    pub fn read<R: Read>(mut r: R) -> io::Result<Self> {
        Ok(Self {
            magic:        r.read_u32::<LittleEndian>()?,
            payload_size: r.read_u32::<LittleEndian>()?,
            file_id:      r.read_u32::<LittleEndian>()?,
            file_offset:  r.read_u64::<LittleEndian>()?,
            codec:        r.read_u8()?,
            level:        r.read_i8()?,
            flags:        r.read_u16::<LittleEndian>()?,
            crc32:        r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Compress `data` and frame it as a complete `BLCK` block (header + payload).
pub fn encode_block(
    file_id:     u32,
    file_offset: u64,
    data:        &[u8],
    codec:       CodecId,
    level:       i32,
) -> Result<Vec<u8>, CodecError> {
    let payload = get_codec(codec).compress(data, level)?;
    let payload_size = u32::try_from(payload.len())
        .map_err(|_| CodecError::Compression("block payload exceeds 4 GiB".into()))?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let header = BlockHeader {
        magic: BLOCK_MAGIC,
        payload_size,
        file_id,
        file_offset,
        codec: codec as u8,
        level: level.clamp(i8::MIN.into(), i8::MAX.into()) as i8,
        flags: 0,
        crc32: hasher.finalize(),
    };

    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    header.write(&mut out)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

// ── Format plugin ────────────────────────────────────────────────────────────

pub struct BlockFormat {
    headers: Vec<BytePattern>,
}

impl BlockFormat {
    pub fn new() -> Self {
        Self { headers: vec![BytePattern::exact(&BLOCK_MAGIC.to_le_bytes())] }
    }
}

impl Default for BlockFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatPlugin for BlockFormat {
    fn name(&self) -> &str {
        "blck"
    }

    fn is_fixed_size(&self) -> bool {
        true
    }

    fn match_size(&self) -> usize {
        BLOCK_HEADER_SIZE
    }

    fn matches(&self, window: &[u8]) -> bool {
        match BlockHeader::read(window) {
            Ok(h) => h.magic == BLOCK_MAGIC && CodecId::from_u8(h.codec).is_some(),
            Err(_) => false,
        }
    }

    fn header_patterns(&self) -> &[BytePattern] {
        &self.headers
    }

    fn decode(&self, s: &mut DecodeSession<'_>) -> Result<(), DecodeError> {
        let raw    = s.read_bytes(BLOCK_HEADER_SIZE as u64)?;
        let header = BlockHeader::read(&raw[..])?;
        if header.magic != BLOCK_MAGIC {
            return Err(DecodeError::Mismatch(format!("block magic {:#010x}", header.magic)));
        }
        let codec = CodecId::from_u8(header.codec)
            .ok_or_else(|| DecodeError::Mismatch(format!("unknown block codec {}", header.codec)))?;

        let payload_start = s.position();
        let payload_end   = payload_start + u64::from(header.payload_size);
        let payload       = s.peek_bytes(u64::from(header.payload_size))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        if crc != header.crc32 {
            return Err(DecodeError::Malformed(format!(
                "block payload crc {crc:#010x}, header says {:#010x}",
                header.crc32,
            )));
        }
        drop(payload);

        s.bind_result_value("file_id", header.file_id.into());
        s.bind_result_value("file_offset", header.file_offset.into());
        s.bind_result_value("codec", codec.name().into());
        s.bind_result_value("level", i64::from(header.level).into());
        s.bind_result_value("payload_size", header.payload_size.into());
        s.bind_result_value("crc32", header.crc32.into());

        let mut table = InputDecoderTable::new();
        table.add(codec.decoder(), 0, Some(u64::from(header.payload_size)), None);
        s.decode_encoded_input(&table, &SingleInput)?;
        s.seek(payload_end)
    }

    fn render(&self, out: &mut dyn Write, s: &mut RenderSession<'_>) -> io::Result<()> {
        let codec = s.get_value("codec").and_then(|v| v.as_str().map(str::to_owned)).unwrap_or_default();
        let size  = s.get_value("payload_size").and_then(|v| v.as_u64()).unwrap_or(0);
        write!(out, "{} [{} payload, {} bytes]", s.name(), codec, size)?;
        if let (Some(id), Some(off)) = (s.get_value("file_id"), s.get_value("file_offset")) {
            write!(out, " file {id} @ {off}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_28_bytes() {
        let block = encode_block(7, 4096, b"hello hello hello", CodecId::Stored, 0).unwrap();
        assert_eq!(&block[..4], b"KCLB");
        let h = BlockHeader::read(&block[..]).unwrap();
        assert_eq!(h.payload_size as usize, block.len() - BLOCK_HEADER_SIZE);
        assert_eq!((h.file_id, h.file_offset, h.codec), (7, 4096, CodecId::Stored as u8));
        assert_eq!(&block[BLOCK_HEADER_SIZE..], b"hello hello hello");
    }

    #[test]
    fn level_is_clamped() {
        let block = encode_block(0, 0, b"x", CodecId::Stored, 1000).unwrap();
        assert_eq!(BlockHeader::read(&block[..]).unwrap().level, i8::MAX);
    }

    #[test]
    fn matches_requires_known_codec() {
        let f = BlockFormat::new();
        let mut block = encode_block(0, 0, b"abc", CodecId::Zstd, 3).unwrap();
        assert!(f.matches(&block[..BLOCK_HEADER_SIZE]));
        block[20] = 0xEE;
        assert!(!f.matches(&block[..BLOCK_HEADER_SIZE]));
        assert!(!f.matches(&block[..10]));
    }
}
