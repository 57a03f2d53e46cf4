//! Compression registry: the file-level compression tag → block decoder.
//!
//! # Identity rules
//! nfdump records the compression of every data block once, in the file
//! header (`FileHeader::compression`).  The tag is a single byte:
//!
//! | tag | codec            |
//! |-----|------------------|
//! | 0   | none             |
//! | 1   | LZO1X-1          |
//! | 2   | BZIP2            |
//! | 3   | LZ4 (raw block)  |
//! | 4   | ZSTD (one frame) |
//!
//! Any other tag is fatal for the whole file: there is no negotiation and no
//! fallback to another codec.
//!
//! # Output ceiling
//! Every decoder is given a fixed `max_len` ceiling (5 MiB by default, the
//! collector's own block buffer size).  A block that inflates beyond it is a
//! hard error, never a reallocation.  The decoded length replaces the on-disk
//! block size for all later length arithmetic.

mod lzo;

use std::io::Read;
use thiserror::Error;

use lzo::LzoError;

/// Default decompression ceiling: 5 MiB.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 5 * 1024 * 1024;

// ── CompressionId enum ───────────────────────────────────────────────────────

/// Runtime codec discriminant, one per on-disk compression tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionId {
    None,
    Lzo,
    Bzip2,
    Lz4,
    Zstd,
}

impl CompressionId {
    /// Resolve an on-disk tag.  Returns `None` for tags this build does not know.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionId::None),
            1 => Some(CompressionId::Lzo),
            2 => Some(CompressionId::Bzip2),
            3 => Some(CompressionId::Lz4),
            4 => Some(CompressionId::Zstd),
            _ => None,
        }
    }

    /// Human-readable name, for diagnostics only.
    pub fn name(self) -> &'static str {
        match self {
            CompressionId::None  => "none",
            CompressionId::Lzo   => "lzo",
            CompressionId::Bzip2 => "bzip2",
            CompressionId::Lz4   => "lz4",
            CompressionId::Zstd  => "zstd",
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Decompression error ({codec}): {reason}")]
    Decompression { codec: &'static str, reason: String },
    #[error("Decompressed block exceeds ceiling of {max} bytes")]
    TooLarge { max: usize },
    /// The file header names a compression this build cannot decode.
    #[error("Unknown data block compression: {0}")]
    UnknownCompression(u8),
}

impl CodecError {
    fn decompression(codec: CompressionId, reason: impl ToString) -> Self {
        CodecError::Decompression { codec: codec.name(), reason: reason.to_string() }
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn compression_id(&self) -> CompressionId;
    /// Decode `data`; the result never exceeds `max_len` bytes.
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn compression_id(&self) -> CompressionId { CompressionId::None }
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        check_len(data.len(), max_len)?;
        Ok(data.to_vec())
    }
}

pub struct LzoCodec;
impl Codec for LzoCodec {
    fn compression_id(&self) -> CompressionId { CompressionId::Lzo }
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; max_len];
        let n = lzo::decompress_into(data, &mut out).map_err(|e| match e {
            LzoError::OutputOverrun => CodecError::TooLarge { max: max_len },
            e => CodecError::decompression(CompressionId::Lzo, e),
        })?;
        out.truncate(n);
        Ok(out)
    }
}

pub struct Bzip2Codec;
impl Codec for Bzip2Codec {
    fn compression_id(&self) -> CompressionId { CompressionId::Bzip2 }
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        // One byte past the ceiling is enough to tell "fits" from "too large".
        bzip2::read::BzDecoder::new(data)
            .take(max_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::decompression(CompressionId::Bzip2, e))?;
        check_len(out.len(), max_len)?;
        Ok(out)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn compression_id(&self) -> CompressionId { CompressionId::Lz4 }
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; max_len];
        let n = lz4_flex::block::decompress_into(data, &mut out)
            .map_err(|e| CodecError::decompression(CompressionId::Lz4, e))?;
        out.truncate(n);
        Ok(out)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn compression_id(&self) -> CompressionId { CompressionId::Zstd }
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::decompress(data, max_len)
            .map_err(|e| CodecError::decompression(CompressionId::Zstd, e))
    }
}

fn check_len(len: usize, max_len: usize) -> Result<(), CodecError> {
    if len > max_len {
        return Err(CodecError::TooLarge { max: max_len });
    }
    Ok(())
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CompressionId to a built-in codec.
pub fn get_codec(id: CompressionId) -> Box<dyn Codec> {
    match id {
        CompressionId::None  => Box::new(NoneCodec),
        CompressionId::Lzo   => Box::new(LzoCodec),
        CompressionId::Bzip2 => Box::new(Bzip2Codec),
        CompressionId::Lz4   => Box::new(Lz4Codec),
        CompressionId::Zstd  => Box::new(ZstdCodec),
    }
}

/// Decode one block payload compressed with the on-disk `tag`.
///
/// Returns `Err(CodecError::UnknownCompression)` for unrecognised tags; the
/// caller MUST treat that as fatal for the file.
pub fn decode(tag: u8, data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
    let id = CompressionId::from_tag(tag).ok_or(CodecError::UnknownCompression(tag))?;
    get_codec(id).decompress(data, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..4096u32).flat_map(|i| (i % 97).to_le_bytes()).collect()
    }

    #[test]
    fn none_passes_bytes_through() {
        let data = sample();
        assert_eq!(decode(0, &data, DEFAULT_MAX_BLOCK_SIZE).unwrap(), data);
    }

    #[test]
    fn lz4_block_decodes() {
        let data = sample();
        let packed = lz4_flex::block::compress(&data);
        assert_eq!(decode(3, &packed, DEFAULT_MAX_BLOCK_SIZE).unwrap(), data);
    }

    #[test]
    fn zstd_frame_decodes() {
        let data = sample();
        let packed = zstd::bulk::compress(&data, 3).unwrap();
        assert_eq!(decode(4, &packed, DEFAULT_MAX_BLOCK_SIZE).unwrap(), data);
    }

    #[test]
    fn bzip2_decodes() {
        use std::io::Write;
        let data = sample();
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(&data).unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(decode(2, &packed, DEFAULT_MAX_BLOCK_SIZE).unwrap(), data);
    }

    #[test]
    fn lzo_decodes() {
        let data = sample();
        let packed = lzokay_native::compress(&data).unwrap();
        assert_eq!(decode(1, &packed, DEFAULT_MAX_BLOCK_SIZE).unwrap(), data);
    }

    #[test]
    fn lzo_stops_at_the_ceiling() {
        let packed = lzokay_native::compress(&vec![0u8; 4 << 20]).unwrap();
        assert!(packed.len() < 64 << 10);
        assert!(matches!(decode(1, &packed, 1 << 20), Err(CodecError::TooLarge { max }) if max == 1 << 20));
        assert_eq!(decode(1, &packed, 4 << 20).unwrap().len(), 4 << 20);
    }

    #[test]
    fn garbage_lzo_is_an_error() {
        assert!(matches!(decode(1, &[0x40, 0x00, 0x11, 0x00, 0x00], 1024), Err(CodecError::Decompression { codec: "lzo", .. })));
    }

    #[test]
    fn ceiling_is_a_hard_error() {
        let data = sample();
        let packed = zstd::bulk::compress(&data, 3).unwrap();
        assert!(decode(4, &packed, 128).is_err());
        assert!(matches!(decode(0, &data, 128), Err(CodecError::TooLarge { max: 128 })));

        let packed = lz4_flex::block::compress(&data);
        assert!(decode(3, &packed, 128).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(decode(9, b"abc", 16), Err(CodecError::UnknownCompression(9))));
    }

    #[test]
    fn garbage_lz4_does_not_panic() {
        assert!(decode(3, &[0xff; 32], 1024).is_err());
    }
}
