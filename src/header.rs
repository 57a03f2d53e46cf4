use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::io::{self, Read};
use thiserror::Error;
use tracing::warn;

pub const MAGIC: u16 = 0xA50C;
pub const LAYOUT_VERSION_1: u16 = 1;
pub const LAYOUT_VERSION_2: u16 = 2;

/// On-disk size of a version-2 file header.
pub const HEADER_SIZE: u64 = 40;
/// On-disk size of a version-1 file header plus its trailing stat record.
pub const HEADER_V1_SIZE: u64 = 140 + STAT_RECORD_V1_SIZE;
pub const STAT_RECORD_SIZE: usize = 144;
pub const STAT_RECORD_V1_SIZE: u64 = 136;

const IDENT_V1_LEN: usize = 128;
const CREATOR_VERSION_V1: u32 = 0x106;

// v1 header flag bits
const FLAG_V1_LZO: u32 = 0x1;
const FLAG_V1_BZ2: u32 = 0x8;
const FLAG_V1_LZ4: u32 = 0x10;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Bad magic: 0x{0:04x}")]
    InvalidMagic(u16),
    #[error("Unsupported layout version: {0}")]
    UnsupportedVersion(u16),
    #[error("Encrypted files are not supported (encryption {0})")]
    Encrypted(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// File header in its version-2 shape.  Version-1 headers are converted into
/// this shape when the file is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub magic: u16,
    pub version: u16,
    pub creator_version: u32,
    pub created: u64,
    pub compression: u8,
    pub encryption: u8,
    pub appendix_blocks: u16,
    pub reserved: u32,
    pub appendix_offset: u64,
    pub block_size: u32,
    pub block_count: u32,
}

impl FileHeader {
    /// Reads magic and version, then the remainder of a version-2 header.
    ///
    /// For a version-1 file only the first four bytes are consumed and the
    /// remaining fields stay at their defaults; see [`FileHeaderV1`].
    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let magic = reader.read_u16::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(HeaderError::InvalidMagic(magic));
        }
        let version = reader.read_u16::<LittleEndian>()?;
        match version {
            LAYOUT_VERSION_1 => Ok(Self { magic, version, ..Self::default() }),
            LAYOUT_VERSION_2 => {
                let header = Self {
                    magic,
                    version,
                    creator_version: reader.read_u32::<LittleEndian>()?,
                    created: reader.read_u64::<LittleEndian>()?,
                    compression: reader.read_u8()?,
                    encryption: reader.read_u8()?,
                    appendix_blocks: reader.read_u16::<LittleEndian>()?,
                    reserved: reader.read_u32::<LittleEndian>()?,
                    appendix_offset: reader.read_u64::<LittleEndian>()?,
                    block_size: reader.read_u32::<LittleEndian>()?,
                    block_count: reader.read_u32::<LittleEndian>()?,
                };
                if header.encryption != 0 {
                    return Err(HeaderError::Encrypted(header.encryption));
                }
                Ok(header)
            }
            other => Err(HeaderError::UnsupportedVersion(other)),
        }
    }
}

/// Aggregate counters of a file.  Timestamps are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatRecord {
    pub num_flows: u64,
    pub num_bytes: u64,
    pub num_packets: u64,
    pub num_flows_tcp: u64,
    pub num_flows_udp: u64,
    pub num_flows_icmp: u64,
    pub num_flows_other: u64,
    pub num_bytes_tcp: u64,
    pub num_bytes_udp: u64,
    pub num_bytes_icmp: u64,
    pub num_bytes_other: u64,
    pub num_packets_tcp: u64,
    pub num_packets_udp: u64,
    pub num_packets_icmp: u64,
    pub num_packets_other: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub sequence_failure: u64,
}

impl StatRecord {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut counters = [0u64; 15];
        reader.read_u64_into::<LittleEndian>(&mut counters)?;
        let mut stat = Self::from_counters(&counters);
        stat.first_seen = reader.read_u64::<LittleEndian>()?;
        stat.last_seen = reader.read_u64::<LittleEndian>()?;
        stat.sequence_failure = reader.read_u64::<LittleEndian>()?;
        Ok(stat)
    }

    /// Version-1 layout: same counters, 32-bit seconds plus separate msec
    /// fields, 32-bit sequence failures.
    pub fn read_v1<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut counters = [0u64; 15];
        reader.read_u64_into::<LittleEndian>(&mut counters)?;
        let mut stat = Self::from_counters(&counters);
        let first = reader.read_u32::<LittleEndian>()? as u64;
        let last = reader.read_u32::<LittleEndian>()? as u64;
        let msec_first = reader.read_u16::<LittleEndian>()? as u64;
        let msec_last = reader.read_u16::<LittleEndian>()? as u64;
        stat.first_seen = first * 1000 + msec_first;
        stat.last_seen = last * 1000 + msec_last;
        stat.sequence_failure = reader.read_u32::<LittleEndian>()? as u64;
        Ok(stat)
    }

    // on-disk order: totals, flows, bytes, packets per protocol family
    fn from_counters(c: &[u64; 15]) -> Self {
        Self {
            num_flows: c[0],
            num_bytes: c[1],
            num_packets: c[2],
            num_flows_tcp: c[3],
            num_flows_udp: c[4],
            num_flows_icmp: c[5],
            num_flows_other: c[6],
            num_bytes_tcp: c[7],
            num_bytes_udp: c[8],
            num_bytes_icmp: c[9],
            num_bytes_other: c[10],
            num_packets_tcp: c[11],
            num_packets_udp: c[12],
            num_packets_icmp: c[13],
            num_packets_other: c[14],
            ..Self::default()
        }
    }
}

/// Version-1 header body: everything after magic and version.
#[derive(Debug, Clone)]
pub struct FileHeaderV1 {
    pub flags: u32,
    pub block_count: u32,
    pub ident: String,
}

impl FileHeaderV1 {
    /// Reads the v1 header body and the stat record that follows it.  The
    /// reader must be positioned just past magic and version.
    pub fn read<R: Read>(mut reader: R) -> io::Result<(Self, StatRecord)> {
        let flags = reader.read_u32::<LittleEndian>()?;
        let block_count = reader.read_u32::<LittleEndian>()?;
        let mut ident = [0u8; IDENT_V1_LEN];
        reader.read_exact(&mut ident)?;
        let stat = StatRecord::read_v1(&mut reader)?;
        Ok((Self { flags, block_count, ident: ident_string(&ident) }, stat))
    }

    /// Convert into the version-2 header shape.  Compression, encryption and
    /// appendix fields take their "none" defaults.
    pub fn into_header(self) -> FileHeader {
        if self.flags & (FLAG_V1_LZO | FLAG_V1_BZ2 | FLAG_V1_LZ4) != 0 {
            warn!(flags = self.flags, "v1 file flags announce compressed blocks; reading them as uncompressed");
        }
        FileHeader {
            magic: MAGIC,
            version: LAYOUT_VERSION_1,
            creator_version: CREATOR_VERSION_V1,
            block_count: self.block_count,
            ..FileHeader::default()
        }
    }
}

/// Identity strings are NUL padded on disk.
pub fn ident_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn v2_header(encryption: u8) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&MAGIC.to_le_bytes());
        b.extend_from_slice(&2u16.to_le_bytes());
        b.extend_from_slice(&0x0107_0000u32.to_le_bytes());
        b.extend_from_slice(&1_700_000_000u64.to_le_bytes());
        b.push(4);
        b.push(encryption);
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&4096u64.to_le_bytes());
        b.extend_from_slice(&(5u32 << 20).to_le_bytes());
        b.extend_from_slice(&7u32.to_le_bytes());
        b
    }

    #[test]
    fn reads_v2_header() {
        let bytes = v2_header(0);
        assert_eq!(bytes.len() as u64, HEADER_SIZE);
        let h = FileHeader::read(Cursor::new(bytes)).unwrap();
        assert_eq!(h.version, 2);
        assert_eq!(h.compression, 4);
        assert_eq!(h.appendix_blocks, 1);
        assert_eq!(h.appendix_offset, 4096);
        assert_eq!(h.block_count, 7);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = v2_header(0);
        bytes[0] = 0;
        assert!(matches!(FileHeader::read(Cursor::new(&bytes)), Err(HeaderError::InvalidMagic(_))));

        let mut bytes = v2_header(0);
        bytes[2] = 3;
        assert!(matches!(FileHeader::read(Cursor::new(&bytes)), Err(HeaderError::UnsupportedVersion(3))));
    }

    #[test]
    fn rejects_encrypted() {
        let bytes = v2_header(1);
        assert!(matches!(FileHeader::read(Cursor::new(bytes)), Err(HeaderError::Encrypted(1))));
    }

    #[test]
    fn short_header_is_io_error() {
        let bytes = &v2_header(0)[..20];
        assert!(matches!(FileHeader::read(Cursor::new(bytes)), Err(HeaderError::Io(_))));
    }

    #[test]
    fn converts_v1_header_and_stat() {
        let mut b = Vec::new();
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&3u32.to_le_bytes());
        let mut ident = [0u8; IDENT_V1_LEN];
        ident[..6].copy_from_slice(b"router");
        b.extend_from_slice(&ident);
        for i in 0..15u64 {
            b.extend_from_slice(&(i + 1).to_le_bytes());
        }
        b.extend_from_slice(&100u32.to_le_bytes());
        b.extend_from_slice(&200u32.to_le_bytes());
        b.extend_from_slice(&5u16.to_le_bytes());
        b.extend_from_slice(&7u16.to_le_bytes());
        b.extend_from_slice(&9u32.to_le_bytes());
        assert_eq!(b.len() as u64 + 4, HEADER_V1_SIZE);

        let (v1, stat) = FileHeaderV1::read(Cursor::new(b)).unwrap();
        assert_eq!(v1.ident, "router");
        assert_eq!(stat.num_flows, 1);
        assert_eq!(stat.num_packets_other, 15);
        assert_eq!(stat.first_seen, 100_005);
        assert_eq!(stat.last_seen, 200_007);
        assert_eq!(stat.sequence_failure, 9);

        let header = v1.into_header();
        assert_eq!(header.version, 1);
        assert_eq!(header.block_count, 3);
        assert_eq!(header.compression, 0);
        assert_eq!(header.appendix_blocks, 0);
    }
}
