use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};

/// On-disk size of a data block header.
pub const BLOCK_HEADER_SIZE: u64 = 12;

/// Legacy block: extension maps and common records.
pub const DATA_BLOCK_TYPE_2: u16 = 2;
/// Tagged-element (V3) record block.
pub const DATA_BLOCK_TYPE_3: u16 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBlockHeader {
    pub num_records: u32,
    /// Payload size without this header.  On disk this is the compressed
    /// size; after decompression it is the decoded length.
    pub size: u32,
    pub block_type: u16,
    pub flags: u16,
}

impl DataBlockHeader {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            num_records: reader.read_u32::<LittleEndian>()?,
            size: reader.read_u32::<LittleEndian>()?,
            block_type: reader.read_u16::<LittleEndian>()?,
            flags: reader.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_decodable(&self) -> bool {
        matches!(self.block_type, DATA_BLOCK_TYPE_2 | DATA_BLOCK_TYPE_3)
    }
}

/// A decompressed data block.  The payload is owned and never mutated.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub header: DataBlockHeader,
    pub data: Vec<u8>,
}

impl DataBlock {
    /// Wrap a decoded payload; the header size becomes the decoded length.
    pub fn new(mut header: DataBlockHeader, data: Vec<u8>) -> Self {
        header.size = data.len() as u32;
        Self { header, data }
    }
}
