//! Container reader: file header, appendix and the forward block sequence.
//!
//! # Open
//! [`NfReader`] reads the file header and fails hard on a bad magic, an
//! unsupported layout version or an encrypted file.  Version-1 files are
//! converted in place into the version-2 header/stat shape.  Version-2 files
//! carry identity and statistics in an appendix at `appendix_offset`; the
//! appendix is scanned once and the stream position is restored to just past
//! the header so data blocks can be read sequentially.
//!
//! # Blocks
//! The body is read strictly forward.  Blocks of a type this crate does not
//! decode are skipped by seeking their on-disk size.  A block header that
//! cannot be read ends the sequence cleanly, so trailing garbage after the
//! last block is tolerated.  A block that fails to decompress is yielded once
//! as an error and ends the sequence.
//!
//! # Endianness
//! All binary I/O is strictly little-endian.

use std::io::{self, Cursor, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::block::{DataBlock, DataBlockHeader};
use crate::codec::{self, CodecError, DEFAULT_MAX_BLOCK_SIZE};
use crate::error::NfError;
use crate::header::{
    ident_string, FileHeader, FileHeaderV1, HeaderError, StatRecord, HEADER_SIZE, HEADER_V1_SIZE,
    LAYOUT_VERSION_1, STAT_RECORD_SIZE,
};

/// Appendix record carrying the identity string.
pub const TYPE_IDENT: u16 = 0x8001;
/// Appendix record carrying the [`StatRecord`].
pub const TYPE_STAT: u16 = 0x8002;

/// Size of the generic `(type u16, size u16)` record prefix.
pub const RECORD_PREFIX_SIZE: usize = 4;

pub struct NfReader<R: Read + Seek> {
    reader:         R,
    pub header:     FileHeader,
    pub ident:      String,
    pub stats:      StatRecord,
    max_block_size: usize,
    blocks_read:    u32,
    finished:       bool,
}

impl<R: Read + Seek> NfReader<R> {
    pub fn new(reader: R) -> Result<Self, HeaderError> {
        Self::with_max_block_size(reader, DEFAULT_MAX_BLOCK_SIZE)
    }

    pub fn with_max_block_size(mut reader: R, max_block_size: usize) -> Result<Self, HeaderError> {
        reader.seek(SeekFrom::Start(0))?;
        let header = FileHeader::read(&mut reader)?;

        let mut this = Self {
            reader,
            header,
            ident:       String::new(),
            stats:       StatRecord::default(),
            max_block_size,
            blocks_read: 0,
            finished:    false,
        };

        if this.header.version == LAYOUT_VERSION_1 {
            let (v1, stats) = FileHeaderV1::read(&mut this.reader)?;
            this.ident = v1.ident.clone();
            this.stats = stats;
            this.header = v1.into_header();
            this.reader.seek(SeekFrom::Start(HEADER_V1_SIZE))?;
        } else {
            if let Err(e) = this.read_appendix() {
                warn!("nfFile read appendix: {e}");
            }
            this.reader.seek(SeekFrom::Start(HEADER_SIZE))?;
        }
        Ok(this)
    }

    // ── Appendix ─────────────────────────────────────────────────────────────

    fn read_appendix(&mut self) -> Result<(), NfError> {
        if self.header.appendix_blocks == 0 {
            return Ok(());
        }
        self.reader.seek(SeekFrom::Start(self.header.appendix_offset))?;

        for i in 0..self.header.appendix_blocks {
            let block_header = DataBlockHeader::read(&mut self.reader)?;
            let block = self.read_block_payload(block_header, i as u32)?;
            debug!(block = i, records = block.header.num_records, "appendix block");
            self.scan_appendix_block(&block);
        }
        Ok(())
    }

    fn scan_appendix_block(&mut self, block: &DataBlock) {
        let data = &block.data;
        let mut offset = 0usize;
        for _ in 0..block.header.num_records {
            let Some((record_type, size)) = record_prefix(data, offset) else {
                warn!(offset, "appendix record overruns its block");
                return;
            };
            let body = &data[offset + RECORD_PREFIX_SIZE..offset + size];
            match record_type {
                TYPE_IDENT => self.ident = ident_string(body),
                TYPE_STAT if body.len() >= STAT_RECORD_SIZE => {
                    // length checked above, the read cannot fail
                    if let Ok(stats) = StatRecord::read(Cursor::new(body)) {
                        self.stats = stats;
                    }
                }
                TYPE_STAT => warn!(size, "appendix stat record too short"),
                _ => {}
            }
            offset += size;
        }
    }

    // ── Blocks ───────────────────────────────────────────────────────────────

    /// Read and decompress the payload that follows `header`.
    fn read_block_payload(&mut self, header: DataBlockHeader, index: u32) -> Result<DataBlock, NfError> {
        let declared = header.size as usize;
        if declared > self.max_block_size {
            return Err(NfError::Decompression {
                block: index,
                source: CodecError::TooLarge { max: self.max_block_size },
            });
        }
        let mut payload = vec![0u8; declared];
        self.reader.read_exact(&mut payload)?;

        let data = codec::decode(self.header.compression, &payload, self.max_block_size)
            .map_err(|source| NfError::Decompression { block: index, source })?;
        Ok(DataBlock::new(header, data))
    }

    /// Next decodable data block, `None` at end of stream.
    pub fn next_block(&mut self) -> Option<Result<DataBlock, NfError>> {
        while !self.finished && self.blocks_read < self.header.block_count {
            let index = self.blocks_read;
            self.blocks_read += 1;

            let header = match DataBlockHeader::read(&mut self.reader) {
                Ok(h) => h,
                Err(e) => {
                    debug!(block = index, "nfFile read block header: {e}");
                    break;
                }
            };

            if !header.is_decodable() {
                debug!(block = index, block_type = header.block_type, "skip block");
                if let Err(e) = self.reader.seek(SeekFrom::Current(header.size as i64)) {
                    warn!(block = index, "file seek error: {e}");
                    break;
                }
                continue;
            }

            match self.read_block_payload(header, index) {
                Ok(block) => return Some(Ok(block)),
                Err(NfError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(block = index, "truncated data block");
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
        self.finished = true;
        None
    }
}

impl<R: Read + Seek> Iterator for NfReader<R> {
    type Item = Result<DataBlock, NfError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block()
    }
}

/// Decode the `(type, size)` prefix at `offset` and check that the whole
/// record lies inside `data`.  Returns `None` on any overrun or a size smaller
/// than the prefix itself.
pub fn record_prefix(data: &[u8], offset: usize) -> Option<(u16, usize)> {
    let prefix = data.get(offset..offset.checked_add(RECORD_PREFIX_SIZE)?)?;
    let record_type = LittleEndian::read_u16(&prefix[0..2]);
    let size = LittleEndian::read_u16(&prefix[2..4]) as usize;
    if size < RECORD_PREFIX_SIZE || offset + size > data.len() {
        return None;
    }
    Some((record_type, size))
}
