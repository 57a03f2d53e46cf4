//! High-level [`NfFile`] API, the primary embedding surface.
//!
//! ```no_run
//! use nfdump::nffile::NfFile;
//! use nfdump::order::Direction;
//!
//! let file = NfFile::open("nfcapd.202401011200")?;
//! println!("{} flows", file.stats().num_flows);
//!
//! for record in file.records()?.order_by("bytes", Direction::Descending)? {
//!     let record = record?;
//!     println!("{:?} -> {:?}", record.src_addr(), record.dst_addr());
//! }
//! # Ok::<(), nfdump::error::NfError>(())
//! ```

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use tracing::debug;

use crate::codec::DEFAULT_MAX_BLOCK_SIZE;
use crate::error::Result;
use crate::header::{FileHeader, StatRecord};
use crate::io_stream::NfReader;
use crate::pipeline::{self, RecordStream};

pub const DEFAULT_BLOCK_QUEUE_DEPTH: usize = 16;
pub const DEFAULT_RECORD_QUEUE_DEPTH: usize = 32;

// ── ReadOptions ──────────────────────────────────────────────────────────────

/// Configuration for [`NfFile::open_with_options`].
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Ceiling for a decompressed block and for a converted legacy block.
    pub max_block_size:     usize,
    pub block_queue_depth:  usize,
    pub record_queue_depth: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            max_block_size:     DEFAULT_MAX_BLOCK_SIZE,
            block_queue_depth:  DEFAULT_BLOCK_QUEUE_DEPTH,
            record_queue_depth: DEFAULT_RECORD_QUEUE_DEPTH,
        }
    }
}

// ── NfFile ───────────────────────────────────────────────────────────────────

/// An opened flow file.  Header, identity and statistics are available
/// immediately; [`records`](NfFile::records) consumes the handle and starts
/// the decoding pipeline.
pub struct NfFile<R: Read + Seek = BufReader<File>> {
    reader:  NfReader<R>,
    options: ReadOptions,
}

impl NfFile<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, ReadOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(path: P, options: ReadOptions) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "open flow file");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), options)
    }
}

impl<R: Read + Seek> NfFile<R> {
    pub fn from_reader(reader: R, options: ReadOptions) -> Result<Self> {
        let reader = NfReader::with_max_block_size(reader, options.max_block_size)?;
        Ok(Self { reader, options })
    }

    pub fn header(&self) -> &FileHeader {
        &self.reader.header
    }

    /// Identity string, empty when the file carries none.
    pub fn ident(&self) -> &str {
        &self.reader.ident
    }

    pub fn stats(&self) -> &StatRecord {
        &self.reader.stats
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// The raw decompressed block sequence, without record decoding.
    pub fn blocks(self) -> NfReader<R> {
        self.reader
    }
}

impl<R: Read + Seek + Send + 'static> NfFile<R> {
    /// Start decoding.  Records are yielded in file order.
    pub fn records(self) -> Result<RecordStream> {
        Ok(pipeline::spawn(self.reader, &self.options)?)
    }
}
