//! Crate-level error type.
//!
//! Only the terminal failures live here: a file that cannot be opened, a block
//! that cannot be decompressed, an unknown ordering key.  Corrupt blocks,
//! corrupt records and rejected extension maps are recoverable; they are
//! logged, counted in [`StreamReport`](crate::pipeline::StreamReport) and the
//! stream carries on.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::header::HeaderError;

#[derive(Error, Debug)]
pub enum NfError {
    #[error("Cannot open flow file: {0}")]
    Open(#[from] HeaderError),
    #[error("Block {block}: {source}")]
    Decompression {
        block: u32,
        #[source]
        source: CodecError,
    },
    #[error("Unknown orderBy: {0}")]
    UnknownKey(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NfError>;
