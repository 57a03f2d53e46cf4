pub mod codec;
pub mod header;
pub mod block;
pub mod io_stream;
pub mod extension_map;
pub mod convert;
pub mod record;
pub mod exporter;
pub mod pipeline;
pub mod order;
pub mod nffile;
pub mod error;

pub use codec::{CompressionId, get_codec};
pub use header::{FileHeader, StatRecord};
pub use block::{DataBlock, DataBlockHeader};
pub use record::FlowRecordV3;
pub use exporter::{Exporter, ExporterRegistry, Sampler};
pub use pipeline::{RecordStream, StreamReport};
pub use order::{Direction, OrderKey};
pub use nffile::{NfFile, ReadOptions};
pub use error::NfError;
