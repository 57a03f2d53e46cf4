//! Record stream pipeline.
//!
//! Two threads connected by bounded queues:
//!
//! ```text
//!   nf-reader  : NfReader -> Result<DataBlock>      (block queue)
//!   nf-decode  : convert legacy blocks, demux records, decode V3,
//!                update exporters, resolve sampling  (record queue)
//!   caller     : RecordStream::next()
//! ```
//!
//! The decode thread owns the exporter registry and the extension map
//! registry; nothing is shared.  Dropping the [`RecordStream`] closes the
//! record queue, the decode thread sees the failed send and exits, which in
//! turn closes the block queue and stops the reader.  Stages that buffer
//! before sending (ordering) cannot rely on a failed send, so their stream
//! also carries a cancel sender whose disconnect they watch while pulling.
//!
//! An error travelling down the pipeline is terminal: it is forwarded once and
//! nothing follows it.

use std::io::{self, Read, Seek};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvError, SendError, Sender};
use serde::Serialize;
use tracing::{debug, warn};

use crate::block::{DataBlock, DATA_BLOCK_TYPE_2};
use crate::convert::{convert_block, ConvertStats};
use crate::error::NfError;
use crate::exporter::{
    ExporterError, ExporterRegistry, EXPORTER_INFO_TYPE, EXPORTER_STAT_TYPE, SAMPLER_LEGACY_TYPE, SAMPLER_TYPE,
};
use crate::extension_map::ExtensionMapRegistry;
use crate::io_stream::{record_prefix, NfReader};
use crate::nffile::ReadOptions;
use crate::record::{FlowRecordV3, V3_RECORD_TYPE};

pub type BlockItem = Result<DataBlock, NfError>;
pub type RecordItem = Result<FlowRecordV3, NfError>;

// ── StreamReport ─────────────────────────────────────────────────────────────

/// What the decode stage saw, returned by [`RecordStream::finish`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamReport {
    pub blocks: u64,
    pub records: u64,
    /// Records dropped because they failed to decode or transcode.
    pub corrupt_records: u64,
    /// Blocks whose record walk stopped early.
    pub corrupt_blocks: u64,
    /// Legacy extensions with no V3 counterpart.
    pub unknown_extensions: u64,
    pub rejected_maps: u64,
    pub exporters: ExporterRegistry,
}

impl StreamReport {
    fn absorb(&mut self, stats: ConvertStats) {
        self.corrupt_records += stats.dropped_records;
        self.corrupt_blocks += stats.corrupt_blocks;
        self.unknown_extensions += stats.unknown_extensions;
        self.rejected_maps += stats.rejected_maps;
    }
}

// ── RecordStream ─────────────────────────────────────────────────────────────

/// Live stream of decoded flow records.  An `Err` item is the last item.
pub struct RecordStream {
    rx:      Receiver<RecordItem>,
    worker:  Option<JoinHandle<StreamReport>>,
    done:    bool,
    /// Never sent on; dropping it tells the worker the consumer is gone.
    _cancel: Option<Sender<()>>,
}

/// One pull from a stream watched by a cancel receiver.
pub(crate) enum Pull {
    Item(RecordItem),
    End,
    Cancelled,
}

impl RecordStream {
    pub(crate) fn new(rx: Receiver<RecordItem>, worker: Option<JoinHandle<StreamReport>>) -> Self {
        Self { rx, worker, done: false, _cancel: None }
    }

    pub(crate) fn cancel_on_drop(mut self, cancel: Sender<()>) -> Self {
        self._cancel = Some(cancel);
        self
    }

    /// In-memory stream over already decoded records.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = FlowRecordV3>,
    {
        let (tx, rx) = unbounded();
        for record in records {
            // the receiver is alive until this function returns
            let _ = tx.send(Ok(record));
        }
        Self::new(rx, None)
    }

    /// Drain what is left of the stream, wait for the producing thread and
    /// return its report.
    pub fn finish(mut self) -> StreamReport {
        for _ in self.by_ref() {}
        join_worker(self.worker.take())
    }

    /// Stop early: close the queue so the producing threads exit on their
    /// next send, then wait for them.
    pub(crate) fn abandon(self) -> StreamReport {
        let RecordStream { rx, worker, .. } = self;
        drop(rx);
        join_worker(worker)
    }

    /// Next item, unless `cancel` disconnects first.
    pub(crate) fn pull(&mut self, cancel: &Receiver<()>) -> Pull {
        if self.done {
            return Pull::End;
        }
        let msg = select! {
            recv(self.rx) -> msg => msg,
            recv(cancel) -> _ => return Pull::Cancelled,
        };
        match self.accept(msg) {
            Some(item) => Pull::Item(item),
            None       => Pull::End,
        }
    }

    fn accept(&mut self, msg: Result<RecordItem, RecvError>) -> Option<RecordItem> {
        match msg {
            Ok(Ok(record)) => Some(Ok(record)),
            Ok(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

fn join_worker(worker: Option<JoinHandle<StreamReport>>) -> StreamReport {
    match worker {
        Some(handle) => handle.join().unwrap_or_else(|_| {
            warn!("decode thread panicked");
            StreamReport::default()
        }),
        None => StreamReport::default(),
    }
}

impl Iterator for RecordStream {
    type Item = RecordItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let msg = self.rx.recv();
        self.accept(msg)
    }
}

// ── Stages ───────────────────────────────────────────────────────────────────

/// Start the reader and decode threads for an opened file.
pub(crate) fn spawn<R>(reader: NfReader<R>, options: &ReadOptions) -> io::Result<RecordStream>
where
    R: Read + Seek + Send + 'static,
{
    let (block_tx, block_rx) = bounded(options.block_queue_depth);
    let reader_handle = thread::Builder::new()
        .name("nf-reader".into())
        .spawn(move || read_blocks(reader, block_tx))?;
    spawn_decoder(block_rx, Some(reader_handle), options)
}

fn read_blocks<R: Read + Seek>(reader: NfReader<R>, blocks: Sender<BlockItem>) -> u64 {
    let mut sent = 0u64;
    for block in reader {
        if blocks.send(block).is_err() {
            debug!("block consumer gone");
            break;
        }
        sent += 1;
    }
    sent
}

/// Start the decode thread over an arbitrary block source.
pub(crate) fn spawn_decoder(
    blocks: Receiver<BlockItem>,
    reader: Option<JoinHandle<u64>>,
    options: &ReadOptions,
) -> io::Result<RecordStream> {
    let (record_tx, record_rx) = bounded(options.record_queue_depth);
    let decoder = Decoder::new(options.max_block_size);
    let handle = thread::Builder::new().name("nf-decode".into()).spawn(move || {
        let report = decoder.run(blocks, record_tx);
        if let Some(reader) = reader {
            if reader.join().is_err() {
                warn!("reader thread panicked");
            }
        }
        report
    })?;
    Ok(RecordStream::new(record_rx, Some(handle)))
}

struct Decoder {
    ceiling: usize,
    maps:    Option<ExtensionMapRegistry>,
    report:  StreamReport,
}

impl Decoder {
    fn new(ceiling: usize) -> Self {
        Self { ceiling, maps: None, report: StreamReport::default() }
    }

    fn run(mut self, blocks: Receiver<BlockItem>, records: Sender<RecordItem>) -> StreamReport {
        for item in blocks.iter() {
            let block = match item {
                Ok(block) => block,
                Err(e) => {
                    if records.send(Err(e)).is_err() {
                        debug!("record consumer gone before block error");
                    }
                    break;
                }
            };
            self.report.blocks += 1;

            let block = if block.header.block_type == DATA_BLOCK_TYPE_2 {
                let maps = self.maps.get_or_insert_with(ExtensionMapRegistry::new);
                let (converted, stats) = convert_block(&block, maps, self.ceiling);
                self.report.absorb(stats);
                converted
            } else {
                block
            };

            if self.demux(&block, &records).is_err() {
                debug!("record consumer gone");
                break;
            }
        }
        // closes the block queue before the reader is joined
        drop(blocks);
        self.report
    }

    /// Walk the records of one block.  Fails only when the consumer is gone.
    fn demux(&mut self, block: &DataBlock, records: &Sender<RecordItem>) -> Result<(), SendError<RecordItem>> {
        let data = &block.data;
        let mut offset = 0usize;

        for index in 0..block.header.num_records {
            let Some((record_type, size)) = record_prefix(data, offset) else {
                warn!(
                    index,
                    offset,
                    num_records = block.header.num_records,
                    size = block.header.size,
                    "corrupt data block, skipping rest of block"
                );
                self.report.corrupt_blocks += 1;
                break;
            };
            let record = &data[offset..offset + size];

            match record_type {
                V3_RECORD_TYPE => match FlowRecordV3::decode(record) {
                    Ok(mut flow) => {
                        let (packet_interval, space_interval) = self.report.exporters.resolve(&flow);
                        flow.set_sampling(packet_interval, space_interval);
                        records.send(Ok(flow))?;
                        self.report.records += 1;
                    }
                    Err(e) => {
                        warn!(index, offset, "corrupt record: {e}");
                        self.report.corrupt_records += 1;
                    }
                },
                EXPORTER_INFO_TYPE => {
                    let result = self.report.exporters.add_exporter_info(record);
                    self.registry_result(result);
                }
                EXPORTER_STAT_TYPE => {
                    let result = self.report.exporters.add_exporter_stat(record);
                    self.registry_result(result);
                }
                SAMPLER_TYPE => {
                    let result = self.report.exporters.add_sampler(record);
                    self.registry_result(result);
                }
                SAMPLER_LEGACY_TYPE => {}
                other => debug!(record_type = other, size, "skip record"),
            }
            offset += size;
        }
        Ok(())
    }

    fn registry_result(&mut self, result: Result<(), ExporterError>) {
        if let Err(e) = result {
            warn!("{e}");
            self.report.corrupt_records += 1;
        }
    }
}
