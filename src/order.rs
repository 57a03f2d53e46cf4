//! Ordering stage.
//!
//! Records are buffered in arrival order next to a compact array of
//! `(index, key)` pairs.  Only the pair array is sorted, so the comparator
//! never touches record memory.  The stage emits nothing until its input is
//! exhausted; dropping the ordered stream while it is still buffering stops
//! the upstream pipeline instead of reading the rest of the file.

use std::str::FromStr;
use std::thread;

use crossbeam_channel::bounded;
use tracing::debug;

use crate::error::NfError;
use crate::pipeline::{Pull, RecordStream};
use crate::record::FlowRecordV3;

/// Capacity of the queue behind the ordering stage.
pub const ORDER_QUEUE_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKey {
    /// Flow start, msec.
    TStart,
    /// Flow end, msec.
    TEnd,
    Packets,
    Bytes,
}

impl OrderKey {
    /// Sort value of `record`; 0 when it carries no generic flow element.
    pub fn value(self, record: &FlowRecordV3) -> u64 {
        let Some(g) = record.generic_flow() else {
            return 0;
        };
        match self {
            OrderKey::TStart  => g.msec_first,
            OrderKey::TEnd    => g.msec_last,
            OrderKey::Packets => g.in_packets,
            OrderKey::Bytes   => g.in_bytes,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OrderKey::TStart  => "tstart",
            OrderKey::TEnd    => "tend",
            OrderKey::Packets => "packets",
            OrderKey::Bytes   => "bytes",
        }
    }
}

impl FromStr for OrderKey {
    type Err = NfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tstart"  => Ok(OrderKey::TStart),
            "tend"    => Ok(OrderKey::TEnd),
            "packets" => Ok(OrderKey::Packets),
            "bytes"   => Ok(OrderKey::Bytes),
            other     => Err(NfError::UnknownKey(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy)]
struct SortEntry {
    index: u32,
    value: u64,
}

/// Sort by value; equal values keep arrival order in both directions.
fn sort_entries(entries: &mut [SortEntry], direction: Direction) {
    match direction {
        Direction::Ascending => entries.sort_unstable_by_key(|e| (e.value, e.index)),
        Direction::Descending => {
            entries.sort_unstable_by(|a, b| b.value.cmp(&a.value).then(a.index.cmp(&b.index)))
        }
    }
}

impl RecordStream {
    /// Order the remaining records by `key` (`tstart`, `tend`, `packets` or
    /// `bytes`).  An unknown key fails before any record is consumed.
    pub fn order_by(self, key: &str, direction: Direction) -> Result<RecordStream, NfError> {
        let key: OrderKey = key.parse()?;
        self.ordered(key, direction)
    }

    pub fn ordered(self, key: OrderKey, direction: Direction) -> Result<RecordStream, NfError> {
        let (tx, rx) = bounded(ORDER_QUEUE_DEPTH);
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let mut upstream = self;

        let handle = thread::Builder::new().name("nf-order".into()).spawn(move || {
            let mut records: Vec<Option<FlowRecordV3>> = Vec::new();
            let mut entries: Vec<SortEntry> = Vec::new();

            loop {
                match upstream.pull(&cancel_rx) {
                    Pull::Item(Ok(record)) => {
                        entries.push(SortEntry { index: records.len() as u32, value: key.value(&record) });
                        records.push(Some(record));
                    }
                    Pull::Item(Err(e)) => {
                        debug!(buffered = records.len(), "ordering aborted by upstream error");
                        drop(records);
                        if tx.send(Err(e)).is_err() {
                            debug!("ordered consumer gone before upstream error");
                        }
                        return upstream.finish();
                    }
                    Pull::Cancelled => {
                        debug!(buffered = records.len(), "ordered consumer gone, stopping upstream");
                        return upstream.abandon();
                    }
                    Pull::End => break,
                }
            }

            sort_entries(&mut entries, direction);
            debug!(records = entries.len(), key = key.name(), ?direction, "records ordered");

            for entry in entries {
                if let Some(record) = records[entry.index as usize].take() {
                    if tx.send(Ok(record)).is_err() {
                        break;
                    }
                }
            }
            upstream.finish()
        })?;

        Ok(RecordStream::new(rx, Some(handle)).cancel_on_drop(cancel_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::pipeline::RecordItem;
    use crate::record::tests::{build_record, generic_flow};
    use crate::record::EX_GENERIC_FLOW_ID;
    use crossbeam_channel::{unbounded, SendTimeoutError};
    use std::time::Duration;

    fn record(first: u64, packets: u64, bytes: u64) -> FlowRecordV3 {
        let raw = build_record(0, &[(EX_GENERIC_FLOW_ID, generic_flow(first, first + 10, packets, bytes))]);
        FlowRecordV3::decode(&raw).unwrap()
    }

    fn values(stream: RecordStream, key: OrderKey) -> Vec<u64> {
        stream.map(|r| key.value(&r.unwrap())).collect()
    }

    #[test]
    fn bytes_descending() {
        let s = RecordStream::from_records(vec![record(0, 0, 5), record(0, 0, 1), record(0, 0, 3)]);
        let sorted = s.order_by("bytes", Direction::Descending).unwrap();
        assert_eq!(values(sorted, OrderKey::Bytes), vec![5, 3, 1]);
    }

    #[test]
    fn tstart_and_tend_ascending() {
        let input = || vec![record(300, 0, 0), record(100, 0, 0), record(200, 0, 0)];
        let s = RecordStream::from_records(input()).order_by("tstart", Direction::Ascending).unwrap();
        assert_eq!(values(s, OrderKey::TStart), vec![100, 200, 300]);
        let s = RecordStream::from_records(input()).order_by("tend", Direction::Ascending).unwrap();
        assert_eq!(values(s, OrderKey::TEnd), vec![110, 210, 310]);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let s = RecordStream::from_records(vec![record(0, 0, 1)]);
        assert!(matches!(s.order_by("duration", Direction::Ascending), Err(NfError::UnknownKey(k)) if k == "duration"));
    }

    #[test]
    fn ties_keep_arrival_order() {
        // packets identify the records, bytes is the key
        let input = || vec![record(0, 1, 2), record(0, 2, 1), record(0, 3, 2)];
        let s = RecordStream::from_records(input()).ordered(OrderKey::Bytes, Direction::Ascending).unwrap();
        assert_eq!(values(s, OrderKey::Packets), vec![2, 1, 3]);
        let s = RecordStream::from_records(input()).ordered(OrderKey::Bytes, Direction::Descending).unwrap();
        assert_eq!(values(s, OrderKey::Packets), vec![1, 3, 2]);
    }

    #[test]
    fn missing_generic_flow_sorts_as_zero() {
        let bare = FlowRecordV3::decode(&build_record(0, &[])).unwrap();
        let s = RecordStream::from_records(vec![record(0, 5, 5), bare]);
        let sorted: Vec<_> = s.ordered(OrderKey::Packets, Direction::Ascending).unwrap().map(|r| r.unwrap()).collect();
        assert!(sorted[0].generic_flow().is_none());
    }

    #[test]
    fn upstream_error_discards_buffered_records() {
        let (tx, rx) = unbounded::<RecordItem>();
        tx.send(Ok(record(0, 0, 1))).unwrap();
        tx.send(Ok(record(0, 0, 2))).unwrap();
        tx.send(Err(NfError::Decompression { block: 3, source: CodecError::UnknownCompression(9) })).unwrap();
        drop(tx);

        let mut s = RecordStream::new(rx, None).order_by("bytes", Direction::Ascending).unwrap();
        assert!(matches!(s.next(), Some(Err(NfError::Decompression { block: 3, .. }))));
        assert!(s.next().is_none());
    }

    #[test]
    fn dropping_ordered_stream_stops_pulling_upstream() {
        let (tx, rx) = bounded::<RecordItem>(1);
        let ordered = RecordStream::new(rx, None).ordered(OrderKey::Bytes, Direction::Ascending).unwrap();
        tx.send(Ok(record(0, 0, 1))).unwrap();
        drop(ordered);

        let mut accepted = 0;
        let closed = loop {
            match tx.send_timeout(Ok(record(0, 0, accepted)), Duration::from_secs(5)) {
                Ok(()) if accepted < 2000 => accepted += 1,
                Ok(()) => break false,
                Err(SendTimeoutError::Disconnected(_)) => break true,
                Err(SendTimeoutError::Timeout(_)) => panic!("upstream neither drained nor closed"),
            }
        };
        assert!(closed, "ordering kept pulling {accepted} records after the consumer left");
    }

    #[test]
    fn dropping_ordered_file_stream_joins_the_pipeline() {
        use crate::pipeline::tests::block;
        use crate::pipeline::spawn_decoder;
        use crate::block::DATA_BLOCK_TYPE_3;
        use crate::nffile::ReadOptions;

        let (block_tx, block_rx) = bounded(1);
        let upstream = spawn_decoder(block_rx, None, &ReadOptions::default()).unwrap();
        let ordered = upstream.ordered(OrderKey::Bytes, Direction::Descending).unwrap();
        let raw = build_record(0, &[(EX_GENERIC_FLOW_ID, generic_flow(0, 1, 1, 1))]);
        block_tx.send(Ok(block(DATA_BLOCK_TYPE_3, &[raw.clone(), raw.clone()]))).unwrap();
        drop(ordered);

        let mut sent = 0;
        let closed = loop {
            match block_tx.send_timeout(Ok(block(DATA_BLOCK_TYPE_3, &[raw.clone()])), Duration::from_secs(5)) {
                Ok(()) if sent < 1000 => sent += 1,
                Ok(()) => break false,
                Err(SendTimeoutError::Disconnected(_)) => break true,
                Err(SendTimeoutError::Timeout(_)) => panic!("decoder neither drained nor closed"),
            }
        };
        assert!(closed, "decoder kept taking {sent} blocks after the consumer left");
    }
}
