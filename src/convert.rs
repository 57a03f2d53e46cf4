//! Legacy (block type 2) to V3 conversion.
//!
//! A legacy block interleaves extension map records with common records.
//! [`convert_block`] walks such a block, feeds the maps into the per-file
//! [`ExtensionMapRegistry`], transcodes every common record into a V3 record
//! and copies exporter/sampler records through unchanged.  The result is an
//! ordinary type-3 block that the V3 decoder handles like any other.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, warn};

use crate::block::{DataBlock, DataBlockHeader, DATA_BLOCK_TYPE_3};
use crate::extension_map::{self as ext, ExtensionMap, ExtensionMapRegistry, EXTENSION_MAP_TYPE};
use crate::exporter::{EXPORTER_INFO_TYPE, EXPORTER_STAT_TYPE, SAMPLER_LEGACY_TYPE, SAMPLER_TYPE};
use crate::io_stream::record_prefix;
use crate::record::{
    self as v3, CNT_FLOW_SIZE, ELEMENT_HEADER_SIZE, GENERIC_FLOW_SIZE, IPV4_FLOW_SIZE, IPV6_FLOW_SIZE,
    MPLS_LABEL_SIZE, V3_HEADER_SIZE, V3_RECORD_TYPE,
};

/// Record type of a legacy common record.
pub const COMMON_RECORD_TYPE: u16 = 10;
pub const COMMON_RECORD_FIXED_SIZE: usize = 32;
/// Largest legacy record accepted for conversion.
pub const MAX_COMMON_RECORD_SIZE: usize = 2048;

// common record flag bits
pub const FLAG_IPV6_ADDR: u16 = 0x01;
pub const FLAG_PKG_64: u16 = 0x02;
pub const FLAG_BYTES_64: u16 = 0x04;
pub const FLAG_IPV6_NH: u16 = 0x08;
pub const FLAG_IPV6_NHB: u16 = 0x10;
pub const FLAG_IPV6_EXP: u16 = 0x20;
pub const FLAG_EVENT: u16 = 0x40;
pub const FLAG_SAMPLED: u16 = 0x80;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error("common record too short: {0} bytes")]
    TooShort(usize),
    #[error("corrupt data file. Record size {0}. Skip record")]
    TooLarge(usize),
    #[error("corrupt data file. Missing extension map {0}. Skip record")]
    MissingMap(u16),
    #[error("common record tail truncated: need {needed} bytes at offset {offset}, have {available}")]
    Truncated { offset: usize, needed: usize, available: usize },
}

// ── CommonRecord ─────────────────────────────────────────────────────────────

/// A legacy common record borrowed from its block.
#[derive(Debug, Clone, Copy)]
pub struct CommonRecord<'a> {
    pub size: u16,
    pub flags: u16,
    pub ext_map: u16,
    pub msec_first: u16,
    pub msec_last: u16,
    pub first: u32,
    pub last: u32,
    pub fwd_status: u8,
    pub tcp_flags: u8,
    pub proto: u8,
    pub tos: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub exporter_sysid: u16,
    pub bi_flow_dir: u8,
    pub flow_end_reason: u8,
    /// Variable tail: addresses, counters, then the map's extensions.
    pub data: &'a [u8],
}

impl<'a> CommonRecord<'a> {
    /// Parse a complete common record; bytes past the size field are ignored.
    pub fn parse(record: &'a [u8]) -> Result<Self, ConvertError> {
        if record.len() < COMMON_RECORD_FIXED_SIZE {
            return Err(ConvertError::TooShort(record.len()));
        }
        let size = LittleEndian::read_u16(&record[2..4]);
        let end = size as usize;
        if end < COMMON_RECORD_FIXED_SIZE {
            return Err(ConvertError::TooShort(end));
        }
        if end > record.len() {
            return Err(ConvertError::Truncated {
                offset:    0,
                needed:    end,
                available: record.len(),
            });
        }
        Ok(Self {
            size,
            flags: LittleEndian::read_u16(&record[4..6]),
            ext_map: LittleEndian::read_u16(&record[6..8]),
            msec_first: LittleEndian::read_u16(&record[8..10]),
            msec_last: LittleEndian::read_u16(&record[10..12]),
            first: LittleEndian::read_u32(&record[12..16]),
            last: LittleEndian::read_u32(&record[16..20]),
            fwd_status: record[20],
            tcp_flags: record[21],
            proto: record[22],
            tos: record[23],
            src_port: LittleEndian::read_u16(&record[24..26]),
            dst_port: LittleEndian::read_u16(&record[26..28]),
            exporter_sysid: LittleEndian::read_u16(&record[28..30]),
            bi_flow_dir: record[30],
            flow_end_reason: record[31],
            data: &record[COMMON_RECORD_FIXED_SIZE..end],
        })
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Sequential reader over a common record tail.
struct Tail<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Tail<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ConvertError> {
        let bytes = self.data.get(self.pos..self.pos + n).ok_or(ConvertError::Truncated {
            offset:    self.pos,
            needed:    n,
            available: self.data.len().saturating_sub(self.pos),
        })?;
        self.pos += n;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, ConvertError> {
        self.take(2).map(LittleEndian::read_u16)
    }

    fn u32(&mut self) -> Result<u32, ConvertError> {
        self.take(4).map(LittleEndian::read_u32)
    }

    fn u64(&mut self) -> Result<u64, ConvertError> {
        self.take(8).map(LittleEndian::read_u64)
    }

    /// 4 or 8 byte counter.
    fn counter(&mut self, wide: bool) -> Result<u64, ConvertError> {
        if wide { self.u64() } else { self.u32().map(u64::from) }
    }
}

// ── V3 record builder ────────────────────────────────────────────────────────

/// Appends tagged elements behind a V3 header and keeps the header's size
/// and element count current.
struct RecordBuilder {
    buf:      Vec<u8>,
    elements: u16,
}

impl RecordBuilder {
    fn new(exporter_id: u16, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(V3_HEADER_SIZE, 0);
        LittleEndian::write_u16(&mut buf[0..2], V3_RECORD_TYPE);
        LittleEndian::write_u16(&mut buf[8..10], exporter_id);
        Self { buf, elements: 0 }
    }

    /// Append a zeroed element and return the offset of its payload.
    fn element(&mut self, element_type: u16, payload_size: usize) -> usize {
        let start = self.buf.len();
        self.buf.resize(start + ELEMENT_HEADER_SIZE + payload_size, 0);
        LittleEndian::write_u16(&mut self.buf[start..start + 2], element_type);
        LittleEndian::write_u16(&mut self.buf[start + 2..start + 4], (ELEMENT_HEADER_SIZE + payload_size) as u16);
        self.elements += 1;
        start + ELEMENT_HEADER_SIZE
    }

    /// Append an element holding `payload` verbatim.
    fn copy_element(&mut self, element_type: u16, payload: &[u8]) {
        let at = self.element(element_type, payload.len());
        self.buf[at..at + payload.len()].copy_from_slice(payload);
    }

    fn put_u16(&mut self, at: usize, v: u16) {
        LittleEndian::write_u16(&mut self.buf[at..at + 2], v);
    }

    fn put_u32(&mut self, at: usize, v: u32) {
        LittleEndian::write_u32(&mut self.buf[at..at + 4], v);
    }

    fn put_u64(&mut self, at: usize, v: u64) {
        LittleEndian::write_u64(&mut self.buf[at..at + 8], v);
    }

    fn finish(mut self) -> Vec<u8> {
        let size = self.buf.len() as u16;
        let elements = self.elements;
        LittleEndian::write_u16(&mut self.buf[2..4], size);
        LittleEndian::write_u16(&mut self.buf[4..6], elements);
        self.buf
    }
}

// ── Transcoder ───────────────────────────────────────────────────────────────

/// Counters collected while converting legacy blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertStats {
    pub converted: u64,
    pub dropped_records: u64,
    pub unknown_extensions: u64,
    pub rejected_maps: u64,
    pub corrupt_blocks: u64,
}

/// Counters for the output element that aggregates several legacy extensions.
#[derive(Default)]
struct CntAccumulator {
    present:     bool,
    flows:       u64,
    out_packets: u64,
    out_bytes:   u64,
}

/// Transcode one legacy common record into a V3 record.
pub fn transcode(
    common: &CommonRecord<'_>,
    registry: &ExtensionMapRegistry,
    stats: &mut ConvertStats,
) -> Result<Vec<u8>, ConvertError> {
    let map = registry.get(common.ext_map).ok_or(ConvertError::MissingMap(common.ext_map))?;
    if common.size as usize > MAX_COMMON_RECORD_SIZE {
        return Err(ConvertError::TooLarge(common.size as usize));
    }

    let mut out = RecordBuilder::new(common.exporter_sysid, 2 * common.size as usize);
    let mut tail = Tail { data: common.data, pos: 0 };

    let generic = out.element(v3::EX_GENERIC_FLOW_ID, GENERIC_FLOW_SIZE);
    out.put_u64(generic, common.first as u64 * 1000 + common.msec_first as u64);
    out.put_u64(generic + 8, common.last as u64 * 1000 + common.msec_last as u64);
    out.put_u16(generic + 40, common.src_port);
    out.put_u16(generic + 42, common.dst_port);
    out.buf[generic + 44] = common.proto;
    out.buf[generic + 45] = common.tcp_flags;
    out.buf[generic + 46] = common.fwd_status;
    out.buf[generic + 47] = common.tos;

    if common.has_flag(FLAG_IPV6_ADDR) {
        out.copy_element(v3::EX_IPV6_FLOW_ID, tail.take(IPV6_FLOW_SIZE)?);
    } else {
        out.copy_element(v3::EX_IPV4_FLOW_ID, tail.take(IPV4_FLOW_SIZE)?);
    }

    let packets = tail.counter(common.has_flag(FLAG_PKG_64))?;
    let bytes = tail.counter(common.has_flag(FLAG_BYTES_64))?;
    out.put_u64(generic + 24, packets);
    out.put_u64(generic + 32, bytes);

    let mut cnt = CntAccumulator::default();
    for id in map.ids() {
        match id {
            ext::COMMON_BLOCK_ID..=ext::EX_BYTE_4_8 => {}
            ext::EX_IO_SNMP_2 | ext::EX_IO_SNMP_4 => {
                tail.take(ext::extension_size(id))?;
            }
            ext::EX_AS_2 => {
                let (src, dst) = (tail.u16()?, tail.u16()?);
                let at = out.element(v3::EX_AS_ROUTING_ID, v3::AS_ROUTING_SIZE);
                out.put_u32(at, src as u32);
                out.put_u32(at + 4, dst as u32);
            }
            ext::EX_AS_4 => out.copy_element(v3::EX_AS_ROUTING_ID, tail.take(v3::AS_ROUTING_SIZE)?),
            ext::EX_NEXT_HOP_V4 => out.copy_element(v3::EX_IP_NEXT_HOP_V4_ID, tail.take(4)?),
            ext::EX_NEXT_HOP_V6 => out.copy_element(v3::EX_IP_NEXT_HOP_V6_ID, tail.take(16)?),
            ext::EX_NEXT_HOP_BGP_V4 => out.copy_element(v3::EX_BGP_NEXT_HOP_V4_ID, tail.take(4)?),
            ext::EX_NEXT_HOP_BGP_V6 => out.copy_element(v3::EX_BGP_NEXT_HOP_V6_ID, tail.take(16)?),
            ext::EX_VLAN => {
                let (src, dst) = (tail.u16()?, tail.u16()?);
                let at = out.element(v3::EX_VLAN_ID, v3::VLAN_SIZE);
                out.put_u16(at, src);
                out.put_u16(at + 4, dst);
            }
            ext::EX_OUT_PKG_4 | ext::EX_OUT_PKG_8 => {
                cnt.out_packets = tail.counter(id == ext::EX_OUT_PKG_8)?;
                cnt.present = true;
            }
            ext::EX_OUT_BYTES_4 | ext::EX_OUT_BYTES_8 => {
                cnt.out_bytes = tail.counter(id == ext::EX_OUT_BYTES_8)?;
                cnt.present = true;
            }
            ext::EX_AGGR_FLOWS_4 | ext::EX_AGGR_FLOWS_8 => {
                cnt.flows = tail.counter(id == ext::EX_AGGR_FLOWS_8)?;
                cnt.present = true;
            }
            ext::EX_MPLS => out.copy_element(v3::EX_MPLS_LABEL_ID, tail.take(MPLS_LABEL_SIZE)?),
            ext::EX_ROUTER_IP_V4 => out.copy_element(v3::EX_IP_RECEIVED_V4_ID, tail.take(4)?),
            ext::EX_ROUTER_IP_V6 => out.copy_element(v3::EX_IP_RECEIVED_V6_ID, tail.take(16)?),
            ext::EX_RECEIVED => {
                let received = tail.u64()?;
                out.put_u64(generic + 16, received);
            }
            _ => {
                debug!(map_id = common.ext_map, extension = id, "unexpected legacy extension");
                stats.unknown_extensions += 1;
                tail.take(ext::extension_size(id))?;
            }
        }
    }

    if cnt.present {
        let at = out.element(v3::EX_CNT_FLOW_ID, CNT_FLOW_SIZE);
        out.put_u64(at, cnt.flows);
        out.put_u64(at + 8, cnt.out_packets);
        out.put_u64(at + 16, cnt.out_bytes);
    }

    Ok(out.finish())
}

// ── Block conversion ─────────────────────────────────────────────────────────

/// Convert one legacy block into a V3 block.  `ceiling` bounds the output
/// payload; once a record no longer fits, the rest of the block is dropped.
pub fn convert_block(
    block: &DataBlock,
    registry: &mut ExtensionMapRegistry,
    ceiling: usize,
) -> (DataBlock, ConvertStats) {
    let mut stats = ConvertStats::default();
    let mut out: Vec<u8> = Vec::with_capacity(block.data.len() * 2);
    let mut num_records = 0u32;
    let data = &block.data;
    let mut offset = 0usize;

    for index in 0..block.header.num_records {
        let Some((record_type, size)) = record_prefix(data, offset) else {
            warn!(
                index,
                offset,
                num_records = block.header.num_records,
                size = block.header.size,
                "corrupt legacy block: inconsistent block size"
            );
            stats.corrupt_blocks += 1;
            break;
        };
        let record = &data[offset..offset + size];

        match record_type {
            COMMON_RECORD_TYPE => {
                if out.len() + 2 * size >= ceiling {
                    warn!(size = out.len(), ceiling, "converted block exceeds buffer size, dropping rest of block");
                    stats.corrupt_blocks += 1;
                    break;
                }
                match CommonRecord::parse(record).and_then(|c| transcode(&c, registry, &mut stats)) {
                    Ok(v3_record) => {
                        out.extend_from_slice(&v3_record);
                        num_records += 1;
                        stats.converted += 1;
                    }
                    Err(e) => {
                        warn!("{e}");
                        stats.dropped_records += 1;
                    }
                }
            }
            EXTENSION_MAP_TYPE => match ExtensionMap::parse(record).and_then(|m| registry.insert(m)) {
                Ok(outcome) => debug!(?outcome, maps = registry.len(), "extension map"),
                Err(e) => {
                    warn!("{e}");
                    stats.rejected_maps += 1;
                }
            },
            EXPORTER_INFO_TYPE | EXPORTER_STAT_TYPE | SAMPLER_LEGACY_TYPE | SAMPLER_TYPE => {
                out.extend_from_slice(record);
                num_records += 1;
            }
            other => debug!(record_type = other, "skip legacy record"),
        }
        offset += size;
    }

    if stats.unknown_extensions > 0 {
        warn!(count = stats.unknown_extensions, "legacy extensions without V3 counterpart dropped");
    }

    let header = DataBlockHeader {
        num_records,
        size: 0,
        block_type: DATA_BLOCK_TYPE_3,
        flags: block.header.flags,
    };
    (DataBlock::new(header, out), stats)
}
