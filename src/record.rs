//! V3 tagged-element flow records.
//!
//! A V3 record is a 12-byte header followed by `num_elements` elements, each
//! prefixed by `(type u16, size u16)` where `size` includes the prefix.
//! Decoding copies the record bytes, walks the element list once and records
//! the payload `(offset, size)` of every known element type in a fixed table.
//! Every element header and body is checked against the declared record size
//! before it is touched; a single violation rejects the whole record.
//!
//! Addresses are decoded eagerly since every consumer needs them.  All other
//! extensions are projected lazily from the offset table by the accessors,
//! which return `None` when the element is absent or too short for its fields.
//!
//! Integers are little-endian.  IPv6 addresses are stored as two
//! little-endian 64-bit halves, most significant half first.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Record type of a V3 record.
pub const V3_RECORD_TYPE: u16 = 11;
pub const V3_HEADER_SIZE: usize = 12;
pub const ELEMENT_HEADER_SIZE: usize = 4;

// ── Element ids ──────────────────────────────────────────────────────────────

pub const EX_GENERIC_FLOW_ID: u16 = 1;
pub const EX_IPV4_FLOW_ID: u16 = 2;
pub const EX_IPV6_FLOW_ID: u16 = 3;
pub const EX_FLOW_MISC_ID: u16 = 4;
pub const EX_CNT_FLOW_ID: u16 = 5;
pub const EX_VLAN_ID: u16 = 6;
pub const EX_AS_ROUTING_ID: u16 = 7;
pub const EX_BGP_NEXT_HOP_V4_ID: u16 = 8;
pub const EX_BGP_NEXT_HOP_V6_ID: u16 = 9;
pub const EX_IP_NEXT_HOP_V4_ID: u16 = 10;
pub const EX_IP_NEXT_HOP_V6_ID: u16 = 11;
pub const EX_IP_RECEIVED_V4_ID: u16 = 12;
pub const EX_IP_RECEIVED_V6_ID: u16 = 13;
pub const EX_MPLS_LABEL_ID: u16 = 14;
pub const EX_MAC_ADDR_ID: u16 = 15;
pub const EX_AS_ADJACENT_ID: u16 = 16;
pub const EX_LATENCY_ID: u16 = 17;
pub const EX_SAMPLER_INFO_ID: u16 = 18;
pub const EX_NSEL_COMMON_ID: u16 = 19;
pub const EX_NSEL_XLATE_IPV4_ID: u16 = 20;
pub const EX_NSEL_XLATE_IPV6_ID: u16 = 21;
pub const EX_NSEL_XLATE_PORT_ID: u16 = 22;
pub const EX_IN_PAYLOAD_ID: u16 = 29;
pub const EX_OUT_PAYLOAD_ID: u16 = 30;

/// Size of the element id space; ids at or above it are skipped.
pub const MAX_EXTENSIONS: usize = 38;

// payload sizes of the fixed-layout elements
pub const GENERIC_FLOW_SIZE: usize = 48;
pub const IPV4_FLOW_SIZE: usize = 8;
pub const IPV6_FLOW_SIZE: usize = 32;
pub const FLOW_MISC_SIZE: usize = 16;
pub const CNT_FLOW_SIZE: usize = 24;
pub const VLAN_SIZE: usize = 8;
pub const AS_ROUTING_SIZE: usize = 8;
pub const MPLS_LABEL_SIZE: usize = 40;
pub const MAC_ADDR_SIZE: usize = 32;
pub const AS_ADJACENT_SIZE: usize = 8;
pub const LATENCY_SIZE: usize = 24;
pub const SAMPLER_INFO_SIZE: usize = 16;
pub const NSEL_COMMON_SIZE: usize = 16;
pub const NSEL_XLATE_PORT_SIZE: usize = 4;

// header flag bits
pub const V3_FLAG_EVENT: u8 = 0x1;
pub const V3_FLAG_SAMPLED: u8 = 0x2;
pub const V3_FLAG_ANON: u8 = 0x4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record too short: {0} bytes")]
    Truncated(usize),
    #[error("not a V3 record: type {0}")]
    NotV3(u16),
    #[error("declared record size {declared} outside [{min}, {available}]")]
    BadSize { declared: usize, min: usize, available: usize },
    #[error("element {index} header at offset {offset} overruns record size {size}")]
    ElementHeaderOverrun { index: u16, offset: usize, size: usize },
    #[error("element {index} (type {element_type}, size {element_size}) at offset {offset} overruns record size {size}")]
    ElementOverrun { index: u16, element_type: u16, element_size: usize, offset: usize, size: usize },
    #[error("element {index} (type {element_type}) has invalid size {element_size}")]
    ElementTooShort { index: u16, element_type: u16, element_size: usize },
}

// ── Byte helpers ─────────────────────────────────────────────────────────────

/// IPv4 address stored as a little-endian u32.
pub fn read_ipv4(b: &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(LittleEndian::read_u32(b))
}

/// IPv6 address stored as two little-endian u64 halves, high half first.
pub fn read_ipv6(b: &[u8]) -> Ipv6Addr {
    let hi = LittleEndian::read_u64(&b[0..8]) as u128;
    let lo = LittleEndian::read_u64(&b[8..16]) as u128;
    Ipv6Addr::from((hi << 64) | lo)
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordHeaderV3 {
    pub record_type: u16,
    pub size: u16,
    pub num_elements: u16,
    pub engine_type: u8,
    pub engine_id: u8,
    pub exporter_id: u16,
    pub flags: u8,
    pub nf_version: u8,
}

impl RecordHeaderV3 {
    fn parse(b: &[u8]) -> Self {
        Self {
            record_type: LittleEndian::read_u16(&b[0..2]),
            size: LittleEndian::read_u16(&b[2..4]),
            num_elements: LittleEndian::read_u16(&b[4..6]),
            engine_type: b[6],
            engine_id: b[7],
            exporter_id: LittleEndian::read_u16(&b[8..10]),
            flags: b[10],
            nf_version: b[11],
        }
    }
}

/// Collector that produced the record, from the header's version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Sflow,
    Pcap,
    Netflow,
    Flow,
}

impl SourceKind {
    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Sflow   => "SFLOW",
            SourceKind::Pcap    => "PCAP",
            SourceKind::Netflow => "NETFLOW",
            SourceKind::Flow    => "FLOW",
        }
    }
}

// ── Extension views ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenericFlow {
    pub msec_first: u64,
    pub msec_last: u64,
    pub msec_received: u64,
    pub in_packets: u64,
    pub in_bytes: u64,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub tcp_flags: u8,
    pub fwd_status: u8,
    pub src_tos: u8,
}

impl GenericFlow {
    fn parse(b: &[u8]) -> Self {
        Self {
            msec_first: LittleEndian::read_u64(&b[0..8]),
            msec_last: LittleEndian::read_u64(&b[8..16]),
            msec_received: LittleEndian::read_u64(&b[16..24]),
            in_packets: LittleEndian::read_u64(&b[24..32]),
            in_bytes: LittleEndian::read_u64(&b[32..40]),
            src_port: LittleEndian::read_u16(&b[40..42]),
            dst_port: LittleEndian::read_u16(&b[42..44]),
            proto: b[44],
            tcp_flags: b[45],
            fwd_status: b[46],
            src_tos: b[47],
        }
    }

    /// ICMP type and code are carried in the destination port.
    pub fn icmp_type_code(&self) -> (u8, u8) {
        ((self.dst_port >> 8) as u8, (self.dst_port & 0xff) as u8)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowMisc {
    pub input: u32,
    pub output: u32,
    pub src_mask: u8,
    pub dst_mask: u8,
    pub dir: u8,
    pub dst_tos: u8,
    pub bi_flow_dir: u8,
    pub flow_end_reason: u8,
    pub rev_tcp_flags: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CntFlow {
    pub flows: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vlan {
    pub src_vlan: u32,
    pub dst_vlan: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsRouting {
    pub src_as: u32,
    pub dst_as: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacAddrs {
    pub in_src_mac: u64,
    pub out_dst_mac: u64,
    pub in_dst_mac: u64,
    pub out_src_mac: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsAdjacent {
    pub next_adjacent_as: u32,
    pub prev_adjacent_as: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latency {
    pub usec_client_nw_delay: u64,
    pub usec_server_nw_delay: u64,
    pub usec_appl_latency: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerInfo {
    pub selector_id: u64,
    pub sysid: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NselCommon {
    pub msec_event: u64,
    pub conn_id: u32,
    pub fw_xevent: u16,
    pub fw_event: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NatPorts {
    pub xlate_src_port: u16,
    pub xlate_dst_port: u16,
}

// ── FlowRecordV3 ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u16,
    size: u16,
}

#[derive(Debug, Clone)]
pub struct FlowRecordV3 {
    raw:             Vec<u8>,
    header:          RecordHeaderV3,
    slots:           [Option<Slot>; MAX_EXTENSIONS],
    addrs:           Option<(IpAddr, IpAddr)>,
    nat_addrs:       Option<(IpAddr, IpAddr)>,
    packet_interval: u32,
    space_interval:  u32,
}

impl FlowRecordV3 {
    /// Decode one V3 record from the start of `bytes`.  Bytes beyond the
    /// record's declared size are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < V3_HEADER_SIZE {
            return Err(RecordError::Truncated(bytes.len()));
        }
        let header = RecordHeaderV3::parse(&bytes[..V3_HEADER_SIZE]);
        if header.record_type != V3_RECORD_TYPE {
            return Err(RecordError::NotV3(header.record_type));
        }
        let size = header.size as usize;
        if size < V3_HEADER_SIZE || size > bytes.len() {
            return Err(RecordError::BadSize { declared: size, min: V3_HEADER_SIZE, available: bytes.len() });
        }

        let raw = bytes[..size].to_vec();
        let mut record = Self {
            raw,
            header,
            slots:           [None; MAX_EXTENSIONS],
            addrs:           None,
            nat_addrs:       None,
            packet_interval: 1,
            space_interval:  0,
        };

        let mut offset = V3_HEADER_SIZE;
        for index in 0..header.num_elements {
            if offset + ELEMENT_HEADER_SIZE > size {
                return Err(RecordError::ElementHeaderOverrun { index, offset, size });
            }
            let element_type = LittleEndian::read_u16(&record.raw[offset..offset + 2]);
            let element_size = LittleEndian::read_u16(&record.raw[offset + 2..offset + 4]) as usize;
            if element_size < ELEMENT_HEADER_SIZE {
                return Err(RecordError::ElementTooShort { index, element_type, element_size });
            }
            if offset + element_size > size {
                return Err(RecordError::ElementOverrun { index, element_type, element_size, offset, size });
            }

            let body = offset + ELEMENT_HEADER_SIZE;
            let body_size = element_size - ELEMENT_HEADER_SIZE;
            if (element_type as usize) < MAX_EXTENSIONS {
                record.slots[element_type as usize] = Some(Slot { offset: body as u16, size: body_size as u16 });
            }

            let payload = &record.raw[body..body + body_size];
            let too_short = || RecordError::ElementTooShort { index, element_type, element_size };
            match element_type {
                EX_IPV4_FLOW_ID | EX_NSEL_XLATE_IPV4_ID => {
                    if body_size < IPV4_FLOW_SIZE {
                        return Err(too_short());
                    }
                    let pair = (IpAddr::V4(read_ipv4(&payload[0..4])), IpAddr::V4(read_ipv4(&payload[4..8])));
                    record.set_addrs(element_type == EX_NSEL_XLATE_IPV4_ID, pair);
                }
                EX_IPV6_FLOW_ID | EX_NSEL_XLATE_IPV6_ID => {
                    if body_size < IPV6_FLOW_SIZE {
                        return Err(too_short());
                    }
                    let pair = (IpAddr::V6(read_ipv6(&payload[0..16])), IpAddr::V6(read_ipv6(&payload[16..32])));
                    record.set_addrs(element_type == EX_NSEL_XLATE_IPV6_ID, pair);
                }
                _ => {}
            }
            offset += element_size;
        }
        Ok(record)
    }

    fn set_addrs(&mut self, translated: bool, pair: (IpAddr, IpAddr)) {
        if translated {
            self.nat_addrs = Some(pair);
        } else {
            self.addrs = Some(pair);
        }
    }

    // ── Header ───────────────────────────────────────────────────────────────

    pub fn header(&self) -> &RecordHeaderV3 { &self.header }
    pub fn raw(&self) -> &[u8] { &self.raw }
    pub fn exporter_id(&self) -> u16 { self.header.exporter_id }
    pub fn engine_type(&self) -> u8 { self.header.engine_type }
    pub fn engine_id(&self) -> u8 { self.header.engine_id }
    pub fn is_event(&self) -> bool { self.header.flags & V3_FLAG_EVENT != 0 }
    pub fn is_sampled(&self) -> bool { self.header.flags & V3_FLAG_SAMPLED != 0 }
    pub fn is_anonymized(&self) -> bool { self.header.flags & V3_FLAG_ANON != 0 }

    pub fn source_kind(&self) -> SourceKind {
        match self.header.nf_version {
            0 => SourceKind::Flow,
            v if v & 0x80 != 0 => SourceKind::Sflow,
            v if v & 0x40 != 0 => SourceKind::Pcap,
            _ => SourceKind::Netflow,
        }
    }

    // ── Offset table ─────────────────────────────────────────────────────────

    /// Payload `(offset, size)` of element `id` within [`raw`](Self::raw).
    pub fn extension(&self, id: u16) -> Option<(usize, usize)> {
        self.slots
            .get(id as usize)
            .copied()
            .flatten()
            .map(|s| (s.offset as usize, s.size as usize))
    }

    /// Payload of element `id`.
    pub fn extension_bytes(&self, id: u16) -> Option<&[u8]> {
        let (offset, size) = self.extension(id)?;
        self.raw.get(offset..offset + size)
    }

    /// Payload of element `id` when it holds at least `min` bytes.
    fn fixed(&self, id: u16, min: usize) -> Option<&[u8]> {
        self.extension_bytes(id).filter(|b| b.len() >= min)
    }

    // ── Addresses ────────────────────────────────────────────────────────────

    pub fn addresses(&self) -> Option<(IpAddr, IpAddr)> { self.addrs }
    pub fn src_addr(&self) -> Option<IpAddr> { self.addrs.map(|a| a.0) }
    pub fn dst_addr(&self) -> Option<IpAddr> { self.addrs.map(|a| a.1) }
    pub fn is_ipv4(&self) -> bool { matches!(self.addrs, Some((IpAddr::V4(_), _))) }
    pub fn is_ipv6(&self) -> bool { matches!(self.addrs, Some((IpAddr::V6(_), _))) }

    /// NAT translated source/destination addresses.
    pub fn nat_addresses(&self) -> Option<(IpAddr, IpAddr)> { self.nat_addrs }
    pub fn has_nat_translation(&self) -> bool { self.nat_addrs.is_some() }

    // ── Extensions ───────────────────────────────────────────────────────────

    pub fn generic_flow(&self) -> Option<GenericFlow> {
        self.fixed(EX_GENERIC_FLOW_ID, GENERIC_FLOW_SIZE).map(GenericFlow::parse)
    }

    pub fn flow_misc(&self) -> Option<FlowMisc> {
        self.fixed(EX_FLOW_MISC_ID, FLOW_MISC_SIZE).map(|b| FlowMisc {
            input: LittleEndian::read_u32(&b[0..4]),
            output: LittleEndian::read_u32(&b[4..8]),
            src_mask: b[8],
            dst_mask: b[9],
            dir: b[10],
            dst_tos: b[11],
            bi_flow_dir: b[12],
            flow_end_reason: b[13],
            rev_tcp_flags: b[14],
        })
    }

    pub fn cnt_flow(&self) -> Option<CntFlow> {
        self.fixed(EX_CNT_FLOW_ID, CNT_FLOW_SIZE).map(|b| CntFlow {
            flows: LittleEndian::read_u64(&b[0..8]),
            out_packets: LittleEndian::read_u64(&b[8..16]),
            out_bytes: LittleEndian::read_u64(&b[16..24]),
        })
    }

    pub fn vlan(&self) -> Option<Vlan> {
        self.fixed(EX_VLAN_ID, VLAN_SIZE).map(|b| Vlan {
            src_vlan: LittleEndian::read_u32(&b[0..4]),
            dst_vlan: LittleEndian::read_u32(&b[4..8]),
        })
    }

    pub fn as_routing(&self) -> Option<AsRouting> {
        self.fixed(EX_AS_ROUTING_ID, AS_ROUTING_SIZE).map(|b| AsRouting {
            src_as: LittleEndian::read_u32(&b[0..4]),
            dst_as: LittleEndian::read_u32(&b[4..8]),
        })
    }

    fn ip_pair(&self, v4: u16, v6: u16) -> Option<IpAddr> {
        if let Some(b) = self.fixed(v4, 4) {
            return Some(IpAddr::V4(read_ipv4(b)));
        }
        self.fixed(v6, 16).map(|b| IpAddr::V6(read_ipv6(b)))
    }

    pub fn bgp_next_hop(&self) -> Option<IpAddr> {
        self.ip_pair(EX_BGP_NEXT_HOP_V4_ID, EX_BGP_NEXT_HOP_V6_ID)
    }

    pub fn ip_next_hop(&self) -> Option<IpAddr> {
        self.ip_pair(EX_IP_NEXT_HOP_V4_ID, EX_IP_NEXT_HOP_V6_ID)
    }

    /// Address of the router the flow was received from.
    pub fn ip_received(&self) -> Option<IpAddr> {
        self.ip_pair(EX_IP_RECEIVED_V4_ID, EX_IP_RECEIVED_V6_ID)
    }

    pub fn mpls_labels(&self) -> Option<[u32; 10]> {
        self.fixed(EX_MPLS_LABEL_ID, MPLS_LABEL_SIZE).map(|b| {
            let mut labels = [0u32; 10];
            LittleEndian::read_u32_into(&b[..MPLS_LABEL_SIZE], &mut labels);
            labels
        })
    }

    pub fn mac_addrs(&self) -> Option<MacAddrs> {
        self.fixed(EX_MAC_ADDR_ID, MAC_ADDR_SIZE).map(|b| MacAddrs {
            in_src_mac: LittleEndian::read_u64(&b[0..8]),
            out_dst_mac: LittleEndian::read_u64(&b[8..16]),
            in_dst_mac: LittleEndian::read_u64(&b[16..24]),
            out_src_mac: LittleEndian::read_u64(&b[24..32]),
        })
    }

    pub fn as_adjacent(&self) -> Option<AsAdjacent> {
        self.fixed(EX_AS_ADJACENT_ID, AS_ADJACENT_SIZE).map(|b| AsAdjacent {
            next_adjacent_as: LittleEndian::read_u32(&b[0..4]),
            prev_adjacent_as: LittleEndian::read_u32(&b[4..8]),
        })
    }

    pub fn latency(&self) -> Option<Latency> {
        self.fixed(EX_LATENCY_ID, LATENCY_SIZE).map(|b| Latency {
            usec_client_nw_delay: LittleEndian::read_u64(&b[0..8]),
            usec_server_nw_delay: LittleEndian::read_u64(&b[8..16]),
            usec_appl_latency: LittleEndian::read_u64(&b[16..24]),
        })
    }

    pub fn sampler_info(&self) -> Option<SamplerInfo> {
        self.fixed(EX_SAMPLER_INFO_ID, 10).map(|b| SamplerInfo {
            selector_id: LittleEndian::read_u64(&b[0..8]),
            sysid: LittleEndian::read_u16(&b[8..10]),
        })
    }

    pub fn nat_common(&self) -> Option<NselCommon> {
        self.fixed(EX_NSEL_COMMON_ID, 15).map(|b| NselCommon {
            msec_event: LittleEndian::read_u64(&b[0..8]),
            conn_id: LittleEndian::read_u32(&b[8..12]),
            fw_xevent: LittleEndian::read_u16(&b[12..14]),
            fw_event: b[14],
        })
    }

    pub fn nat_ports(&self) -> Option<NatPorts> {
        self.fixed(EX_NSEL_XLATE_PORT_ID, NSEL_XLATE_PORT_SIZE).map(|b| NatPorts {
            xlate_src_port: LittleEndian::read_u16(&b[0..2]),
            xlate_dst_port: LittleEndian::read_u16(&b[2..4]),
        })
    }

    pub fn in_payload(&self) -> Option<&[u8]> {
        self.extension_bytes(EX_IN_PAYLOAD_ID)
    }

    pub fn out_payload(&self) -> Option<&[u8]> {
        self.extension_bytes(EX_OUT_PAYLOAD_ID)
    }

    // ── Sampling ─────────────────────────────────────────────────────────────

    /// Resolved `(packet_interval, space_interval)`; `(1, 0)` when unsampled.
    pub fn sampling(&self) -> (u32, u32) {
        (self.packet_interval, self.space_interval)
    }

    pub(crate) fn set_sampling(&mut self, packet_interval: u32, space_interval: u32) {
        self.packet_interval = packet_interval;
        self.space_interval = space_interval;
    }
}
