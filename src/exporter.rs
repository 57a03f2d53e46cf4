//! Exporter and sampler registry.
//!
//! Exporter info, exporter stat and sampler records arrive interleaved with
//! the flow records.  The registry is filled as they stream past and used to
//! resolve the sampling interval of each flow record before it is handed out.

use std::net::IpAddr;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::{read_ipv4, read_ipv6, FlowRecordV3};

pub const EXPORTER_INFO_TYPE: u16 = 7;
pub const EXPORTER_STAT_TYPE: u16 = 8;
/// Legacy sampler record; superseded by [`SAMPLER_TYPE`] and ignored.
pub const SAMPLER_LEGACY_TYPE: u16 = 9;
pub const SAMPLER_TYPE: u16 = 15;

pub const EXPORTER_INFO_SIZE: usize = 32;
pub const EXPORTER_STAT_ENTRY_SIZE: usize = 24;
pub const SAMPLER_SIZE: usize = 24;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

const INITIAL_SLOTS: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExporterError {
    #[error("record type {record_type} too short: {size} bytes")]
    TooShort { record_type: u16, size: usize },
    #[error("sampler for exporter {0} without a known address, dropped")]
    NoExporter(u16),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Sampler {
    pub id: i64,
    pub algorithm: u16,
    pub packet_interval: u32,
    pub space_interval: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Exporter {
    pub sysid: u16,
    pub ip: Option<IpAddr>,
    pub family: u16,
    /// Netflow version.
    pub version: u32,
    /// Exporter / observation domain id assigned by the device.
    pub id: u32,
    pub packets: u64,
    pub flows: u64,
    pub sequence_failures: u64,
    pub samplers: Vec<Sampler>,
}

impl Exporter {
    /// An exporter is usable once its info record supplied an address.
    pub fn is_valid(&self) -> bool {
        self.ip.is_some()
    }
}

/// Exporters keyed by their dense sys id.
#[derive(Debug, Clone, Serialize)]
pub struct ExporterRegistry {
    slots: Vec<Option<Exporter>>,
}

impl Default for ExporterRegistry {
    fn default() -> Self {
        Self { slots: vec![None; INITIAL_SLOTS] }
    }
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, sysid: u16) -> &mut Option<Exporter> {
        let index = sysid as usize;
        if index >= self.slots.len() {
            let mut len = self.slots.len().max(1);
            while len <= index {
                len *= 2;
            }
            self.slots.resize(len, None);
        }
        &mut self.slots[index]
    }

    pub fn get(&self, sysid: u16) -> Option<&Exporter> {
        self.slots.get(sysid as usize).and_then(Option::as_ref)
    }

    /// Registered exporters in sys id order.
    pub fn exporters(&self) -> impl Iterator<Item = &Exporter> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.exporters().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create or overwrite the exporter named by an exporter info record.
    pub fn add_exporter_info(&mut self, record: &[u8]) -> Result<(), ExporterError> {
        if record.len() < EXPORTER_INFO_SIZE {
            return Err(ExporterError::TooShort { record_type: EXPORTER_INFO_TYPE, size: record.len() });
        }
        let family = LittleEndian::read_u16(&record[24..26]);
        let sysid = LittleEndian::read_u16(&record[26..28]);
        let ip = match family {
            AF_INET => Some(IpAddr::V4(read_ipv4(&record[16..20]))),
            AF_INET6 => Some(IpAddr::V6(read_ipv6(&record[8..24]))),
            other => {
                warn!(sysid, family = other, "exporter with unknown address family");
                None
            }
        };
        let exporter = Exporter {
            sysid,
            ip,
            family,
            version: LittleEndian::read_u32(&record[4..8]),
            id: LittleEndian::read_u32(&record[28..32]),
            ..Exporter::default()
        };
        debug!(sysid, ip = ?exporter.ip, version = exporter.version, "exporter info");
        *self.slot_mut(sysid) = Some(exporter);
        Ok(())
    }

    /// Accumulate per-exporter packet, flow and sequence failure counters.
    pub fn add_exporter_stat(&mut self, record: &[u8]) -> Result<(), ExporterError> {
        if record.len() < 8 {
            return Err(ExporterError::TooShort { record_type: EXPORTER_STAT_TYPE, size: record.len() });
        }
        let declared = LittleEndian::read_u32(&record[4..8]) as usize;
        let fits = (record.len() - 8) / EXPORTER_STAT_ENTRY_SIZE;
        if declared > fits {
            warn!(declared, fits, "exporter stat count exceeds record size");
        }

        for entry in record[8..].chunks_exact(EXPORTER_STAT_ENTRY_SIZE).take(declared.min(fits)) {
            let sysid = LittleEndian::read_u32(&entry[0..4]);
            let exporter = u16::try_from(sysid)
                .ok()
                .and_then(|id| self.slots.get_mut(id as usize))
                .and_then(Option::as_mut);
            match exporter {
                Some(e) => {
                    e.sequence_failures += LittleEndian::read_u32(&entry[4..8]) as u64;
                    e.packets += LittleEndian::read_u64(&entry[8..16]);
                    e.flows += LittleEndian::read_u64(&entry[16..24]);
                }
                None => warn!(sysid, "unknown exporter id in exporter stat"),
            }
        }
        Ok(())
    }

    /// Append a sampler to its exporter.
    pub fn add_sampler(&mut self, record: &[u8]) -> Result<(), ExporterError> {
        if record.len() < SAMPLER_SIZE {
            return Err(ExporterError::TooShort { record_type: SAMPLER_TYPE, size: record.len() });
        }
        let sysid = LittleEndian::read_u16(&record[4..6]);
        let sampler = Sampler {
            algorithm: LittleEndian::read_u16(&record[6..8]),
            id: LittleEndian::read_i64(&record[8..16]),
            packet_interval: LittleEndian::read_u32(&record[16..20]),
            space_interval: LittleEndian::read_u32(&record[20..24]),
        };
        match self.slots.get_mut(sysid as usize).and_then(Option::as_mut) {
            Some(exporter) if exporter.is_valid() => {
                debug!(sysid, id = sampler.id, packet_interval = sampler.packet_interval, "sampler");
                exporter.samplers.push(sampler);
                Ok(())
            }
            _ => Err(ExporterError::NoExporter(sysid)),
        }
    }

    /// `(packet_interval, space_interval)` for `record`, `(1, 0)` when no
    /// sampler applies.
    ///
    /// With a sampler info extension, the exporter is the one it names and the
    /// last sampler with a matching selector id wins.  Without one, the
    /// record's exporter id is used and its last sampler wins.
    pub fn resolve(&self, record: &FlowRecordV3) -> (u32, u32) {
        let info = record.sampler_info();
        let sysid = info.map_or(record.exporter_id(), |s| s.sysid);

        let Some(exporter) = self.get(sysid).filter(|e| e.is_valid()) else {
            return (1, 0);
        };
        exporter
            .samplers
            .iter()
            .rev()
            .find(|s| info.map_or(true, |i| i.selector_id == s.id as u64))
            .map_or((1, 0), |s| (s.packet_interval, s.space_interval))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::tests::build_record;
    use crate::record::EX_SAMPLER_INFO_ID;
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub(crate) fn exporter_info_v4(sysid: u16, ip: Ipv4Addr) -> Vec<u8> {
        let mut b = vec![0u8; EXPORTER_INFO_SIZE];
        b[0..2].copy_from_slice(&EXPORTER_INFO_TYPE.to_le_bytes());
        b[2..4].copy_from_slice(&(EXPORTER_INFO_SIZE as u16).to_le_bytes());
        b[4..8].copy_from_slice(&9u32.to_le_bytes());
        b[16..20].copy_from_slice(&u32::from(ip).to_le_bytes());
        b[24..26].copy_from_slice(&AF_INET.to_le_bytes());
        b[26..28].copy_from_slice(&sysid.to_le_bytes());
        b[28..32].copy_from_slice(&77u32.to_le_bytes());
        b
    }

    pub(crate) fn sampler(sysid: u16, id: i64, packet_interval: u32) -> Vec<u8> {
        let mut b = vec![0u8; SAMPLER_SIZE];
        b[0..2].copy_from_slice(&SAMPLER_TYPE.to_le_bytes());
        b[2..4].copy_from_slice(&(SAMPLER_SIZE as u16).to_le_bytes());
        b[4..6].copy_from_slice(&sysid.to_le_bytes());
        b[8..16].copy_from_slice(&id.to_le_bytes());
        b[16..20].copy_from_slice(&packet_interval.to_le_bytes());
        b
    }

    fn exporter_stat(entries: &[(u32, u32, u64, u64)]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&EXPORTER_STAT_TYPE.to_le_bytes());
        b.extend_from_slice(&((8 + entries.len() * EXPORTER_STAT_ENTRY_SIZE) as u16).to_le_bytes());
        b.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (sysid, seq, packets, flows) in entries {
            b.extend_from_slice(&sysid.to_le_bytes());
            b.extend_from_slice(&seq.to_le_bytes());
            b.extend_from_slice(&packets.to_le_bytes());
            b.extend_from_slice(&flows.to_le_bytes());
        }
        b
    }

    fn sampler_info(selector_id: u64, sysid: u16) -> Vec<u8> {
        let mut b = vec![0u8; 16];
        b[0..8].copy_from_slice(&selector_id.to_le_bytes());
        b[8..10].copy_from_slice(&sysid.to_le_bytes());
        b
    }

    fn registry_with_samplers() -> ExporterRegistry {
        let mut registry = ExporterRegistry::new();
        registry.add_exporter_info(&exporter_info_v4(1, Ipv4Addr::new(192, 0, 2, 10))).unwrap();
        registry.add_sampler(&sampler(1, 5, 100)).unwrap();
        registry.add_sampler(&sampler(1, 6, 50)).unwrap();
        registry.add_sampler(&sampler(1, 5, 100)).unwrap();
        registry
    }

    #[test]
    fn resolves_with_sampler_info_extension() {
        let registry = registry_with_samplers();
        let raw = build_record(0, &[(EX_SAMPLER_INFO_ID, sampler_info(5, 1))]);
        let record = FlowRecordV3::decode(&raw).unwrap();
        assert_eq!(registry.resolve(&record), (100, 0));

        let raw = build_record(0, &[(EX_SAMPLER_INFO_ID, sampler_info(6, 1))]);
        assert_eq!(registry.resolve(&FlowRecordV3::decode(&raw).unwrap()), (50, 0));
    }

    #[test]
    fn resolves_last_sampler_without_extension() {
        let registry = registry_with_samplers();
        let record = FlowRecordV3::decode(&build_record(1, &[])).unwrap();
        assert_eq!(registry.resolve(&record), (100, 0));
    }

    #[test]
    fn unknown_exporter_resolves_to_default() {
        let registry = registry_with_samplers();
        let record = FlowRecordV3::decode(&build_record(3, &[])).unwrap();
        assert_eq!(registry.resolve(&record), (1, 0));
        let raw = build_record(1, &[(EX_SAMPLER_INFO_ID, sampler_info(99, 1))]);
        assert_eq!(registry.resolve(&FlowRecordV3::decode(&raw).unwrap()), (1, 0));
    }

    #[test]
    fn exporter_info_ipv6_and_growth() {
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mut b = exporter_info_v4(20, Ipv4Addr::UNSPECIFIED);
        let v = u128::from(ip);
        b[8..16].copy_from_slice(&((v >> 64) as u64).to_le_bytes());
        b[16..24].copy_from_slice(&(v as u64).to_le_bytes());
        b[24..26].copy_from_slice(&AF_INET6.to_le_bytes());

        let mut registry = ExporterRegistry::new();
        registry.add_exporter_info(&b).unwrap();
        let exporter = registry.get(20).unwrap();
        assert_eq!(exporter.ip, Some(IpAddr::V6(ip)));
        assert_eq!(exporter.id, 77);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sampler_without_exporter_is_dropped() {
        let mut registry = ExporterRegistry::new();
        assert_eq!(registry.add_sampler(&sampler(2, 1, 10)), Err(ExporterError::NoExporter(2)));

        let mut no_addr = exporter_info_v4(2, Ipv4Addr::LOCALHOST);
        no_addr[24..26].copy_from_slice(&99u16.to_le_bytes());
        registry.add_exporter_info(&no_addr).unwrap();
        assert!(!registry.get(2).unwrap().is_valid());
        assert_eq!(registry.add_sampler(&sampler(2, 1, 10)), Err(ExporterError::NoExporter(2)));
    }

    #[test]
    fn exporter_stat_accumulates_known_ids() {
        let mut registry = ExporterRegistry::new();
        registry.add_exporter_info(&exporter_info_v4(1, Ipv4Addr::LOCALHOST)).unwrap();
        registry.add_exporter_stat(&exporter_stat(&[(1, 2, 100, 10), (4, 1, 1, 1)])).unwrap();
        registry.add_exporter_stat(&exporter_stat(&[(1, 1, 50, 5)])).unwrap();
        let e = registry.get(1).unwrap();
        assert_eq!((e.sequence_failures, e.packets, e.flows), (3, 150, 15));
        assert!(registry.get(4).is_none());
    }

    #[test]
    fn exporter_stat_count_is_clamped() {
        let mut registry = ExporterRegistry::new();
        registry.add_exporter_info(&exporter_info_v4(0, Ipv4Addr::LOCALHOST)).unwrap();
        let mut rec = exporter_stat(&[(0, 0, 1, 1)]);
        rec[4..8].copy_from_slice(&1000u32.to_le_bytes());
        registry.add_exporter_stat(&rec).unwrap();
        assert_eq!(registry.get(0).unwrap().flows, 1);
    }
}
