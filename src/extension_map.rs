//! Legacy extension maps.
//!
//! A legacy (V2) common record does not describe its own optional fields.  It
//! names an extension map by id, and the map lists the extension ids present
//! in every record that references it, in on-disk order.  Maps are written
//! into the block stream ahead of the records using them, so the registry is
//! rebuilt from the stream itself while decoding.
//!
//! The registry belongs to one file's decoding pipeline; there is no shared
//! or global map table.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Record type of an extension map inside a legacy block.
pub const EXTENSION_MAP_TYPE: u16 = 2;

const MAP_FIXED_SIZE: usize = 8;

// ── Legacy extension ids ─────────────────────────────────────────────────────

pub const COMMON_BLOCK_ID: u16 = 0;
pub const EX_IPV4V6: u16 = 1;
pub const EX_PACKET_4_8: u16 = 2;
pub const EX_BYTE_4_8: u16 = 3;
pub const EX_IO_SNMP_2: u16 = 4;
pub const EX_IO_SNMP_4: u16 = 5;
pub const EX_AS_2: u16 = 6;
pub const EX_AS_4: u16 = 7;
pub const EX_MULTIPLE: u16 = 8;
pub const EX_NEXT_HOP_V4: u16 = 9;
pub const EX_NEXT_HOP_V6: u16 = 10;
pub const EX_NEXT_HOP_BGP_V4: u16 = 11;
pub const EX_NEXT_HOP_BGP_V6: u16 = 12;
pub const EX_VLAN: u16 = 13;
pub const EX_OUT_PKG_4: u16 = 14;
pub const EX_OUT_PKG_8: u16 = 15;
pub const EX_OUT_BYTES_4: u16 = 16;
pub const EX_OUT_BYTES_8: u16 = 17;
pub const EX_AGGR_FLOWS_4: u16 = 18;
pub const EX_AGGR_FLOWS_8: u16 = 19;
pub const EX_MAC_1: u16 = 20;
pub const EX_MAC_2: u16 = 21;
pub const EX_MPLS: u16 = 22;
pub const EX_ROUTER_IP_V4: u16 = 23;
pub const EX_ROUTER_IP_V6: u16 = 24;
pub const EX_ROUTER_ID: u16 = 25;
pub const EX_BGPADJ: u16 = 26;
pub const EX_RECEIVED: u16 = 27;
pub const EX_NSEL_COMMON: u16 = 37;
pub const EX_NSEL_XLATE_PORTS: u16 = 38;
pub const EX_NSEL_XLATE_IP_V4: u16 = 39;
pub const EX_NSEL_XLATE_IP_V6: u16 = 40;
pub const EX_NSEL_ACL: u16 = 41;
pub const EX_NSEL_USER: u16 = 42;
pub const EX_NSEL_USER_MAX: u16 = 43;
pub const EX_LATENCY: u16 = 45;
pub const EX_NEL_COMMON: u16 = 46;
pub const EX_NEL_GLOBAL_IP_V4: u16 = 47;
pub const EX_PORT_BLOCK_ALLOC: u16 = 48;

/// Highest valid extension id.
pub const MAX_NUM_EXTENSIONS: u16 = 49;

/// Fixed on-disk size and description of one legacy extension.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionDescriptor {
    pub size: u16,
    pub description: &'static str,
}

const fn d(size: u16, description: &'static str) -> ExtensionDescriptor {
    ExtensionDescriptor { size, description }
}

/// Indexed by extension id.
pub static EXTENSION_DESCRIPTORS: [ExtensionDescriptor; MAX_NUM_EXTENSIONS as usize + 1] = [
    d(0, "Required extension: Common record"),
    d(0, "Required extension: IPv4/IPv6 src/dst address"),
    d(0, "Required extension: 4/8 byte input packets"),
    d(0, "Required extension: 4/8 byte input bytes"),
    d(4, "2 byte input/output interface index"),
    d(8, "4 byte input/output interface index"),
    d(4, "2 byte src/dst AS number"),
    d(8, "4 byte src/dst AS number"),
    d(4, "dst tos, direction, src/dst mask"),
    d(4, "IPv4 next hop"),
    d(16, "IPv6 next hop"),
    d(4, "IPv4 BGP next IP"),
    d(16, "IPv6 BGP next IP"),
    d(4, "src/dst vlan id"),
    d(4, "4 byte output packets"),
    d(8, "8 byte output packets"),
    d(4, "4 byte output bytes"),
    d(8, "8 byte output bytes"),
    d(4, "4 byte aggregated flows"),
    d(8, "8 byte aggregated flows"),
    d(16, "in src/out dst mac address"),
    d(16, "in dst/out src mac address"),
    d(40, "MPLS Labels"),
    d(4, "IPv4 router IP addr"),
    d(16, "IPv6 router IP addr"),
    d(4, "router ID"),
    d(8, "BGP adjacent prev/next AS"),
    d(8, "time packet received"),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(0, ""),
    d(20, "NSEL Common block"),
    d(4, "NSEL xlate ports"),
    d(8, "NSEL xlate IPv4 addr"),
    d(32, "NSEL xlate IPv6 addr"),
    d(24, "NSEL ACL ingress/egress acl ID"),
    d(24, "NSEL username"),
    d(72, "NSEL max username"),
    d(0, ""),
    d(24, "nprobe/nfpcapd latency"),
    d(12, "NEL Common block"),
    d(0, "Compat NEL IPv4"),
    d(8, "NAT Port Block Allocation"),
    d(0, ""),
];

/// Fixed size of extension `id`, 0 for unknown ids.
pub fn extension_size(id: u16) -> usize {
    EXTENSION_DESCRIPTORS.get(id as usize).map_or(0, |d| d.size as usize)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MapError {
    #[error("extension map record too short: {0} bytes")]
    TooShort(usize),
    #[error("extension map record length {actual} does not match its size field {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("verify map id {map_id}: map size {size} not aligned")]
    Unaligned { map_id: u16, size: u16 },
    #[error("verify map id {map_id}: element id {id} out of range [{max}]")]
    IdOutOfRange { map_id: u16, id: u16, max: u16 },
    #[error("verify map id {0}: map has a zero element")]
    EmbeddedZero(u16),
    #[error("verify map id {0}: no zero element at the end")]
    MissingTerminator(u16),
    #[error("verify map id {map_id}: extension size: expected {expected}, map reports {declared}")]
    SizeMismatch { map_id: u16, expected: u16, declared: u16 },
}

// ── ExtensionMap ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionMap {
    pub map_id: u16,
    /// Size of the whole map record including its header.
    pub size: u16,
    /// Sum of the fixed sizes of all listed extensions.
    pub extension_size: u16,
    /// Extension ids, including the zero sentinel and any padding slot.
    pub extension_ids: Vec<u16>,
}

impl ExtensionMap {
    /// Parse a complete extension map record (type, size, map id, extension
    /// size, id list).
    pub fn parse(record: &[u8]) -> Result<Self, MapError> {
        if record.len() < MAP_FIXED_SIZE {
            return Err(MapError::TooShort(record.len()));
        }
        let size = LittleEndian::read_u16(&record[2..4]);
        if record.len() != size as usize {
            return Err(MapError::LengthMismatch { declared: size as usize, actual: record.len() });
        }
        let extension_ids = record[MAP_FIXED_SIZE..]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        Ok(Self {
            map_id: LittleEndian::read_u16(&record[4..6]),
            size,
            extension_size: LittleEndian::read_u16(&record[6..8]),
            extension_ids,
        })
    }

    /// Extension ids up to, not including, the zero sentinel.
    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.extension_ids.iter().copied().take_while(|&id| id != 0)
    }

    /// Check alignment, id range, terminator placement and the declared
    /// payload size against the descriptor table.
    pub fn verify(&self) -> Result<(), MapError> {
        let map_id = self.map_id;
        if self.size & 0x3 != 0 {
            return Err(MapError::Unaligned { map_id, size: self.size });
        }

        let mut expected: u32 = 0;
        let mut count = 0usize;
        for id in self.ids() {
            if id > MAX_NUM_EXTENSIONS {
                return Err(MapError::IdOutOfRange { map_id, id, max: MAX_NUM_EXTENSIONS });
            }
            expected += extension_size(id) as u32;
            count += 1;
        }

        // the sentinel must be the last slot, or the one before a padding slot
        let len = self.extension_ids.len();
        if count == len {
            return Err(MapError::MissingTerminator(map_id));
        }
        if count + 1 != len && count + 2 != len {
            return Err(MapError::EmbeddedZero(map_id));
        }

        if expected != self.extension_size as u32 {
            return Err(MapError::SizeMismatch {
                map_id,
                expected: expected as u16,
                declared: self.extension_size,
            });
        }
        Ok(())
    }

    /// Same leading extension id sequence.
    pub fn same_layout(&self, other: &ExtensionMap) -> bool {
        self.ids().eq(other.ids())
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Result of a successful [`ExtensionMapRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New map id.
    Inserted,
    /// Existing id, different layout; the old entry is gone.
    Replaced,
    /// Existing id with the same layout; nothing changed.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ExtensionMapRegistry {
    slots:    HashMap<u16, ExtensionMap>,
    max_used: u16,
}

impl ExtensionMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `map` and store it under its id.  A map failing verification
    /// leaves the registry untouched.
    pub fn insert(&mut self, map: ExtensionMap) -> Result<InsertOutcome, MapError> {
        map.verify()?;

        let outcome = match self.slots.get(&map.map_id) {
            Some(existing) if existing.same_layout(&map) => return Ok(InsertOutcome::Unchanged),
            Some(_) => InsertOutcome::Replaced,
            None    => InsertOutcome::Inserted,
        };
        self.max_used = self.max_used.max(map.map_id);
        self.slots.insert(map.map_id, map);
        Ok(outcome)
    }

    pub fn get(&self, map_id: u16) -> Option<&ExtensionMap> {
        self.slots.get(&map_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Highest map id ever registered.
    pub fn max_used(&self) -> u16 {
        self.max_used
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn map_record(map_id: u16, ids: &[u16], extension_size: u16) -> Vec<u8> {
        let mut slots: Vec<u16> = ids.to_vec();
        slots.push(0);
        if slots.len() % 2 != 0 {
            slots.push(0);
        }
        let size = (MAP_FIXED_SIZE + 2 * slots.len()) as u16;
        let mut b = Vec::new();
        b.extend_from_slice(&EXTENSION_MAP_TYPE.to_le_bytes());
        b.extend_from_slice(&size.to_le_bytes());
        b.extend_from_slice(&map_id.to_le_bytes());
        b.extend_from_slice(&extension_size.to_le_bytes());
        for id in slots {
            b.extend_from_slice(&id.to_le_bytes());
        }
        b
    }

    #[test]
    fn parses_and_verifies() {
        let map = ExtensionMap::parse(&map_record(1, &[EX_IO_SNMP_2, EX_VLAN], 8)).unwrap();
        assert_eq!(map.map_id, 1);
        assert_eq!(map.ids().collect::<Vec<_>>(), vec![EX_IO_SNMP_2, EX_VLAN]);
        assert!(map.verify().is_ok());
    }

    #[test]
    fn rejects_payload_size_mismatch() {
        let mut registry = ExtensionMapRegistry::new();
        let map = ExtensionMap::parse(&map_record(1, &[EX_IO_SNMP_4, EX_MPLS], 40)).unwrap();
        assert_eq!(
            registry.insert(map),
            Err(MapError::SizeMismatch { map_id: 1, expected: 48, declared: 40 })
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_out_of_range_id() {
        let map = ExtensionMap::parse(&map_record(2, &[60], 0)).unwrap();
        assert!(matches!(map.verify(), Err(MapError::IdOutOfRange { id: 60, .. })));
    }

    #[test]
    fn rejects_misplaced_terminator() {
        let map = ExtensionMap {
            map_id: 3,
            size: 16,
            extension_size: 4,
            extension_ids: vec![EX_VLAN, 0, 0, 0],
        };
        assert_eq!(map.verify(), Err(MapError::EmbeddedZero(3)));

        let map = ExtensionMap { map_id: 3, size: 12, extension_size: 8, extension_ids: vec![EX_VLAN, EX_VLAN] };
        assert_eq!(map.verify(), Err(MapError::MissingTerminator(3)));
    }

    #[test]
    fn rejects_unaligned_size() {
        let map = ExtensionMap { map_id: 4, size: 10, extension_size: 0, extension_ids: vec![0] };
        assert!(matches!(map.verify(), Err(MapError::Unaligned { .. })));
    }

    #[test]
    fn identical_reinsert_is_noop_and_change_replaces() {
        let mut registry = ExtensionMapRegistry::new();
        let first = ExtensionMap::parse(&map_record(7, &[EX_VLAN], 4)).unwrap();
        assert_eq!(registry.insert(first.clone()), Ok(InsertOutcome::Inserted));
        assert_eq!(registry.insert(first), Ok(InsertOutcome::Unchanged));

        let changed = ExtensionMap::parse(&map_record(7, &[EX_VLAN, EX_RECEIVED], 12)).unwrap();
        assert_eq!(registry.insert(changed), Ok(InsertOutcome::Replaced));
        assert_eq!(registry.get(7).unwrap().ids().count(), 2);
        assert_eq!(registry.max_used(), 7);
    }

    #[test]
    fn length_must_match_size_field() {
        let mut rec = map_record(1, &[EX_VLAN], 4);
        rec.push(0);
        assert!(matches!(ExtensionMap::parse(&rec), Err(MapError::LengthMismatch { .. })));
    }
}
