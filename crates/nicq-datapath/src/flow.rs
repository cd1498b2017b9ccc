//! Flow tables
//!
//! Packet classification mirrors the device's flow steering: a port root
//! table (level 0) matches destination MAC, each RX group owns a VLAN
//! table (level 1) and a hash table (level 2) that picks a hash target by
//! IP version and protocol.
//!
//! # Design
//!
//! - A table is carved into groups; every group has one match mask and a
//!   contiguous entry range
//! - Entries are evaluated in index order, first installed match wins
//! - Forwarding holds the next table or hash target directly, so
//!   [`FlowTable::lookup`] walks the chain without a registry
//! - One lock per table; lookup never holds two table locks at once

use crate::device::DeviceContext;
use crate::error::{DatapathError, DatapathResult};
use crate::hw::HwCommand;
use crate::lock_order::{LockClass, OrderedMutex};
use crate::rss::HashTarget;
use std::sync::Arc;

/// Destinations a single entry may fan out to
pub const FLOW_MAX_DESTS: usize = 4;

/// Deepest table chain a lookup follows
const MAX_CHAIN: usize = 8;

/// Ethernet broadcast address
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// IP protocol numbers matched by the hash tables
pub mod ip_proto {
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// ICMP
    pub const ICMP: u8 = 1;
}

/// Fields a flow group compares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatchMask(u8);

impl MatchMask {
    /// Destination MAC
    pub const DMAC: Self = Self(0x01);
    /// Outer VLAN tag present
    pub const VLAN: Self = Self(0x02);
    /// VLAN ID
    pub const VID: Self = Self(0x04);
    /// IP version
    pub const IP_VERSION: Self = Self(0x08);
    /// IP protocol
    pub const IP_PROTO: Self = Self(0x10);

    /// Match nothing (wildcard group)
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True for the wildcard mask
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for MatchMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Header fields of a packet, or the values an entry matches on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketMatch {
    /// Destination MAC
    pub dmac: [u8; 6],
    /// Outer VLAN tag present
    pub vlan: bool,
    /// VLAN ID (valid when `vlan`)
    pub vid: u16,
    /// 4, 6, or 0 for non-IP
    pub ip_version: u8,
    /// IP protocol number
    pub ip_proto: u8,
}

impl PacketMatch {
    /// Untagged packet to `dmac`
    pub fn to_mac(dmac: [u8; 6]) -> Self {
        Self {
            dmac,
            ..Default::default()
        }
    }

    /// Tag with VLAN `vid`
    pub fn with_vlan(mut self, vid: u16) -> Self {
        self.vlan = true;
        self.vid = vid;
        self
    }

    /// Set IP version and protocol
    pub fn with_ip(mut self, version: u8, proto: u8) -> Self {
        self.ip_version = version;
        self.ip_proto = proto;
        self
    }

    /// Whether `pkt` carries these values in every field of `mask`
    pub fn matches(&self, mask: MatchMask, pkt: &PacketMatch) -> bool {
        (!mask.contains(MatchMask::DMAC) || self.dmac == pkt.dmac)
            && (!mask.contains(MatchMask::VLAN) || self.vlan == pkt.vlan)
            && (!mask.contains(MatchMask::VID) || self.vid == pkt.vid)
            && (!mask.contains(MatchMask::IP_VERSION) || self.ip_version == pkt.ip_version)
            && (!mask.contains(MatchMask::IP_PROTO) || self.ip_proto == pkt.ip_proto)
    }
}

/// Forwarding destination as the device sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDest {
    /// Another flow table
    Table(u32),
    /// A receive target
    Tir(u32),
}

/// Where a matching entry sends the packet
#[derive(Debug, Clone)]
pub enum Forward {
    /// Continue in a deeper table
    Table(Arc<FlowTable>),
    /// Deliver through a hash target
    Target(Arc<HashTarget>),
}

impl Forward {
    /// Device destination
    pub fn dest(&self) -> FlowDest {
        match self {
            Self::Table(t) => FlowDest::Table(t.num()),
            Self::Target(t) => FlowDest::Tir(t.num()),
        }
    }
}

impl PartialEq for Forward {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Table(a), Self::Table(b)) => Arc::ptr_eq(a, b),
            (Self::Target(a), Self::Target(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Handle to a group within one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

#[derive(Debug)]
struct FlowGroup {
    num: u32,
    start: u32,
    size: u32,
    mask: MatchMask,
}

#[derive(Debug, Default)]
struct FlowEntry {
    matcher: PacketMatch,
    forward: Vec<Forward>,
    installed: bool,
}

#[derive(Debug)]
struct FlowTableInner {
    groups: Vec<FlowGroup>,
    entries: Vec<FlowEntry>,
    next_start: u32,
    destroyed: bool,
}

/// A device flow table
pub struct FlowTable {
    ctx: Arc<DeviceContext>,
    num: u32,
    level: u8,
    shift: u32,
    inner: OrderedMutex<FlowTableInner>,
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("num", &self.num)
            .field("level", &self.level)
            .field("nents", &self.nents())
            .finish()
    }
}

impl FlowTable {
    /// Create a table of `1 << shift` entries at `level`
    pub fn create(ctx: &Arc<DeviceContext>, level: u8, shift: u32) -> DatapathResult<Arc<Self>> {
        let num = ctx.exec(&HwCommand::CreateFlowTable {
            level,
            log_size: shift,
        })?;
        let nents = 1usize << shift;
        tracing::debug!(table = num, level, nents, "flow table created");
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            num,
            level,
            shift,
            inner: OrderedMutex::new(
                LockClass::FlowTable,
                FlowTableInner {
                    groups: Vec::new(),
                    entries: (0..nents).map(|_| FlowEntry::default()).collect(),
                    next_start: 0,
                    destroyed: false,
                },
            ),
        }))
    }

    /// Hardware table number
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Table level
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Entry slots
    pub fn nents(&self) -> usize {
        1 << self.shift
    }

    /// Installed entries
    pub fn installed(&self) -> usize {
        self.inner.lock().entries.iter().filter(|e| e.installed).count()
    }

    /// Carve the next `size` entries into a group matching `mask`
    pub fn add_group(&self, size: u32, mask: MatchMask) -> DatapathResult<GroupId> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(DatapathError::Teardown);
        }
        let start = inner.next_start;
        if size == 0 || (start + size) as usize > self.nents() {
            return Err(DatapathError::FlowTableFull);
        }
        let num = self.ctx.exec(&HwCommand::CreateFlowGroup {
            table: self.num,
            start,
            size,
            mask,
        })?;
        inner.next_start = start + size;
        inner.groups.push(FlowGroup {
            num,
            start,
            size,
            mask,
        });
        Ok(GroupId(inner.groups.len() - 1))
    }

    /// Entry count of `group`
    pub fn group_size(&self, group: GroupId) -> usize {
        self.inner
            .lock()
            .groups
            .get(group.0)
            .map_or(0, |g| g.size as usize)
    }

    /// Write slot `slot` of `group` and install it
    pub fn set_entry(
        &self,
        group: GroupId,
        slot: u32,
        matcher: PacketMatch,
        forward: Vec<Forward>,
    ) -> DatapathResult<u32> {
        let mut inner = self.inner.lock();
        let index = self.slot_index(&inner, group, slot)?;
        self.install(&mut inner, index, matcher, forward)?;
        Ok(index)
    }

    /// Install into the first free slot of `group`
    pub fn insert(
        &self,
        group: GroupId,
        matcher: PacketMatch,
        forward: Vec<Forward>,
    ) -> DatapathResult<u32> {
        let mut inner = self.inner.lock();
        let (start, size) = self.group_range(&inner, group)?;
        let index = (start..start + size)
            .find(|i| !inner.entries[*i as usize].installed)
            .ok_or(DatapathError::FlowTableFull)?;
        self.install(&mut inner, index, matcher, forward)?;
        Ok(index)
    }

    /// Index of the installed entry in `group` with this matcher
    pub fn find(&self, group: GroupId, matcher: &PacketMatch) -> Option<u32> {
        let inner = self.inner.lock();
        let (start, size) = self.group_range(&inner, group).ok()?;
        (start..start + size).find(|i| {
            let e = &inner.entries[*i as usize];
            e.installed && e.matcher == *matcher
        })
    }

    /// Whether slot `slot` of `group` is installed
    pub fn is_installed(&self, group: GroupId, slot: u32) -> bool {
        let inner = self.inner.lock();
        self.slot_index(&inner, group, slot)
            .map_or(false, |i| inner.entries[i as usize].installed)
    }

    /// Destinations of the entry at `index`
    pub fn forward_of(&self, index: u32) -> Vec<Forward> {
        self.inner
            .lock()
            .entries
            .get(index as usize)
            .filter(|e| e.installed)
            .map(|e| e.forward.clone())
            .unwrap_or_default()
    }

    /// Add `fwd` to the installed entry at `index`, rewriting it in place
    pub fn add_dest(&self, index: u32, fwd: Forward) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get(index as usize)
            .filter(|e| e.installed)
            .ok_or_else(|| DatapathError::UnknownFlowEntry(format!("{}:{index}", self.num)))?;
        if entry.forward.contains(&fwd) {
            return Ok(());
        }
        if entry.forward.len() >= FLOW_MAX_DESTS {
            return Err(DatapathError::FlowTableFull);
        }
        let matcher = entry.matcher;
        let mut forward = entry.forward.clone();
        forward.push(fwd);
        self.install(&mut inner, index, matcher, forward)
    }

    /// Drop `fwd` from the entry at `index`; the entry is deleted once
    /// no destination is left. True when the entry was deleted.
    pub fn remove_dest(&self, index: u32, fwd: &Forward) -> DatapathResult<bool> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get(index as usize)
            .filter(|e| e.installed)
            .ok_or_else(|| DatapathError::UnknownFlowEntry(format!("{}:{index}", self.num)))?;
        let matcher = entry.matcher;
        let forward: Vec<Forward> = entry.forward.iter().filter(|f| *f != fwd).cloned().collect();
        if forward.len() == entry.forward.len() {
            return Err(DatapathError::UnknownFlowEntry(format!("{}:{index}", self.num)));
        }
        if forward.is_empty() {
            self.uninstall(&mut inner, index)?;
            return Ok(true);
        }
        self.install(&mut inner, index, matcher, forward)?;
        Ok(false)
    }

    /// Delete the entry at `index`. Deleting an absent entry is a no-op.
    pub fn delete_entry(&self, index: u32) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        self.uninstall(&mut inner, index)
    }

    /// Delete slot `slot` of `group`; a no-op when not installed
    pub fn delete_slot(&self, group: GroupId, slot: u32) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        let index = self.slot_index(&inner, group, slot)?;
        self.uninstall(&mut inner, index)
    }

    /// Delete the installed entry in `group` matching `matcher`
    pub fn remove(&self, group: GroupId, matcher: &PacketMatch) -> DatapathResult<()> {
        let index = self
            .find(group, matcher)
            .ok_or_else(|| DatapathError::UnknownFlowEntry(format!("{matcher:?}")))?;
        self.delete_entry(index)
    }

    /// First installed entry matching `pkt`, with its destination
    fn first_match(&self, pkt: &PacketMatch) -> Option<Forward> {
        let inner = self.inner.lock();
        for group in &inner.groups {
            for i in group.start..group.start + group.size {
                let entry = &inner.entries[i as usize];
                if entry.installed && entry.matcher.matches(group.mask, pkt) {
                    return entry.forward.first().cloned();
                }
            }
        }
        None
    }

    /// Resolve `pkt` through this table and every table it forwards to,
    /// down to a hash target
    pub fn lookup(&self, pkt: &PacketMatch) -> Option<Arc<HashTarget>> {
        let mut fwd = self.first_match(pkt)?;
        for _ in 0..MAX_CHAIN {
            match fwd {
                Forward::Target(target) => return Some(target),
                Forward::Table(table) => fwd = table.first_match(pkt)?,
            }
        }
        tracing::warn!(table = self.num, "flow chain too deep");
        None
    }

    /// Delete every entry and group, then destroy the table. Safe to call
    /// repeatedly.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        for (i, entry) in inner.entries.iter_mut().enumerate() {
            if entry.installed {
                self.ctx.exec_best_effort(&HwCommand::DeleteFlowEntry {
                    table: self.num,
                    index: i as u32,
                });
                *entry = FlowEntry::default();
            }
        }
        for group in inner.groups.drain(..) {
            self.ctx.exec_best_effort(&HwCommand::DestroyFlowGroup {
                table: self.num,
                group: group.num,
            });
        }
        self.ctx
            .exec_best_effort(&HwCommand::DestroyFlowTable { table: self.num });
        tracing::debug!(table = self.num, level = self.level, "flow table destroyed");
    }

    /// Whether the table has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    fn group_range(&self, inner: &FlowTableInner, group: GroupId) -> DatapathResult<(u32, u32)> {
        inner
            .groups
            .get(group.0)
            .map(|g| (g.start, g.size))
            .ok_or_else(|| DatapathError::UnknownFlowEntry(format!("group {}", group.0)))
    }

    fn slot_index(&self, inner: &FlowTableInner, group: GroupId, slot: u32) -> DatapathResult<u32> {
        let (start, size) = self.group_range(inner, group)?;
        if slot >= size {
            return Err(DatapathError::UnknownFlowEntry(format!(
                "slot {slot} of group {}",
                group.0
            )));
        }
        Ok(start + slot)
    }

    fn install(
        &self,
        inner: &mut FlowTableInner,
        index: u32,
        matcher: PacketMatch,
        forward: Vec<Forward>,
    ) -> DatapathResult<()> {
        if inner.destroyed {
            return Err(DatapathError::Teardown);
        }
        if forward.is_empty() || forward.len() > FLOW_MAX_DESTS {
            return Err(DatapathError::InvalidDescriptor(format!(
                "{} flow destinations",
                forward.len()
            )));
        }
        self.ctx.exec(&HwCommand::SetFlowEntry {
            table: self.num,
            index,
            matcher,
            dests: forward.iter().map(Forward::dest).collect(),
        })?;
        inner.entries[index as usize] = FlowEntry {
            matcher,
            forward,
            installed: true,
        };
        Ok(())
    }

    fn uninstall(&self, inner: &mut FlowTableInner, index: u32) -> DatapathResult<()> {
        let Some(entry) = inner.entries.get_mut(index as usize) else {
            return Err(DatapathError::UnknownFlowEntry(format!("{}:{index}", self.num)));
        };
        if !entry.installed {
            return Ok(());
        }
        self.ctx.exec(&HwCommand::DeleteFlowEntry {
            table: self.num,
            index,
        })?;
        *entry = FlowEntry::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatapathConfig;
    use crate::sim::SimHarness;

    fn harness() -> SimHarness {
        SimHarness::new(DatapathConfig::default()).unwrap()
    }

    #[test]
    fn test_mask_matching() {
        let entry = PacketMatch::to_mac([2, 0, 0, 0, 0, 1]).with_vlan(10);
        let pkt = PacketMatch::to_mac([2, 0, 0, 0, 0, 1])
            .with_vlan(10)
            .with_ip(4, ip_proto::TCP);

        assert!(entry.matches(MatchMask::DMAC, &pkt));
        assert!(entry.matches(MatchMask::VLAN | MatchMask::VID, &pkt));
        assert!(!entry.matches(MatchMask::IP_VERSION, &pkt));
        assert!(entry.matches(MatchMask::empty(), &PacketMatch::default()));
    }

    #[test]
    fn test_group_bounds() {
        let h = harness();
        let table = FlowTable::create(&h.ctx, 2, 2).unwrap();
        let a = table.add_group(3, MatchMask::IP_VERSION).unwrap();
        table.add_group(1, MatchMask::empty()).unwrap();
        assert!(matches!(
            table.add_group(1, MatchMask::empty()),
            Err(DatapathError::FlowTableFull)
        ));
        assert_eq!(table.group_size(a), 3);
        assert!(table.set_entry(a, 3, PacketMatch::default(), vec![]).is_err());
    }

    #[test]
    fn test_insert_until_full() {
        let h = harness();
        let table = FlowTable::create(&h.ctx, 1, 2).unwrap();
        let leaf = FlowTable::create(&h.ctx, 2, 2).unwrap();
        let g = table.add_group(2, MatchMask::VLAN | MatchMask::VID).unwrap();

        let fwd = || vec![Forward::Table(Arc::clone(&leaf))];
        let first = table
            .insert(g, PacketMatch::default().with_vlan(1), fwd())
            .unwrap();
        let second = table
            .insert(g, PacketMatch::default().with_vlan(2), fwd())
            .unwrap();
        assert_eq!((first, second), (0, 1));
        assert!(matches!(
            table.insert(g, PacketMatch::default().with_vlan(3), fwd()),
            Err(DatapathError::FlowTableFull)
        ));

        table.remove(g, &PacketMatch::default().with_vlan(1)).unwrap();
        assert_eq!(table.installed(), 1);
        assert!(matches!(
            table.remove(g, &PacketMatch::default().with_vlan(1)),
            Err(DatapathError::UnknownFlowEntry(_))
        ));
    }

    #[test]
    fn test_dest_fan_out() {
        let h = harness();
        let root = FlowTable::create(&h.ctx, 0, 2).unwrap();
        let a = FlowTable::create(&h.ctx, 1, 2).unwrap();
        let b = FlowTable::create(&h.ctx, 1, 2).unwrap();
        let g = root.add_group(4, MatchMask::DMAC).unwrap();
        let mac = PacketMatch::to_mac([2, 0, 0, 0, 0, 7]);

        let index = root.insert(g, mac, vec![Forward::Table(Arc::clone(&a))]).unwrap();
        root.add_dest(index, Forward::Table(Arc::clone(&b))).unwrap();
        root.add_dest(index, Forward::Table(Arc::clone(&b))).unwrap();
        assert_eq!(root.forward_of(index).len(), 2);

        assert!(!root.remove_dest(index, &Forward::Table(Arc::clone(&a))).unwrap());
        assert!(root.remove_dest(index, &Forward::Table(Arc::clone(&b))).unwrap());
        assert_eq!(root.installed(), 0);
    }

    #[test]
    fn test_teardown_once() {
        let h = harness();
        let table = FlowTable::create(&h.ctx, 1, 2).unwrap();
        let leaf = FlowTable::create(&h.ctx, 2, 2).unwrap();
        let g = table.add_group(1, MatchMask::empty()).unwrap();
        table
            .set_entry(g, 0, PacketMatch::default(), vec![Forward::Table(leaf)])
            .unwrap();

        table.teardown();
        table.teardown();
        assert!(table.is_destroyed());
        assert_eq!(h.device.command_count("DELETE_FLOW_TABLE_ENTRY"), 1);
        assert_eq!(h.device.command_count("DESTROY_FLOW_GROUP"), 1);
        assert_eq!(h.device.command_count("DESTROY_FLOW_TABLE"), 1);
        assert!(matches!(
            table.add_group(1, MatchMask::empty()),
            Err(DatapathError::Teardown)
        ));
    }
}
