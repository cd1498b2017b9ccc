//! Ring groups
//!
//! A ring group owns a set of WQ/CQ pairs plus the objects that steer
//! traffic into them. RX groups carry a redirection table, one hash
//! target per protocol class, a VLAN table and a hash table; TX groups
//! carry transmit interfaces.
//!
//! # Design
//!
//! - Setup progress is tracked as [`GroupPhase`]s; teardown releases
//!   exactly the phases held, in reverse dependency order, so a failed
//!   setup and a full teardown share one path
//! - Completion queues are quiesced before anything is destroyed, which
//!   lets blocked refill workers exit before the pool is joined
//! - The group lock is taken around multi-object sequences and is never
//!   acquired under a queue lock

use crate::buffer::return_buffer;
use crate::config::EqKind;
use crate::cq::CompletionQueue;
use crate::device::DeviceContext;
use crate::eq::{EqAllocator, EventQueue};
use crate::error::{DatapathError, DatapathResult};
use crate::flow::{ip_proto, FlowTable, Forward, GroupId, MatchMask, PacketMatch};
use crate::hw::{HwCommand, QueueKind};
use crate::lifecycle::{GroupPhase, GroupPhases, WqState};
use crate::lock_order::{LockClass, OrderedMutex};
use crate::refill::{refill_now, RefillPool};
use crate::rss::{HashTarget, RedirectionTable, TirRole};
use crate::wq::WorkQueue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// log2 of entries in each group's hash flow table
pub const HASH_TABLE_SIZE_SHIFT: u32 = 4;

/// Transmit interfaces per TX group
pub const TIS_PER_GROUP: usize = 1;

/// Hash table rules, in match order: (IP version, IP protocol) -> target.
/// No rule reaches the IPv4 and IPv6 targets; other IP protocols fall
/// through to `Other`, and those targets stay reachable via
/// [`RingGroup::target`].
const HASH_RULES: [(Option<u8>, Option<u8>, TirRole); 5] = [
    (Some(6), Some(ip_proto::UDP), TirRole::UdpV6),
    (Some(4), Some(ip_proto::UDP), TirRole::UdpV4),
    (Some(6), Some(ip_proto::TCP), TirRole::TcpV6),
    (Some(4), Some(ip_proto::TCP), TirRole::TcpV4),
    (None, None, TirRole::Other),
];

/// Direction of a ring group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Receive rings
    Rx,
    /// Send rings
    Tx,
}

impl GroupKind {
    /// Name for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rx => "rx",
            Self::Tx => "tx",
        }
    }
}

#[derive(Debug)]
struct GroupFlows {
    hash: Arc<FlowTable>,
    vlan: Arc<FlowTable>,
    vlan_explicit: GroupId,
    vlan_default: GroupId,
    vlan_promisc: GroupId,
    vids: BTreeSet<u16>,
}

#[derive(Debug, Default)]
struct GroupInner {
    phases: GroupPhases,
    wqs: Vec<Arc<WorkQueue>>,
    tis: Vec<u32>,
    rqt: Option<Arc<RedirectionTable>>,
    targets: BTreeMap<TirRole, Arc<HashTarget>>,
    flows: Option<GroupFlows>,
    refill: Option<RefillPool>,
}

/// A set of rings sharing steering objects
pub struct RingGroup {
    ctx: Arc<DeviceContext>,
    kind: GroupKind,
    index: usize,
    inner: OrderedMutex<GroupInner>,
}

impl std::fmt::Debug for RingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingGroup")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .finish()
    }
}

impl RingGroup {
    fn empty(ctx: &Arc<DeviceContext>, kind: GroupKind, index: usize) -> Arc<Self> {
        let mut inner = GroupInner::default();
        let _ = inner.phases.acquire(GroupPhase::Init);
        Arc::new(Self {
            ctx: Arc::clone(ctx),
            kind,
            index,
            inner: OrderedMutex::new(LockClass::Group, inner),
        })
    }

    /// Build RX group `index`: WQ/CQ pairs spread over the RX-capable
    /// event queues, the redirection table, one hash target per protocol
    /// class and the VLAN and hash flow tables. On failure everything
    /// created so far is destroyed.
    pub fn setup_rx(
        ctx: &Arc<DeviceContext>,
        index: usize,
        eqs: &[Arc<EventQueue>],
        alloc: &mut EqAllocator,
    ) -> DatapathResult<Arc<Self>> {
        let group = Self::empty(ctx, GroupKind::Rx, index);
        let built = {
            let mut inner = group.inner.lock();
            group.build_rx(&mut inner, eqs, alloc)
        };
        match built {
            Ok(()) => Ok(group),
            Err(e) => {
                tracing::warn!(group = index, error = %e, "rx group setup failed");
                group.teardown();
                Err(e)
            }
        }
    }

    fn build_rx(
        &self,
        inner: &mut GroupInner,
        eqs: &[Arc<EventQueue>],
        alloc: &mut EqAllocator,
    ) -> DatapathResult<()> {
        let nwqs = self.ctx.config().rx_rings_in_group(self.index);
        self.build_pairs(inner, nwqs, eqs, alloc, EqKind::Rx, QueueKind::Receive)?;

        let rqs: Vec<u32> = inner.wqs.iter().map(|wq| wq.num()).collect();
        inner.rqt = Some(RedirectionTable::create(&self.ctx, &rqs)?);
        inner.phases.acquire(GroupPhase::RedirTable)?;

        let rqt = inner.rqt.clone().ok_or(DatapathError::Teardown)?;
        for role in TirRole::ALL {
            let target = HashTarget::create(&self.ctx, role, &rqt, rqs[0])?;
            inner.targets.insert(role, target);
        }
        inner.phases.acquire(GroupPhase::TirTis)?;

        let flows = self.build_flows(inner)?;
        inner.flows = Some(flows);
        inner.phases.acquire(GroupPhase::Flows)?;

        tracing::info!(group = self.index, rings = inner.wqs.len(), "rx group ready");
        Ok(())
    }

    /// Create up to `nwqs` WQ/CQ pairs. A failure after the first pair
    /// truncates the group.
    fn build_pairs(
        &self,
        inner: &mut GroupInner,
        nwqs: usize,
        eqs: &[Arc<EventQueue>],
        alloc: &mut EqAllocator,
        rings: EqKind,
        kind: QueueKind,
    ) -> DatapathResult<()> {
        for i in 0..nwqs {
            let tis = (!inner.tis.is_empty()).then(|| inner.tis[i % inner.tis.len()]);
            match Self::build_pair(&self.ctx, eqs, alloc, rings, kind, tis) {
                Ok(wq) => inner.wqs.push(wq),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        group = self.index,
                        kind = self.kind.as_str(),
                        requested = nwqs,
                        built = i,
                        error = %e,
                        "ring group truncated"
                    );
                    break;
                }
            }
        }
        inner.phases.acquire(GroupPhase::Wqs)
    }

    fn build_pair(
        ctx: &Arc<DeviceContext>,
        eqs: &[Arc<EventQueue>],
        alloc: &mut EqAllocator,
        rings: EqKind,
        kind: QueueKind,
        tis: Option<u32>,
    ) -> DatapathResult<Arc<WorkQueue>> {
        let eq = alloc.next_for(eqs, rings)?;
        let cq = CompletionQueue::setup(ctx, kind, &eq)?;
        WorkQueue::setup(ctx, &cq, tis).map_err(|e| {
            cq.teardown();
            e
        })
    }

    fn build_flows(&self, inner: &GroupInner) -> DatapathResult<GroupFlows> {
        let hash = FlowTable::create(&self.ctx, 2, HASH_TABLE_SIZE_SHIFT)?;
        let built = self.fill_hash_table(&hash, inner).and_then(|()| {
            let vlan = FlowTable::create(&self.ctx, 1, self.ctx.config().ftbl_vlan_size_shift)?;
            match self.fill_vlan_table(&vlan, &hash) {
                Ok(flows) => Ok(flows),
                Err(e) => {
                    vlan.teardown();
                    Err(e)
                }
            }
        });
        if built.is_err() {
            hash.teardown();
        }
        built
    }

    fn fill_hash_table(&self, hash: &Arc<FlowTable>, inner: &GroupInner) -> DatapathResult<()> {
        for (version, proto, role) in HASH_RULES {
            let mut mask = MatchMask::empty();
            let mut matcher = PacketMatch::default();
            if let Some(v) = version {
                mask = mask | MatchMask::IP_VERSION;
                matcher.ip_version = v;
            }
            if let Some(p) = proto {
                mask = mask | MatchMask::IP_PROTO;
                matcher.ip_proto = p;
            }
            let target = inner
                .targets
                .get(&role)
                .cloned()
                .ok_or(DatapathError::Teardown)?;
            let g = hash.add_group(1, mask)?;
            hash.set_entry(g, 0, matcher, vec![Forward::Target(target)])?;
        }
        Ok(())
    }

    fn fill_vlan_table(
        &self,
        vlan: &Arc<FlowTable>,
        hash: &Arc<FlowTable>,
    ) -> DatapathResult<GroupFlows> {
        let nents = vlan.nents() as u32;
        let vlan_explicit = vlan.add_group(nents - 2, MatchMask::VLAN | MatchMask::VID)?;
        let vlan_default = vlan.add_group(1, MatchMask::empty())?;
        let vlan_promisc = vlan.add_group(1, MatchMask::empty())?;
        vlan.set_entry(
            vlan_default,
            0,
            PacketMatch::default(),
            vec![Forward::Table(Arc::clone(hash))],
        )?;
        Ok(GroupFlows {
            hash: Arc::clone(hash),
            vlan: Arc::clone(vlan),
            vlan_explicit,
            vlan_default,
            vlan_promisc,
            vids: BTreeSet::new(),
        })
    }

    /// Build TX group `index`: transmit interfaces, then WQ/CQ pairs on
    /// TX-capable event queues
    pub fn setup_tx(
        ctx: &Arc<DeviceContext>,
        index: usize,
        eqs: &[Arc<EventQueue>],
        alloc: &mut EqAllocator,
    ) -> DatapathResult<Arc<Self>> {
        let group = Self::empty(ctx, GroupKind::Tx, index);
        let built = {
            let mut inner = group.inner.lock();
            group.build_tx(&mut inner, eqs, alloc)
        };
        match built {
            Ok(()) => Ok(group),
            Err(e) => {
                tracing::warn!(group = index, error = %e, "tx group setup failed");
                group.teardown();
                Err(e)
            }
        }
    }

    fn build_tx(
        &self,
        inner: &mut GroupInner,
        eqs: &[Arc<EventQueue>],
        alloc: &mut EqAllocator,
    ) -> DatapathResult<()> {
        for _ in 0..TIS_PER_GROUP {
            let tis = self.ctx.exec(&HwCommand::CreateTis)?;
            inner.tis.push(tis);
        }
        inner.phases.acquire(GroupPhase::TirTis)?;

        let nwqs = self.ctx.config().tx_nrings_per_group;
        self.build_pairs(inner, nwqs, eqs, alloc, EqKind::Tx, QueueKind::Send)?;
        tracing::info!(group = self.index, rings = inner.wqs.len(), "tx group ready");
        Ok(())
    }

    /// Group index within its direction
    pub fn index(&self) -> usize {
        self.index
    }

    /// Direction
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Rings, in ring index order
    pub fn wqs(&self) -> Vec<Arc<WorkQueue>> {
        self.inner.lock().wqs.clone()
    }

    /// Ring `ring`
    pub fn wq(&self, ring: usize) -> Option<Arc<WorkQueue>> {
        self.inner.lock().wqs.get(ring).cloned()
    }

    /// Phases currently held
    pub fn phases(&self) -> GroupPhases {
        self.inner.lock().phases
    }

    /// Whether the group has been started
    pub fn is_running(&self) -> bool {
        self.inner.lock().phases.has(GroupPhase::Running)
    }

    /// Hash target for `role`
    pub fn target(&self, role: TirRole) -> Option<Arc<HashTarget>> {
        self.inner.lock().targets.get(&role).cloned()
    }

    /// Redirection table
    pub fn redirection_table(&self) -> Option<Arc<RedirectionTable>> {
        self.inner.lock().rqt.clone()
    }

    /// Level 2 table matching IP version and protocol
    pub fn hash_table(&self) -> Option<Arc<FlowTable>> {
        self.inner.lock().flows.as_ref().map(|f| Arc::clone(&f.hash))
    }

    /// Level 1 table matching VLAN tags
    pub fn vlan_table(&self) -> Option<Arc<FlowTable>> {
        self.inner.lock().flows.as_ref().map(|f| Arc::clone(&f.vlan))
    }

    /// Transmit interfaces
    pub fn tis(&self) -> Vec<u32> {
        self.inner.lock().tis.clone()
    }

    /// Refill workers, 0 until the group starts
    pub fn refill_workers(&self) -> usize {
        self.inner.lock().refill.as_ref().map_or(0, RefillPool::workers)
    }

    /// Start the group: RX groups get one refill worker per ring. Starting
    /// a running group is a no-op. True when this call started it.
    pub fn start(&self) -> DatapathResult<bool> {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner)
    }

    fn start_locked(&self, inner: &mut GroupInner) -> DatapathResult<bool> {
        if inner.phases.has(GroupPhase::Running) {
            return Ok(false);
        }
        if !inner.phases.has(GroupPhase::Wqs) {
            return Err(DatapathError::Teardown);
        }
        if self.kind == GroupKind::Rx && inner.refill.is_none() {
            let pool = RefillPool::new(&format!("nicq-rx{}-refill", self.index), inner.wqs.len())?;
            for wq in &inner.wqs {
                wq.set_refill_sender(pool.sender());
            }
            inner.refill = Some(pool);
        }
        inner.phases.acquire(GroupPhase::Running)?;
        tracing::info!(group = self.index, kind = self.kind.as_str(), "ring group started");
        Ok(true)
    }

    fn ring(&self, inner: &GroupInner, ring: usize) -> DatapathResult<Arc<WorkQueue>> {
        inner
            .wqs
            .get(ring)
            .cloned()
            .ok_or(DatapathError::NoSuchRing(ring))
    }

    /// Start receive ring `ring`: start the hardware queue, stock its shard
    /// with one and a half rings of buffers and post the first refill.
    /// Starts the group if needed.
    pub fn rx_ring_start(&self, ring: usize) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        if self.kind != GroupKind::Rx {
            return Err(DatapathError::InvalidDescriptor("not a receive group".into()));
        }
        let wq = self.ring(&inner, ring)?;
        self.start_locked(&mut inner)?;
        if wq.state() == WqState::Started {
            return Ok(());
        }

        wq.start()?;
        wq.lock_inner().buffers_loaded = true;
        wq.shard().ready();
        let nbufs = wq.nents() + wq.nents() / 2;
        let size = self.ctx.config().mtu;
        for _ in 0..nbufs {
            let buf = wq.shard().create_buffer(self.ctx.dma(), size)?;
            return_buffer(buf);
        }
        let posted = refill_now(&wq);
        tracing::debug!(group = self.index, ring, wq = wq.num(), posted, "rx ring started");
        Ok(())
    }

    /// Start send ring `ring`: stock both shards, start the hardware queue
    /// and post one no-op
    pub fn tx_ring_start(&self, ring: usize) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        if self.kind != GroupKind::Tx {
            return Err(DatapathError::InvalidDescriptor("not a send group".into()));
        }
        let wq = self.ring(&inner, ring)?;
        if wq.state() == WqState::Started {
            return Ok(());
        }

        let nents = wq.nents();
        if let Some(foreign) = wq.foreign_shard() {
            for _ in 0..nents + nents / 2 {
                return_buffer(foreign.create_foreign());
            }
            foreign.ready();
        }
        let size = self.ctx.config().mtu;
        for _ in 0..nents {
            let buf = wq.shard().create_buffer(self.ctx.dma(), size)?;
            return_buffer(buf);
        }
        wq.shard().ready();

        wq.start()?;
        self.start_locked(&mut inner)?;
        wq.add_nop()?;
        tracing::debug!(group = self.index, ring, wq = wq.num(), "tx ring started");
        Ok(())
    }

    /// Stop ring `ring`: reset the hardware queue, reclaim posted buffers
    /// and drain the shards. The ring can be started again.
    pub fn ring_stop(&self, ring: usize) -> DatapathResult<()> {
        let inner = self.inner.lock();
        let wq = self.ring(&inner, ring)?;
        wq.stop()?;
        wq.shard().draining();
        if let Some(foreign) = wq.foreign_shard() {
            foreign.draining();
        }
        let returned = wq.cq().return_pending();
        let timeout = self.drain_timeout();
        let mut drained = wq.shard().drain(timeout);
        if let Some(foreign) = wq.foreign_shard() {
            drained &= foreign.drain(timeout);
        }
        tracing::debug!(group = self.index, ring, returned, drained, "ring stopped");
        Ok(())
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config().loaned_drain_timeout_ms)
    }

    /// Steer VLAN `vid` into this group. The default entry is removed once
    /// the first explicit VLAN is added.
    pub fn add_vlan(&self, vid: u16) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        let flows = inner.flows.as_mut().ok_or(DatapathError::Teardown)?;
        if flows.vids.contains(&vid) {
            return Ok(());
        }
        flows.vlan.insert(
            flows.vlan_explicit,
            PacketMatch::default().with_vlan(vid),
            vec![Forward::Table(Arc::clone(&flows.hash))],
        )?;
        if flows.vids.is_empty() {
            if let Err(e) = flows.vlan.delete_slot(flows.vlan_default, 0) {
                let _ = flows
                    .vlan
                    .remove(flows.vlan_explicit, &PacketMatch::default().with_vlan(vid));
                return Err(e);
            }
        }
        flows.vids.insert(vid);
        Ok(())
    }

    /// Stop steering VLAN `vid`. The default entry returns once no
    /// explicit VLAN is left.
    pub fn remove_vlan(&self, vid: u16) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        let flows = inner.flows.as_mut().ok_or(DatapathError::Teardown)?;
        if !flows.vids.contains(&vid) {
            return Err(DatapathError::UnknownFlowEntry(format!("vlan {vid}")));
        }
        flows
            .vlan
            .remove(flows.vlan_explicit, &PacketMatch::default().with_vlan(vid))?;
        flows.vids.remove(&vid);
        if flows.vids.is_empty() {
            flows.vlan.set_entry(
                flows.vlan_default,
                0,
                PacketMatch::default(),
                vec![Forward::Table(Arc::clone(&flows.hash))],
            )?;
        }
        Ok(())
    }

    /// Explicit VLANs steered into this group
    pub fn vlans(&self) -> Vec<u16> {
        self.inner
            .lock()
            .flows
            .as_ref()
            .map(|f| f.vids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the VLAN default entry is installed
    pub fn vlan_default_installed(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .flows
            .as_ref()
            .map_or(false, |f| f.vlan.is_installed(f.vlan_default, 0))
    }

    /// Install (`Some`) or remove (`None`) the VLAN promiscuous entry,
    /// forwarding to `dest`
    pub(crate) fn set_vlan_promisc(&self, dest: Option<Arc<FlowTable>>) -> DatapathResult<()> {
        let inner = self.inner.lock();
        let Some(flows) = inner.flows.as_ref() else {
            return Ok(());
        };
        match dest {
            Some(table) => {
                flows
                    .vlan
                    .set_entry(flows.vlan_promisc, 0, PacketMatch::default(), vec![Forward::Table(table)])?;
            }
            None => flows.vlan.delete_slot(flows.vlan_promisc, 0)?,
        }
        Ok(())
    }

    /// Mark every completion queue as tearing down and wake refill
    /// workers waiting on the shards
    pub fn quiesce(&self) {
        for wq in self.wqs() {
            wq.cq().quiesce();
        }
    }

    /// Destroy the group in dependency order: flow tables, running
    /// queues and refill workers, hash targets or transmit interfaces,
    /// the redirection table, then each WQ/CQ pair. Safe to call
    /// repeatedly; only held phases are undone.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        if inner.phases.is_empty() {
            return;
        }
        for wq in &inner.wqs {
            wq.cq().quiesce();
        }

        if inner.phases.has(GroupPhase::Flows) {
            if let Some(flows) = inner.flows.take() {
                flows.vlan.teardown();
                flows.hash.teardown();
            }
            self.release(&mut inner, GroupPhase::Flows);
        }

        if inner.phases.has(GroupPhase::Running) {
            for wq in &inner.wqs {
                if let Err(e) = wq.stop() {
                    tracing::warn!(wq = wq.num(), error = %e, "stop failed during teardown");
                }
            }
            if let Some(mut pool) = inner.refill.take() {
                pool.shutdown();
            }
            self.release(&mut inner, GroupPhase::Running);
        }

        if self.kind == GroupKind::Rx && inner.phases.has(GroupPhase::TirTis) {
            for target in std::mem::take(&mut inner.targets).into_values() {
                target.teardown();
            }
            self.release(&mut inner, GroupPhase::TirTis);
        }

        if inner.phases.has(GroupPhase::RedirTable) {
            if let Some(rqt) = inner.rqt.take() {
                rqt.teardown();
            }
            self.release(&mut inner, GroupPhase::RedirTable);
        }

        if inner.phases.has(GroupPhase::Wqs) {
            for wq in &inner.wqs {
                wq.teardown();
                wq.cq().teardown();
            }
            self.release(&mut inner, GroupPhase::Wqs);
        }

        if inner.phases.has(GroupPhase::TirTis) {
            for tis in inner.tis.drain(..) {
                self.ctx.exec_best_effort(&HwCommand::DestroyTis { tis });
            }
            self.release(&mut inner, GroupPhase::TirTis);
        }

        let timeout = self.drain_timeout();
        for wq in inner.wqs.drain(..) {
            wq.shard().drain(timeout);
            if let Some(foreign) = wq.foreign_shard() {
                foreign.drain(timeout);
            }
        }
        self.release(&mut inner, GroupPhase::Init);
        tracing::info!(group = self.index, kind = self.kind.as_str(), "ring group torn down");
    }

    fn release(&self, inner: &mut GroupInner, phase: GroupPhase) {
        if let Err(e) = inner.phases.release(phase) {
            tracing::warn!(group = self.index, error = %e, "group phase");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatapathConfig;
    use crate::lifecycle::ShardState;
    use crate::sim::SimHarness;

    fn config() -> DatapathConfig {
        DatapathConfig {
            sq_size_shift: 4,
            rq_size_shift: 4,
            cq_size_shift: 4,
            refill_step: 4,
            rx_nrings_per_large_group: 3,
            tx_nrings_per_group: 2,
            event_queues: vec![EqKind::Rx, EqKind::Tx, EqKind::Any],
            mtu: 256,
            ..Default::default()
        }
    }

    fn eqs(h: &SimHarness) -> Vec<Arc<EventQueue>> {
        h.ctx
            .config()
            .event_queues
            .iter()
            .enumerate()
            .map(|(i, k)| EventQueue::new(i, i as u32, *k))
            .collect()
    }

    #[test]
    fn test_rx_setup_builds_steering() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        let group = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();

        assert_eq!(group.wqs().len(), 3);
        assert_eq!(group.redirection_table().unwrap().len(), 4);
        assert_eq!(h.device.command_count("CREATE_TIR"), 7);
        assert_eq!(group.hash_table().unwrap().installed(), 5);
        assert!(group.vlan_default_installed());

        // RX rings only land on RX-capable event queues
        for wq in group.wqs() {
            assert_ne!(wq.cq().eq().kind(), EqKind::Tx);
        }
        let phases = group.phases();
        for p in [GroupPhase::Wqs, GroupPhase::TirTis, GroupPhase::RedirTable, GroupPhase::Flows] {
            assert!(phases.has(p));
        }
        assert!(!phases.has(GroupPhase::Running));
        group.teardown();
    }

    #[test]
    fn test_hash_rule_order() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        let group = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();
        let hash = group.hash_table().unwrap();

        let role = |v, p| hash.lookup(&PacketMatch::default().with_ip(v, p)).unwrap().role();
        assert_eq!(role(6, ip_proto::UDP), TirRole::UdpV6);
        assert_eq!(role(4, ip_proto::TCP), TirRole::TcpV4);
        assert_eq!(role(4, ip_proto::ICMP), TirRole::Other);
        assert_eq!(role(6, ip_proto::ICMP), TirRole::Other);
        assert_eq!(role(0, 0), TirRole::Other);
        assert!(group.target(TirRole::Ipv4).is_some());
        assert!(group.target(TirRole::Ipv6).is_some());
        group.teardown();
    }

    #[test]
    fn test_failed_setup_leaves_nothing() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        h.device.fail_command("CREATE_FLOW_GROUP", 1);

        let err = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap_err();
        assert!(matches!(err, DatapathError::HardwareCommand { .. }));
        for (create, destroy) in [
            ("CREATE_RQ", "DESTROY_RQ"),
            ("CREATE_CQ", "DESTROY_CQ"),
            ("CREATE_TIR", "DESTROY_TIR"),
            ("CREATE_RQT", "DESTROY_RQT"),
            ("CREATE_FLOW_TABLE", "DESTROY_FLOW_TABLE"),
        ] {
            assert_eq!(
                h.device.command_count(create),
                h.device.command_count(destroy),
                "{create}"
            );
        }
        for eq in &eqs {
            assert!(eq.cq_nums().is_empty());
        }
    }

    #[test]
    fn test_partial_ring_failure_truncates() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        h.device.fail_command_after("CREATE_RQ", 2, 1);

        let group = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();
        assert_eq!(group.wqs().len(), 2);
        assert_eq!(group.redirection_table().unwrap().len(), 2);
        // The CQ built for the failed ring is gone again
        assert_eq!(h.device.command_count("DESTROY_CQ"), 1);
        group.teardown();
    }

    #[test]
    fn test_first_ring_failure_fails_setup() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        h.device.fail_command("CREATE_SQ", 1);
        assert!(RingGroup::setup_tx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).is_err());
        assert_eq!(h.device.command_count("DESTROY_TIS"), 1);
    }

    #[test]
    fn test_ring_start_and_stop() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        let group = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();

        group.rx_ring_start(0).unwrap();
        group.rx_ring_start(0).unwrap();
        assert!(group.is_running());
        assert_eq!(group.refill_workers(), 3);
        let wq = group.wq(0).unwrap();
        assert_eq!(wq.state(), WqState::Started);
        assert!(wq.buffers_loaded());
        assert_eq!(wq.cq().buffer_count(), 12);
        assert_eq!(wq.shard().counts().total, 24);

        group.ring_stop(0).unwrap();
        assert_eq!(wq.state(), WqState::Created);
        assert_eq!(wq.cq().buffer_count(), 0);
        assert_eq!(wq.shard().counts().total, 0);
        assert_eq!(wq.shard().state(), ShardState::Draining);

        group.rx_ring_start(0).unwrap();
        assert_eq!(wq.cq().buffer_count(), 12);
        assert!(matches!(group.rx_ring_start(9), Err(DatapathError::NoSuchRing(9))));
        group.teardown();
    }

    #[test]
    fn test_tx_ring_start() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        let group = RingGroup::setup_tx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();
        assert_eq!(group.tis().len(), TIS_PER_GROUP);

        group.tx_ring_start(1).unwrap();
        let wq = group.wq(1).unwrap();
        assert!(group.is_running());
        assert_eq!(group.refill_workers(), 0);
        assert_eq!(wq.foreign_shard().unwrap().counts().total, 24);
        assert_eq!(wq.shard().counts().total, 16);
        assert_eq!(wq.producer_counter(), 1);
        for w in group.wqs() {
            assert_ne!(w.cq().eq().kind(), EqKind::Rx);
        }

        group.teardown();
        assert_eq!(h.device.command_count("DESTROY_TIS"), 1);
        assert_eq!(wq.state(), WqState::Destroyed);
    }

    #[test]
    fn test_vlan_default_tracks_explicit_set() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        let group = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();
        let vlan = group.vlan_table().unwrap();
        let tagged = PacketMatch::default().with_vlan(100).with_ip(4, ip_proto::UDP);

        group.add_vlan(100).unwrap();
        group.add_vlan(100).unwrap();
        assert!(!group.vlan_default_installed());
        assert_eq!(vlan.lookup(&tagged).unwrap().role(), TirRole::UdpV4);
        assert!(vlan.lookup(&PacketMatch::default().with_vlan(200)).is_none());

        group.remove_vlan(100).unwrap();
        assert!(group.vlan_default_installed());
        assert!(vlan.lookup(&PacketMatch::default().with_vlan(200)).is_some());
        assert!(group.remove_vlan(100).is_err());
        group.teardown();
    }

    #[test]
    fn test_teardown_order_and_idempotence() {
        let h = SimHarness::new(config()).unwrap();
        let eqs = eqs(&h);
        let group = RingGroup::setup_rx(&h.ctx, 0, &eqs, &mut EqAllocator::new()).unwrap();
        group.rx_ring_start(0).unwrap();

        group.teardown();
        let count = h.device.commands().len();
        group.teardown();
        assert_eq!(h.device.commands().len(), count);
        assert!(group.phases().is_empty());

        let names: Vec<&str> = h.device.commands().iter().map(|c| c.name()).collect();
        let pos = |name: &str| names.iter().position(|n| *n == name).unwrap();
        let last = |name: &str| names.iter().rposition(|n| *n == name).unwrap();
        assert!(last("DESTROY_FLOW_TABLE") < pos("STOP_RQ"));
        assert!(pos("STOP_RQ") < pos("DESTROY_TIR"));
        assert!(last("DESTROY_TIR") < pos("DESTROY_RQT"));
        assert!(pos("DESTROY_RQT") < pos("DESTROY_RQ"));
        assert!(pos("DESTROY_RQ") < pos("DESTROY_CQ"));
        for eq in &eqs {
            assert!(eq.cq_nums().is_empty());
        }
    }
}
