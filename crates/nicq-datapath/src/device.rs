//! Device context and port data path
//!
//! [`DeviceContext`] bundles the external collaborators and the shared
//! per-port state every queue needs. [`Datapath`] owns the event queues,
//! the ring groups and the port root flow table, and is the control-path
//! entrypoint for setup, start and teardown.

use crate::config::DatapathConfig;
use crate::diag::DiagnosticSink;
use crate::dma::DmaAllocator;
use crate::eq::{EqAllocator, EventQueue};
use crate::error::{DatapathError, DatapathResult};
use crate::flow::{FlowTable, Forward, GroupId, MatchMask, PacketMatch, BROADCAST_MAC};
use crate::group::{GroupKind, RingGroup};
use crate::hw::{DeviceAccess, DeviceHealth, HardwareControl, HwCommand};
use crate::lock_order::{LockClass, OrderedMutex};
use crate::rss::{FlowTuple, HashTarget};
use crate::stack::NetworkStack;
use crate::stats::PortStats;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Collaborators and shared state of one port
pub struct DeviceContext {
    config: DatapathConfig,
    hw: Arc<dyn HardwareControl>,
    access: Arc<dyn DeviceAccess>,
    dma: Arc<dyn DmaAllocator>,
    diag: Arc<dyn DiagnosticSink>,
    stack: Arc<dyn NetworkStack>,
    stats: PortStats,
    health: DeviceHealth,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("config", &self.config)
            .field("health", &self.health.current())
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Validate `config` and bundle the collaborators
    pub fn new(
        config: DatapathConfig,
        hw: Arc<dyn HardwareControl>,
        access: Arc<dyn DeviceAccess>,
        dma: Arc<dyn DmaAllocator>,
        diag: Arc<dyn DiagnosticSink>,
        stack: Arc<dyn NetworkStack>,
    ) -> DatapathResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            hw,
            access,
            dma,
            diag,
            stack,
            stats: PortStats::default(),
            health: DeviceHealth::default(),
        }))
    }

    /// Configuration
    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// Memory visibility and doorbells
    pub fn access(&self) -> &dyn DeviceAccess {
        self.access.as_ref()
    }

    /// Hardware-visible memory
    pub fn dma(&self) -> &dyn DmaAllocator {
        self.dma.as_ref()
    }

    /// Diagnostic events
    pub fn diag(&self) -> &dyn DiagnosticSink {
        self.diag.as_ref()
    }

    /// Network stack hand-off
    pub fn stack(&self) -> &dyn NetworkStack {
        self.stack.as_ref()
    }

    /// Port counters
    pub fn stats(&self) -> &PortStats {
        &self.stats
    }

    /// Device service state
    pub fn health(&self) -> &DeviceHealth {
        &self.health
    }

    /// Run a hardware command, mapping failure into [`DatapathError`]
    pub fn exec(&self, cmd: &HwCommand) -> DatapathResult<u32> {
        self.hw.execute(cmd).map_err(|e| {
            tracing::debug!(op = cmd.name(), error = %e, "hardware command failed");
            DatapathError::hw(cmd.name(), e.to_string())
        })
    }

    /// Run a teardown command; failures are logged and teardown goes on
    pub(crate) fn exec_best_effort(&self, cmd: &HwCommand) -> bool {
        match self.hw.execute(cmd) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(op = cmd.name(), error = %e, "teardown command failed, continuing");
                false
            }
        }
    }
}

#[derive(Debug)]
struct RootFlows {
    table: Arc<FlowTable>,
    umcast: GroupId,
    bcast: GroupId,
    promisc: GroupId,
}

#[derive(Debug, Default)]
struct PortState {
    root: Option<RootFlows>,
    promisc: bool,
    macs: BTreeMap<[u8; 6], BTreeSet<usize>>,
    torn_down: bool,
}

/// The data path of one port
pub struct Datapath {
    ctx: Arc<DeviceContext>,
    eqs: Vec<Arc<EventQueue>>,
    rx_groups: Vec<Arc<RingGroup>>,
    tx_groups: Vec<Arc<RingGroup>>,
    port: OrderedMutex<PortState>,
}

impl std::fmt::Debug for Datapath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datapath")
            .field("eqs", &self.eqs.len())
            .field("rx_groups", &self.rx_groups.len())
            .field("tx_groups", &self.tx_groups.len())
            .finish()
    }
}

impl Datapath {
    /// Build the port: event queues, the root flow table, then every RX
    /// and TX group, sharing one round-robin event queue cursor. On
    /// failure everything built so far is torn down.
    pub fn setup(ctx: Arc<DeviceContext>) -> DatapathResult<Self> {
        let eqs: Vec<_> = ctx
            .config()
            .event_queues
            .iter()
            .enumerate()
            .map(|(i, kind)| EventQueue::new(i, i as u32, *kind))
            .collect();
        let mut dp = Self {
            ctx,
            eqs,
            rx_groups: Vec::new(),
            tx_groups: Vec::new(),
            port: OrderedMutex::with_default(LockClass::Port),
        };

        // Dropping `dp` on an early return tears down what was built
        let root = dp.build_root()?;
        dp.port.get_mut().root = Some(root);

        let mut alloc = EqAllocator::new();
        for i in 0..dp.ctx.config().rx_ngroups() {
            let group = RingGroup::setup_rx(&dp.ctx, i, &dp.eqs, &mut alloc)?;
            dp.rx_groups.push(group);
        }
        for i in 0..dp.ctx.config().tx_ngroups {
            let group = RingGroup::setup_tx(&dp.ctx, i, &dp.eqs, &mut alloc)?;
            dp.tx_groups.push(group);
        }
        tracing::info!(
            eqs = dp.eqs.len(),
            rx_groups = dp.rx_groups.len(),
            tx_groups = dp.tx_groups.len(),
            "data path ready"
        );
        Ok(dp)
    }

    fn build_root(&self) -> DatapathResult<RootFlows> {
        let table = FlowTable::create(&self.ctx, 0, self.ctx.config().ftbl_root_size_shift)?;
        let nents = table.nents() as u32;
        let built = (|| -> DatapathResult<RootFlows> {
            let umcast = table.add_group(nents - 2, MatchMask::DMAC)?;
            let bcast = table.add_group(1, MatchMask::DMAC)?;
            let promisc = table.add_group(1, MatchMask::empty())?;
            self.ctx.exec(&HwCommand::SetRootTable { table: table.num() })?;
            Ok(RootFlows {
                table: Arc::clone(&table),
                umcast,
                bcast,
                promisc,
            })
        })();
        if built.is_err() {
            table.teardown();
        }
        built
    }

    /// Device context
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Completion event queues, by interrupt vector
    pub fn event_queues(&self) -> &[Arc<EventQueue>] {
        &self.eqs
    }

    /// RX groups
    pub fn rx_groups(&self) -> &[Arc<RingGroup>] {
        &self.rx_groups
    }

    /// TX groups
    pub fn tx_groups(&self) -> &[Arc<RingGroup>] {
        &self.tx_groups
    }

    fn group(&self, kind: GroupKind, index: usize) -> DatapathResult<&Arc<RingGroup>> {
        let groups = match kind {
            GroupKind::Rx => &self.rx_groups,
            GroupKind::Tx => &self.tx_groups,
        };
        groups
            .get(index)
            .ok_or(DatapathError::NoSuchGroup(kind.as_str(), index))
    }

    /// Port root flow table
    pub fn root_table(&self) -> Option<Arc<FlowTable>> {
        self.port.lock().root.as_ref().map(|r| Arc::clone(&r.table))
    }

    /// Whether promiscuous mode is on
    pub fn promisc(&self) -> bool {
        self.port.lock().promisc
    }

    /// Start receive ring `ring` of RX group `group`, starting the group
    /// first. Starting group 0 installs the root broadcast rule and, in
    /// promiscuous mode, the root promiscuous rule.
    pub fn rx_ring_start(&self, group: usize, ring: usize) -> DatapathResult<()> {
        let g = self.group(GroupKind::Rx, group)?;
        {
            let port = self.port.lock();
            if port.torn_down {
                return Err(DatapathError::Teardown);
            }
            if g.start()? && group == 0 {
                self.install_first_group_rules(&port, g)?;
            }
        }
        g.rx_ring_start(ring)
    }

    fn install_first_group_rules(&self, port: &PortState, first: &RingGroup) -> DatapathResult<()> {
        let (Some(root), Some(hash)) = (port.root.as_ref(), first.hash_table()) else {
            return Err(DatapathError::Teardown);
        };
        root.table.set_entry(
            root.bcast,
            0,
            PacketMatch::to_mac(BROADCAST_MAC),
            vec![Forward::Table(Arc::clone(&hash))],
        )?;
        if port.promisc {
            root.table
                .set_entry(root.promisc, 0, PacketMatch::default(), vec![Forward::Table(hash)])?;
        }
        Ok(())
    }

    /// Start send ring `ring` of TX group `group`
    pub fn tx_ring_start(&self, group: usize, ring: usize) -> DatapathResult<()> {
        if self.port.lock().torn_down {
            return Err(DatapathError::Teardown);
        }
        self.group(GroupKind::Tx, group)?.tx_ring_start(ring)
    }

    /// Stop one ring and reclaim its buffers
    pub fn ring_stop(&self, kind: GroupKind, group: usize, ring: usize) -> DatapathResult<()> {
        self.group(kind, group)?.ring_stop(ring)
    }

    /// Steer traffic for `mac` into RX group `group`. A MAC shared by
    /// several groups fans out to each of them.
    pub fn add_mac(&self, group: usize, mac: [u8; 6]) -> DatapathResult<()> {
        let g = self.group(GroupKind::Rx, group)?;
        let mut port = self.port.lock();
        let root = port.root.as_ref().ok_or(DatapathError::Teardown)?;
        let vlan = g.vlan_table().ok_or(DatapathError::Teardown)?;
        let matcher = PacketMatch::to_mac(mac);
        match root.table.find(root.umcast, &matcher) {
            Some(index) => root.table.add_dest(index, Forward::Table(vlan))?,
            None => {
                root.table
                    .insert(root.umcast, matcher, vec![Forward::Table(vlan)])?;
            }
        }
        port.macs.entry(mac).or_default().insert(group);
        Ok(())
    }

    /// Stop steering `mac` into RX group `group`
    pub fn remove_mac(&self, group: usize, mac: [u8; 6]) -> DatapathResult<()> {
        let g = self.group(GroupKind::Rx, group)?;
        let mut port = self.port.lock();
        if !port.macs.get(&mac).map_or(false, |gs| gs.contains(&group)) {
            return Err(DatapathError::UnknownFlowEntry(format!("{mac:02x?}")));
        }
        Self::unsteer_mac(&port, g, mac)?;
        if let Some(groups) = port.macs.get_mut(&mac) {
            groups.remove(&group);
            if groups.is_empty() {
                port.macs.remove(&mac);
            }
        }
        Ok(())
    }

    fn unsteer_mac(port: &PortState, g: &RingGroup, mac: [u8; 6]) -> DatapathResult<()> {
        let root = port.root.as_ref().ok_or(DatapathError::Teardown)?;
        let vlan = g.vlan_table().ok_or(DatapathError::Teardown)?;
        let index = root
            .table
            .find(root.umcast, &PacketMatch::to_mac(mac))
            .ok_or_else(|| DatapathError::UnknownFlowEntry(format!("{mac:02x?}")))?;
        root.table.remove_dest(index, &Forward::Table(vlan))?;
        Ok(())
    }

    /// Steer VLAN `vid` into RX group `group`
    pub fn add_vlan(&self, group: usize, vid: u16) -> DatapathResult<()> {
        self.group(GroupKind::Rx, group)?.add_vlan(vid)
    }

    /// Stop steering VLAN `vid` into RX group `group`
    pub fn remove_vlan(&self, group: usize, vid: u16) -> DatapathResult<()> {
        self.group(GroupKind::Rx, group)?.remove_vlan(vid)
    }

    /// Turn promiscuous mode on or off. Each group's VLAN promiscuous
    /// entry follows at once; the root entry is only present while group 0
    /// is running.
    pub fn set_promisc(&self, on: bool) -> DatapathResult<()> {
        let mut port = self.port.lock();
        if port.torn_down {
            return Err(DatapathError::Teardown);
        }
        let first = self.group(GroupKind::Rx, 0)?;
        let hash = first.hash_table().ok_or(DatapathError::Teardown)?;
        let root = port.root.as_ref().ok_or(DatapathError::Teardown)?;

        if on {
            for g in &self.rx_groups {
                g.set_vlan_promisc(Some(Arc::clone(&hash)))?;
            }
            if first.is_running() {
                root.table.set_entry(
                    root.promisc,
                    0,
                    PacketMatch::default(),
                    vec![Forward::Table(hash)],
                )?;
            }
        } else {
            root.table.delete_slot(root.promisc, 0)?;
            for g in &self.rx_groups {
                g.set_vlan_promisc(None)?;
            }
        }
        port.promisc = on;
        tracing::info!(promisc = on, "promiscuous mode");
        Ok(())
    }

    /// Hash target a packet with these headers reaches, if any
    pub fn classify(&self, pkt: &PacketMatch) -> Option<Arc<HashTarget>> {
        self.root_table()?.lookup(pkt)
    }

    /// Receive queue a packet with these headers lands on, if any
    pub fn steer(&self, pkt: &PacketMatch, tuple: &FlowTuple) -> Option<u32> {
        self.classify(pkt)?.select_queue(tuple)
    }

    /// Service every event queue once with `budget` completions per CQ
    pub fn poll(&self, budget: usize) -> usize {
        self.eqs.iter().map(|eq| eq.dispatch_all(budget)).sum()
    }

    /// Tear the port down: quiesce every RX completion queue, then per RX
    /// group remove the root rules forwarding into it and destroy it, then
    /// the TX groups and the root table. Safe to call repeatedly.
    pub fn teardown(&self) {
        let mut port = self.port.lock();
        if port.torn_down {
            return;
        }
        port.torn_down = true;

        for g in &self.rx_groups {
            g.quiesce();
        }

        let macs: Vec<_> = std::mem::take(&mut port.macs).into_iter().collect();
        for (i, g) in self.rx_groups.iter().enumerate() {
            for (mac, groups) in &macs {
                if groups.contains(&i) {
                    if let Err(e) = Self::unsteer_mac(&port, g, *mac) {
                        tracing::warn!(group = i, error = %e, "mac rule removal failed, continuing");
                    }
                }
            }
            if i == 0 {
                if let Some(root) = port.root.as_ref() {
                    for fg in [root.bcast, root.promisc] {
                        if let Err(e) = root.table.delete_slot(fg, 0) {
                            tracing::warn!(error = %e, "root rule removal failed, continuing");
                        }
                    }
                }
            }
            g.teardown();
        }
        for g in &self.tx_groups {
            g.teardown();
        }
        if let Some(root) = port.root.take() {
            root.table.teardown();
        }
        tracing::info!("data path torn down");
    }
}

impl Drop for Datapath {
    fn drop(&mut self) {
        self.teardown();
    }
}
