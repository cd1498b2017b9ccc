//! Software device model
//!
//! [`SimDevice`] stands in for the adapter: it executes hardware commands
//! against an in-memory object table, records every command it accepted,
//! and plays the device side of the rings by reading posted descriptors
//! and writing completion entries. Faults can be injected per command name
//! and per memory region. [`SimStack`] collects what the data path hands
//! to the network stack.

use crate::config::DatapathConfig;
use crate::descriptor::{CompletionEntry, CqeFormat, CqeOpcode, CqeSyndrome, SendOpcode};
use crate::device::DeviceContext;
use crate::diag::{ChannelDiagnostics, DiagnosticEvent};
use crate::dma::HeapDmaAllocator;
use crate::error::DatapathResult;
use crate::hw::{
    DeviceAccess, DmaRegion, FaultStatus, HardwareControl, HwCommand, HwError, HwQueueState,
    QueueKind, UarRegister,
};
use crate::stack::{NetworkStack, RxPacket};
use crate::wq::WorkQueue;
use bytes::BytesMut;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Memory or register a fault can be injected on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultTarget {
    /// Descriptor slots of a work queue
    WqEntries(u32),
    /// Doorbell record of a work queue
    WqDoorbell(u32),
    /// Doorbell record of a completion queue
    CqDoorbell(u32),
    /// Blue-flame doorbell register writes
    Uar,
    /// Any packet buffer
    Buffers,
}

impl FaultTarget {
    fn of(region: DmaRegion) -> Option<Self> {
        match region {
            DmaRegion::WqEntries { wq, .. } => Some(Self::WqEntries(wq)),
            DmaRegion::WqDoorbell { wq } => Some(Self::WqDoorbell(wq)),
            DmaRegion::CqDoorbell { cq } => Some(Self::CqDoorbell(cq)),
            DmaRegion::Buffer { .. } => Some(Self::Buffers),
            DmaRegion::Uar => Some(Self::Uar),
            DmaRegion::CqEntries { .. } => None,
        }
    }
}

/// Defect [`SimDevice::complete_malformed`] writes into a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Opcode of the other queue direction
    Opcode,
    /// Compressed entry format
    Format,
}

#[derive(Default)]
struct SimState {
    next_num: u32,
    log: Vec<HwCommand>,
    failures: HashMap<&'static str, (u32, u32)>,
    queue_states: HashMap<u32, HwQueueState>,
    pending_faults: HashMap<FaultTarget, u32>,
    faulted: HashSet<FaultTarget>,
    blueflame: HashMap<u32, Vec<u64>>,
    arm_writes: usize,
    consumed: HashMap<u32, u32>,
}

impl SimState {
    fn trip(&mut self, target: FaultTarget) {
        if let Some(left) = self.pending_faults.get_mut(&target) {
            if *left > 0 {
                *left -= 1;
                self.faulted.insert(target);
            }
        }
    }
}

/// In-memory adapter
pub struct SimDevice {
    dma: Arc<HeapDmaAllocator>,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("commands", &self.state.lock().log.len())
            .finish()
    }
}

impl SimDevice {
    /// Device reading and writing packet memory through `dma`
    pub fn new(dma: Arc<HeapDmaAllocator>) -> Self {
        Self {
            dma,
            state: Mutex::new(SimState {
                next_num: 1,
                ..Default::default()
            }),
        }
    }

    /// Every command accepted so far, in order
    pub fn commands(&self) -> Vec<HwCommand> {
        self.state.lock().log.clone()
    }

    /// Accepted commands named `name`
    pub fn command_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|cmd| cmd.name() == name)
            .count()
    }

    /// Reject the next `times` commands named `name`
    pub fn fail_command(&self, name: &'static str, times: u32) {
        self.fail_command_after(name, 0, times);
    }

    /// Let `skip` runs of command `name` succeed, then fail the next `times`
    pub fn fail_command_after(&self, name: &'static str, skip: u32, times: u32) {
        self.state.lock().failures.insert(name, (skip, times));
    }

    /// Fault the next `times` accesses to `target`
    pub fn inject_fault(&self, target: FaultTarget, times: u32) {
        self.state.lock().pending_faults.insert(target, times);
    }

    /// Force the state the device reports for queue `num`
    pub fn set_queue_state(&self, num: u32, state: HwQueueState) {
        self.state.lock().queue_states.insert(num, state);
    }

    /// Blue-flame doorbell writes seen for send queue `sq`
    pub fn blueflame_writes(&self, sq: u32) -> usize {
        self.state.lock().blueflame.get(&sq).map_or(0, Vec::len)
    }

    /// Last value written to send queue `sq`'s doorbell register
    pub fn last_doorbell(&self, sq: u32) -> Option<u64> {
        self.state
            .lock()
            .blueflame
            .get(&sq)
            .and_then(|w| w.last().copied())
    }

    /// Completion queue arm writes seen
    pub fn arm_writes(&self) -> usize {
        self.state.lock().arm_writes
    }

    fn consumed(&self, wq: u32) -> u32 {
        self.state.lock().consumed.get(&wq).copied().unwrap_or(0)
    }

    fn advance(&self, wq: u32, n: u32) {
        let mut state = self.state.lock();
        let c = state.consumed.entry(wq).or_insert(0);
        *c = c.wrapping_add(n);
    }

    fn pending(wq: &WorkQueue, consumed: u32) -> bool {
        consumed & 0xffff != wq.doorbell_counter()
    }

    /// Receive `payload` into the next posted receive descriptor of `wq`
    /// and write its completion. False when nothing is posted.
    pub fn complete_receive(&self, wq: &WorkQueue, payload: &[u8]) -> bool {
        let num = wq.num();
        let consumed = self.consumed(num);
        if !Self::pending(wq, consumed) {
            return false;
        }
        let Some(entry) = wq.receive_entry(consumed as usize) else {
            return false;
        };

        let mut off = 0;
        for seg in entry.segments.iter().take_while(|s| !s.is_null()) {
            if off >= payload.len() {
                break;
            }
            let n = (seg.byte_count as usize).min(payload.len() - off);
            if !self.dma.device_write(seg.address, &payload[off..off + n]) {
                break;
            }
            off += n;
        }

        wq.cq().hw_ring().post(CompletionEntry {
            l3_ok: true,
            l4_ok: true,
            ..CompletionEntry::receive(consumed as u16, off as u32)
        });
        self.advance(num, 1);
        true
    }

    /// Receive `n` copies of `payload`; returns how many landed
    pub fn complete_receive_n(&self, wq: &WorkQueue, payload: &[u8], n: usize) -> usize {
        (0..n)
            .take_while(|_| self.complete_receive(wq, payload))
            .count()
    }

    /// Complete every send descriptor group published on `wq`; returns
    /// the number of completions written
    pub fn complete_send(&self, wq: &WorkQueue) -> usize {
        let num = wq.num();
        let mut consumed = self.consumed(num);
        let start = consumed;
        let mut written = 0;
        while Self::pending(wq, consumed) {
            let entry = wq.send_entry(consumed as usize);
            let step = match entry.as_ref().and_then(|e| e.control().map(|c| (e, *c))) {
                Some((e, ctrl)) => {
                    wq.cq()
                        .hw_ring()
                        .post(CompletionEntry::send(ctrl.wqe_index, ctrl.opcode));
                    written += 1;
                    e.wqebbs()
                }
                None => 1,
            };
            consumed = consumed.wrapping_add(step as u32);
        }
        self.advance(num, consumed.wrapping_sub(start));
        written
    }

    /// Completion counter and slot count of the next published
    /// descriptor of `wq`
    fn next_posted(&self, wq: &WorkQueue) -> Option<(u16, u32)> {
        let consumed = self.consumed(wq.num());
        if !Self::pending(wq, consumed) {
            return None;
        }
        match wq.kind() {
            QueueKind::Receive => Some((consumed as u16, 1)),
            QueueKind::Send => {
                let entry = wq.send_entry(consumed as usize)?;
                let counter = entry.control().map_or(consumed as u16, |c| c.wqe_index);
                Some((counter, entry.wqebbs().max(1) as u32))
            }
        }
    }

    /// Fail the next posted descriptor of `wq` with `syndrome`
    pub fn complete_with_error(&self, wq: &WorkQueue, syndrome: CqeSyndrome) -> bool {
        let Some((counter, step)) = self.next_posted(wq) else {
            return false;
        };
        let opcode = match wq.kind() {
            QueueKind::Receive => CqeOpcode::ResponderError,
            QueueKind::Send => CqeOpcode::RequesterError,
        };
        wq.cq()
            .hw_ring()
            .post(CompletionEntry::error(opcode, counter, syndrome));
        self.advance(wq.num(), step);
        true
    }

    /// Complete the next posted descriptor of `wq` with an entry the
    /// driver cannot interpret
    pub fn complete_malformed(&self, wq: &WorkQueue, defect: Malformed) -> bool {
        let Some((counter, step)) = self.next_posted(wq) else {
            return false;
        };
        let (good, foreign) = match wq.kind() {
            QueueKind::Receive => (CompletionEntry::receive(counter, 0), CqeOpcode::Requester),
            QueueKind::Send => (
                CompletionEntry::send(counter, SendOpcode::Send),
                CqeOpcode::Responder,
            ),
        };
        let entry = match defect {
            Malformed::Opcode => CompletionEntry {
                opcode: foreign,
                ..good
            },
            Malformed::Format => CompletionEntry {
                format: CqeFormat::Other(3),
                ..good
            },
        };
        wq.cq().hw_ring().post(entry);
        self.advance(wq.num(), step);
        true
    }

    fn fresh(state: &mut SimState) -> u32 {
        let num = state.next_num;
        state.next_num += 1;
        num
    }

    fn run(state: &mut SimState, cmd: &HwCommand) -> u32 {
        match cmd {
            HwCommand::CreateRq { .. } | HwCommand::CreateSq { .. } => {
                let num = Self::fresh(state);
                state.queue_states.insert(num, HwQueueState::Reset);
                num
            }
            HwCommand::CreateCq { .. }
            | HwCommand::CreateTis
            | HwCommand::CreateRqt { .. }
            | HwCommand::CreateTir { .. }
            | HwCommand::CreateFlowTable { .. }
            | HwCommand::CreateFlowGroup { .. } => Self::fresh(state),
            HwCommand::StartRq { rq: num } | HwCommand::StartSq { sq: num } => {
                state.queue_states.insert(*num, HwQueueState::Ready);
                0
            }
            HwCommand::StopRq { rq: num } | HwCommand::StopSq { sq: num } => {
                state.queue_states.insert(*num, HwQueueState::Reset);
                0
            }
            HwCommand::DestroyRq { rq: num } | HwCommand::DestroySq { sq: num } => {
                state.queue_states.remove(num);
                0
            }
            HwCommand::QueryQueueState { num, .. } => state
                .queue_states
                .get(num)
                .copied()
                .unwrap_or(HwQueueState::Reset)
                .to_raw(),
            _ => 0,
        }
    }
}

impl HardwareControl for SimDevice {
    fn execute(&self, cmd: &HwCommand) -> Result<u32, HwError> {
        let mut state = self.state.lock();
        if let Some((skip, left)) = state.failures.get_mut(cmd.name()) {
            if *skip > 0 {
                *skip -= 1;
            } else if *left > 0 {
                *left -= 1;
                return Err(HwError::Rejected {
                    status: 0x03,
                    detail: "injected failure".into(),
                });
            }
        }
        let out = Self::run(&mut state, cmd);
        state.log.push(cmd.clone());
        Ok(out)
    }
}

impl DeviceAccess for SimDevice {
    fn sync_for_device(&self, region: DmaRegion) {
        if let Some(target) = FaultTarget::of(region).filter(|t| *t != FaultTarget::Uar) {
            self.state.lock().trip(target);
        }
    }

    fn sync_for_cpu(&self, region: DmaRegion) {
        if let DmaRegion::Buffer { .. } = region {
            self.state.lock().trip(FaultTarget::Buffers);
        }
    }

    fn write_uar(&self, reg: UarRegister, value: u64) {
        let mut state = self.state.lock();
        match reg {
            UarRegister::Blueflame { sq } => {
                state.blueflame.entry(sq).or_default().push(value);
                state.trip(FaultTarget::Uar);
            }
            UarRegister::CqArm { .. } => state.arm_writes += 1,
        }
    }

    fn fault_status(&self, region: DmaRegion) -> FaultStatus {
        match FaultTarget::of(region) {
            Some(target) if self.state.lock().faulted.contains(&target) => FaultStatus::Fault,
            _ => FaultStatus::Ok,
        }
    }

    fn clear_fault(&self, region: DmaRegion) {
        if let Some(target) = FaultTarget::of(region) {
            self.state.lock().faulted.remove(&target);
        }
    }
}

/// Network stack that keeps what it is given
#[derive(Default)]
pub struct SimStack {
    delivered: Mutex<Vec<(u32, RxPacket)>>,
    fail_alloc: AtomicBool,
}

impl std::fmt::Debug for SimStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStack")
            .field("delivered", &self.delivered.lock().len())
            .finish()
    }
}

impl SimStack {
    /// Packets delivered since the last call, with their receive queue
    pub fn take_delivered(&self) -> Vec<(u32, RxPacket)> {
        std::mem::take(&mut *self.delivered.lock())
    }

    /// Packets waiting to be taken
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Refuse copy-fallback allocations while set
    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::Release);
    }
}

impl NetworkStack for SimStack {
    fn deliver_rx(&self, wq: u32, packets: Vec<RxPacket>) {
        self.delivered
            .lock()
            .extend(packets.into_iter().map(|p| (wq, p)));
    }

    fn alloc_rx(&self, len: usize) -> Option<BytesMut> {
        (!self.fail_alloc.load(Ordering::Acquire)).then(|| BytesMut::with_capacity(len))
    }
}

/// A device context wired to a [`SimDevice`], a [`SimStack`] and a
/// channel diagnostic sink
pub struct SimHarness {
    /// The adapter
    pub device: Arc<SimDevice>,
    /// The stack
    pub stack: Arc<SimStack>,
    /// Packet and ring memory
    pub dma: Arc<HeapDmaAllocator>,
    /// Diagnostic events
    pub diag: Receiver<DiagnosticEvent>,
    /// The assembled context
    pub ctx: Arc<DeviceContext>,
}

impl SimHarness {
    /// Validate `config` and assemble the context
    pub fn new(config: DatapathConfig) -> DatapathResult<Self> {
        let dma = Arc::new(HeapDmaAllocator::default());
        let device = Arc::new(SimDevice::new(Arc::clone(&dma)));
        let stack = Arc::new(SimStack::default());
        let (sink, diag) = ChannelDiagnostics::new(256);
        let ctx = DeviceContext::new(
            config,
            device.clone(),
            device.clone(),
            dma.clone(),
            Arc::new(sink),
            stack.clone(),
        )?;
        Ok(Self {
            device,
            stack,
            dma,
            diag,
            ctx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failure_not_logged() {
        let dma = Arc::new(HeapDmaAllocator::default());
        let dev = SimDevice::new(dma);
        dev.fail_command("CREATE_TIS", 1);
        assert!(dev.execute(&HwCommand::CreateTis).is_err());
        assert_eq!(dev.execute(&HwCommand::CreateTis), Ok(1));
        assert_eq!(dev.execute(&HwCommand::CreateTis), Ok(2));
        assert_eq!(dev.command_count("CREATE_TIS"), 2);
    }

    #[test]
    fn test_queue_state_follows_commands() {
        let dev = SimDevice::new(Arc::new(HeapDmaAllocator::default()));
        let rq = dev.execute(&HwCommand::CreateRq { cq: 1, log_size: 4 }).unwrap();
        let query = HwCommand::QueryQueueState {
            kind: QueueKind::Receive,
            num: rq,
        };
        assert_eq!(dev.execute(&query), Ok(0));
        dev.execute(&HwCommand::StartRq { rq }).unwrap();
        assert_eq!(dev.execute(&query), Ok(1));
        dev.set_queue_state(rq, HwQueueState::Error);
        assert_eq!(dev.execute(&query), Ok(3));
    }

    #[test]
    fn test_fault_trips_once_per_injection() {
        let dev = SimDevice::new(Arc::new(HeapDmaAllocator::default()));
        let region = DmaRegion::WqDoorbell { wq: 7 };
        dev.inject_fault(FaultTarget::WqDoorbell(7), 1);

        dev.sync_for_device(DmaRegion::WqDoorbell { wq: 8 });
        assert_eq!(dev.fault_status(region), FaultStatus::Ok);
        dev.sync_for_device(region);
        assert_eq!(dev.fault_status(region), FaultStatus::Fault);
        dev.clear_fault(region);
        dev.sync_for_device(region);
        assert_eq!(dev.fault_status(region), FaultStatus::Ok);
    }

    #[test]
    fn test_arm_writes_do_not_trip_uar() {
        let dev = SimDevice::new(Arc::new(HeapDmaAllocator::default()));
        dev.inject_fault(FaultTarget::Uar, 1);
        dev.write_uar(UarRegister::CqArm { cq: 1 }, 0);
        assert_eq!(dev.fault_status(DmaRegion::Uar), FaultStatus::Ok);
        dev.write_uar(UarRegister::Blueflame { sq: 2 }, 0xab);
        assert_eq!(dev.fault_status(DmaRegion::Uar), FaultStatus::Fault);
        assert_eq!(dev.last_doorbell(2), Some(0xab));
        assert_eq!(dev.arm_writes(), 1);
    }

    #[test]
    fn test_stack_copy_fallback_toggle() {
        let stack = SimStack::default();
        assert!(stack.alloc_rx(64).is_some());
        stack.set_fail_alloc(true);
        assert!(stack.alloc_rx(64).is_none());
        assert_eq!(stack.delivered_count(), 0);
    }
}
