//! Completion queues
//!
//! Each work queue is paired with one completion queue. Hardware writes
//! completion entries into the CQ ring; the interrupt path polls them,
//! matches each to the buffer posted at that WQE counter, and hands the
//! buffer to receive or send processing.
//!
//! # Design
//!
//! - Posted buffers wait on one of two lists: receive posts and refills
//!   append to the primary list under the CQ lock, the send path appends
//!   to the secondary list under its own lock so it never needs the CQ
//!   lock
//! - Polling merges the secondary list into the primary one when a
//!   lookup misses and bumps a generation counter, so the send path can
//!   tell whether a buffer it just appended is still where it left it
//! - Teardown is flagged atomically first so pollers and refill workers
//!   bail out, then runs under the CQ lock, then re-takes the event queue
//!   and CQ locks in interrupt order to unlink

use crate::batch::ReturnBatch;
use crate::buffer::{return_buffer, Buffer, BufferId};
use crate::descriptor::{CompletionEntry, CqeFormat, CqeOpcode, CqeSyndrome, SendOpcode};
use crate::device::DeviceContext;
use crate::diag::{DiagValue, DiagnosticEvent, CLASS_CQE_ERR};
use crate::dma::DmaBuffer;
use crate::eq::EventQueue;
use crate::error::DatapathResult;
use crate::hw::{DmaRegion, FaultStatus, HwCommand, QueueKind, ServiceImpact, UarRegister};
use crate::lifecycle::{CqState, Lifecycle};
use crate::lock_order::{LockClass, OrderedGuard, OrderedMutex};
use crate::stack::{RxChecksum, RxData, RxPacket};
use crate::wq::WorkQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Bytes per completion entry in ring memory
pub const CQE_SIZE: usize = 64;

/// Bytes of doorbell record memory
pub const CQ_DOORBELL_SIZE: usize = 64;

/// Arm command sequence lives in the top bits of the arm doorbell
const ARM_SEQ_SHIFT: u32 = 28;

const CI_MASK: u32 = 0x00ff_ffff;

/// Hardware-written completion ring
pub struct CompletionRing {
    shift: u32,
    slots: Box<[Mutex<CompletionEntry>]>,
    pi: AtomicU32,
}

impl CompletionRing {
    fn new(shift: u32) -> Self {
        let slots = (0..1usize << shift)
            .map(|_| Mutex::new(CompletionEntry::INVALID))
            .collect();
        Self {
            shift,
            slots,
            pi: AtomicU32::new(0),
        }
    }

    /// Entries in the ring
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Device side: write `entry` at the producer position with the
    /// ownership parity of the current pass
    pub fn post(&self, mut entry: CompletionEntry) {
        let pi = self.pi.fetch_add(1, Ordering::AcqRel);
        entry.owner = (pi >> self.shift) & 1 == 1;
        let idx = pi as usize & (self.slots.len() - 1);
        *self.slots[idx].lock() = entry;
    }

    /// Entries written by the device so far
    pub fn produced(&self) -> u32 {
        self.pi.load(Ordering::Acquire)
    }

    fn peek(&self, ci: u32) -> Option<CompletionEntry> {
        let idx = ci as usize & (self.slots.len() - 1);
        let entry = *self.slots[idx].lock();
        let parity = (ci >> self.shift) & 1 == 1;
        (entry.opcode != CqeOpcode::Invalid && entry.owner == parity).then_some(entry)
    }
}

#[derive(Default)]
struct CqDoorbell {
    ci: AtomicU32,
    arm: AtomicU32,
}

/// State guarded by the CQ lock
pub(crate) struct CqInner {
    pub(crate) state: CqState,
    pub(crate) eq_linked: bool,
    cc: u32,
    arm_seq: u32,
    pub(crate) buffers: VecDeque<Buffer>,
    pub(crate) wq: Weak<WorkQueue>,
    ring_mem: Option<DmaBuffer>,
    doorbell_mem: Option<DmaBuffer>,
}

#[derive(Default)]
struct PendingReturns {
    buffers: Vec<Buffer>,
    gen: u64,
}

/// Result of one poll pass
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Completion entries consumed
    pub completions: usize,
    /// Receive queue the packets came from
    pub wq: Option<u32>,
    /// Packets for the network stack
    pub packets: Vec<RxPacket>,
}

/// A completion queue paired with one work queue
pub struct CompletionQueue {
    ctx: Arc<DeviceContext>,
    kind: QueueKind,
    num: u32,
    eq: Arc<EventQueue>,
    ring: CompletionRing,
    doorbell: CqDoorbell,
    teardown: AtomicBool,
    armed: AtomicBool,
    buffer_count: AtomicU64,
    pub(crate) inner: OrderedMutex<CqInner>,
    pending: OrderedMutex<PendingReturns>,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("num", &self.num)
            .field("kind", &self.kind)
            .field("eq", &self.eq.num())
            .field("buffers", &self.buffer_count())
            .finish()
    }
}

impl CompletionQueue {
    /// Allocate ring memory, create the hardware CQ on `eq`, link it into
    /// the event queue and arm it
    pub fn setup(
        ctx: &Arc<DeviceContext>,
        kind: QueueKind,
        eq: &Arc<EventQueue>,
    ) -> DatapathResult<Arc<Self>> {
        let config = ctx.config();
        let shift = config.cq_size_shift;
        let nents = 1usize << shift;

        let mut state = CqState::Init;
        let ring_mem = ctx.dma().alloc(nents * CQE_SIZE)?;
        let doorbell_mem = ctx.dma().alloc(CQ_DOORBELL_SIZE)?;
        state.transition(CqState::Allocated)?;

        let moderation_count = config.cqemod_count.min((nents as u32 * 8) / 10);
        let num = ctx.exec(&HwCommand::CreateCq {
            eq: eq.num(),
            log_size: shift,
            moderation_period: config.cqemod_period_usec,
            moderation_count,
        })?;
        state.transition(CqState::Created)?;

        let cq = Arc::new(Self {
            ctx: Arc::clone(ctx),
            kind,
            num,
            eq: Arc::clone(eq),
            ring: CompletionRing::new(shift),
            doorbell: CqDoorbell::default(),
            teardown: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            buffer_count: AtomicU64::new(0),
            inner: OrderedMutex::new(
                LockClass::CompletionQueue,
                CqInner {
                    state,
                    eq_linked: false,
                    cc: 0,
                    arm_seq: 0,
                    buffers: VecDeque::new(),
                    wq: Weak::new(),
                    ring_mem: Some(ring_mem),
                    doorbell_mem: Some(doorbell_mem),
                },
            ),
            pending: OrderedMutex::with_default(LockClass::PendingReturns),
        });
        eq.link(&cq);
        tracing::debug!(cq = num, eq = eq.num(), kind = kind.as_str(), "completion queue created");
        Ok(cq)
    }

    /// Hardware CQ number
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Kind of the paired work queue
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Owning event queue
    pub fn eq(&self) -> &Arc<EventQueue> {
        &self.eq
    }

    /// Device side of the completion ring
    pub fn hw_ring(&self) -> &CompletionRing {
        &self.ring
    }

    /// Consumer counter last published to the device
    pub fn doorbell_ci(&self) -> u32 {
        self.doorbell.ci.load(Ordering::Acquire)
    }

    /// Last arm doorbell value
    pub fn doorbell_arm(&self) -> u32 {
        self.doorbell.arm.load(Ordering::Acquire)
    }

    /// Buffers posted to the paired WQ and not yet completed
    pub fn buffer_count(&self) -> u64 {
        self.buffer_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_buffer_count(&self, n: u64) {
        self.buffer_count.fetch_add(n, Ordering::AcqRel);
    }

    /// Whether teardown has begun
    pub fn is_teardown(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    /// Whether the CQ is armed for an interrupt
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Lifecycle state
    pub fn state(&self) -> CqState {
        self.inner.lock().state
    }

    /// Whether the CQ is in its event queue's index
    pub fn is_linked(&self) -> bool {
        self.inner.lock().eq_linked
    }

    /// Buffers waiting on the primary and secondary pending lists
    pub fn pending_buffers(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let b = self.pending.lock().buffers.len();
        (inner.buffers.len(), b)
    }

    pub(crate) fn lock_inner(&self) -> OrderedGuard<'_, CqInner> {
        self.inner.lock()
    }

    pub(crate) fn attach_wq(&self, wq: &Arc<WorkQueue>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.wq.upgrade().is_none());
        inner.wq = Arc::downgrade(wq);
    }

    /// Append a send chain to the secondary list; returns the generation
    /// it landed in. The chain is counted before a poll can see it.
    pub(crate) fn push_pending(&self, buf: Buffer) -> u64 {
        self.buffer_count.fetch_add(1, Ordering::AcqRel);
        let mut pending = self.pending.lock();
        pending.buffers.push(buf);
        pending.gen
    }

    /// Take back buffer `id` after a failed doorbell, if no poll has
    /// merged the secondary list since it was appended. `None` means it
    /// moved to the primary list; see [`Self::reclaim_merged`].
    pub(crate) fn reclaim_pending(&self, id: BufferId, gen: u64) -> Option<Buffer> {
        let mut pending = self.pending.lock();
        if pending.gen != gen {
            return None;
        }
        let pos = pending.buffers.iter().rposition(|b| b.id() == id)?;
        let buf = pending.buffers.swap_remove(pos);
        self.buffer_count.fetch_sub(1, Ordering::AcqRel);
        Some(buf)
    }

    /// Take a failed send's chain off the primary list. Takes the CQ lock,
    /// so the WQ lock must not be held. `None` once its completion has
    /// consumed it.
    pub(crate) fn reclaim_merged(&self, id: BufferId) -> Option<Buffer> {
        let mut inner = self.inner.lock();
        let pos = inner.buffers.iter().position(|b| b.id() == id)?;
        let buf = inner.buffers.remove(pos)?;
        self.buffer_count.fetch_sub(1, Ordering::AcqRel);
        Some(buf)
    }

    /// Write the arm doorbell so the next completion raises an event
    pub(crate) fn arm(&self, inner: &mut CqInner) {
        let value = (inner.arm_seq << ARM_SEQ_SHIFT) | (inner.cc & CI_MASK);
        self.doorbell.arm.store(value, Ordering::Release);
        self.ctx
            .access()
            .write_uar(UarRegister::CqArm { cq: self.num }, u64::from(value));
        inner.arm_seq = (inner.arm_seq + 1) & 0x3;
        self.armed.store(true, Ordering::Release);
    }

    /// Consume up to `budget` completion entries.
    ///
    /// Caller holds the CQ lock (and, on the interrupt path, the event
    /// queue lock before it).
    pub(crate) fn poll(&self, inner: &mut CqInner, budget: usize) -> PollOutcome {
        let mut out = PollOutcome::default();
        if self.is_teardown() || inner.state != CqState::Created {
            return out;
        }
        let access = self.ctx.access();
        let wq = inner.wq.upgrade();
        out.wq = wq.as_ref().map(|wq| wq.num());

        access.sync_for_cpu(DmaRegion::CqEntries { cq: self.num });
        let mut batch = ReturnBatch::new();

        while out.completions < budget && !self.is_teardown() {
            let Some(ent) = self.ring.peek(inner.cc) else {
                break;
            };
            inner.cc = inner.cc.wrapping_add(1);
            out.completions += 1;

            if self.kind == QueueKind::Send
                && ent.opcode == CqeOpcode::Requester
                && ent.send_opcode == SendOpcode::Nop
            {
                if let Some(wq) = &wq {
                    wq.release_slots(1);
                }
                continue;
            }

            let Some(buf) = self.find_buffer(inner, ent.wqe_counter) else {
                tracing::warn!(cq = self.num, wqe_counter = ent.wqe_counter, "completion for unknown descriptor");
                continue;
            };
            self.buffer_count.fetch_sub(1, Ordering::AcqRel);

            match self.kind {
                QueueKind::Send => {
                    if let Some(wq) = &wq {
                        wq.release_slots(buf.wqebbs().max(1));
                    }
                    self.tx_completion(wq.as_ref(), &ent, buf, &mut batch);
                }
                QueueKind::Receive => {
                    if let Some(wq) = &wq {
                        wq.release_slots(1);
                    }
                    if let Some(pkt) = self.rx_completion(inner, wq.as_ref(), &ent, buf) {
                        out.packets.push(pkt);
                    }
                }
            }
        }

        if out.completions > 0 {
            self.doorbell.ci.store(inner.cc & CI_MASK, Ordering::Release);
            access.sync_for_device(DmaRegion::CqDoorbell { cq: self.num });
        }
        batch.flush();
        if !self.is_teardown() {
            self.arm(inner);
        }
        out
    }

    /// Hand received packets to the network stack; no locks held
    pub(crate) fn deliver(&self, wq: u32, packets: Vec<RxPacket>) {
        self.ctx.stack().deliver_rx(wq, packets);
    }

    fn find_buffer(&self, inner: &mut CqInner, counter: u16) -> Option<Buffer> {
        loop {
            if let Some(pos) = inner
                .buffers
                .iter()
                .position(|b| b.wqe_index() as u16 == counter)
            {
                return inner.buffers.remove(pos);
            }
            let mut pending = self.pending.lock();
            if pending.buffers.is_empty() {
                return None;
            }
            pending.gen += 1;
            inner.buffers.extend(pending.buffers.drain(..));
        }
    }

    fn report_cqe_error(&self, wq: Option<&Arc<WorkQueue>>, ent: &CompletionEntry) {
        let syndrome = CqeSyndrome::from_raw(ent.syndrome);
        self.ctx.stats().record_cqe_error();
        tracing::warn!(
            cq = self.num,
            syndrome = syndrome.name(),
            wqe_counter = ent.wqe_counter,
            "hardware reported completion error"
        );
        self.ctx.diag().emit(
            DiagnosticEvent::new(CLASS_CQE_ERR)
                .field("syndrome", DiagValue::Str(syndrome.name().to_string()))
                .field("syndrome_num", DiagValue::U8(ent.syndrome))
                .field("vendor_syndrome", DiagValue::U8(ent.vendor_syndrome))
                .field("wqe_counter", DiagValue::U16(ent.wqe_counter))
                .field("wq_type", DiagValue::Str(self.kind.as_str().to_string()))
                .field("cq_num", DiagValue::U32(self.num))
                .field("wq_num", DiagValue::U32(wq.map_or(0, |wq| wq.num()))),
        );
        self.ctx.health().report(ServiceImpact::Degraded);
    }

    fn malformed(&self, what: &'static str, ent: &CompletionEntry) {
        tracing::warn!(cq = self.num, opcode = ?ent.opcode, send_opcode = ?ent.send_opcode, format = ?ent.format, "unexpected completion {what}");
        self.ctx.stats().record_malformed();
    }

    fn tx_completion(
        &self,
        wq: Option<&Arc<WorkQueue>>,
        ent: &CompletionEntry,
        buf: Buffer,
        batch: &mut ReturnBatch,
    ) {
        match ent.opcode {
            CqeOpcode::RequesterError => {
                self.report_cqe_error(wq, ent);
                batch.push_chain(buf);
                if let Some(wq) = wq {
                    wq.check_health();
                }
                return;
            }
            CqeOpcode::Requester => {}
            _ => {
                self.malformed("opcode", ent);
                batch.push_chain(buf);
                return;
            }
        }
        if !matches!(ent.send_opcode, SendOpcode::Send | SendOpcode::Lso) {
            self.malformed("send opcode", ent);
            batch.push_chain(buf);
            return;
        }
        if ent.format != CqeFormat::Basic {
            self.malformed("format", ent);
            batch.push_chain(buf);
            return;
        }

        let bytes = buf.used() + buf.chain().iter().map(Buffer::used).sum::<usize>();
        self.ctx.stats().record_tx(bytes as u64);
        batch.push_chain(buf);
    }

    fn rx_completion(
        &self,
        inner: &mut CqInner,
        wq: Option<&Arc<WorkQueue>>,
        ent: &CompletionEntry,
        mut buf: Buffer,
    ) -> Option<RxPacket> {
        let stats = self.ctx.stats();
        match ent.opcode {
            CqeOpcode::ResponderError => {
                self.report_cqe_error(wq, ent);
                return_buffer(buf);
                if let Some(wq) = wq {
                    wq.check_health();
                }
                return None;
            }
            CqeOpcode::Responder => {}
            _ => {
                self.malformed("opcode", ent);
                return_buffer(buf);
                return None;
            }
        }
        if ent.format != CqeFormat::Basic {
            self.malformed("format", ent);
            return_buffer(buf);
            return None;
        }

        stats.record_rx_drops(u64::from(ent.rx_drop_counter));

        let access = self.ctx.access();
        let region = buf.dma().region();
        access.sync_for_cpu(region);
        if access.fault_status(region) == FaultStatus::Fault {
            access.clear_fault(region);
            tracing::warn!(cq = self.num, buffer = buf.id(), "receive buffer sync fault");
            return_buffer(buf);
            return None;
        }

        // Loaning zeroes the index.
        let wqe_index = buf.wqe_index();
        let used = (ent.byte_count as usize).min(buf.dma().len());
        buf.set_used(used);

        let loan = match buf.shard() {
            Some(shard) => shard.loan(buf),
            None => Err(buf),
        };
        let (data, loaned) = match loan {
            Ok(loan) => (RxData::Loaned(loan), true),
            Err(buf) => {
                let Some(mut copy) = self.ctx.stack().alloc_rx(used) else {
                    stats.record_rx_drops(1);
                    return_buffer(buf);
                    return None;
                };
                copy.clear();
                buf.dma().with_bytes(used, |b| copy.extend_from_slice(b));
                return_buffer(buf);
                (RxData::Copied(copy.freeze()), false)
            }
        };
        stats.record_rx(used as u64, loaned);

        if wqe_index & 0x7 == 0 {
            if let Some(wq) = wq {
                let mut wq_inner = wq.lock_inner();
                if !wq_inner.is_teardown() {
                    crate::refill::refill(wq, inner, &mut wq_inner);
                }
            }
        }

        Some(RxPacket {
            data,
            checksum: RxChecksum {
                l3_ok: ent.l3_ok,
                l4_ok: ent.l4_ok,
            },
        })
    }

    /// Return every posted buffer to its shard (queue stopped or being
    /// destroyed)
    pub fn return_pending(&self) -> usize {
        let doomed = {
            let mut inner = self.inner.lock();
            self.drain_lists(&mut inner)
        };
        let n = doomed.len();
        for buf in doomed {
            return_buffer(buf);
        }
        n
    }

    fn drain_lists(&self, inner: &mut CqInner) -> Vec<Buffer> {
        let mut doomed: Vec<Buffer> = inner.buffers.drain(..).collect();
        let mut pending = self.pending.lock();
        pending.gen += 1;
        doomed.append(&mut pending.buffers);
        self.buffer_count.store(0, Ordering::Release);
        doomed
    }

    /// Flag teardown and wake anything waiting on the paired WQ's shard
    pub fn quiesce(&self) {
        self.teardown.store(true, Ordering::Release);
        let wq = self.inner.lock().wq.upgrade();
        if let Some(wq) = wq {
            wq.shard().wake_waiters();
        }
    }

    /// Destroy the hardware CQ, release its memory, return every pending
    /// buffer and unlink from the event queue. Safe to call repeatedly.
    pub fn teardown(&self) {
        self.quiesce();

        let (doomed, linked) = {
            let mut inner = self.inner.lock();
            if inner.state == CqState::Destroyed {
                return;
            }
            if inner.state == CqState::Created {
                self.ctx.exec_best_effort(&HwCommand::DestroyCq { cq: self.num });
            }
            inner.ring_mem = None;
            inner.doorbell_mem = None;
            if let Err(e) = inner.state.transition(CqState::Destroyed) {
                tracing::warn!(cq = self.num, error = %e, "completion queue state");
            }
            (self.drain_lists(&mut inner), inner.eq_linked)
        };
        let returned = doomed.len();
        for buf in doomed {
            return_buffer(buf);
        }

        if linked {
            self.eq.unlink(self);
        }
        tracing::debug!(cq = self.num, returned, "completion queue torn down");
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        for buf in self.inner.get_mut().buffers.drain(..) {
            return_buffer(buf);
        }
        for buf in self.pending.get_mut().buffers.drain(..) {
            return_buffer(buf);
        }
    }
}
