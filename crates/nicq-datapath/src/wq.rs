//! Work queues
//!
//! A work queue is a power-of-two ring of descriptors the device consumes.
//! Receive queues carry scatter lists pointing at empty buffers; send
//! queues carry descriptor groups describing outgoing packets. Each WQ owns
//! the buffer shard that feeds it and is paired with one completion queue.
//!
//! # Design
//!
//! - The producer counter only advances under the WQ lock; slots are
//!   released by the completion path with an atomic decrement
//! - Descriptor slots are flushed before the doorbell record, and the
//!   doorbell record before the doorbell register
//! - The send path snapshots the slots in use once, then bounds every slot
//!   it writes against that snapshot
//! - A posted send chain goes to the completion queue's secondary list, so
//!   the send path never takes the CQ lock

use crate::buffer::{return_buffer, return_chain, Buffer, BufferId, BufferShard};
use crate::cq::{CompletionQueue, CqInner};
use crate::descriptor::{
    ControlSegment, DataSegment, EthSegment, RecvEntry, SendEntry, SendOpcode, SendSlot,
    ETH_INLINE_BUILTIN, HEAD_DATA_SEGS, HEAD_DS_PREAMBLE, MAX_INLINE_HEADERLEN, SQE_BUF,
    SQE_MAX_DS, SQE_MAX_PTRS, WQE_OCTOWORD,
};
use crate::device::DeviceContext;
use crate::diag::{DiagValue, DiagnosticEvent, CLASS_QSTATE_ERR};
use crate::dma::DmaBuffer;
use crate::error::{DatapathError, DatapathResult};
use crate::hw::{
    DmaRegion, FaultStatus, HwCommand, HwQueueState, QueueKind, ServiceImpact, UarRegister,
};
use crate::lifecycle::{Lifecycle, WqState};
use crate::lock_order::{LockClass, OrderedGuard, OrderedMutex};
use crate::refill::RefillJob;
use crate::stack::{TxContext, TxPacket};
use bytes::{Bytes, BytesMut};
use crossbeam::channel::Sender;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Bytes per send queue slot
pub const SQE_SIZE: usize = 64;

/// Bytes of doorbell record memory
pub const WQ_DOORBELL_SIZE: usize = 64;

/// Bytes per scatter pointer in a receive slot
const RQE_SEGMENT_SIZE: usize = 16;

/// Copy attempts on a transmit fragment before giving up
pub const BIND_MAX_ATTEMPTS: usize = 3;

const COUNTER_MASK: u32 = 0xffff;

/// A send descriptor group the ring did not take
#[derive(Debug)]
pub struct SendRejected {
    /// Why
    pub error: DatapathError,
    /// The chain, unless a completion poll already moved it to the
    /// completion queue's primary list
    pub buffer: Option<Buffer>,
    /// Head of a chain that sits on the primary list; take it back with
    /// the WQ lock released
    pub merged: Option<BufferId>,
}

enum WqRing {
    Recv(Vec<RecvEntry>),
    Send(Vec<SendEntry>),
}

#[derive(Default)]
struct WqDoorbell {
    recv_counter: AtomicU32,
    send_counter: AtomicU32,
}

/// State guarded by the WQ lock
pub(crate) struct WqInner {
    pub(crate) state: WqState,
    pub(crate) buffers_loaded: bool,
    pub(crate) refilling: bool,
    pub(crate) refill_tx: Option<Sender<RefillJob>>,
    pc: u32,
    ring: WqRing,
    /// Ring memory and doorbell record
    memory: Option<(DmaBuffer, DmaBuffer)>,
}

impl WqInner {
    pub(crate) fn is_teardown(&self) -> bool {
        matches!(self.state, WqState::Teardown | WqState::Destroyed)
    }
}

/// A send or receive descriptor ring
pub struct WorkQueue {
    ctx: Arc<DeviceContext>,
    kind: QueueKind,
    num: u32,
    shift: u32,
    cq: Arc<CompletionQueue>,
    shard: Arc<BufferShard>,
    foreign: Option<Arc<BufferShard>>,
    wqebb_used: AtomicU64,
    doorbell: WqDoorbell,
    inner: OrderedMutex<WqInner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("num", &self.num)
            .field("kind", &self.kind)
            .field("cq", &self.cq.num())
            .field("wqebb_used", &self.wqebb_used())
            .finish()
    }
}

struct SendGroup {
    entries: Vec<SendEntry>,
    next: usize,
    ds: u8,
}

impl SendGroup {
    fn new(head: SendEntry) -> Self {
        Self {
            entries: vec![head],
            next: 0,
            ds: HEAD_DS_PREAMBLE,
        }
    }

    fn next_slot(&mut self) -> DatapathResult<&mut SendSlot> {
        if self.ds >= SQE_MAX_DS {
            return Err(DatapathError::InvalidDescriptor(format!(
                "descriptor group exceeds {SQE_MAX_DS} units"
            )));
        }
        let full = self
            .entries
            .last()
            .map_or(true, |e| self.next >= e.slots().len());
        if full {
            if self.entries.len() >= SQE_BUF {
                return Err(DatapathError::InvalidDescriptor(format!(
                    "descriptor group needs more than {SQE_BUF} slots"
                )));
            }
            self.entries.push(SendEntry::extra());
            self.next = 0;
        }
        self.ds += 1;
        let i = self.next;
        self.next += 1;
        self.entries
            .last_mut()
            .and_then(|e| e.slots_mut().get_mut(i))
            .ok_or_else(|| DatapathError::InvalidDescriptor("descriptor slot out of range".into()))
    }

    fn finish(mut self) -> Vec<SendEntry> {
        let ds = self.ds;
        if let Some(SendEntry::Head { ctrl, .. }) = self.entries.first_mut() {
            ctrl.ds_count = ds;
        }
        self.entries
    }
}

impl WorkQueue {
    /// Allocate ring memory and create the hardware queue paired with
    /// `cq`. Send queues need a transmit interface. On failure nothing is
    /// left behind on the device.
    pub fn setup(
        ctx: &Arc<DeviceContext>,
        cq: &Arc<CompletionQueue>,
        tis: Option<u32>,
    ) -> DatapathResult<Arc<Self>> {
        let kind = cq.kind();
        let config = ctx.config();
        let shift = match kind {
            QueueKind::Send => config.sq_size_shift,
            QueueKind::Receive => config.rq_size_shift,
        };
        let nents = 1usize << shift;

        let mut state = WqState::Init;
        let memory = Self::alloc(ctx, kind, nents)?;
        state.transition(WqState::Allocated)?;

        let cmd = match kind {
            QueueKind::Receive => HwCommand::CreateRq {
                cq: cq.num(),
                log_size: shift,
            },
            QueueKind::Send => HwCommand::CreateSq {
                cq: cq.num(),
                tis: tis.ok_or_else(|| {
                    DatapathError::Config("send queue needs a transmit interface".into())
                })?,
                log_size: shift,
            },
        };
        let num = ctx.exec(&cmd)?;
        state.transition(WqState::Created)?;

        let label = format!("{}-{}", kind.as_str(), num);
        let shard = BufferShard::new(label.clone(), config.rx_p50_loan_min_size);
        let foreign =
            (kind == QueueKind::Send).then(|| BufferShard::new(format!("{label}-foreign"), 0));
        let ring = match kind {
            QueueKind::Receive => WqRing::Recv(vec![
                RecvEntry {
                    segments: vec![DataSegment::NULL; config.recvq_max_ptrs],
                };
                nents
            ]),
            QueueKind::Send => WqRing::Send(vec![SendEntry::Empty; nents]),
        };

        let wq = Arc::new(Self {
            ctx: Arc::clone(ctx),
            kind,
            num,
            shift,
            cq: Arc::clone(cq),
            shard,
            foreign,
            wqebb_used: AtomicU64::new(0),
            doorbell: WqDoorbell::default(),
            inner: OrderedMutex::new(
                LockClass::WorkQueue,
                WqInner {
                    state,
                    buffers_loaded: false,
                    refilling: false,
                    refill_tx: None,
                    pc: 0,
                    ring,
                    memory: Some(memory),
                },
            ),
        });
        cq.attach_wq(&wq);
        tracing::debug!(wq = num, cq = cq.num(), kind = kind.as_str(), nents, "work queue created");
        Ok(wq)
    }

    /// Ring memory plus doorbell record, all or nothing
    fn alloc(
        ctx: &DeviceContext,
        kind: QueueKind,
        nents: usize,
    ) -> DatapathResult<(DmaBuffer, DmaBuffer)> {
        let entry_size = match kind {
            QueueKind::Send => SQE_SIZE,
            QueueKind::Receive => RQE_SEGMENT_SIZE * ctx.config().recvq_max_ptrs,
        };
        let ring = ctx.dma().alloc(nents * entry_size)?;
        let doorbell = ctx.dma().alloc(WQ_DOORBELL_SIZE)?;
        Ok((ring, doorbell))
    }

    /// Hardware queue number
    pub fn num(&self) -> u32 {
        self.num
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Send or receive
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Ring slots
    pub fn nents(&self) -> usize {
        1 << self.shift
    }

    /// Paired completion queue
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    /// Shard of driver-owned buffers feeding this queue
    pub fn shard(&self) -> &Arc<BufferShard> {
        &self.shard
    }

    /// Shard of memory-less buffers used to bind stack memory (send only)
    pub fn foreign_shard(&self) -> Option<&Arc<BufferShard>> {
        self.foreign.as_ref()
    }

    /// Ring slots written and not yet completed
    pub fn wqebb_used(&self) -> u64 {
        self.wqebb_used.load(Ordering::Acquire)
    }

    pub(crate) fn release_slots(&self, n: usize) {
        let _ = self
            .wqebb_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(n as u64))
            });
    }

    /// Lifecycle state
    pub fn state(&self) -> WqState {
        self.inner.lock().state
    }

    /// Whether the initial receive buffers have been posted
    pub fn buffers_loaded(&self) -> bool {
        self.inner.lock().buffers_loaded
    }

    /// Whether a background refill is queued or running
    pub fn is_refilling(&self) -> bool {
        self.inner.lock().refilling
    }

    /// Producer counter
    pub fn producer_counter(&self) -> u32 {
        self.inner.lock().pc
    }

    /// Producer counter last published in the doorbell record
    pub fn doorbell_counter(&self) -> u32 {
        let counter = match self.kind {
            QueueKind::Send => &self.doorbell.send_counter,
            QueueKind::Receive => &self.doorbell.recv_counter,
        };
        counter.load(Ordering::Acquire)
    }

    /// Whether ring memory is still held
    pub fn has_memory(&self) -> bool {
        self.inner.lock().memory.is_some()
    }

    /// Device view of receive slot `index`
    pub fn receive_entry(&self, index: usize) -> Option<RecvEntry> {
        match &self.inner.lock().ring {
            WqRing::Recv(ring) => ring.get(index & (self.nents() - 1)).cloned(),
            WqRing::Send(_) => None,
        }
    }

    /// Device view of send slot `index`
    pub fn send_entry(&self, index: usize) -> Option<SendEntry> {
        match &self.inner.lock().ring {
            WqRing::Send(ring) => ring.get(index & (self.nents() - 1)).cloned(),
            WqRing::Recv(_) => None,
        }
    }

    pub(crate) fn lock_inner(&self) -> OrderedGuard<'_, WqInner> {
        self.inner.lock()
    }

    pub(crate) fn set_refill_sender(&self, tx: Sender<RefillJob>) {
        self.inner.lock().refill_tx = Some(tx);
    }

    fn start_cmd(&self) -> HwCommand {
        match self.kind {
            QueueKind::Send => HwCommand::StartSq { sq: self.num },
            QueueKind::Receive => HwCommand::StartRq { rq: self.num },
        }
    }

    fn stop_cmd(&self) -> HwCommand {
        match self.kind {
            QueueKind::Send => HwCommand::StopSq { sq: self.num },
            QueueKind::Receive => HwCommand::StopRq { rq: self.num },
        }
    }

    fn destroy_cmd(&self) -> HwCommand {
        match self.kind {
            QueueKind::Send => HwCommand::DestroySq { sq: self.num },
            QueueKind::Receive => HwCommand::DestroyRq { rq: self.num },
        }
    }

    /// Move the hardware queue to ready
    pub fn start(&self) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == WqState::Started {
            return Ok(());
        }
        let mut next = inner.state;
        next.transition(WqState::Started)?;
        self.ctx.exec(&self.start_cmd())?;
        inner.state = next;
        Ok(())
    }

    /// Move the hardware queue back to reset. Posted descriptors are
    /// abandoned; the caller returns their buffers through the CQ.
    pub fn stop(&self) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != WqState::Started {
            return Ok(());
        }
        self.ctx.exec(&self.stop_cmd())?;
        inner.state.transition(WqState::Created)?;
        inner.buffers_loaded = false;
        self.wqebb_used.store(0, Ordering::Release);
        Ok(())
    }

    /// Stop and destroy the hardware queue, release ring memory and
    /// detach from the CQ. Safe to call repeatedly.
    pub fn teardown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == WqState::Destroyed {
                return;
            }
            let was = inner.state;
            if was != WqState::Teardown {
                if let Err(e) = inner.state.transition(WqState::Teardown) {
                    tracing::warn!(wq = self.num, error = %e, "work queue state");
                }
            }
            inner.refill_tx = None;
            inner.buffers_loaded = false;
            if was == WqState::Started {
                self.ctx.exec_best_effort(&self.stop_cmd());
            }
            if matches!(was, WqState::Created | WqState::Started) {
                self.ctx.exec_best_effort(&self.destroy_cmd());
            }
            inner.memory = None;
            if let Err(e) = inner.state.transition(WqState::Destroyed) {
                tracing::warn!(wq = self.num, error = %e, "work queue state");
            }
        }

        let mut cq_inner = self.cq.lock_inner();
        if std::ptr::eq(cq_inner.wq.as_ptr(), self) {
            cq_inner.wq = Weak::new();
        }
        drop(cq_inner);
        tracing::debug!(wq = self.num, kind = self.kind.as_str(), "work queue torn down");
    }

    /// Write one receive slot per buffer and publish the producer counter.
    ///
    /// A buffer belongs to the queue as soon as its slot is written. On a
    /// full ring or a sync fault the buffers not yet written come back in
    /// `Err`. Caller holds the CQ lock and then the WQ lock.
    pub(crate) fn add_receive_buffers(
        &self,
        cq_inner: &mut CqInner,
        inner: &mut WqInner,
        bufs: Vec<Buffer>,
    ) -> Result<usize, Vec<Buffer>> {
        let access = self.ctx.access();
        let nents = self.nents();
        let WqRing::Recv(ring) = &mut inner.ring else {
            return Err(bufs);
        };

        let mut posted = 0;
        let mut bufs = bufs.into_iter();
        while let Some(mut buf) = bufs.next() {
            if self.wqebb_used() as usize >= nents {
                let mut rest = vec![buf];
                rest.extend(bufs);
                return Err(rest);
            }

            let index = inner.pc as usize & (nents - 1);
            buf.set_wqe_index(inner.pc);
            buf.set_wqebbs(1);
            let segs = buf.dma().segments();
            for (i, slot) in ring[index].segments.iter_mut().enumerate() {
                *slot = segs
                    .get(i)
                    .map_or(DataSegment::NULL, |s| DataSegment::new(s.addr, s.len as u32));
            }

            inner.pc = inner.pc.wrapping_add(1);
            self.wqebb_used.fetch_add(1, Ordering::AcqRel);
            cq_inner.buffers.push_back(buf);
            self.cq.add_buffer_count(1);
            posted += 1;

            let region = DmaRegion::WqEntries {
                wq: self.num,
                first: index,
                count: 1,
            };
            access.sync_for_device(region);
            if access.fault_status(region) == FaultStatus::Fault {
                access.clear_fault(region);
                tracing::warn!(wq = self.num, index, "receive slot sync fault");
                return Err(bufs.collect());
            }
        }

        fence(Ordering::Release);
        self.doorbell
            .recv_counter
            .store(inner.pc & COUNTER_MASK, Ordering::Release);
        for region in [
            DmaRegion::CqDoorbell { cq: self.cq.num() },
            DmaRegion::WqDoorbell { wq: self.num },
        ] {
            access.sync_for_device(region);
            if access.fault_status(region) == FaultStatus::Fault {
                access.clear_fault(region);
                tracing::warn!(wq = self.num, region = region.name(), "doorbell record sync fault");
                return Err(Vec::new());
            }
        }
        Ok(posted)
    }

    /// Publish the producer counter and write the first slot of the new
    /// descriptors to the doorbell register, retrying transient faults up
    /// to `doorbell_tries` times. Exhausting the retries marks the device
    /// service as lost.
    fn ring_doorbell(&self, inner: &WqInner, first: usize) -> DatapathResult<()> {
        let WqRing::Send(ring) = &inner.ring else {
            return Err(DatapathError::InvalidDescriptor("doorbell on a receive queue".into()));
        };
        let word = ring[first].control().map_or(0, ControlSegment::doorbell_word);
        let access = self.ctx.access();
        let tries = self.ctx.config().doorbell_tries;
        let record = DmaRegion::WqDoorbell { wq: self.num };

        fence(Ordering::SeqCst);
        self.doorbell
            .send_counter
            .store(inner.pc & COUNTER_MASK, Ordering::Release);

        let mut attempt = 0;
        loop {
            access.sync_for_device(record);
            let faulted = if access.fault_status(record) == FaultStatus::Fault {
                Some(record)
            } else {
                access.write_uar(UarRegister::Blueflame { sq: self.num }, word);
                (access.fault_status(DmaRegion::Uar) == FaultStatus::Fault)
                    .then_some(DmaRegion::Uar)
            };
            let Some(region) = faulted else {
                return Ok(());
            };
            if attempt >= tries {
                break;
            }
            attempt += 1;
            self.ctx.stats().record_doorbell_retry();
            access.clear_fault(region);
        }

        self.ctx.health().report(ServiceImpact::Lost);
        tracing::error!(sq = self.num, attempts = attempt + 1, "doorbell write kept faulting");
        Err(DatapathError::DoorbellFault {
            attempts: attempt + 1,
        })
    }

    /// Post a single no-op descriptor
    pub fn add_nop(&self) -> DatapathResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != WqState::Started {
            return Err(DatapathError::NotStarted(self.num));
        }
        self.add_nop_locked(&mut inner)
    }

    fn add_nop_locked(&self, inner: &mut WqInner) -> DatapathResult<()> {
        let nents = self.nents();
        let used = self.wqebb_used() as usize;
        if used + 1 >= nents {
            return Err(DatapathError::RingFull {
                needed: 1,
                available: (nents - 1).saturating_sub(used),
            });
        }
        let WqRing::Send(ring) = &mut inner.ring else {
            return Err(DatapathError::InvalidDescriptor("no-op on a receive queue".into()));
        };
        let index = inner.pc as usize & (nents - 1);
        ring[index] = SendEntry::Nop(ControlSegment::nop(self.num, inner.pc as u16));

        let access = self.ctx.access();
        let region = DmaRegion::WqEntries {
            wq: self.num,
            first: index,
            count: 1,
        };
        access.sync_for_device(region);
        if access.fault_status(region) == FaultStatus::Fault {
            access.clear_fault(region);
            return Err(DatapathError::DmaSyncFault(region.name()));
        }

        inner.pc = inner.pc.wrapping_add(1);
        self.wqebb_used.fetch_add(1, Ordering::AcqRel);
        self.ring_doorbell(inner, index)
    }

    /// Write `head`'s prepared descriptor group into the ring and ring the
    /// doorbell. Caller holds the WQ lock.
    pub(crate) fn add_send_buffer(
        &self,
        inner: &mut WqInner,
        mut head: Buffer,
    ) -> Result<(), SendRejected> {
        let nents = self.nents();
        let mask = nents - 1;
        let wqebbs = head.wqebbs();
        // Completions release slots without the WQ lock; everything below
        // is bounded against this one read.
        let used = self.wqebb_used() as usize;

        let reject = |error: DatapathError, head: Buffer| SendRejected {
            error,
            buffer: Some(head),
            merged: None,
        };
        let full = |needed: usize| DatapathError::RingFull {
            needed,
            available: (nents - 1).saturating_sub(used),
        };

        if head.sqe().is_empty() || wqebbs == 0 || wqebbs != head.sqe().len() {
            return Err(reject(
                DatapathError::InvalidDescriptor("send buffer has no prepared descriptor".into()),
                head,
            ));
        }
        if wqebbs + used >= nents {
            return Err(reject(full(wqebbs), head));
        }
        let WqRing::Send(ring) = &mut inner.ring else {
            return Err(reject(
                DatapathError::InvalidDescriptor("send on a receive queue".into()),
                head,
            ));
        };

        let pc = inner.pc;
        let first = pc as usize & mask;
        let mut ents = 0usize;

        // A group never wraps; pad to the end of the ring first.
        if first + wqebbs > nents {
            let mut index = first;
            while index != 0 {
                if ents + used >= nents {
                    return Err(reject(full(wqebbs + ents), head));
                }
                ring[index] = SendEntry::Nop(ControlSegment::nop(
                    self.num,
                    pc.wrapping_add(ents as u32) as u16,
                ));
                ents += 1;
                index = pc.wrapping_add(ents as u32) as usize & mask;
            }
        }

        let wqe_index = pc.wrapping_add(ents as u32);
        let mut group = head.sqe().to_vec();
        if let Some(SendEntry::Head { ctrl, .. }) = group.first_mut() {
            ctrl.wqe_index = wqe_index as u16;
        }
        for (j, entry) in group.into_iter().enumerate() {
            if j > 0 && ents + used >= nents {
                return Err(reject(full(wqebbs + ents), head));
            }
            ring[pc.wrapping_add(ents as u32) as usize & mask] = entry;
            ents += 1;
        }
        head.set_wqe_index(wqe_index);

        let access = self.ctx.access();
        let regions: Vec<DmaRegion> = if first + ents > nents {
            let tail = nents - first;
            vec![
                DmaRegion::WqEntries {
                    wq: self.num,
                    first,
                    count: tail,
                },
                DmaRegion::WqEntries {
                    wq: self.num,
                    first: 0,
                    count: ents - tail,
                },
            ]
        } else {
            vec![DmaRegion::WqEntries {
                wq: self.num,
                first,
                count: ents,
            }]
        };
        for region in &regions {
            access.sync_for_device(*region);
        }
        let mut faulted = false;
        for region in &regions {
            if access.fault_status(*region) == FaultStatus::Fault {
                access.clear_fault(*region);
                faulted = true;
            }
        }
        if faulted {
            return Err(reject(DatapathError::DmaSyncFault("wq entries"), head));
        }

        inner.pc = pc.wrapping_add(ents as u32);
        self.wqebb_used.fetch_add(ents as u64, Ordering::AcqRel);

        let id = head.id();
        let gen = self.cq.push_pending(head);
        self.ring_doorbell(inner, first).map_err(|error| {
            match self.cq.reclaim_pending(id, gen) {
                Some(head) => SendRejected {
                    error,
                    buffer: Some(head),
                    merged: None,
                },
                None => SendRejected {
                    error,
                    buffer: None,
                    merged: Some(id),
                },
            }
        })
    }

    /// Build the send descriptor group for `head` and its chain
    pub fn prepare_send(&self, head: &mut Buffer, ctx: &TxContext) -> DatapathResult<()> {
        let hdrlen = ctx.inline_hdrlen;
        if hdrlen > MAX_INLINE_HEADERLEN {
            return Err(DatapathError::InvalidDescriptor(format!(
                "inline header of {hdrlen} bytes exceeds {MAX_INLINE_HEADERLEN}"
            )));
        }
        if ctx.inline_hdrs.len() < hdrlen {
            return Err(DatapathError::InvalidDescriptor(format!(
                "{} inline header bytes supplied, {hdrlen} declared",
                ctx.inline_hdrs.len()
            )));
        }
        let opcode = match ctx.lso_mss {
            Some(_) if hdrlen == 0 => {
                return Err(DatapathError::InvalidDescriptor(
                    "segmentation offload needs inline headers".into(),
                ))
            }
            Some(_) => SendOpcode::Lso,
            None => SendOpcode::Send,
        };

        let mut group = SendGroup::new(SendEntry::Head {
            ctrl: ControlSegment {
                opcode,
                wqe_index: 0,
                sq: self.num,
                ds_count: HEAD_DS_PREAMBLE,
                cqe_always: true,
            },
            eth: EthSegment {
                l3_checksum: ctx.checksum.l3,
                l4_checksum: ctx.checksum.l4,
                mss: ctx.lso_mss.unwrap_or(0),
                inline_hdr_size: hdrlen as u16,
                inline_hdrs: ctx.inline_hdrs.slice(..hdrlen),
            },
            data: [SendSlot::NULL; HEAD_DATA_SEGS],
        });

        if hdrlen > ETH_INLINE_BUILTIN {
            for _ in 0..(hdrlen - ETH_INLINE_BUILTIN).div_ceil(WQE_OCTOWORD) {
                *group.next_slot()? = SendSlot::Inline;
            }
        }

        for buf in std::iter::once(&*head).chain(head.chain()) {
            let mut rem = buf.used();
            for seg in buf.dma().segments() {
                if rem == 0 {
                    break;
                }
                let n = seg.len.min(rem);
                *group.next_slot()? = SendSlot::Data(DataSegment::new(seg.addr, n as u32));
                rem -= n;
            }
        }

        let entries = group.finish();
        head.set_wqebbs(entries.len());
        *head.sqe_mut() = entries;
        Ok(())
    }

    fn copy_data(&self, data: &[u8]) -> Option<Buffer> {
        let access = self.ctx.access();
        for _ in 0..=BIND_MAX_ATTEMPTS {
            let mut buf = self.shard.take()?;
            if let Err(e) = buf.dma().write(data) {
                tracing::warn!(wq = self.num, error = %e, "transmit copy failed");
                return_buffer(buf);
                return None;
            }
            let region = buf.dma().region();
            access.sync_for_device(region);
            if access.fault_status(region) == FaultStatus::Fault {
                access.clear_fault(region);
                return_buffer(buf);
                continue;
            }
            buf.set_used(data.len());
            return Some(buf);
        }
        None
    }

    fn bind_or_copy_fragment(&self, data: &Bytes) -> Option<Buffer> {
        if data.len() < self.ctx.config().tx_bind_threshold {
            return self.copy_data(data);
        }
        let mut buf = self.foreign.as_ref()?.take()?;
        match self.ctx.dma().bind(data.clone()) {
            Ok(mem) => {
                *buf.dma_mut() = mem;
                buf.set_used(data.len());
                Some(buf)
            }
            Err(e) => {
                tracing::debug!(wq = self.num, error = %e, "bind failed, copying");
                return_buffer(buf);
                self.copy_data(data)
            }
        }
    }

    /// Move `packet`'s payload (past the inline headers) into a buffer
    /// chain: small fragments are copied, large ones bound in place. A
    /// chain needing more than [`SQE_MAX_PTRS`] segments is pulled up into
    /// one contiguous buffer.
    pub fn bind_or_copy(&self, packet: &TxPacket) -> DatapathResult<Buffer> {
        let mut skip = packet.ctx.inline_hdrlen;
        let mut frags = Vec::with_capacity(packet.fragments.len());
        for frag in &packet.fragments {
            if skip >= frag.len() {
                skip -= frag.len();
                continue;
            }
            frags.push(frag.slice(skip..));
            skip = 0;
        }
        if frags.is_empty() {
            return Err(DatapathError::InvalidDescriptor(
                "no payload past the inline headers".into(),
            ));
        }

        let mut head: Option<Buffer> = None;
        let mut ncookies = 0;
        for frag in &frags {
            if ncookies > SQE_MAX_PTRS {
                break;
            }
            let Some(buf) = self.bind_or_copy_fragment(frag) else {
                if let Some(head) = head {
                    return_chain(head);
                }
                return Err(DatapathError::NoBuffers);
            };
            ncookies += buf.dma().segment_count();
            match head.as_mut() {
                None => head = Some(buf),
                Some(h) => h.push_chain(buf),
            }
        }

        if ncookies > SQE_MAX_PTRS {
            if let Some(head) = head.take() {
                return_chain(head);
            }
            let mut joined = BytesMut::with_capacity(frags.iter().map(Bytes::len).sum());
            for frag in &frags {
                joined.extend_from_slice(frag);
            }
            head = Some(
                self.bind_or_copy_fragment(&joined.freeze())
                    .ok_or(DatapathError::NoBuffers)?,
            );
        }
        head.ok_or(DatapathError::NoBuffers)
    }

    /// Queue `packet` for transmission. On failure every buffer taken for
    /// it is returned and the caller keeps the packet.
    pub fn transmit(&self, packet: &TxPacket) -> DatapathResult<()> {
        if self.kind != QueueKind::Send {
            return Err(DatapathError::InvalidDescriptor(
                "transmit on a receive queue".into(),
            ));
        }
        let mut head = self.bind_or_copy(packet)?;
        if let Err(e) = self.prepare_send(&mut head, &packet.ctx) {
            return_chain(head);
            return Err(e);
        }

        let mut inner = self.inner.lock();
        if inner.state != WqState::Started {
            drop(inner);
            return_chain(head);
            return Err(DatapathError::NotStarted(self.num));
        }
        let rejected = match self.add_send_buffer(&mut inner, head) {
            Ok(()) => return Ok(()),
            Err(rejected) => rejected,
        };
        drop(inner);
        Err(self.settle_rejected(rejected))
    }

    /// Return a rejected chain to its shard. Caller must not hold the WQ
    /// lock.
    pub(crate) fn settle_rejected(&self, rejected: SendRejected) -> DatapathError {
        let SendRejected {
            error,
            buffer,
            merged,
        } = rejected;
        if let Some(head) = buffer.or_else(|| merged.and_then(|id| self.cq.reclaim_merged(id))) {
            return_chain(head);
        }
        error
    }

    /// Query the hardware queue state. Anything but ready is reported to
    /// the diagnostic sink and degrades the device; the queue is left as
    /// it is.
    pub fn check_health(&self) -> Option<HwQueueState> {
        let cmd = HwCommand::QueryQueueState {
            kind: self.kind,
            num: self.num,
        };
        let raw = match self.ctx.exec(&cmd) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(wq = self.num, error = %e, "queue state query failed");
                return None;
            }
        };
        let state = HwQueueState::from_raw(raw);
        if state != HwQueueState::Ready {
            tracing::warn!(kind = self.kind.as_str(), wq = self.num, state = ?state, "work queue not ready");
            self.ctx.diag().emit(
                DiagnosticEvent::new(CLASS_QSTATE_ERR)
                    .field("queue_type", DiagValue::Str(self.kind.as_str().to_string()))
                    .field("queue_num", DiagValue::U32(self.num))
                    .field("state", DiagValue::U32(raw)),
            );
            self.ctx.health().report(ServiceImpact::Degraded);
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatapathConfig, EqKind};
    use crate::descriptor::CompletionEntry;
    use crate::eq::EventQueue;
    use crate::sim::{FaultTarget, SimHarness};

    fn config() -> DatapathConfig {
        DatapathConfig {
            sq_size_shift: 3,
            rq_size_shift: 4,
            cq_size_shift: 4,
            refill_step: 4,
            mtu: 256,
            tx_bind_threshold: 1024,
            ..Default::default()
        }
    }

    fn queue(h: &SimHarness, kind: QueueKind) -> Arc<WorkQueue> {
        let eq = EventQueue::new(0, 1, EqKind::Any);
        let cq = CompletionQueue::setup(&h.ctx, kind, &eq).unwrap();
        WorkQueue::setup(&h.ctx, &cq, Some(1)).unwrap()
    }

    fn stock(h: &SimHarness, shard: &Arc<BufferShard>, n: usize) {
        for _ in 0..n {
            return_buffer(shard.create_buffer(h.dma.as_ref(), 256).unwrap());
        }
        shard.ready();
    }

    fn started_sq(h: &SimHarness) -> Arc<WorkQueue> {
        let wq = queue(h, QueueKind::Send);
        stock(h, wq.shard(), 16);
        stock_foreign(wq.foreign_shard().unwrap(), 16);
        wq.start().unwrap();
        wq
    }

    fn stock_foreign(shard: &Arc<BufferShard>, n: usize) {
        for _ in 0..n {
            return_buffer(shard.create_foreign());
        }
        shard.ready();
    }

    fn packet(sizes: &[usize], inline: usize) -> TxPacket {
        let fragments: Vec<Bytes> = sizes
            .iter()
            .enumerate()
            .map(|(i, n)| Bytes::from(vec![i as u8; *n]))
            .collect();
        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.iter().copied()).collect();
        TxPacket {
            fragments,
            ctx: TxContext {
                inline_hdrlen: inline,
                inline_hdrs: Bytes::from(joined).slice(..inline),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_setup_creates_hw_queue() {
        let h = SimHarness::new(config()).unwrap();
        let wq = queue(&h, QueueKind::Receive);
        assert_eq!(wq.state(), WqState::Created);
        assert_eq!(wq.nents(), 16);
        assert!(h.device.commands().contains(&HwCommand::CreateRq {
            cq: wq.cq().num(),
            log_size: 4
        }));
    }

    #[test]
    fn test_setup_failure_leaves_nothing() {
        let h = SimHarness::new(config()).unwrap();
        let eq = EventQueue::new(0, 1, EqKind::Any);
        let cq = CompletionQueue::setup(&h.ctx, QueueKind::Send, &eq).unwrap();
        let live = h.dma.live();

        h.device.fail_command("CREATE_SQ", 1);
        assert!(WorkQueue::setup(&h.ctx, &cq, Some(1)).is_err());
        assert_eq!(h.dma.live(), live);

        h.dma.fail_next_allocs(1);
        assert!(matches!(
            WorkQueue::setup(&h.ctx, &cq, Some(1)),
            Err(DatapathError::DmaAllocation(_))
        ));
        assert_eq!(h.dma.live(), live);
        assert_eq!(h.device.command_count("CREATE_SQ"), 0);
    }

    #[test]
    fn test_receive_post_pads_scatter_list() {
        let h = SimHarness::new(config()).unwrap();
        let wq = queue(&h, QueueKind::Receive);
        stock(&h, wq.shard(), 4);
        wq.start().unwrap();

        let bufs = wq.shard().take_n(2);
        let posted = {
            let mut cq_inner = wq.cq().lock_inner();
            let mut inner = wq.lock_inner();
            wq.add_receive_buffers(&mut cq_inner, &mut inner, bufs)
        };
        assert_eq!(posted.unwrap(), 2);

        let entry = wq.receive_entry(1).unwrap();
        assert_eq!(entry.segments.len(), 4);
        assert!(!entry.segments[0].is_null());
        assert!(entry.segments[1..].iter().all(DataSegment::is_null));
        assert_eq!(wq.doorbell_counter(), 2);
        assert_eq!(wq.cq().buffer_count(), 2);
        assert_eq!(wq.wqebb_used(), 2);
    }

    #[test]
    fn test_receive_post_stops_at_capacity() {
        let h = SimHarness::new(config()).unwrap();
        let wq = queue(&h, QueueKind::Receive);
        stock(&h, wq.shard(), 20);
        wq.start().unwrap();

        let bufs = wq.shard().take_n(20);
        let rest = {
            let mut cq_inner = wq.cq().lock_inner();
            let mut inner = wq.lock_inner();
            wq.add_receive_buffers(&mut cq_inner, &mut inner, bufs)
        };
        let rest = rest.unwrap_err();
        assert_eq!(rest.len(), 4);
        assert_eq!(wq.wqebb_used(), 16);
        rest.into_iter().for_each(return_buffer);
        assert_eq!(wq.shard().counts().free, 4);
    }

    #[test]
    fn test_prepare_spills_inline_headers() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        let pkt = packet(&[100], 18);

        let mut head = wq.bind_or_copy(&pkt).unwrap();
        assert_eq!(head.used(), 82);
        wq.prepare_send(&mut head, &pkt.ctx).unwrap();

        assert_eq!(head.wqebbs(), 2);
        let SendEntry::Head { ctrl, eth, data } = &head.sqe()[0] else {
            panic!("expected head slot");
        };
        assert_eq!(ctrl.ds_count, 5);
        assert_eq!(eth.inline_hdr_size, 18);
        assert_eq!(data[0], SendSlot::Inline);
        let SendSlot::Data(seg) = head.sqe()[1].slots()[0] else {
            panic!("expected data slot");
        };
        assert_eq!(seg.byte_count, 82);
        assert!(head.sqe()[1].slots()[1..].iter().all(|s| *s == SendSlot::NULL));
        return_chain(head);
    }

    #[test]
    fn test_prepare_rejects_oversized_inline() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        let pkt = packet(&[200], 65);
        let mut head = wq.bind_or_copy(&packet(&[200], 0)).unwrap();
        assert!(matches!(
            wq.prepare_send(&mut head, &pkt.ctx),
            Err(DatapathError::InvalidDescriptor(_))
        ));
        return_chain(head);
    }

    #[test]
    fn test_pad_to_ring_end() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        wq.lock_inner().pc = 7;

        // 64 inline bytes spill four slots; two data slots make a 3-slot group.
        wq.transmit(&packet(&[80, 100], 64)).unwrap();

        assert_eq!(
            wq.send_entry(7),
            Some(SendEntry::Nop(ControlSegment::nop(wq.num(), 7)))
        );
        let head = wq.send_entry(0).unwrap();
        assert_eq!(head.control().unwrap().wqe_index, 8);
        assert_eq!(head.wqebbs(), 3);
        assert!(matches!(wq.send_entry(1), Some(SendEntry::Extra { .. })));
        assert!(matches!(wq.send_entry(2), Some(SendEntry::Extra { .. })));
        assert_eq!(wq.producer_counter(), 11);
        assert_eq!(wq.wqebb_used(), 4);
        assert_eq!(wq.cq().pending_buffers(), (0, 1));
        assert_eq!(wq.cq().buffer_count(), 1);
    }

    #[test]
    fn test_full_ring_rejects_without_side_effects() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        wq.wqebb_used.store(7, Ordering::Release);

        assert!(matches!(
            wq.transmit(&packet(&[100], 14)),
            Err(DatapathError::RingFull { .. })
        ));
        assert_eq!(wq.producer_counter(), 0);
        assert_eq!(wq.shard().counts().busy, 0);
        assert_eq!(wq.cq().pending_buffers(), (0, 0));
    }

    #[test]
    fn test_doorbell_retries_transient_fault() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        h.device.inject_fault(FaultTarget::Uar, 2);

        wq.transmit(&packet(&[100], 14)).unwrap();
        assert_eq!(h.ctx.stats().snapshot().doorbell_retries, 2);
        assert_eq!(h.ctx.health().current(), ServiceImpact::Ok);
        assert_eq!(h.device.blueflame_writes(wq.num()), 3);
    }

    #[test]
    fn test_doorbell_exhaustion_loses_service() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        h.device.inject_fault(FaultTarget::WqDoorbell(wq.num()), 10);

        assert!(matches!(
            wq.transmit(&packet(&[100], 14)),
            Err(DatapathError::DoorbellFault { attempts: 4 })
        ));
        assert_eq!(h.ctx.health().current(), ServiceImpact::Lost);
        assert_eq!(wq.shard().counts().busy, 0);
        assert_eq!(wq.cq().pending_buffers(), (0, 0));
        assert_eq!(wq.cq().buffer_count(), 0);
    }

    #[test]
    fn test_rejected_chain_taken_from_primary_list() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        let cq = wq.cq();
        let head = wq.shard().take().unwrap();
        let id = head.id();

        let gen = cq.push_pending(head);
        cq.hw_ring().post(CompletionEntry::send(999, SendOpcode::Send));
        {
            let mut inner = cq.lock_inner();
            cq.poll(&mut inner, 8);
        }
        assert_eq!(cq.pending_buffers(), (1, 0));

        let rejected = SendRejected {
            error: DatapathError::DoorbellFault { attempts: 4 },
            buffer: cq.reclaim_pending(id, gen),
            merged: Some(id),
        };
        assert!(rejected.buffer.is_none());
        assert!(matches!(
            wq.settle_rejected(rejected),
            DatapathError::DoorbellFault { attempts: 4 }
        ));
        assert_eq!(cq.pending_buffers(), (0, 0));
        assert_eq!(cq.buffer_count(), 0);
        assert_eq!(wq.shard().counts().busy, 0);
    }

    #[test]
    fn test_large_fragment_bound_in_place() {
        let cfg = DatapathConfig {
            tx_bind_threshold: 64,
            ..config()
        };
        let h = SimHarness::new(cfg).unwrap();
        let wq = started_sq(&h);

        let head = wq.bind_or_copy(&packet(&[200], 0)).unwrap();
        assert!(head.is_foreign());
        assert!(head.dma().is_bound());
        return_chain(head);
        assert_eq!(wq.foreign_shard().unwrap().counts().busy, 0);

        h.dma.fail_next_binds(1);
        let head = wq.bind_or_copy(&packet(&[200], 0)).unwrap();
        assert!(!head.is_foreign());
        assert_eq!(head.used(), 200);
        assert_eq!(wq.foreign_shard().unwrap().counts().busy, 0);
        return_chain(head);
    }

    #[test]
    fn test_chain_pulled_up_past_pointer_limit() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);

        let head = wq.bind_or_copy(&packet(&[20; 10], 0)).unwrap();
        assert!(head.chain().is_empty());
        assert_eq!(head.used(), 200);
        assert_eq!(wq.shard().counts().busy, 1);
        return_chain(head);

        let head = wq.bind_or_copy(&packet(&[20; 3], 10)).unwrap();
        assert_eq!(head.chain().len(), 2);
        assert_eq!(head.used(), 10);
        assert_eq!(wq.shard().counts().busy, 3);
        return_chain(head);
    }

    #[test]
    fn test_transmit_requires_started() {
        let h = SimHarness::new(config()).unwrap();
        let wq = queue(&h, QueueKind::Send);
        stock(&h, wq.shard(), 4);
        assert!(matches!(
            wq.transmit(&packet(&[100], 14)),
            Err(DatapathError::NotStarted(_))
        ));
        assert_eq!(wq.shard().counts().busy, 0);
        assert!(matches!(wq.add_nop(), Err(DatapathError::NotStarted(_))));
    }

    #[test]
    fn test_check_health_reports_error_state() {
        let h = SimHarness::new(config()).unwrap();
        let wq = queue(&h, QueueKind::Receive);
        wq.start().unwrap();
        assert_eq!(wq.check_health(), Some(HwQueueState::Ready));
        assert!(h.diag.try_recv().is_err());

        h.device.set_queue_state(wq.num(), HwQueueState::Error);
        assert_eq!(wq.check_health(), Some(HwQueueState::Error));
        let event = h.diag.try_recv().unwrap();
        assert_eq!(event.class, CLASS_QSTATE_ERR);
        assert_eq!(event.get("queue_num"), Some(&DiagValue::U32(wq.num())));
        assert_eq!(h.ctx.health().current(), ServiceImpact::Degraded);
        assert_eq!(wq.state(), WqState::Started);
    }

    #[test]
    fn test_teardown_idempotent() {
        let h = SimHarness::new(config()).unwrap();
        let wq = queue(&h, QueueKind::Receive);
        wq.start().unwrap();

        wq.teardown();
        wq.teardown();
        assert_eq!(wq.state(), WqState::Destroyed);
        assert!(!wq.has_memory());
        assert_eq!(h.device.command_count("STOP_RQ"), 1);
        assert_eq!(h.device.command_count("DESTROY_RQ"), 1);
        assert!(wq.cq().lock_inner().wq.upgrade().is_none());
    }

    #[test]
    fn test_nop_primes_ring() {
        let h = SimHarness::new(config()).unwrap();
        let wq = started_sq(&h);
        wq.add_nop().unwrap();
        assert_eq!(wq.doorbell_counter(), 1);
        assert_eq!(wq.wqebb_used(), 1);
        assert!(matches!(wq.send_entry(0), Some(SendEntry::Nop(_))));
    }
}
