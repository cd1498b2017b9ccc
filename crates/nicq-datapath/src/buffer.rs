//! Packet buffers and buffer pool shards
//!
//! A [`Buffer`] is a move-only handle: at any instant it lives in exactly
//! one place (a shard's free list, a completion queue's pending list, a
//! stack loan, or a transmit chain head). The shard tracks the buffers it
//! does not hold by id, so `free + busy + loaned == total` always.
//!
//! # Design
//!
//! - One lock per shard guards the lists, `total` and the loan watermarks
//! - A condition variable signals "free list non-empty" to refill workers
//! - Cleanup that does not need the lock (unbinding stack memory,
//!   resetting fields) happens before it is taken
//! - While draining, loaned buffers coming home are destroyed instead of
//!   recycled

use crate::dma::{DmaAllocator, DmaBuffer};
use crate::descriptor::SendEntry;
use crate::error::DatapathResult;
use crate::lifecycle::{BufferState, Lifecycle, ShardState};
use crate::lock_order::{LockClass, OrderedMutex};
use crate::stack::LoanedBuffer;
use parking_lot::Condvar;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Receive buffers start this far into their memory so the IP header
/// lands aligned behind a 14-byte ethernet header
pub const RX_IP_ALIGN: usize = 2;

/// Unique buffer identifier
pub type BufferId = u64;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// One hardware-visible packet buffer
pub struct Buffer {
    id: BufferId,
    shard: Weak<BufferShard>,
    state: BufferState,
    foreign: bool,
    dma: DmaBuffer,
    used: usize,
    wqe_index: u32,
    wqebbs: usize,
    chain: Vec<Buffer>,
    sqe: Vec<SendEntry>,
}

impl Buffer {
    fn new(shard: &Arc<BufferShard>, dma: DmaBuffer, foreign: bool) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            shard: Arc::downgrade(shard),
            state: BufferState::Init,
            foreign,
            dma,
            used: 0,
            wqe_index: 0,
            wqebbs: 0,
            chain: Vec::new(),
            sqe: Vec::new(),
        }
    }

    /// Identifier
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Ownership state
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Whether this buffer binds stack memory instead of owning its own
    pub fn is_foreign(&self) -> bool {
        self.foreign
    }

    /// Backing memory
    pub fn dma(&self) -> &DmaBuffer {
        &self.dma
    }

    pub(crate) fn dma_mut(&mut self) -> &mut DmaBuffer {
        &mut self.dma
    }

    /// Bytes of payload
    pub fn used(&self) -> usize {
        self.used
    }

    /// Set the payload length
    pub fn set_used(&mut self, used: usize) {
        self.used = used;
    }

    /// Producer counter the buffer was posted at
    pub fn wqe_index(&self) -> u32 {
        self.wqe_index
    }

    pub(crate) fn set_wqe_index(&mut self, index: u32) {
        self.wqe_index = index;
    }

    /// Ring slots the buffer's descriptor group occupies
    pub fn wqebbs(&self) -> usize {
        self.wqebbs
    }

    pub(crate) fn set_wqebbs(&mut self, wqebbs: usize) {
        self.wqebbs = wqebbs;
    }

    /// Non-head members of this buffer's transmit chain
    pub fn chain(&self) -> &[Buffer] {
        &self.chain
    }

    pub(crate) fn push_chain(&mut self, mut member: Buffer) {
        if member.state.transition(BufferState::OnChain).is_err() {
            tracing::warn!(buffer = member.id, state = ?member.state, "chain member not on queue");
        }
        self.chain.push(member);
    }

    pub(crate) fn take_chain(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.chain)
    }

    /// Prepared send descriptor group
    pub fn sqe(&self) -> &[SendEntry] {
        &self.sqe
    }

    pub(crate) fn sqe_mut(&mut self) -> &mut Vec<SendEntry> {
        &mut self.sqe
    }

    /// Owning shard, if it still exists
    pub fn shard(&self) -> Option<Arc<BufferShard>> {
        self.shard.upgrade()
    }

    pub(crate) fn belongs_to(&self, shard: &Arc<BufferShard>) -> bool {
        Weak::ptr_eq(&self.shard, &Arc::downgrade(shard))
    }

    /// Lock-free part of a return
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.chain.is_empty());
        self.used = 0;
        self.wqe_index = 0;
        self.wqebbs = 0;
        self.sqe.clear();
        if self.foreign {
            self.dma.unbind();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("foreign", &self.foreign)
            .field("used", &self.used)
            .field("wqe_index", &self.wqe_index)
            .field("chain", &self.chain.len())
            .finish()
    }
}

/// Point-in-time shard accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCounts {
    /// Availability
    pub state: ShardState,
    /// Buffers the shard accounts for
    pub total: usize,
    /// On the free list
    pub free: usize,
    /// On a queue or chain
    pub busy: usize,
    /// Loaned to the stack
    pub loaned: usize,
    /// First loan watermark
    pub hiwat1: usize,
    /// Second loan watermark
    pub hiwat2: usize,
}

struct ShardInner {
    state: ShardState,
    total: usize,
    nloaned: usize,
    hiwat1: usize,
    hiwat2: usize,
    free: VecDeque<Buffer>,
    busy: HashSet<BufferId>,
    loaned: HashSet<BufferId>,
}

impl ShardInner {
    fn adjust_total(&mut self, incr: isize) {
        self.total = self.total.saturating_add_signed(incr);
        self.hiwat1 = self.total / 2;
        self.hiwat2 = 3 * (self.total / 4);
    }

    fn take(&mut self) -> Option<Buffer> {
        let mut buf = self.free.pop_front()?;
        if let Err(e) = buf.state.transition(BufferState::OnQueue) {
            tracing::error!(buffer = buf.id, error = %e, "corrupt free list entry");
        }
        self.busy.insert(buf.id);
        Some(buf)
    }

    /// Put `buf` back under the lock; returns it when it must be destroyed
    fn reclaim(&mut self, mut buf: Buffer) -> Option<Buffer> {
        let old = buf.state;
        match old {
            BufferState::Free => {
                tracing::error!(buffer = buf.id, "buffer returned twice");
                return Some(buf);
            }
            BufferState::Init => self.adjust_total(1),
            BufferState::OnQueue | BufferState::OnChain => {
                self.busy.remove(&buf.id);
            }
            BufferState::OnLoan => {
                self.nloaned = self.nloaned.saturating_sub(1);
                self.loaned.remove(&buf.id);
            }
        }
        buf.state = BufferState::Free;
        if old == BufferState::OnLoan && self.state == ShardState::Draining {
            self.adjust_total(-1);
            return Some(buf);
        }
        self.free.push_back(buf);
        None
    }
}

/// A pool of buffers serving one work queue
pub struct BufferShard {
    label: String,
    loan_min_size: usize,
    inner: OrderedMutex<ShardInner>,
    free_nonempty: Condvar,
}

impl fmt::Debug for BufferShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferShard")
            .field("label", &self.label)
            .field("counts", &self.counts())
            .finish()
    }
}

impl BufferShard {
    /// Empty shard; small packets are only loaned below the first watermark
    /// when at least `loan_min_size` bytes long
    pub fn new(label: impl Into<String>, loan_min_size: usize) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            loan_min_size,
            inner: OrderedMutex::new(
                LockClass::Shard,
                ShardInner {
                    state: ShardState::Init,
                    total: 0,
                    nloaned: 0,
                    hiwat1: 0,
                    hiwat2: 0,
                    free: VecDeque::new(),
                    busy: HashSet::new(),
                    loaned: HashSet::new(),
                },
            ),
            free_nonempty: Condvar::new(),
        })
    }

    /// Shard name
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Allocate a buffer with `size` bytes of payload room; starts `Init`
    pub fn create_buffer(
        self: &Arc<Self>,
        dma: &dyn DmaAllocator,
        size: usize,
    ) -> DatapathResult<Buffer> {
        let mut mem = dma.alloc(size + RX_IP_ALIGN)?;
        mem.trim_front(RX_IP_ALIGN);
        Ok(Buffer::new(self, mem, false))
    }

    /// A buffer without memory, used to bind stack memory on transmit
    pub fn create_foreign(self: &Arc<Self>) -> Buffer {
        Buffer::new(self, DmaBuffer::empty(), true)
    }

    /// Destroy a buffer that was never pooled
    pub fn destroy_init(&self, buf: Buffer) -> Result<(), Buffer> {
        if buf.state != BufferState::Init {
            return Err(buf);
        }
        drop(buf);
        Ok(())
    }

    /// Destroy up to `n` free buffers, shrinking the pool
    pub fn shrink(&self, n: usize) -> usize {
        let mut doomed = Vec::with_capacity(n);
        {
            let mut inner = self.inner.lock();
            while doomed.len() < n {
                let Some(buf) = inner.free.pop_front() else {
                    break;
                };
                inner.adjust_total(-1);
                doomed.push(buf);
            }
        }
        doomed.len()
    }

    /// Pop one free buffer; `None` when empty or not ready
    pub fn take(&self) -> Option<Buffer> {
        let mut inner = self.inner.lock();
        if inner.state != ShardState::Ready {
            return None;
        }
        inner.take()
    }

    /// Pop up to `n` free buffers without waiting
    pub fn take_n(&self, n: usize) -> Vec<Buffer> {
        let mut inner = self.inner.lock();
        if inner.state != ShardState::Ready {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(n.min(inner.free.len()));
        while out.len() < n {
            match inner.take() {
                Some(buf) => out.push(buf),
                None => break,
            }
        }
        out
    }

    /// Hand an on-queue buffer to the stack without copying.
    ///
    /// Refused (buffer handed back) once half the pool is on loan and the
    /// payload is small, or once three quarters are on loan at all.
    pub fn loan(&self, mut buf: Buffer) -> Result<LoanedBuffer, Buffer> {
        if buf.state != BufferState::OnQueue {
            return Err(buf);
        }
        {
            let mut inner = self.inner.lock();
            if inner.nloaned >= inner.hiwat1 && buf.used < self.loan_min_size {
                return Err(buf);
            }
            if inner.nloaned >= inner.hiwat2 {
                return Err(buf);
            }
            if buf.state.transition(BufferState::OnLoan).is_err() {
                return Err(buf);
            }
            buf.wqe_index = 0;
            inner.busy.remove(&buf.id);
            inner.loaned.insert(buf.id);
            inner.nloaned += 1;
        }
        Ok(LoanedBuffer::new(buf))
    }

    fn put_back(&self, mut buf: Buffer) {
        buf.reset();
        let doomed = {
            let mut inner = self.inner.lock();
            let doomed = inner.reclaim(buf);
            self.free_nonempty.notify_all();
            doomed
        };
        drop(doomed);
    }

    /// Return a batch of already reset buffers under one lock hold
    pub(crate) fn put_back_many(&self, bufs: Vec<Buffer>) {
        let mut doomed = Vec::new();
        {
            let mut inner = self.inner.lock();
            for buf in bufs {
                if let Some(buf) = inner.reclaim(buf) {
                    doomed.push(buf);
                }
            }
            self.free_nonempty.notify_all();
        }
        drop(doomed);
    }

    /// Resume handing out and recycling buffers
    pub fn ready(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ShardState::Ready {
            if let Err(e) = inner.state.transition(ShardState::Ready) {
                tracing::warn!(shard = %self.label, error = %e, "buffer shard state");
            }
        }
    }

    /// Stop handing out buffers and wake waiters
    pub fn draining(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ShardState::Draining {
            if let Err(e) = inner.state.transition(ShardState::Draining) {
                tracing::warn!(shard = %self.label, error = %e, "buffer shard state");
            }
        }
        self.free_nonempty.notify_all();
    }

    /// Mark draining, destroy free buffers, and wait up to `timeout` for
    /// loaned buffers to come home. True when none remain on loan.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut doomed = Vec::new();
        let drained = {
            let mut inner = self.inner.lock();
            if inner.state != ShardState::Draining {
                if let Err(e) = inner.state.transition(ShardState::Draining) {
                    tracing::warn!(shard = %self.label, error = %e, "buffer shard state");
                }
            }
            self.free_nonempty.notify_all();
            loop {
                while let Some(buf) = inner.free.pop_front() {
                    inner.adjust_total(-1);
                    doomed.push(buf);
                }
                if inner.loaned.is_empty() {
                    break true;
                }
                let now = Instant::now();
                if now >= deadline {
                    break false;
                }
                inner.wait_for(&self.free_nonempty, deadline - now);
            }
        };
        if !drained {
            tracing::warn!(shard = %self.label, counts = ?self.counts(), "loaned buffers outstanding after drain timeout");
        }
        tracing::debug!(shard = %self.label, destroyed = doomed.len(), "shard drained");
        drained
    }

    /// Block until the free list is non-empty, the shard drains, or
    /// `cancelled` reports true. The canceller must call
    /// [`BufferShard::wake_waiters`] after setting its flag.
    pub fn wait_free(&self, cancelled: impl Fn() -> bool) {
        let mut inner = self.inner.lock();
        while inner.state != ShardState::Draining && inner.free.is_empty() && !cancelled() {
            inner.wait(&self.free_nonempty);
        }
    }

    /// Wake every waiter on the free list
    pub fn wake_waiters(&self) {
        let _inner = self.inner.lock();
        self.free_nonempty.notify_all();
    }

    /// Availability
    pub fn state(&self) -> ShardState {
        self.inner.lock().state
    }

    /// Accounting snapshot
    pub fn counts(&self) -> ShardCounts {
        let inner = self.inner.lock();
        ShardCounts {
            state: inner.state,
            total: inner.total,
            free: inner.free.len(),
            busy: inner.busy.len(),
            loaned: inner.nloaned,
            hiwat1: inner.hiwat1,
            hiwat2: inner.hiwat2,
        }
    }
}

/// Return `buf` (and any chain it heads) to its shard
pub fn return_buffer(mut buf: Buffer) {
    for member in buf.take_chain() {
        return_buffer(member);
    }
    match buf.shard() {
        Some(shard) => shard.put_back(buf),
        None => tracing::debug!(buffer = buf.id, "shard gone, dropping buffer"),
    }
}

/// Return a transmit chain head and all its members
pub fn return_chain(head: Buffer) {
    return_buffer(head);
}
