//! Receive refill
//!
//! Receive queues are topped up from the completion path in fixed steps,
//! up to `capacity - refill_step` posted buffers. When the shard has
//! nothing free and the queue is nearly empty, one job per queue is handed
//! to the group's refill workers instead of blocking the interrupt path.
//!
//! # Design
//!
//! - A job waits on the shard's "free list non-empty" condition, which
//!   also wakes on drain and on completion queue teardown
//! - The `refilling` flag under the WQ lock keeps at most one job queued
//!   or running per work queue
//! - One worker per work queue, so a job stuck waiting for buffers never
//!   delays a sibling queue

use crate::buffer::return_buffer;
use crate::cq::CqInner;
use crate::error::{DatapathError, DatapathResult};
use crate::lifecycle::{ShardState, WqState};
use crate::wq::{WorkQueue, WqInner};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work for a refill worker
#[derive(Debug)]
pub enum RefillJob {
    /// Wait for free buffers, then refill this queue
    Refill(Arc<WorkQueue>),
    /// Exit the worker
    Stop,
}

/// Post buffers to a started receive queue until `capacity - step` are
/// outstanding. Returns the number posted.
///
/// Caller holds the CQ lock and then the WQ lock.
pub(crate) fn refill(wq: &Arc<WorkQueue>, cq_inner: &mut CqInner, inner: &mut WqInner) -> usize {
    let cq = wq.cq();
    let step = wq.context().config().refill_step;
    let target = wq.nents().saturating_sub(step);

    if inner.state != WqState::Started || !inner.buffers_loaded || cq.is_teardown() {
        return 0;
    }
    let current = cq.buffer_count() as usize;
    if current + step >= target {
        return 0;
    }

    let want = target - current;
    let mut done = 0;
    while !inner.is_teardown() && done < want {
        let bufs = wq.shard().take_n(step.min(want - done));
        if bufs.is_empty() {
            if current < step && !inner.refilling {
                dispatch(wq, inner);
            }
            break;
        }
        if cq.is_teardown() {
            bufs.into_iter().for_each(return_buffer);
            break;
        }
        let n = bufs.len();
        match wq.add_receive_buffers(cq_inner, inner, bufs) {
            Ok(posted) => done += posted,
            Err(rest) => {
                done += n - rest.len();
                rest.into_iter().for_each(return_buffer);
                break;
            }
        }
    }
    done
}

fn dispatch(wq: &Arc<WorkQueue>, inner: &mut WqInner) {
    let Some(tx) = inner.refill_tx.as_ref() else {
        tracing::debug!(wq = wq.num(), "shard empty and no refill workers");
        return;
    };
    if tx.send(RefillJob::Refill(Arc::clone(wq))).is_err() {
        tracing::warn!(wq = wq.num(), "refill workers gone");
        return;
    }
    inner.refilling = true;
    wq.context().stats().record_refill_task();
}

/// Refill `wq` from the control path, taking the CQ and WQ locks
pub fn refill_now(wq: &Arc<WorkQueue>) -> usize {
    let mut cq_inner = wq.cq().lock_inner();
    let mut inner = wq.lock_inner();
    refill(wq, &mut cq_inner, &mut inner)
}

fn refill_task(wq: &Arc<WorkQueue>) {
    let cq = wq.cq();
    let step = wq.context().config().refill_step;
    loop {
        wq.shard().wait_free(|| cq.is_teardown());
        let draining = wq.shard().state() == ShardState::Draining;

        let mut cq_inner = cq.lock_inner();
        let mut inner = wq.lock_inner();
        if draining || cq.is_teardown() || inner.is_teardown() {
            inner.refilling = false;
            tracing::debug!(wq = wq.num(), draining, "refill job abandoned");
            return;
        }
        let posted = refill(wq, &mut cq_inner, &mut inner);
        if posted == 0 && (inner.state != WqState::Started || !inner.buffers_loaded) {
            inner.refilling = false;
            return;
        }
        if cq.buffer_count() as usize >= step {
            inner.refilling = false;
            return;
        }
    }
}

fn worker_loop(rx: Receiver<RefillJob>) {
    while let Ok(job) = rx.recv() {
        match job {
            RefillJob::Refill(wq) => refill_task(&wq),
            RefillJob::Stop => break,
        }
    }
}

/// Worker threads running refill jobs for one ring group
pub struct RefillPool {
    name: String,
    tx: Sender<RefillJob>,
    rx: Receiver<RefillJob>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RefillPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefillPool")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl RefillPool {
    /// Spawn `nworkers` threads named `{name}-{i}`
    pub fn new(name: &str, nworkers: usize) -> DatapathResult<Self> {
        let (tx, rx) = unbounded();
        let mut pool = Self {
            name: name.to_string(),
            tx,
            rx,
            workers: Vec::with_capacity(nworkers),
        };
        for i in 0..nworkers.max(1) {
            let rx = pool.rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(rx));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(DatapathError::WorkerSpawn(e.to_string()));
                }
            }
        }
        tracing::info!(pool = name, workers = pool.workers.len(), "refill pool started");
        Ok(pool)
    }

    /// Job queue handle for the pool's work queues
    pub fn sender(&self) -> Sender<RefillJob> {
        self.tx.clone()
    }

    /// Running workers
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop and join every worker. Jobs still queued are discarded.
    ///
    /// Workers blocked in a job only return once their queue's CQ has
    /// been quiesced or its shard drained.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for _ in &self.workers {
            let _ = self.tx.send(RefillJob::Stop);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        let discarded = self.rx.try_iter().count();
        tracing::info!(pool = %self.name, discarded, "refill pool stopped");
    }
}

impl Drop for RefillPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferShard;
    use crate::config::{DatapathConfig, EqKind};
    use crate::cq::CompletionQueue;
    use crate::eq::EventQueue;
    use crate::hw::QueueKind;
    use crate::sim::SimHarness;
    use std::time::{Duration, Instant};

    fn config() -> DatapathConfig {
        DatapathConfig {
            rq_size_shift: 4,
            cq_size_shift: 4,
            refill_step: 4,
            mtu: 256,
            ..Default::default()
        }
    }

    fn loaded_rq(h: &SimHarness) -> Arc<WorkQueue> {
        let eq = EventQueue::new(0, 1, EqKind::Any);
        let cq = CompletionQueue::setup(&h.ctx, QueueKind::Receive, &eq).unwrap();
        let wq = WorkQueue::setup(&h.ctx, &cq, None).unwrap();
        wq.shard().ready();
        wq.start().unwrap();
        wq.lock_inner().buffers_loaded = true;
        wq
    }

    fn stock(h: &SimHarness, shard: &Arc<BufferShard>, n: usize) {
        for _ in 0..n {
            return_buffer(shard.create_buffer(h.dma.as_ref(), 256).unwrap());
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_refill_converges_below_capacity() {
        let h = SimHarness::new(config()).unwrap();
        let wq = loaded_rq(&h);
        stock(&h, wq.shard(), 16);

        assert_eq!(refill_now(&wq), 12);
        assert_eq!(wq.cq().buffer_count(), 12);
        assert_eq!(refill_now(&wq), 0);
        assert_eq!(wq.shard().counts().free, 4);
        assert!(wq.wqebb_used() <= wq.nents() as u64);
    }

    #[test]
    fn test_refill_skips_unloaded_queue() {
        let h = SimHarness::new(config()).unwrap();
        let wq = loaded_rq(&h);
        stock(&h, wq.shard(), 16);
        wq.lock_inner().buffers_loaded = false;
        assert_eq!(refill_now(&wq), 0);
        assert_eq!(wq.shard().counts().free, 16);
    }

    #[test]
    fn test_dry_shard_dispatches_once() {
        let h = SimHarness::new(config()).unwrap();
        let wq = loaded_rq(&h);
        let (tx, rx) = unbounded();
        wq.set_refill_sender(tx);

        assert_eq!(refill_now(&wq), 0);
        assert!(wq.is_refilling());
        assert!(matches!(rx.try_recv(), Ok(RefillJob::Refill(_))));

        assert_eq!(refill_now(&wq), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(h.ctx.stats().snapshot().refill_tasks, 1);
    }

    #[test]
    fn test_worker_refills_when_buffers_return() {
        let h = SimHarness::new(config()).unwrap();
        let wq = loaded_rq(&h);
        let pool = RefillPool::new("refill-test", 1).unwrap();
        wq.set_refill_sender(pool.sender());

        assert_eq!(refill_now(&wq), 0);
        assert!(wq.is_refilling());

        stock(&h, wq.shard(), 16);
        assert!(wait_until(|| wq.cq().buffer_count() == 12));
        assert!(wait_until(|| !wq.is_refilling()));
    }

    #[test]
    fn test_worker_exits_on_cq_teardown() {
        let h = SimHarness::new(config()).unwrap();
        let wq = loaded_rq(&h);
        let mut pool = RefillPool::new("refill-test", 1).unwrap();
        wq.set_refill_sender(pool.sender());

        refill_now(&wq);
        assert!(wq.is_refilling());
        thread::sleep(Duration::from_millis(20));

        wq.cq().quiesce();
        assert!(wait_until(|| !wq.is_refilling()));
        assert_eq!(wq.cq().buffer_count(), 0);
        pool.shutdown();
        assert_eq!(pool.workers(), 0);
    }
}
