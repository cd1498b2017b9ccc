//! Event queues
//!
//! An event queue stands for one interrupt vector. It indexes the
//! completion queues bound to it by CQ number; [`EventQueue::dispatch`] is
//! the interrupt-context entrypoint and is serialized per event queue by
//! the EQ lock.

use crate::config::EqKind;
use crate::cq::CompletionQueue;
use crate::error::{DatapathError, DatapathResult};
use crate::lock_order::{LockClass, OrderedMutex};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One completion event queue
pub struct EventQueue {
    index: usize,
    num: u32,
    kind: EqKind,
    cqs: OrderedMutex<BTreeMap<u32, Arc<CompletionQueue>>>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("index", &self.index)
            .field("num", &self.num)
            .field("kind", &self.kind)
            .finish()
    }
}

impl EventQueue {
    /// Event queue on interrupt vector `index`
    pub fn new(index: usize, num: u32, kind: EqKind) -> Arc<Self> {
        Arc::new(Self {
            index,
            num,
            kind,
            cqs: OrderedMutex::new(LockClass::EventQueue, BTreeMap::new()),
        })
    }

    /// Interrupt vector
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hardware EQ number
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Traffic this event queue serves
    pub fn kind(&self) -> EqKind {
        self.kind
    }

    /// Numbers of the linked completion queues
    pub fn cq_nums(&self) -> Vec<u32> {
        self.cqs.lock().keys().copied().collect()
    }

    /// Insert `cq` into the index and arm it (EQ lock, then CQ lock)
    pub(crate) fn link(&self, cq: &Arc<CompletionQueue>) {
        let mut cqs = self.cqs.lock();
        let mut inner = cq.lock_inner();
        debug_assert!(!inner.eq_linked);
        cqs.insert(cq.num(), Arc::clone(cq));
        inner.eq_linked = true;
        cq.arm(&mut inner);
    }

    /// Remove `cq` from the index unless another path already did
    pub(crate) fn unlink(&self, cq: &CompletionQueue) {
        let mut cqs = self.cqs.lock();
        let mut inner = cq.lock_inner();
        if inner.eq_linked {
            cqs.remove(&cq.num());
            inner.eq_linked = false;
        }
    }

    /// Interrupt entrypoint: poll CQ `cq_num` for up to `budget` entries
    /// and deliver received packets outside both locks. Returns the number
    /// of completions consumed.
    pub fn dispatch(&self, cq_num: u32, budget: usize) -> usize {
        let (cq, outcome) = {
            let cqs = self.cqs.lock();
            let Some(cq) = cqs.get(&cq_num).cloned() else {
                tracing::debug!(eq = self.num, cq = cq_num, "event for unknown completion queue");
                return 0;
            };
            let mut inner = cq.lock_inner();
            if cq.is_teardown() {
                return 0;
            }
            cq.disarm();
            let outcome = cq.poll(&mut inner, budget);
            drop(inner);
            (cq, outcome)
        };

        if let (Some(wq), false) = (outcome.wq, outcome.packets.is_empty()) {
            cq.deliver(wq, outcome.packets);
        }
        outcome.completions
    }

    /// Dispatch every linked completion queue once
    pub fn dispatch_all(&self, budget: usize) -> usize {
        self.cq_nums()
            .into_iter()
            .map(|num| self.dispatch(num, budget))
            .sum()
    }
}

/// Round-robin assignment of rings to event queues.
///
/// The cursor is explicit state owned by the port, shared by every group
/// setup call.
#[derive(Debug, Default)]
pub struct EqAllocator {
    next: usize,
}

impl EqAllocator {
    /// Allocator starting at the first event queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Next event queue able to serve `rings`, wrapping around
    pub fn next_for(
        &mut self,
        eqs: &[Arc<EventQueue>],
        rings: EqKind,
    ) -> DatapathResult<Arc<EventQueue>> {
        for _ in 0..eqs.len() {
            let eq = &eqs[self.next % eqs.len()];
            self.next = (self.next + 1) % eqs.len();
            if eq.kind().serves(rings) {
                return Ok(Arc::clone(eq));
            }
        }
        Err(DatapathError::NoEventQueue(match rings {
            EqKind::Rx => "rx",
            EqKind::Tx => "tx",
            EqKind::Any => "any",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_filters_kind() {
        let eqs: Vec<_> = [EqKind::Rx, EqKind::Tx, EqKind::Any, EqKind::Rx]
            .into_iter()
            .enumerate()
            .map(|(i, k)| EventQueue::new(i, i as u32 + 1, k))
            .collect();
        let mut alloc = EqAllocator::new();

        let picks: Vec<u32> = (0..5)
            .map(|_| alloc.next_for(&eqs, EqKind::Rx).unwrap().num())
            .collect();
        assert_eq!(picks, vec![1, 3, 4, 1, 3]);

        assert_eq!(alloc.next_for(&eqs, EqKind::Tx).unwrap().num(), 2);
    }

    #[test]
    fn test_no_capable_queue() {
        let eqs = vec![EventQueue::new(0, 1, EqKind::Rx)];
        let mut alloc = EqAllocator::new();
        assert!(matches!(
            alloc.next_for(&eqs, EqKind::Tx),
            Err(DatapathError::NoEventQueue("tx"))
        ));
        assert!(alloc.next_for(&[], EqKind::Rx).is_err());
    }
}
