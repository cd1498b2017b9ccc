//! Object state machines
//!
//! Each data path object has an explicit state enum and a transition
//! table. Illegal transitions are rejected with
//! [`DatapathError::InvalidTransition`] instead of being silently applied.

use crate::error::{DatapathError, DatapathResult};
use std::fmt::Debug;

/// A state enum with a transition table
pub trait Lifecycle: Copy + Eq + Debug {
    /// Object kind used in error messages
    const OBJECT: &'static str;

    /// State name used in error messages
    fn name(self) -> &'static str;

    /// Whether `self -> to` is allowed
    fn can_transition(self, to: Self) -> bool;

    /// Move to `to` or fail without changing state
    fn transition(&mut self, to: Self) -> DatapathResult<()> {
        if !self.can_transition(to) {
            return Err(DatapathError::InvalidTransition {
                object: Self::OBJECT,
                from: self.name(),
                to: to.name(),
            });
        }
        *self = to;
        Ok(())
    }
}

/// Ownership state of a packet buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Created, never pooled
    Init,
    /// On the shard free list
    Free,
    /// Owned by a work queue (or in flight to one)
    OnQueue,
    /// Loaned to the network stack
    OnLoan,
    /// Non-head member of a transmit chain
    OnChain,
}

impl Lifecycle for BufferState {
    const OBJECT: &'static str = "buffer";

    fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Free => "free",
            Self::OnQueue => "on-queue",
            Self::OnLoan => "on-loan",
            Self::OnChain => "on-chain",
        }
    }

    fn can_transition(self, to: Self) -> bool {
        use BufferState::*;
        matches!(
            (self, to),
            (Init, Free)
                | (Free, OnQueue)
                | (OnQueue, OnLoan)
                | (OnQueue, OnChain)
                | (OnQueue, Free)
                | (OnLoan, Free)
                | (OnChain, Free)
        )
    }
}

/// Buffer shard availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    /// Created, not yet handing out buffers
    Init,
    /// Handing out and recycling buffers
    Ready,
    /// Returned buffers are destroyed
    Draining,
}

impl Lifecycle for ShardState {
    const OBJECT: &'static str = "shard";

    fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Draining => "draining",
        }
    }

    fn can_transition(self, to: Self) -> bool {
        use ShardState::*;
        matches!(
            (self, to),
            (Init, Ready) | (Init, Draining) | (Ready, Draining) | (Draining, Ready)
        )
    }
}

/// Work queue lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WqState {
    /// Software object only
    Init,
    /// Ring and doorbell memory allocated
    Allocated,
    /// Hardware queue created
    Created,
    /// Hardware queue accepting descriptors
    Started,
    /// Being torn down; no new descriptors
    Teardown,
    /// All resources released
    Destroyed,
}

impl Lifecycle for WqState {
    const OBJECT: &'static str = "work queue";

    fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Allocated => "allocated",
            Self::Created => "created",
            Self::Started => "started",
            Self::Teardown => "teardown",
            Self::Destroyed => "destroyed",
        }
    }

    fn can_transition(self, to: Self) -> bool {
        use WqState::*;
        matches!(
            (self, to),
            (Init, Allocated)
                | (Allocated, Created)
                | (Created, Started)
                | (Started, Created)
                | (Init | Allocated | Created | Started, Teardown)
                | (Teardown, Destroyed)
        )
    }
}

/// Completion queue lifecycle; teardown is a separate atomic flag so the
/// interrupt path can observe it without the CQ lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqState {
    /// Software object only
    Init,
    /// Ring and doorbell memory allocated
    Allocated,
    /// Hardware queue created
    Created,
    /// All resources released
    Destroyed,
}

impl Lifecycle for CqState {
    const OBJECT: &'static str = "completion queue";

    fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Allocated => "allocated",
            Self::Created => "created",
            Self::Destroyed => "destroyed",
        }
    }

    fn can_transition(self, to: Self) -> bool {
        use CqState::*;
        matches!(
            (self, to),
            (Init, Allocated) | (Allocated, Created) | (Init | Allocated | Created, Destroyed)
        )
    }
}

/// Ring group setup phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupPhase {
    /// Group memory and lock initialised
    Init,
    /// Work and completion queues set up
    Wqs,
    /// Hash targets (RX) or transmit interface (TX) created
    TirTis,
    /// Redirection table created
    RedirTable,
    /// Flow tables and rules installed
    Flows,
    /// Refill workers running, queues started
    Running,
}

impl GroupPhase {
    const ALL: [GroupPhase; 6] = [
        GroupPhase::Init,
        GroupPhase::Wqs,
        GroupPhase::TirTis,
        GroupPhase::RedirTable,
        GroupPhase::Flows,
        GroupPhase::Running,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Wqs => "wqs",
            Self::TirTis => "tir-tis",
            Self::RedirTable => "redir-table",
            Self::Flows => "flows",
            Self::Running => "running",
        }
    }

    /// Phase that must be held before this one can be acquired
    pub fn prerequisite(self) -> Option<GroupPhase> {
        match self {
            Self::Init => None,
            Self::Wqs | Self::TirTis => Some(Self::Init),
            Self::RedirTable | Self::Running => Some(Self::Wqs),
            Self::Flows => Some(Self::TirTis),
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// The set of phases a ring group currently holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupPhases {
    held: u8,
}

impl GroupPhases {
    /// Whether `phase` is held
    pub fn has(&self, phase: GroupPhase) -> bool {
        self.held & phase.bit() != 0
    }

    /// True when no phase is held
    pub fn is_empty(&self) -> bool {
        self.held == 0
    }

    /// Held phases in acquisition order
    pub fn held(&self) -> Vec<GroupPhase> {
        GroupPhase::ALL
            .into_iter()
            .filter(|p| self.has(*p))
            .collect()
    }

    /// Take `phase`; its prerequisite must already be held
    pub fn acquire(&mut self, phase: GroupPhase) -> DatapathResult<()> {
        if self.has(phase) {
            return Err(self.invalid(phase, "held"));
        }
        if let Some(pre) = phase.prerequisite() {
            if !self.has(pre) {
                return Err(DatapathError::InvalidTransition {
                    object: "ring group",
                    from: pre.name(),
                    to: phase.name(),
                });
            }
        }
        self.held |= phase.bit();
        Ok(())
    }

    /// Drop `phase`; no held phase may still depend on it
    pub fn release(&mut self, phase: GroupPhase) -> DatapathResult<()> {
        if !self.has(phase) {
            return Err(self.invalid(phase, "released"));
        }
        if let Some(dep) = GroupPhase::ALL
            .into_iter()
            .find(|p| self.has(*p) && p.prerequisite() == Some(phase))
        {
            return Err(DatapathError::InvalidTransition {
                object: "ring group",
                from: dep.name(),
                to: phase.name(),
            });
        }
        self.held &= !phase.bit();
        Ok(())
    }

    fn invalid(&self, phase: GroupPhase, already: &'static str) -> DatapathError {
        DatapathError::InvalidTransition {
            object: "ring group",
            from: already,
            to: phase.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_transitions() {
        let mut state = BufferState::Init;
        state.transition(BufferState::Free).unwrap();
        state.transition(BufferState::OnQueue).unwrap();
        state.transition(BufferState::OnLoan).unwrap();
        state.transition(BufferState::Free).unwrap();

        let err = state.transition(BufferState::Free).unwrap_err();
        assert_eq!(err.to_string(), "invalid buffer transition: free -> free");
        assert_eq!(state, BufferState::Free);
    }

    #[test]
    fn test_loan_requires_queue() {
        let mut state = BufferState::Free;
        assert!(state.transition(BufferState::OnLoan).is_err());
        assert!(!BufferState::OnChain.can_transition(BufferState::OnLoan));
    }

    #[test]
    fn test_shard_drain_and_resume() {
        let mut state = ShardState::Init;
        state.transition(ShardState::Ready).unwrap();
        state.transition(ShardState::Draining).unwrap();
        state.transition(ShardState::Ready).unwrap();
        assert!(!ShardState::Ready.can_transition(ShardState::Init));
    }

    #[test]
    fn test_wq_lifecycle() {
        let mut state = WqState::Init;
        state.transition(WqState::Allocated).unwrap();
        state.transition(WqState::Created).unwrap();
        state.transition(WqState::Started).unwrap();
        state.transition(WqState::Created).unwrap();
        state.transition(WqState::Teardown).unwrap();
        assert!(state.transition(WqState::Started).is_err());
        state.transition(WqState::Destroyed).unwrap();
        assert!(state.transition(WqState::Teardown).is_err());
    }

    #[test]
    fn test_cq_lifecycle() {
        let mut state = CqState::Init;
        state.transition(CqState::Allocated).unwrap();
        state.transition(CqState::Created).unwrap();
        state.transition(CqState::Destroyed).unwrap();
        assert!(state.transition(CqState::Destroyed).is_err());
    }

    #[test]
    fn test_group_phase_order() {
        let mut phases = GroupPhases::default();
        assert!(phases.acquire(GroupPhase::Wqs).is_err());

        phases.acquire(GroupPhase::Init).unwrap();
        phases.acquire(GroupPhase::Wqs).unwrap();
        phases.acquire(GroupPhase::RedirTable).unwrap();
        phases.acquire(GroupPhase::TirTis).unwrap();
        phases.acquire(GroupPhase::Flows).unwrap();
        phases.acquire(GroupPhase::Running).unwrap();
        assert!(phases.acquire(GroupPhase::Running).is_err());

        // TirTis still backs Flows
        assert!(phases.release(GroupPhase::TirTis).is_err());

        for phase in [
            GroupPhase::Flows,
            GroupPhase::Running,
            GroupPhase::TirTis,
            GroupPhase::RedirTable,
            GroupPhase::Wqs,
            GroupPhase::Init,
        ] {
            phases.release(phase).unwrap();
        }
        assert!(phases.is_empty());
    }

    #[test]
    fn test_held_listing() {
        let mut phases = GroupPhases::default();
        phases.acquire(GroupPhase::Init).unwrap();
        phases.acquire(GroupPhase::TirTis).unwrap();
        assert_eq!(phases.held(), vec![GroupPhase::Init, GroupPhase::TirTis]);
        assert!(phases.release(GroupPhase::Wqs).is_err());
    }
}
