//! Hardware collaborators
//!
//! The data path never talks to the device directly. Object lifecycle goes
//! through [`HardwareControl`], a synchronous command call that returns the
//! hardware object number. Memory visibility, doorbell registers and fault
//! status go through [`DeviceAccess`].

use crate::flow::{FlowDest, MatchMask, PacketMatch};
use crate::rss::{RssFields, TirRole};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Hardware object lifecycle command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCommand {
    /// Create a completion queue bound to event queue `eq`
    CreateCq {
        /// Owning event queue
        eq: u32,
        /// log2 of entries
        log_size: u32,
        /// Moderation period in microseconds
        moderation_period: u32,
        /// Moderation count
        moderation_count: u32,
    },
    /// Destroy a completion queue
    DestroyCq {
        /// CQ number
        cq: u32,
    },
    /// Create a receive queue
    CreateRq {
        /// Paired CQ
        cq: u32,
        /// log2 of entries
        log_size: u32,
    },
    /// Move a receive queue to ready
    StartRq {
        /// RQ number
        rq: u32,
    },
    /// Move a receive queue to reset
    StopRq {
        /// RQ number
        rq: u32,
    },
    /// Destroy a receive queue
    DestroyRq {
        /// RQ number
        rq: u32,
    },
    /// Create a send queue
    CreateSq {
        /// Paired CQ
        cq: u32,
        /// Transmit interface
        tis: u32,
        /// log2 of entries
        log_size: u32,
    },
    /// Move a send queue to ready
    StartSq {
        /// SQ number
        sq: u32,
    },
    /// Move a send queue to reset
    StopSq {
        /// SQ number
        sq: u32,
    },
    /// Destroy a send queue
    DestroySq {
        /// SQ number
        sq: u32,
    },
    /// Create a transmit interface
    CreateTis,
    /// Destroy a transmit interface
    DestroyTis {
        /// TIS number
        tis: u32,
    },
    /// Create a receive queue redirection table
    CreateRqt {
        /// Table size (power of two)
        max: u32,
        /// Receive queues, repeated to fill the table
        rqs: Vec<u32>,
    },
    /// Destroy a redirection table
    DestroyRqt {
        /// RQT number
        rqt: u32,
    },
    /// Create a hash-distribution (or direct) receive target
    CreateTir {
        /// Protocol class
        role: TirRole,
        /// Redirection table for indirect targets
        rqt: Option<u32>,
        /// Receive queue for direct targets
        rq: Option<u32>,
        /// Toeplitz key
        key: Vec<u8>,
        /// Hashed header fields
        fields: RssFields,
    },
    /// Destroy a receive target
    DestroyTir {
        /// TIR number
        tir: u32,
    },
    /// Create a flow table
    CreateFlowTable {
        /// Table level (0 is the port root)
        level: u8,
        /// log2 of entries
        log_size: u32,
    },
    /// Destroy a flow table
    DestroyFlowTable {
        /// Table number
        table: u32,
    },
    /// Create a flow group
    CreateFlowGroup {
        /// Table number
        table: u32,
        /// First entry index
        start: u32,
        /// Number of entries
        size: u32,
        /// Matched fields
        mask: MatchMask,
    },
    /// Destroy a flow group
    DestroyFlowGroup {
        /// Table number
        table: u32,
        /// Group number
        group: u32,
    },
    /// Install or update a flow entry
    SetFlowEntry {
        /// Table number
        table: u32,
        /// Entry index
        index: u32,
        /// Match values
        matcher: PacketMatch,
        /// Forwarding destinations
        dests: Vec<FlowDest>,
    },
    /// Remove a flow entry
    DeleteFlowEntry {
        /// Table number
        table: u32,
        /// Entry index
        index: u32,
    },
    /// Point the port root at a flow table
    SetRootTable {
        /// Table number
        table: u32,
    },
    /// Query a work queue's hardware state
    QueryQueueState {
        /// Queue kind
        kind: QueueKind,
        /// Queue number
        num: u32,
    },
}

impl HwCommand {
    /// Command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateCq { .. } => "CREATE_CQ",
            Self::DestroyCq { .. } => "DESTROY_CQ",
            Self::CreateRq { .. } => "CREATE_RQ",
            Self::StartRq { .. } => "START_RQ",
            Self::StopRq { .. } => "STOP_RQ",
            Self::DestroyRq { .. } => "DESTROY_RQ",
            Self::CreateSq { .. } => "CREATE_SQ",
            Self::StartSq { .. } => "START_SQ",
            Self::StopSq { .. } => "STOP_SQ",
            Self::DestroySq { .. } => "DESTROY_SQ",
            Self::CreateTis => "CREATE_TIS",
            Self::DestroyTis { .. } => "DESTROY_TIS",
            Self::CreateRqt { .. } => "CREATE_RQT",
            Self::DestroyRqt { .. } => "DESTROY_RQT",
            Self::CreateTir { .. } => "CREATE_TIR",
            Self::DestroyTir { .. } => "DESTROY_TIR",
            Self::CreateFlowTable { .. } => "CREATE_FLOW_TABLE",
            Self::DestroyFlowTable { .. } => "DESTROY_FLOW_TABLE",
            Self::CreateFlowGroup { .. } => "CREATE_FLOW_GROUP",
            Self::DestroyFlowGroup { .. } => "DESTROY_FLOW_GROUP",
            Self::SetFlowEntry { .. } => "SET_FLOW_TABLE_ENTRY",
            Self::DeleteFlowEntry { .. } => "DELETE_FLOW_TABLE_ENTRY",
            Self::SetRootTable { .. } => "SET_FLOW_TABLE_ROOT",
            Self::QueryQueueState { .. } => "QUERY_QUEUE_STATE",
        }
    }
}

/// Work queue kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Send queue
    Send,
    /// Receive queue
    Receive,
}

impl QueueKind {
    /// Short name used in diagnostics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

/// Hardware state reported for a work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwQueueState {
    /// Reset
    Reset,
    /// Ready
    Ready,
    /// Error
    Error,
    /// Any other raw value
    Unknown(u32),
}

impl HwQueueState {
    /// Decode a raw query result
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Reset,
            1 => Self::Ready,
            3 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    /// Encode for a query result
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Reset => 0,
            Self::Ready => 1,
            Self::Error => 3,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Hardware command failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// Device rejected the command
    #[error("rejected with status {status}: {detail}")]
    Rejected {
        /// Status code
        status: u8,
        /// Detail text
        detail: String,
    },
    /// Device did not answer
    #[error("command timed out")]
    Timeout,
}

/// Synchronous hardware object control
pub trait HardwareControl: Send + Sync {
    /// Run `cmd`; on success returns the object number (or query result)
    fn execute(&self, cmd: &HwCommand) -> Result<u32, HwError>;
}

/// Hardware-visible memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaRegion {
    /// Work queue descriptor slots `[first, first + count)`
    WqEntries {
        /// WQ number
        wq: u32,
        /// First slot
        first: usize,
        /// Slot count
        count: usize,
    },
    /// Work queue doorbell record
    WqDoorbell {
        /// WQ number
        wq: u32,
    },
    /// Completion queue entries
    CqEntries {
        /// CQ number
        cq: u32,
    },
    /// Completion queue doorbell record
    CqDoorbell {
        /// CQ number
        cq: u32,
    },
    /// Packet buffer
    Buffer {
        /// Bus address of the first segment
        addr: u64,
        /// Bytes
        len: usize,
    },
    /// Doorbell register page
    Uar,
}

impl DmaRegion {
    /// Short name used in errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::WqEntries { .. } => "wq entries",
            Self::WqDoorbell { .. } => "wq doorbell",
            Self::CqEntries { .. } => "cq entries",
            Self::CqDoorbell { .. } => "cq doorbell",
            Self::Buffer { .. } => "packet buffer",
            Self::Uar => "uar",
        }
    }
}

/// Doorbell register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UarRegister {
    /// Send queue blue-flame doorbell
    Blueflame {
        /// SQ number
        sq: u32,
    },
    /// Completion queue arm register
    CqArm {
        /// CQ number
        cq: u32,
    },
}

/// Fault state of a region after an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// Access completed
    Ok,
    /// Access faulted; clear before retrying
    Fault,
}

/// Memory visibility and register access
pub trait DeviceAccess: Send + Sync {
    /// Make CPU writes to `region` visible to the device
    fn sync_for_device(&self, region: DmaRegion);

    /// Make device writes to `region` visible to the CPU
    fn sync_for_cpu(&self, region: DmaRegion);

    /// Write a 64-bit doorbell register
    fn write_uar(&self, reg: UarRegister, value: u64);

    /// Fault status of the last access to `region`
    fn fault_status(&self, region: DmaRegion) -> FaultStatus;

    /// Clear a recorded fault on `region`
    fn clear_fault(&self, region: DmaRegion);
}

/// Device-wide service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServiceImpact {
    /// Fully operational
    Ok = 0,
    /// Operating with reported errors
    Degraded = 1,
    /// Data path no longer reliable
    Lost = 2,
}

/// Shared service state; reports only ever escalate
#[derive(Debug, Default)]
pub struct DeviceHealth {
    level: AtomicU8,
}

impl DeviceHealth {
    /// Current service state
    pub fn current(&self) -> ServiceImpact {
        match self.level.load(Ordering::Acquire) {
            0 => ServiceImpact::Ok,
            1 => ServiceImpact::Degraded,
            _ => ServiceImpact::Lost,
        }
    }

    /// Record `impact`, keeping the worst state seen
    pub fn report(&self, impact: ServiceImpact) {
        let prev = self.level.fetch_max(impact as u8, Ordering::AcqRel);
        if prev < impact as u8 {
            tracing::warn!(impact = ?impact, "device service impact raised");
        }
    }
}
