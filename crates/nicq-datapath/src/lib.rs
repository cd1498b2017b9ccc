//! NICQ Data Path
//!
//! Data path of a multi-queue Ethernet adapter: descriptor rings shared
//! with the device, completion processing, receive buffer pools with
//! zero-copy loans, background refill, and receive-side scaling through
//! flow tables and hash targets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            DATAPATH                              │
//! │                                                                  │
//! │   root flow table (DMAC) ──► VLAN table ──► hash table ──► TIR   │
//! │                                                  │               │
//! │                                           redirection table      │
//! │                                                  │               │
//! │  ┌────────────── RX group ─────────────┐  ┌──── TX group ────┐   │
//! │  │  ┌──────┐   ┌──────┐   ┌────────┐   │  │ ┌──────┐ ┌─────┐ │   │
//! │  │  │  RQ  │◄──│shard │◄──│ refill │   │  │ │  SQ  │ │ TIS │ │   │
//! │  │  └──┬───┘   └──▲───┘   └────────┘   │  │ └──┬───┘ └─────┘ │   │
//! │  │     ▼          │ return             │  │    ▼             │   │
//! │  │  ┌──────┐   ┌──┴───┐                 │  │ ┌──────┐         │   │
//! │  │  │  CQ  │──►│stack │ loan / copy     │  │ │  CQ  │         │   │
//! │  │  └──┬───┘   └──────┘                 │  │ └──┬───┘         │   │
//! │  └─────┼───────────────────────────────┘  └────┼─────────────┘   │
//! │        └──────────── event queues ◄────────────┘                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! Locks are ranked by [`LockClass`]: port, group, flow table, event
//! queue, completion queue, work queue, pending returns, shard. Debug
//! builds panic on an out-of-order acquisition.
//!
//! # Collaborators
//!
//! The device, DMA memory, the network stack and the diagnostic sink are
//! traits ([`HardwareControl`], [`DeviceAccess`], [`DmaAllocator`],
//! [`NetworkStack`], [`DiagnosticSink`]). [`sim`] provides software
//! implementations for tests and benchmarks.

#![warn(missing_docs)]

pub mod batch;
pub mod buffer;
pub mod config;
pub mod cq;
pub mod descriptor;
pub mod device;
pub mod diag;
pub mod dma;
pub mod eq;
pub mod error;
pub mod flow;
pub mod group;
pub mod hw;
pub mod lifecycle;
pub mod lock_order;
pub mod refill;
pub mod rss;
pub mod sim;
pub mod stack;
pub mod stats;
pub mod wq;

pub use batch::ReturnBatch;
pub use buffer::{return_buffer, return_chain, Buffer, BufferShard, ShardCounts};
pub use config::{DatapathConfig, EqKind};
pub use cq::CompletionQueue;
pub use device::{Datapath, DeviceContext};
pub use diag::{ChannelDiagnostics, DiagnosticEvent, DiagnosticSink, TracingDiagnostics};
pub use dma::{DmaAllocator, HeapDmaAllocator};
pub use eq::{EqAllocator, EventQueue};
pub use error::{DatapathError, DatapathResult};
pub use flow::{FlowTable, MatchMask, PacketMatch};
pub use group::{GroupKind, RingGroup};
pub use hw::{DeviceAccess, HardwareControl, HwCommand, QueueKind, ServiceImpact};
pub use lock_order::LockClass;
pub use refill::{refill_now, RefillPool};
pub use rss::{FlowTuple, HashTarget, RedirectionTable, TirRole};
pub use stack::{LoanedBuffer, NetworkStack, RxPacket, TxPacket};
pub use stats::{PortStats, PortStatsSnapshot};
pub use wq::WorkQueue;
