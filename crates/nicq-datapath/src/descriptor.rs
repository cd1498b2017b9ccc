//! Ring entry records
//!
//! Send, receive and completion entries as structured records with named
//! fields. Bit layout is left to the device.

use bytes::Bytes;

/// Key marking an unused scatter slot
pub const NULL_LKEY: u32 = 0x100;

/// Reserved key for driver-owned memory
pub const RSVD_LKEY: u32 = 0;

/// Most bus segments one send descriptor group can carry
pub const SQE_MAX_PTRS: usize = 8;

/// Most ring slots one send descriptor group may use
pub const SQE_BUF: usize = 4;

/// Most 16-byte units one send descriptor group may describe
pub const SQE_MAX_DS: u8 = 15;

/// Inline header bytes that fit inside the ethernet segment
pub const ETH_INLINE_BUILTIN: usize = 2;

/// Largest inline header a send descriptor accepts
pub const MAX_INLINE_HEADERLEN: usize = 64;

/// Data segment size; also the inline spill granularity
pub const WQE_OCTOWORD: usize = 16;

/// Data segments in the head slot of a send group
pub const HEAD_DATA_SEGS: usize = 1;

/// Data segments in each extra slot of a send group
pub const EXTRA_DATA_SEGS: usize = 4;

/// 16-byte units before the head slot's data segments
pub const HEAD_DS_PREAMBLE: u8 = 3;

/// Scatter/gather pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSegment {
    /// Bytes at `address`
    pub byte_count: u32,
    /// Memory key
    pub lkey: u32,
    /// Bus address
    pub address: u64,
}

impl DataSegment {
    /// Terminates a scatter list
    pub const NULL: Self = Self {
        byte_count: 0,
        lkey: NULL_LKEY,
        address: 0,
    };

    /// Segment over driver memory
    pub fn new(address: u64, byte_count: u32) -> Self {
        Self {
            byte_count,
            lkey: RSVD_LKEY,
            address,
        }
    }

    /// Whether this is the terminator
    pub fn is_null(&self) -> bool {
        self.lkey == NULL_LKEY
    }
}

/// Receive descriptor: a fixed-width scatter list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvEntry {
    /// Scatter slots, padded with [`DataSegment::NULL`]
    pub segments: Vec<DataSegment>,
}

/// Send descriptor opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    /// No-op filler
    Nop,
    /// Plain send
    Send,
    /// Large send offload
    Lso,
}

impl SendOpcode {
    /// Opcode byte as the device encodes it
    pub fn code(self) -> u8 {
        match self {
            Self::Nop => 0x00,
            Self::Send => 0x0a,
            Self::Lso => 0x0e,
        }
    }
}

/// Send descriptor control segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSegment {
    /// Operation
    pub opcode: SendOpcode,
    /// Producer counter at the head slot
    pub wqe_index: u16,
    /// Send queue number
    pub sq: u32,
    /// 16-byte units in the whole group
    pub ds_count: u8,
    /// Request a completion for this descriptor
    pub cqe_always: bool,
}

impl ControlSegment {
    /// Control segment of a no-op filler at `wqe_index`
    pub fn nop(sq: u32, wqe_index: u16) -> Self {
        Self {
            opcode: SendOpcode::Nop,
            wqe_index,
            sq,
            ds_count: 1,
            cqe_always: true,
        }
    }

    /// First 64 bits of the slot, as written to the blue-flame register
    pub fn doorbell_word(&self) -> u64 {
        let hi = (u64::from(self.wqe_index) << 8) | u64::from(self.opcode.code());
        (hi << 32) | (u64::from(self.sq & 0x00ff_ffff) << 8) | u64::from(self.ds_count)
    }
}

/// Send descriptor ethernet segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthSegment {
    /// Offload the IPv4 header checksum
    pub l3_checksum: bool,
    /// Offload the TCP/UDP checksum
    pub l4_checksum: bool,
    /// Segmentation size for LSO
    pub mss: u16,
    /// Inline header length
    pub inline_hdr_size: u16,
    /// Inline header bytes
    pub inline_hdrs: Bytes,
}

/// One 16-byte slot of a send descriptor's data area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSlot {
    /// Holds spilled inline header bytes
    Inline,
    /// Gather pointer (or [`DataSegment::NULL`])
    Data(DataSegment),
}

impl SendSlot {
    /// Unused slot
    pub const NULL: Self = Self::Data(DataSegment::NULL);
}

/// One ring slot of the send queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEntry {
    /// Never written
    Empty,
    /// No-op filler
    Nop(ControlSegment),
    /// First slot of a packet's descriptor group
    Head {
        /// Control segment
        ctrl: ControlSegment,
        /// Ethernet segment
        eth: EthSegment,
        /// Data area
        data: [SendSlot; HEAD_DATA_SEGS],
    },
    /// Continuation slot
    Extra {
        /// Data area
        data: [SendSlot; EXTRA_DATA_SEGS],
    },
}

impl SendEntry {
    /// Continuation slot with every data slot unused
    pub fn extra() -> Self {
        Self::Extra {
            data: [SendSlot::NULL; EXTRA_DATA_SEGS],
        }
    }

    /// Data area of this slot
    pub fn slots(&self) -> &[SendSlot] {
        match self {
            Self::Head { data, .. } => data,
            Self::Extra { data } => data,
            _ => &[],
        }
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [SendSlot] {
        match self {
            Self::Head { data, .. } => data,
            Self::Extra { data } => data,
            _ => &mut [],
        }
    }

    /// Control segment of a head or no-op slot
    pub fn control(&self) -> Option<&ControlSegment> {
        match self {
            Self::Nop(ctrl) | Self::Head { ctrl, .. } => Some(ctrl),
            _ => None,
        }
    }

    /// Ring slots used by the group this slot heads
    pub fn wqebbs(&self) -> usize {
        match self {
            Self::Nop(_) => 1,
            Self::Head { ctrl, .. } => usize::from(ctrl.ds_count).div_ceil(4).max(1),
            _ => 0,
        }
    }
}

/// Completion opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeOpcode {
    /// Send completed
    Requester,
    /// Receive completed
    Responder,
    /// Send failed
    RequesterError,
    /// Receive failed
    ResponderError,
    /// Slot not written
    Invalid,
    /// Anything else
    Other(u8),
}

/// Completion entry format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeFormat {
    /// Uncompressed
    Basic,
    /// Anything else
    Other(u8),
}

/// Hardware error syndrome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeSyndrome {
    /// Length mismatch
    LocalLength,
    /// Queue operation error
    LocalQpOp,
    /// Memory protection fault
    LocalProtection,
    /// Flushed while the queue was in error
    WrFlushed,
    /// Memory window bind error
    MemWindowBind,
    /// Bad response
    BadResponse,
    /// Local access error
    LocalAccess,
    /// Transport retry counter exceeded
    XportRetryCtr,
    /// Receiver-not-ready retry counter exceeded
    RnrRetryCtr,
    /// Operation aborted
    Aborted,
    /// Unrecognised code
    Unknown(u8),
}

impl CqeSyndrome {
    /// Decode a raw syndrome byte
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => Self::LocalLength,
            0x02 => Self::LocalQpOp,
            0x04 => Self::LocalProtection,
            0x05 => Self::WrFlushed,
            0x06 => Self::MemWindowBind,
            0x10 => Self::BadResponse,
            0x11 => Self::LocalAccess,
            0x15 => Self::XportRetryCtr,
            0x16 => Self::RnrRetryCtr,
            0x22 => Self::Aborted,
            other => Self::Unknown(other),
        }
    }

    /// Raw syndrome byte
    pub fn to_raw(self) -> u8 {
        match self {
            Self::LocalLength => 0x01,
            Self::LocalQpOp => 0x02,
            Self::LocalProtection => 0x04,
            Self::WrFlushed => 0x05,
            Self::MemWindowBind => 0x06,
            Self::BadResponse => 0x10,
            Self::LocalAccess => 0x11,
            Self::XportRetryCtr => 0x15,
            Self::RnrRetryCtr => 0x16,
            Self::Aborted => 0x22,
            Self::Unknown(raw) => raw,
        }
    }

    /// Name used in diagnostic events
    pub fn name(self) -> &'static str {
        match self {
            Self::LocalLength => "local length",
            Self::LocalQpOp => "local qp op",
            Self::LocalProtection => "local protection",
            Self::WrFlushed => "wr flushed",
            Self::MemWindowBind => "mem window bind",
            Self::BadResponse => "bad response",
            Self::LocalAccess => "local access",
            Self::XportRetryCtr => "transport retry counter exceeded",
            Self::RnrRetryCtr => "rnr retry counter exceeded",
            Self::Aborted => "aborted",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Completion entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    /// Opcode
    pub opcode: CqeOpcode,
    /// Format
    pub format: CqeFormat,
    /// Ownership parity; flips on every ring wrap
    pub owner: bool,
    /// Producer counter of the completed descriptor
    pub wqe_counter: u16,
    /// Opcode of the completed send descriptor
    pub send_opcode: SendOpcode,
    /// Received bytes
    pub byte_count: u32,
    /// IPv4 header checksum verified
    pub l3_ok: bool,
    /// TCP/UDP checksum verified
    pub l4_ok: bool,
    /// Packets dropped by hardware since the last completion
    pub rx_drop_counter: u32,
    /// Error syndrome (error opcodes only)
    pub syndrome: u8,
    /// Vendor syndrome (error opcodes only)
    pub vendor_syndrome: u8,
}

impl CompletionEntry {
    /// Unwritten slot as initialised by the driver
    pub const INVALID: Self = Self {
        opcode: CqeOpcode::Invalid,
        format: CqeFormat::Basic,
        owner: true,
        wqe_counter: 0,
        send_opcode: SendOpcode::Nop,
        byte_count: 0,
        l3_ok: false,
        l4_ok: false,
        rx_drop_counter: 0,
        syndrome: 0,
        vendor_syndrome: 0,
    };

    /// Successful receive of `byte_count` bytes
    pub fn receive(wqe_counter: u16, byte_count: u32) -> Self {
        Self {
            opcode: CqeOpcode::Responder,
            wqe_counter,
            byte_count,
            ..Self::INVALID
        }
    }

    /// Successful send
    pub fn send(wqe_counter: u16, send_opcode: SendOpcode) -> Self {
        Self {
            opcode: CqeOpcode::Requester,
            wqe_counter,
            send_opcode,
            ..Self::INVALID
        }
    }

    /// Failed completion of either kind
    pub fn error(opcode: CqeOpcode, wqe_counter: u16, syndrome: CqeSyndrome) -> Self {
        Self {
            opcode,
            wqe_counter,
            syndrome: syndrome.to_raw(),
            ..Self::INVALID
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_segment() {
        assert!(DataSegment::NULL.is_null());
        assert!(!DataSegment::new(0x1000, 64).is_null());
        assert_eq!(SendSlot::NULL, SendSlot::Data(DataSegment::NULL));
    }

    #[test]
    fn test_group_slot_count() {
        let mut ctrl = ControlSegment::nop(7, 0);
        assert_eq!(SendEntry::Nop(ctrl).wqebbs(), 1);
        ctrl.opcode = SendOpcode::Send;
        for (ds, slots) in [(4, 1), (5, 2), (8, 2), (9, 3), (15, 4)] {
            ctrl.ds_count = ds;
            let head = SendEntry::Head {
                ctrl,
                eth: EthSegment::default(),
                data: [SendSlot::NULL],
            };
            assert_eq!(head.wqebbs(), slots, "ds_count {ds}");
        }
        assert_eq!(SendEntry::extra().wqebbs(), 0);
        assert_eq!(SendEntry::extra().slots().len(), EXTRA_DATA_SEGS);
    }

    #[test]
    fn test_doorbell_word() {
        let ctrl = ControlSegment::nop(0x12, 0x0102);
        assert_eq!(ctrl.doorbell_word(), (0x0001_0200u64 << 32) | (0x12 << 8) | 1);
    }

    #[test]
    fn test_syndrome_codes() {
        assert_eq!(CqeSyndrome::from_raw(0x04), CqeSyndrome::LocalProtection);
        assert_eq!(CqeSyndrome::from_raw(0x99).name(), "unknown");
        assert_eq!(CqeSyndrome::RnrRetryCtr.to_raw(), 0x16);
    }

    #[test]
    fn test_entry_constructors() {
        let rx = CompletionEntry::receive(5, 128);
        assert_eq!(rx.opcode, CqeOpcode::Responder);
        assert_eq!(rx.format, CqeFormat::Basic);
        let err = CompletionEntry::error(CqeOpcode::RequesterError, 2, CqeSyndrome::WrFlushed);
        assert_eq!(err.syndrome, 0x05);
    }
}
