//! Network stack hand-off
//!
//! Received packets go up either as a [`LoanedBuffer`] (the stack holds the
//! device buffer until its last handle drops) or as a copied [`Bytes`].
//! Packets to transmit come down as [`TxPacket`]s.

use crate::buffer::Buffer;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Receive checksum validation reported by hardware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxChecksum {
    /// IPv4 header checksum verified
    pub l3_ok: bool,
    /// TCP/UDP checksum verified
    pub l4_ok: bool,
}

/// Received payload
#[derive(Debug, Clone)]
pub enum RxData {
    /// Device buffer lent to the stack
    Loaned(LoanedBuffer),
    /// Copy into stack memory
    Copied(Bytes),
}

/// A received packet
#[derive(Debug, Clone)]
pub struct RxPacket {
    /// Payload
    pub data: RxData,
    /// Hardware checksum flags
    pub checksum: RxChecksum,
}

impl RxPacket {
    /// Payload length
    pub fn len(&self) -> usize {
        match &self.data {
            RxData::Loaned(loan) => loan.len(),
            RxData::Copied(bytes) => bytes.len(),
        }
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes (copies a loaned buffer)
    pub fn bytes(&self) -> Bytes {
        match &self.data {
            RxData::Loaned(loan) => loan.to_bytes(),
            RxData::Copied(bytes) => bytes.clone(),
        }
    }
}

struct Loan {
    buffer: Mutex<Option<Buffer>>,
    len: usize,
}

impl Drop for Loan {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.get_mut().take() {
            crate::buffer::return_buffer(buffer);
        }
    }
}

/// Shared handle to a loaned device buffer; the buffer goes back to its
/// shard when the last clone drops
#[derive(Clone)]
pub struct LoanedBuffer {
    inner: Arc<Loan>,
}

impl LoanedBuffer {
    pub(crate) fn new(buffer: Buffer) -> Self {
        let len = buffer.used();
        Self {
            inner: Arc::new(Loan {
                buffer: Mutex::new(Some(buffer)),
                len,
            }),
        }
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Run `f` over the payload in place
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.buffer.lock();
        match guard.as_ref() {
            Some(buffer) => buffer.dma().with_bytes(self.inner.len, f),
            None => f(&[]),
        }
    }

    /// Copy the payload out
    pub fn to_bytes(&self) -> Bytes {
        self.with_bytes(Bytes::copy_from_slice)
    }

    /// Live handles to this loan
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for LoanedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoanedBuffer")
            .field("len", &self.inner.len)
            .field("handles", &self.handles())
            .finish()
    }
}

/// Transmit checksum offload requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxChecksum {
    /// Compute the IPv4 header checksum
    pub l3: bool,
    /// Compute the TCP/UDP checksum
    pub l4: bool,
}

/// Per-packet transmit offload context
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    /// Header bytes copied inline into the descriptor
    pub inline_hdrlen: usize,
    /// The inline header bytes
    pub inline_hdrs: Bytes,
    /// Checksum offload
    pub checksum: TxChecksum,
    /// Segmentation offload MSS
    pub lso_mss: Option<u16>,
}

/// A packet to transmit
#[derive(Debug, Clone, Default)]
pub struct TxPacket {
    /// Payload fragments in order
    pub fragments: Vec<Bytes>,
    /// Offload context
    pub ctx: TxContext,
}

impl TxPacket {
    /// Packet from one contiguous fragment with `inline` header bytes
    pub fn single(data: Bytes, inline: usize) -> Self {
        let inline = inline.min(data.len());
        Self {
            ctx: TxContext {
                inline_hdrlen: inline,
                inline_hdrs: data.slice(..inline),
                ..Default::default()
            },
            fragments: vec![data],
        }
    }

    /// Total bytes across fragments
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }

    /// True when the packet carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Network stack side of the hand-off
pub trait NetworkStack: Send + Sync {
    /// Accept received packets from receive queue `wq`
    fn deliver_rx(&self, wq: u32, packets: Vec<RxPacket>);

    /// Allocate stack memory for a copied receive; `None` drops the packet
    fn alloc_rx(&self, len: usize) -> Option<BytesMut>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fragment_packet() {
        let pkt = TxPacket::single(Bytes::from_static(&[0u8; 60]), 18);
        assert_eq!(pkt.len(), 60);
        assert_eq!(pkt.ctx.inline_hdrs.len(), 18);
        assert_eq!(pkt.fragments.len(), 1);
    }

    #[test]
    fn test_copied_rx_packet() {
        let pkt = RxPacket {
            data: RxData::Copied(Bytes::from_static(b"abc")),
            checksum: RxChecksum::default(),
        };
        assert_eq!(pkt.len(), 3);
        assert_eq!(&pkt.bytes()[..], b"abc");
    }
}
