//! Receive-side scaling
//!
//! Each RX group spreads traffic over its receive queues through a
//! redirection table and one hash target per protocol class. The "other"
//! class bypasses hashing and lands on the group's first queue.
//!
//! # Design
//!
//! - Keys repeat a random 16-bit pattern, so the Toeplitz hash of a flow
//!   and of its reverse direction agree
//! - The redirection table is the next power of two at or above the ring
//!   count (at least 2), filled by repeating the queue list

use crate::device::DeviceContext;
use crate::error::DatapathResult;
use crate::hw::HwCommand;
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Toeplitz key length
pub const RSS_KEY_LEN: usize = 40;

/// Protocol class of a receive target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TirRole {
    /// Anything not matched below, delivered unhashed
    Other,
    /// IPv4, addresses hashed
    Ipv4,
    /// IPv6, addresses hashed
    Ipv6,
    /// TCP over IPv4
    TcpV4,
    /// TCP over IPv6
    TcpV6,
    /// UDP over IPv4
    UdpV4,
    /// UDP over IPv6
    UdpV6,
}

impl TirRole {
    /// Every role, in creation order
    pub const ALL: [TirRole; 7] = [
        TirRole::Other,
        TirRole::Ipv4,
        TirRole::Ipv6,
        TirRole::TcpV4,
        TirRole::TcpV6,
        TirRole::UdpV4,
        TirRole::UdpV6,
    ];

    /// Header fields hashed for this class
    pub fn fields(self) -> RssFields {
        let (l3, l4) = match self {
            Self::Other => return RssFields::default(),
            Self::Ipv4 => (L3Type::Ipv4, None),
            Self::Ipv6 => (L3Type::Ipv6, None),
            Self::TcpV4 => (L3Type::Ipv4, Some(L4Type::Tcp)),
            Self::TcpV6 => (L3Type::Ipv6, Some(L4Type::Tcp)),
            Self::UdpV4 => (L3Type::Ipv4, Some(L4Type::Udp)),
            Self::UdpV6 => (L3Type::Ipv6, Some(L4Type::Udp)),
        };
        RssFields {
            l3: Some(l3),
            l4,
            addresses: true,
            ports: l4.is_some(),
        }
    }

    /// Name for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::TcpV4 => "tcpv4",
            Self::TcpV6 => "tcpv6",
            Self::UdpV4 => "udpv4",
            Self::UdpV6 => "udpv6",
        }
    }
}

/// Network layer a target hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Type {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

/// Transport layer a target hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Type {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

/// Hashed header selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RssFields {
    /// Network layer, `None` for unhashed targets
    pub l3: Option<L3Type>,
    /// Transport layer
    pub l4: Option<L4Type>,
    /// Source and destination addresses
    pub addresses: bool,
    /// Source and destination ports
    pub ports: bool,
}

/// Flow identity fed to the hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Source port
    pub sport: u16,
    /// Destination port
    pub dport: u16,
}

impl FlowTuple {
    /// The same flow seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
        }
    }

    fn hash_input(&self, fields: &RssFields) -> Vec<u8> {
        let mut input = Vec::with_capacity(36);
        if fields.addresses {
            for addr in [self.src, self.dst] {
                match addr {
                    IpAddr::V4(a) => input.extend_from_slice(&a.octets()),
                    IpAddr::V6(a) => input.extend_from_slice(&a.octets()),
                }
            }
        }
        if fields.ports {
            input.extend_from_slice(&self.sport.to_be_bytes());
            input.extend_from_slice(&self.dport.to_be_bytes());
        }
        input
    }
}

/// Symmetric Toeplitz key: a random 16-bit pattern repeated
pub fn symmetric_key() -> [u8; RSS_KEY_LEN] {
    let mut rng = rand::thread_rng();
    // An all-zero key hashes every flow to queue 0
    let pattern: [u8; 2] = loop {
        let p: [u8; 2] = rng.gen();
        if p != [0, 0] {
            break p;
        }
    };
    let mut key = [0u8; RSS_KEY_LEN];
    for (i, b) in key.iter_mut().enumerate() {
        *b = pattern[i % 2];
    }
    key
}

/// Toeplitz hash of `input` under `key`. Input beyond the key's reach
/// (`key.len() - 4` bytes) is ignored.
pub fn toeplitz(key: &[u8], input: &[u8]) -> u32 {
    if key.len() < 4 {
        return 0;
    }
    let mut window = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    let mut result = 0u32;
    for (i, byte) in input.iter().take(key.len() - 4).enumerate() {
        let next = key[i + 4];
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                result ^= window;
            }
            window = (window << 1) | u32::from(next & (0x80 >> bit) != 0);
        }
    }
    result
}

/// Hash bucket to receive queue map
#[derive(Debug)]
pub struct RedirectionTable {
    ctx: Arc<DeviceContext>,
    num: u32,
    entries: Vec<u32>,
    destroyed: AtomicBool,
}

impl RedirectionTable {
    /// Smallest table size able to hold `nrings` queues
    pub fn size_for(nrings: usize) -> usize {
        nrings.max(2).next_power_of_two()
    }

    /// Create a table over receive queues `rqs`
    pub fn create(ctx: &Arc<DeviceContext>, rqs: &[u32]) -> DatapathResult<Arc<Self>> {
        let max = Self::size_for(rqs.len());
        let entries: Vec<u32> = rqs.iter().copied().cycle().take(max).collect();
        let num = ctx.exec(&HwCommand::CreateRqt {
            max: max as u32,
            rqs: entries.clone(),
        })?;
        tracing::debug!(rqt = num, max, rings = rqs.len(), "redirection table created");
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            num,
            entries,
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Hardware RQT number
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Table size
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; tables hold at least two buckets
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receive queue for `hash`
    pub fn queue_for(&self, hash: u32) -> Option<u32> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries[hash as usize & (self.entries.len() - 1)])
    }

    /// Destroy the table. Safe to call repeatedly.
    pub fn teardown(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.ctx
                .exec_best_effort(&HwCommand::DestroyRqt { rqt: self.num });
        }
    }
}

/// A receive target for one protocol class
#[derive(Debug)]
pub struct HashTarget {
    ctx: Arc<DeviceContext>,
    num: u32,
    role: TirRole,
    key: Vec<u8>,
    fields: RssFields,
    rqt: Option<Arc<RedirectionTable>>,
    direct: Option<u32>,
    destroyed: AtomicBool,
}

impl HashTarget {
    /// Create the target for `role`. [`TirRole::Other`] delivers straight
    /// to `direct_rq`; every other role hashes through `rqt` with its own
    /// key.
    pub fn create(
        ctx: &Arc<DeviceContext>,
        role: TirRole,
        rqt: &Arc<RedirectionTable>,
        direct_rq: u32,
    ) -> DatapathResult<Arc<Self>> {
        let fields = role.fields();
        let (key, rqt, direct) = match role {
            TirRole::Other => (Vec::new(), None, Some(direct_rq)),
            _ => (symmetric_key().to_vec(), Some(Arc::clone(rqt)), None),
        };
        let num = ctx.exec(&HwCommand::CreateTir {
            role,
            rqt: rqt.as_ref().map(|t| t.num()),
            rq: direct,
            key: key.clone(),
            fields,
        })?;
        tracing::debug!(tir = num, role = role.as_str(), "hash target created");
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            num,
            role,
            key,
            fields,
            rqt,
            direct,
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Hardware TIR number
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Protocol class
    pub fn role(&self) -> TirRole {
        self.role
    }

    /// Toeplitz key (empty for direct targets)
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Hashed fields
    pub fn fields(&self) -> RssFields {
        self.fields
    }

    /// Hash of `tuple` over this target's fields
    pub fn hash(&self, tuple: &FlowTuple) -> u32 {
        toeplitz(&self.key, &tuple.hash_input(&self.fields))
    }

    /// Receive queue `tuple` lands on
    pub fn select_queue(&self, tuple: &FlowTuple) -> Option<u32> {
        if let Some(rq) = self.direct {
            return Some(rq);
        }
        self.rqt.as_ref()?.queue_for(self.hash(tuple))
    }

    /// Destroy the target. Safe to call repeatedly.
    pub fn teardown(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.ctx
                .exec_best_effort(&HwCommand::DestroyTir { tir: self.num });
        }
    }
}
