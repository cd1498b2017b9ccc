//! Hardware-visible memory
//!
//! [`DmaAllocator`] hands out [`DmaBuffer`]s: owned memory plus the list of
//! bus address segments the device uses to reach it. Stack memory can be
//! bound in place for zero-copy transmit. [`HeapDmaAllocator`] is the
//! software implementation; it also gives a device model address-based
//! access to every live buffer.

use crate::error::{DatapathError, DatapathResult};
use crate::hw::DmaRegion;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Bus address granularity of the software allocator
pub const DMA_PAGE: usize = 4096;

/// One contiguous bus address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Bus address
    pub addr: u64,
    /// Length in bytes
    pub len: usize,
}

enum Backing {
    Owned(Mutex<Vec<u8>>),
    Bound(Bytes),
}

type Registry = RwLock<BTreeMap<u64, Weak<DmaMemory>>>;

/// Memory shared between the CPU and the device model
pub struct DmaMemory {
    base: u64,
    backing: Backing,
    registry: Weak<Registry>,
}

impl DmaMemory {
    fn len(&self) -> usize {
        match &self.backing {
            Backing::Owned(mem) => mem.lock().len(),
            Backing::Bound(bytes) => bytes.len(),
        }
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.base);
        }
    }
}

/// A hardware-visible buffer
#[derive(Default)]
pub struct DmaBuffer {
    mem: Option<Arc<DmaMemory>>,
    segments: Vec<DmaSegment>,
    offset: usize,
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("segments", &self.segments)
            .field("offset", &self.offset)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl DmaBuffer {
    /// A buffer with no memory behind it (foreign buffers before binding)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether memory is attached
    pub fn is_allocated(&self) -> bool {
        self.mem.is_some()
    }

    /// Whether the memory is borrowed stack memory
    pub fn is_bound(&self) -> bool {
        matches!(
            self.mem.as_deref(),
            Some(DmaMemory {
                backing: Backing::Bound(_),
                ..
            })
        )
    }

    /// Usable length
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// True when no bytes are reachable
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bus address segments
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    /// Number of bus address segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Region descriptor for sync and fault calls
    pub fn region(&self) -> DmaRegion {
        DmaRegion::Buffer {
            addr: self.segments.first().map(|s| s.addr).unwrap_or(0),
            len: self.len(),
        }
    }

    /// Skip the first `n` bytes (receive IP alignment)
    pub fn trim_front(&mut self, n: usize) {
        let mut left = n;
        while left > 0 {
            let Some(first) = self.segments.first_mut() else {
                break;
            };
            if first.len > left {
                first.addr += left as u64;
                first.len -= left;
                break;
            }
            left -= first.len;
            self.segments.remove(0);
        }
        self.offset += n;
    }

    /// Copy `data` into owned memory at the usable start
    pub fn write(&self, data: &[u8]) -> DatapathResult<()> {
        match self.mem.as_deref() {
            Some(DmaMemory {
                backing: Backing::Owned(mem),
                ..
            }) => {
                let mut mem = mem.lock();
                let end = self.offset + data.len();
                if end > mem.len() {
                    return Err(DatapathError::InvalidDescriptor(format!(
                        "{} bytes do not fit a {} byte buffer",
                        data.len(),
                        mem.len() - self.offset
                    )));
                }
                mem[self.offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(DatapathError::InvalidDescriptor("buffer has no owned memory".into())),
        }
    }

    /// Run `f` over the first `len` usable bytes
    pub fn with_bytes<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.mem.as_deref().map(|m| &m.backing) {
            Some(Backing::Owned(mem)) => {
                let mem = mem.lock();
                let end = (self.offset + len).min(mem.len());
                f(&mem[self.offset.min(end)..end])
            }
            Some(Backing::Bound(bytes)) => {
                let end = (self.offset + len).min(bytes.len());
                f(&bytes[self.offset.min(end)..end])
            }
            None => f(&[]),
        }
    }

    /// Copy out the first `len` usable bytes
    pub fn to_bytes(&self, len: usize) -> Bytes {
        self.with_bytes(len, Bytes::copy_from_slice)
    }

    /// Release bound stack memory, keeping the buffer reusable
    pub fn unbind(&mut self) {
        if self.is_bound() {
            self.mem = None;
            self.segments.clear();
            self.offset = 0;
        }
    }
}

/// Hardware-visible memory service
pub trait DmaAllocator: Send + Sync {
    /// Allocate `len` bytes; all or nothing
    fn alloc(&self, len: usize) -> DatapathResult<DmaBuffer>;

    /// Map stack memory for the device without copying
    fn bind(&self, data: Bytes) -> DatapathResult<DmaBuffer>;
}

/// Software allocator with fake, monotonically assigned bus addresses
pub struct HeapDmaAllocator {
    next_addr: AtomicU64,
    max_segment: usize,
    registry: Arc<Registry>,
    fail_allocs: AtomicU32,
    fail_binds: AtomicU32,
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        Self::new(DMA_PAGE)
    }
}

impl HeapDmaAllocator {
    /// Allocator splitting memory into segments of at most `max_segment`
    pub fn new(max_segment: usize) -> Self {
        Self {
            next_addr: AtomicU64::new(0x1_0000_0000),
            max_segment: max_segment.max(1),
            registry: Arc::new(RwLock::new(BTreeMap::new())),
            fail_allocs: AtomicU32::new(0),
            fail_binds: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` allocations
    pub fn fail_next_allocs(&self, n: u32) {
        self.fail_allocs.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` bind requests
    pub fn fail_next_binds(&self, n: u32) {
        self.fail_binds.store(n, Ordering::SeqCst);
    }

    /// Live memory objects
    pub fn live(&self) -> usize {
        self.registry.read().len()
    }

    /// Device-side write at a bus address; false if nothing is mapped there
    pub fn device_write(&self, addr: u64, data: &[u8]) -> bool {
        let Some((mem, off)) = self.lookup(addr) else {
            return false;
        };
        match &mem.backing {
            Backing::Owned(buf) => {
                let mut buf = buf.lock();
                let end = off + data.len();
                if end > buf.len() {
                    return false;
                }
                buf[off..end].copy_from_slice(data);
                true
            }
            Backing::Bound(_) => false,
        }
    }

    /// Device-side read at a bus address
    pub fn device_read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let (mem, off) = self.lookup(addr)?;
        let end = off.checked_add(len)?;
        match &mem.backing {
            Backing::Owned(buf) => buf.lock().get(off..end).map(<[u8]>::to_vec),
            Backing::Bound(bytes) => bytes.get(off..end).map(<[u8]>::to_vec),
        }
    }

    fn lookup(&self, addr: u64) -> Option<(Arc<DmaMemory>, usize)> {
        let (base, weak) = {
            let registry = self.registry.read();
            let (base, weak) = registry.range(..=addr).next_back()?;
            (*base, weak.clone())
        };
        let mem = weak.upgrade()?;
        let off = (addr - base) as usize;
        if off >= mem.len() {
            return None;
        }
        Some((mem, off))
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn register(&self, len: usize, backing: Backing) -> DmaBuffer {
        let span = len.div_ceil(DMA_PAGE).max(1) * DMA_PAGE + DMA_PAGE;
        let base = self.next_addr.fetch_add(span as u64, Ordering::Relaxed);
        let mem = Arc::new(DmaMemory {
            base,
            backing,
            registry: Arc::downgrade(&self.registry),
        });
        self.registry.write().insert(base, Arc::downgrade(&mem));

        let mut segments = Vec::new();
        let mut off = 0;
        while off < len {
            let seg = self.max_segment.min(len - off);
            segments.push(DmaSegment {
                addr: base + off as u64,
                len: seg,
            });
            off += seg;
        }
        DmaBuffer {
            mem: Some(mem),
            segments,
            offset: 0,
        }
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn alloc(&self, len: usize) -> DatapathResult<DmaBuffer> {
        if Self::take_failure(&self.fail_allocs) {
            return Err(DatapathError::DmaAllocation(format!("{len} bytes: injected failure")));
        }
        Ok(self.register(len, Backing::Owned(Mutex::new(vec![0; len]))))
    }

    fn bind(&self, data: Bytes) -> DatapathResult<DmaBuffer> {
        if Self::take_failure(&self.fail_binds) {
            return Err(DatapathError::DmaAllocation("bind: injected failure".into()));
        }
        let len = data.len();
        Ok(self.register(len, Backing::Bound(data)))
    }
}
