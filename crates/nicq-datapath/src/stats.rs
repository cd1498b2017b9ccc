//! Port statistics
//!
//! Lock-free counters updated from the completion path, mirrored into the
//! `metrics` facade for export.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-port counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Default)]
pub struct PortStats {
    /// Packets delivered to the stack
    pub rx_packets: AtomicU64,
    /// Bytes delivered to the stack
    pub rx_bytes: AtomicU64,
    /// Send completions
    pub tx_packets: AtomicU64,
    /// Bytes sent
    pub tx_bytes: AtomicU64,
    /// Packets the device dropped for lack of descriptors
    pub rx_drops: AtomicU64,
    /// Receives handed up as loans
    pub rx_loans: AtomicU64,
    /// Receives handed up as copies
    pub rx_copies: AtomicU64,
    /// Completions with an error opcode
    pub cqe_errors: AtomicU64,
    /// Completions that could not be interpreted
    pub malformed_cqes: AtomicU64,
    /// Refill jobs dispatched to the worker pool
    pub refill_tasks: AtomicU64,
    /// Doorbell writes retried after a fault
    pub doorbell_retries: AtomicU64,
}

impl PortStats {
    /// Count one received packet
    #[inline(always)]
    pub fn record_rx(&self, bytes: u64, loaned: bool) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        if loaned {
            self.rx_loans.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rx_copies.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!("nicq_rx_packets_total").increment(1);
        metrics::counter!("nicq_rx_bytes_total").increment(bytes);
    }

    /// Count one completed send
    #[inline(always)]
    pub fn record_tx(&self, bytes: u64) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("nicq_tx_packets_total").increment(1);
        metrics::counter!("nicq_tx_bytes_total").increment(bytes);
    }

    /// Add the device-reported drop count
    #[inline(always)]
    pub fn record_rx_drops(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.rx_drops.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("nicq_rx_drops_total").increment(n);
    }

    /// Count an error completion
    pub fn record_cqe_error(&self) {
        self.cqe_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("nicq_cqe_errors_total").increment(1);
    }

    /// Count an uninterpretable completion
    pub fn record_malformed(&self) {
        self.malformed_cqes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("nicq_malformed_cqes_total").increment(1);
    }

    /// Count a dispatched refill job
    pub fn record_refill_task(&self) {
        self.refill_tasks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("nicq_refill_tasks_total").increment(1);
    }

    /// Count a doorbell retry
    pub fn record_doorbell_retry(&self) {
        self.doorbell_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("nicq_doorbell_retries_total").increment(1);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_drops: self.rx_drops.load(Ordering::Relaxed),
            rx_loans: self.rx_loans.load(Ordering::Relaxed),
            rx_copies: self.rx_copies.load(Ordering::Relaxed),
            cqe_errors: self.cqe_errors.load(Ordering::Relaxed),
            malformed_cqes: self.malformed_cqes.load(Ordering::Relaxed),
            refill_tasks: self.refill_tasks.load(Ordering::Relaxed),
            doorbell_retries: self.doorbell_retries.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    /// Packets delivered to the stack
    pub rx_packets: u64,
    /// Bytes delivered to the stack
    pub rx_bytes: u64,
    /// Send completions
    pub tx_packets: u64,
    /// Bytes sent
    pub tx_bytes: u64,
    /// Packets the device dropped for lack of descriptors
    pub rx_drops: u64,
    /// Receives handed up as loans
    pub rx_loans: u64,
    /// Receives handed up as copies
    pub rx_copies: u64,
    /// Completions with an error opcode
    pub cqe_errors: u64,
    /// Completions that could not be interpreted
    pub malformed_cqes: u64,
    /// Refill jobs dispatched to the worker pool
    pub refill_tasks: u64,
    /// Doorbell writes retried after a fault
    pub doorbell_retries: u64,
}

impl PortStatsSnapshot {
    /// Share of receives delivered as loans
    pub fn loan_ratio(&self) -> f64 {
        let total = self.rx_loans + self.rx_copies;
        if total == 0 {
            return 0.0;
        }
        self.rx_loans as f64 / total as f64
    }
}
