//! Shared fixtures for the integration tests

#![allow(dead_code)]

use nicq_datapath::sim::SimHarness;
use nicq_datapath::{Datapath, DatapathConfig, EqKind};
use std::sync::Arc;

/// One RX group of two rings, one TX group of one ring, small rings
pub fn config() -> DatapathConfig {
    DatapathConfig {
        sq_size_shift: 3,
        rq_size_shift: 5,
        cq_size_shift: 6,
        refill_step: 4,
        rx_ngroups_large: 1,
        rx_ngroups_small: 0,
        rx_nrings_per_large_group: 2,
        tx_ngroups: 1,
        tx_nrings_per_group: 1,
        rx_p50_loan_min_size: 128,
        tx_bind_threshold: 1024,
        mtu: 256,
        event_queues: vec![EqKind::Any, EqKind::Any],
        loaned_drain_timeout_ms: 50,
        ..Default::default()
    }
}

pub fn datapath() -> (SimHarness, Datapath) {
    let h = SimHarness::new(config()).expect("harness");
    let dp = Datapath::setup(Arc::clone(&h.ctx)).expect("datapath");
    (h, dp)
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}
