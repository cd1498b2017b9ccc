//! Send path: copy and bind, descriptor groups, completion, ring bounds
//! and wrap padding against the simulated adapter

mod common;

use bytes::Bytes;
use common::{datapath, payload};
use nicq_datapath::descriptor::{ControlSegment, SendEntry};
use nicq_datapath::sim::{Malformed, SimHarness};
use nicq_datapath::stack::TxContext;
use nicq_datapath::{Datapath, DatapathError, TxPacket, WorkQueue};
use proptest::prelude::*;
use std::sync::Arc;

fn started(h: &SimHarness, dp: &Datapath) -> Arc<WorkQueue> {
    dp.tx_ring_start(0, 0).unwrap();
    let wq = dp.tx_groups()[0].wq(0).unwrap();
    // Flush the start-of-ring NOP
    assert_eq!(h.device.complete_send(&wq), 1);
    dp.poll(64);
    assert_eq!(wq.wqebb_used(), 0);
    wq
}

fn single(len: usize) -> TxPacket {
    TxPacket::single(Bytes::from(payload(len)), 2)
}

fn fragmented(sizes: &[usize], inline: usize) -> TxPacket {
    let fragments: Vec<Bytes> = sizes
        .iter()
        .enumerate()
        .map(|(i, &n)| Bytes::from(vec![i as u8; n]))
        .collect();
    TxPacket {
        ctx: TxContext {
            inline_hdrlen: inline,
            inline_hdrs: fragments[0].slice(..inline),
            ..Default::default()
        },
        fragments,
    }
}

#[test]
fn start_posts_a_nop() {
    let (h, dp) = datapath();
    dp.tx_ring_start(0, 0).unwrap();
    let wq = dp.tx_groups()[0].wq(0).unwrap();
    assert_eq!(wq.producer_counter(), 1);
    assert!(matches!(wq.send_entry(0), Some(SendEntry::Nop(_))));
    assert!(h.device.last_doorbell(wq.num()).is_some());
}

#[test]
fn copied_sends_complete_and_recycle() {
    let (h, dp) = datapath();
    let wq = started(&h, &dp);

    for _ in 0..3 {
        wq.transmit(&single(100)).unwrap();
    }
    assert_eq!(wq.shard().counts().busy, 3);
    assert_eq!(wq.wqebb_used(), 3);

    assert_eq!(h.device.complete_send(&wq), 3);
    assert_eq!(dp.poll(64), 3);

    let stats = h.ctx.stats().snapshot();
    assert_eq!(stats.tx_packets, 3);
    assert_eq!(stats.tx_bytes, 3 * 98);
    assert_eq!(wq.wqebb_used(), 0);
    assert_eq!(wq.cq().buffer_count(), 0);
    let counts = wq.shard().counts();
    assert_eq!((counts.busy, counts.free), (0, counts.total));
}

#[test]
fn malformed_completion_returns_the_chain() {
    let (h, dp) = datapath();
    let wq = started(&h, &dp);

    wq.transmit(&single(100)).unwrap();
    wq.transmit(&single(100)).unwrap();
    assert!(h.device.complete_malformed(&wq, Malformed::Opcode));
    assert_eq!(h.device.complete_send(&wq), 1);
    assert_eq!(dp.poll(64), 2);

    let stats = h.ctx.stats().snapshot();
    assert_eq!(stats.malformed_cqes, 1);
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(stats.tx_bytes, 98);
    assert_eq!(wq.wqebb_used(), 0);
    assert_eq!(wq.cq().buffer_count(), 0);
    assert_eq!(wq.shard().counts().busy, 0);
}

#[test]
fn large_fragments_are_bound_in_place() {
    let (h, dp) = datapath();
    let wq = started(&h, &dp);
    let foreign = wq.foreign_shard().unwrap();

    wq.transmit(&single(4000)).unwrap();
    assert_eq!(foreign.counts().busy, 1);
    assert_eq!(wq.shard().counts().busy, 0);

    h.device.complete_send(&wq);
    dp.poll(64);
    assert_eq!(foreign.counts().busy, 0);
    assert_eq!(h.ctx.stats().snapshot().tx_bytes, 3998);
}

#[test]
fn full_ring_rejects_and_keeps_nothing() {
    let (h, dp) = datapath();
    let wq = started(&h, &dp);

    let mut sent = 0;
    let err = loop {
        match wq.transmit(&single(100)) {
            Ok(()) => sent += 1,
            Err(e) => break e,
        }
        assert!(sent <= wq.nents());
    };
    assert!(matches!(
        err,
        DatapathError::RingFull { .. } | DatapathError::NoBuffers
    ));
    assert_eq!(wq.shard().counts().busy, sent);
    assert!(wq.wqebb_used() as usize <= wq.nents());

    h.device.complete_send(&wq);
    dp.poll(64);
    wq.transmit(&single(100)).unwrap();
}

#[test]
fn group_crossing_ring_end_is_padded() {
    let (h, dp) = datapath();
    let wq = started(&h, &dp);
    let mask = wq.nents() as u32 - 1;

    while wq.producer_counter() & mask != mask {
        wq.transmit(&single(100)).unwrap();
        h.device.complete_send(&wq);
        dp.poll(64);
    }
    let pc = wq.producer_counter();

    // 64 inline bytes spill four slots past the head; two data slots
    // make a three-slot group that cannot fit in the last slot
    wq.transmit(&fragmented(&[80, 100], 64)).unwrap();

    assert_eq!(
        wq.send_entry(mask as usize),
        Some(SendEntry::Nop(ControlSegment::nop(wq.num(), pc as u16)))
    );
    let head = wq.send_entry(0).unwrap();
    assert_eq!(head.control().unwrap().wqe_index, pc.wrapping_add(1) as u16);
    assert_eq!(head.wqebbs(), 3);
    assert_eq!(wq.producer_counter(), pc + 4);

    // Completion of the NOP and the packet frees all four slots
    assert_eq!(h.device.complete_send(&wq), 2);
    dp.poll(64);
    assert_eq!(wq.wqebb_used(), 0);
    assert_eq!(wq.shard().counts().busy, 0);
}

#[derive(Debug, Clone)]
enum TxOp {
    Send(Vec<usize>),
    Complete,
}

fn tx_op() -> impl Strategy<Value = TxOp> {
    prop_oneof![
        3 => prop::collection::vec(16usize..200, 1..3).prop_map(TxOp::Send),
        1 => Just(TxOp::Complete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ring_never_overcommits(ops in prop::collection::vec(tx_op(), 1..60)) {
        let (h, dp) = datapath();
        let wq = started(&h, &dp);
        let nents = wq.nents() as u64;

        for op in ops {
            match op {
                TxOp::Send(sizes) => {
                    let before = wq.shard().counts().busy;
                    match wq.transmit(&fragmented(&sizes, 2)) {
                        Ok(()) => {}
                        Err(DatapathError::RingFull { .. }) | Err(DatapathError::NoBuffers) => {
                            prop_assert_eq!(wq.shard().counts().busy, before);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                }
                TxOp::Complete => {
                    h.device.complete_send(&wq);
                    dp.poll(64);
                }
            }
            prop_assert!(wq.wqebb_used() <= nents);
        }

        h.device.complete_send(&wq);
        dp.poll(64);
        prop_assert_eq!(wq.wqebb_used(), 0);
        prop_assert_eq!(wq.shard().counts().busy, 0);
    }
}
