//! Buffer pool accounting under arbitrary take / return / loan sequences

use nicq_datapath::{return_buffer, Buffer, BufferShard, HeapDmaAllocator, LoanedBuffer};
use proptest::prelude::*;
use std::sync::Arc;

const POOL: usize = 32;

#[derive(Debug, Clone)]
enum Op {
    Take,
    Return(usize),
    Loan(usize, bool),
    Clone(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Take),
        2 => any::<usize>().prop_map(Op::Return),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(i, large)| Op::Loan(i, large)),
        1 => any::<usize>().prop_map(Op::Clone),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

fn pool(dma: &HeapDmaAllocator) -> Arc<BufferShard> {
    let shard = BufferShard::new("prop", 128);
    for _ in 0..POOL {
        return_buffer(shard.create_buffer(dma, 512).unwrap());
    }
    shard.ready();
    shard
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn every_buffer_has_one_owner(ops in prop::collection::vec(op(), 1..200)) {
        let dma = HeapDmaAllocator::default();
        let shard = pool(&dma);
        let mut held: Vec<Buffer> = Vec::new();
        // Each inner vec is the set of handles sharing one loan
        let mut loans: Vec<Vec<LoanedBuffer>> = Vec::new();

        for op in ops {
            match op {
                Op::Take => {
                    if let Some(buf) = shard.take() {
                        held.push(buf);
                    }
                }
                Op::Return(i) if !held.is_empty() => {
                    let n = held.len();
                    return_buffer(held.swap_remove(i % n));
                }
                Op::Loan(i, large) if !held.is_empty() => {
                    let n = held.len();
                    let mut buf = held.swap_remove(i % n);
                    buf.set_used(if large { 512 } else { 64 });
                    match shard.loan(buf) {
                        Ok(loan) => loans.push(vec![loan]),
                        Err(buf) => held.push(buf),
                    }
                }
                Op::Clone(i) if !loans.is_empty() => {
                    let n = loans.len();
                    let handles = &mut loans[i % n];
                    let extra = handles[0].clone();
                    handles.push(extra);
                }
                Op::Release(i) if !loans.is_empty() => {
                    let n = loans.len();
                    let handles = &mut loans[i % n];
                    handles.pop();
                    if handles.is_empty() {
                        loans.swap_remove(i % n);
                    }
                }
                _ => {}
            }

            let c = shard.counts();
            prop_assert_eq!(c.total, POOL);
            prop_assert_eq!(c.free + c.busy + c.loaned, c.total);
            prop_assert_eq!(c.busy, held.len());
            prop_assert_eq!(c.loaned, loans.len());
            prop_assert!(c.loaned <= c.hiwat2);
        }

        held.into_iter().for_each(return_buffer);
        drop(loans);
        let c = shard.counts();
        prop_assert_eq!(c.free, POOL);
    }
}

#[test]
fn loan_refusal_follows_watermarks() {
    let dma = HeapDmaAllocator::default();
    let shard = BufferShard::new("loans", 256);
    for _ in 0..100 {
        return_buffer(shard.create_buffer(&dma, 1518).unwrap());
    }
    shard.ready();

    let mut loans = Vec::new();
    for _ in 0..50 {
        let mut buf = shard.take().unwrap();
        buf.set_used(1024);
        loans.push(shard.loan(buf).unwrap());
    }
    assert_eq!(shard.counts().loaned, 50);

    let mut small = shard.take().unwrap();
    small.set_used(64);
    let mut small = shard.loan(small).unwrap_err();
    assert_eq!(shard.counts().loaned, 50);

    small.set_used(1024);
    loans.push(shard.loan(small).unwrap());
    assert_eq!(shard.counts().loaned, 51);

    drop(loans);
    let c = shard.counts();
    assert_eq!((c.free, c.loaned), (100, 0));
}

#[test]
fn loaned_bytes_survive_until_last_handle() {
    let dma = HeapDmaAllocator::default();
    let shard = BufferShard::new("handles", 0);
    return_buffer(shard.create_buffer(&dma, 64).unwrap());
    shard.ready();

    let mut buf = shard.take().unwrap();
    buf.dma().write(b"hello").unwrap();
    buf.set_used(5);
    let loan = shard.loan(buf).unwrap();
    let copy = loan.clone();
    drop(loan);

    assert_eq!(shard.counts().loaned, 1);
    assert_eq!(copy.to_bytes().as_ref(), b"hello");
    drop(copy);
    assert_eq!(shard.counts().loaned, 0);
    assert_eq!(shard.counts().free, 1);
}
