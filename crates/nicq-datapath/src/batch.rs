//! Batched buffer return
//!
//! Send completions push buffers here instead of returning them one by
//! one. Buffers are grouped by shard into a fixed number of slots; a flush
//! resets every buffer outside the shard lock, then takes the lock once per
//! slot. When all slots are in use, the least popular one is flushed to
//! make room.

use crate::buffer::{return_buffer, Buffer, BufferShard};
use std::sync::Arc;

/// Shard slots in a batch
pub const BATCH_SHARDS: usize = 4;

struct Slot {
    shard: Arc<BufferShard>,
    bufs: Vec<Buffer>,
}

/// Per-poll staging area for buffer returns
#[derive(Default)]
pub struct ReturnBatch {
    slots: [Option<Slot>; BATCH_SHARDS],
}

impl ReturnBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers waiting for a flush
    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().map(|s| s.bufs.len()).sum()
    }

    /// Shards with buffers waiting
    pub fn shards(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Stage `head` and every member of its chain
    pub fn push_chain(&mut self, mut head: Buffer) {
        for member in head.take_chain() {
            self.push(member);
        }
        self.push(head);
    }

    /// Stage one buffer
    pub fn push(&mut self, buf: Buffer) {
        let Some(shard) = buf.shard() else {
            // Orphaned buffers go straight to the slow path, which drops them.
            return_buffer(buf);
            return;
        };

        let idx = match self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| buf.belongs_to(&s.shard)))
        {
            Some(i) => i,
            None => match self.slots.iter().position(Option::is_none) {
                Some(i) => i,
                None => {
                    let victim = self
                        .slots
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.as_ref().map_or(0, |s| s.bufs.len()))
                        .map_or(0, |(i, _)| i);
                    self.flush_slot(victim);
                    victim
                }
            },
        };

        self.slots[idx]
            .get_or_insert_with(|| Slot {
                shard,
                bufs: Vec::new(),
            })
            .bufs
            .push(buf);
    }

    /// Return everything staged
    pub fn flush(&mut self) {
        for i in 0..BATCH_SHARDS {
            self.flush_slot(i);
        }
    }

    fn flush_slot(&mut self, i: usize) {
        let Some(Slot { shard, mut bufs }) = self.slots[i].take() else {
            return;
        };
        for buf in &mut bufs {
            buf.reset();
        }
        shard.put_back_many(bufs);
    }
}

impl Drop for ReturnBatch {
    fn drop(&mut self) {
        self.flush();
    }
}
