//! Per-stream FIFO of compressed chunks, fed by the demux thread and drained
//! by the stream's decode worker. Fullness is governed by the shared
//! [`ChunkBudget`], not by a per-queue length.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::budget::ChunkBudget;
use crate::chunk::Chunk;
use crate::signal::ExitFlag;

pub struct ChunkQueue {
    chunks: Mutex<VecDeque<Chunk>>,
    not_empty: Condvar,
    budget: Arc<ChunkBudget>,
}

impl ChunkQueue {
    pub fn new(budget: Arc<ChunkBudget>) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            budget,
        }
    }

    /// Reserve budget for a data chunk and queue it. Returns false if
    /// `exit` fired while waiting for budget.
    pub fn push_reserved(&self, chunk: Chunk, exit: &ExitFlag) -> bool {
        if !self.budget.try_reserve(chunk.size(), exit) {
            return false;
        }
        self.push(chunk);
        true
    }

    /// Queue a chunk whose size is already accounted for (control markers).
    pub fn push(&self, chunk: Chunk) {
        let mut chunks = self.chunks.lock();
        chunks.push_back(chunk);
        self.not_empty.notify_one();
    }

    /// Block for the next chunk, releasing its bytes back to the budget.
    pub fn pop(&self, exit: &ExitFlag) -> Option<Chunk> {
        let mut chunks = self.chunks.lock();
        loop {
            if exit.is_requested() {
                return None;
            }
            if let Some(chunk) = chunks.pop_front() {
                drop(chunks);
                self.budget.release(chunk.size());
                return Some(chunk);
            }
            self.not_empty.wait(&mut chunks);
        }
    }

    /// Drop every queued chunk and return its bytes to the budget.
    pub fn clear(&self) -> usize {
        let drained: Vec<Chunk> = self.chunks.lock().drain(..).collect();
        let bytes: u64 = drained.iter().map(Chunk::size).sum();
        self.budget.release(bytes);
        drained.len()
    }

    pub fn wake_all(&self) {
        let _guard = self.chunks.lock();
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Budget bytes held by this queue
    pub fn bytes(&self) -> u64 {
        self.chunks.lock().iter().map(Chunk::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;
    use crate::demuxer::Packet;
    use std::thread;
    use std::time::Duration;

    fn packet(dts: i64, size: usize) -> Chunk {
        Chunk::data(Packet {
            stream: 0,
            dts,
            pts: Some(dts),
            keyframe: false,
            data: vec![0; size],
        })
    }

    #[test]
    fn test_fifo_and_budget_accounting() {
        let budget = Arc::new(ChunkBudget::new(1_000));
        let queue = ChunkQueue::new(Arc::clone(&budget));
        let exit = ExitFlag::new();

        assert!(queue.push_reserved(packet(0, 100), &exit));
        queue.push(Chunk::control(0, ChunkKind::EndOfStream));
        assert!(queue.push_reserved(packet(1, 50), &exit));
        assert_eq!(budget.in_use(), 150);
        assert_eq!(queue.bytes(), 150);

        assert_eq!(queue.pop(&exit).unwrap().dts(), Some(0));
        assert_eq!(budget.in_use(), 50);
        assert!(queue.pop(&exit).unwrap().is_control());
        assert_eq!(queue.pop(&exit).unwrap().dts(), Some(1));
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_clear_returns_budget() {
        let budget = Arc::new(ChunkBudget::new(1_000));
        let queue = ChunkQueue::new(Arc::clone(&budget));
        let exit = ExitFlag::new();
        for dts in 0..4 {
            assert!(queue.push_reserved(packet(dts, 10), &exit));
        }
        assert_eq!(queue.clear(), 4);
        assert!(queue.is_empty());
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_pop_cancelled_by_exit() {
        let budget = Arc::new(ChunkBudget::new(1_000));
        let queue = Arc::new(ChunkQueue::new(budget));
        let exit = Arc::new(ExitFlag::new());

        let consumer = {
            let (queue, exit) = (Arc::clone(&queue), Arc::clone(&exit));
            thread::spawn(move || queue.pop(&exit).is_none())
        };
        thread::sleep(Duration::from_millis(10));
        exit.request();
        queue.wake_all();
        assert!(consumer.join().unwrap());
    }
}
