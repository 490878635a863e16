//! Global byte budget for compressed chunks waiting in the per-stream chunk
//! queues. The demux thread reserves before queueing, decode workers release
//! on dequeue.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::signal::ExitFlag;

pub struct ChunkBudget {
    ceiling: u64,
    in_use: Mutex<u64>,
    room: Condvar,
    peak: AtomicU64,
}

impl ChunkBudget {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            in_use: Mutex::new(0),
            room: Condvar::new(),
            peak: AtomicU64::new(0),
        }
    }

    /// Block until `bytes` fit under the ceiling, then take them.
    ///
    /// A chunk larger than the whole ceiling is admitted once nothing else is
    /// in flight. Returns false only when `exit` was requested.
    pub fn try_reserve(&self, bytes: u64, exit: &ExitFlag) -> bool {
        let mut in_use = self.in_use.lock();
        loop {
            if exit.is_requested() {
                return false;
            }
            if *in_use == 0 || *in_use + bytes <= self.ceiling {
                *in_use += bytes;
                self.peak.fetch_max(*in_use, Ordering::Relaxed);
                return true;
            }
            self.room.wait(&mut in_use);
        }
    }

    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(bytes);
        self.room.notify_all();
    }

    /// Wake blocked reservations so they observe their exit flag.
    pub fn wake_all(&self) {
        let _guard = self.in_use.lock();
        self.room.notify_all();
    }

    pub fn in_use(&self) -> u64 {
        *self.in_use.lock()
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Highest reservation level seen since creation
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reserve_and_release() {
        let budget = ChunkBudget::new(100);
        let exit = ExitFlag::new();
        assert!(budget.try_reserve(60, &exit));
        assert!(budget.try_reserve(40, &exit));
        assert_eq!(budget.in_use(), 100);
        budget.release(60);
        assert_eq!(budget.in_use(), 40);
        assert_eq!(budget.peak(), 100);
    }

    #[test]
    fn test_oversized_chunk_admitted_when_idle() {
        let budget = ChunkBudget::new(10);
        let exit = ExitFlag::new();
        assert!(budget.try_reserve(500, &exit));
        assert_eq!(budget.in_use(), 500);
    }

    #[test]
    fn test_blocks_until_released() {
        let budget = Arc::new(ChunkBudget::new(100));
        let exit = ExitFlag::new();
        assert!(budget.try_reserve(80, &exit));

        let waiter = {
            let budget = Arc::clone(&budget);
            thread::spawn(move || {
                let exit = ExitFlag::new();
                budget.try_reserve(50, &exit)
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(budget.in_use(), 80);
        budget.release(80);
        assert!(waiter.join().unwrap());
        assert_eq!(budget.in_use(), 50);
    }

    #[test]
    fn test_blocked_reservation_cancelled() {
        let budget = Arc::new(ChunkBudget::new(10));
        let exit = Arc::new(ExitFlag::new());
        assert!(budget.try_reserve(10, &exit));

        let waiter = {
            let (budget, exit) = (Arc::clone(&budget), Arc::clone(&exit));
            thread::spawn(move || budget.try_reserve(5, &exit))
        };
        thread::sleep(Duration::from_millis(10));
        exit.request();
        budget.wake_all();
        assert!(!waiter.join().unwrap());
        assert_eq!(budget.in_use(), 10);
    }
}
