//! # Frame Queues - Decoded Frame Buffers Per Stream
//!
//! Every stream owns two queues:
//! - the regular queue, bounded, consumed by presentation (`tick`) or the
//!   audio callback
//! - the scratch queue, used while a seek is searching for its landing
//!   frame; it never blocks the decoder and is discarded when the seek ends
//!
//! ```text
//! ┌──────────┐ push ┌─────────────────────┐ try_pop_ready ┌──────────┐
//! │ Decode   │─────►│ regular (capacity N)│──────────────►│ Consumer │
//! │ worker   │      ├─────────────────────┤               └──────────┘
//! └──────────┘─────►│ scratch (seeking)   │──────────────► demux driver
//!                   └─────────────────────┘  pop_scratch
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::decode::FramePayload;
use crate::signal::ExitFlag;
use crate::sync::Pts;

// ============================================================================
// Frame
// ============================================================================

/// A decoded frame with its presentation timing
#[derive(Debug, Clone)]
pub struct Frame {
    pub pts: Pts,
    /// DTS of the first compressed chunk that went into this frame, used to
    /// tighten the seek keyframe cursor.
    pub first_chunk_dts: i64,
    /// Seconds this frame covers
    pub duration: f64,
    pub payload: FramePayload,
}

// ============================================================================
// Queue State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSlot {
    Regular,
    Scratch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Dropped because a flush is pending (a seek is about to clear the queue)
    Discarded,
    /// The pushing thread was asked to exit
    Cancelled,
}

/// Notified after a queue clear, outside the queue lock.
pub trait QueueListener: Send + Sync {
    fn frame_queue_cleared(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub buffered: usize,
    pub scratch: usize,
    pub presented: u64,
    pub dropped: u64,
}

struct Queues {
    regular: VecDeque<Frame>,
    scratch: VecDeque<Frame>,
    active: QueueSlot,
    flushing: bool,
    drain_interrupted: bool,
}

// ============================================================================
// Frame Queues
// ============================================================================

pub struct FrameQueues {
    inner: Mutex<Queues>,
    capacity: usize,
    scratch_capacity: usize,
    /// Regular queue has room
    room: Condvar,
    /// Regular queue became empty, or a drain wait was interrupted
    drained: Condvar,
    listener: Option<Arc<dyn QueueListener>>,
    presented: AtomicU64,
    dropped: AtomicU64,
}

impl FrameQueues {
    pub fn new(capacity: usize, scratch_capacity: usize, listener: Option<Arc<dyn QueueListener>>) -> Self {
        Self {
            inner: Mutex::new(Queues {
                regular: VecDeque::with_capacity(capacity),
                scratch: VecDeque::new(),
                active: QueueSlot::Regular,
                flushing: false,
                drain_interrupted: false,
            }),
            capacity: capacity.max(1),
            scratch_capacity: scratch_capacity.max(1),
            room: Condvar::new(),
            drained: Condvar::new(),
            listener,
            presented: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn active(&self) -> QueueSlot {
        self.inner.lock().active
    }

    // ========================================================================
    // Producer (decode worker)
    // ========================================================================

    /// Queue a frame on the active queue.
    ///
    /// The regular queue blocks while full; the scratch queue evicts its
    /// oldest frame instead. Nothing is queued once `exit` is requested, so a
    /// clear issued after the request stays clear.
    pub fn push(&self, frame: Frame, exit: &ExitFlag) -> PushOutcome {
        let mut queues = self.inner.lock();
        if exit.is_requested() {
            return PushOutcome::Cancelled;
        }
        if queues.active == QueueSlot::Scratch {
            if queues.scratch.len() >= self.scratch_capacity {
                queues.scratch.pop_front();
            }
            queues.scratch.push_back(frame);
            return PushOutcome::Queued;
        }

        while queues.regular.len() >= self.capacity && !queues.flushing && !exit.is_requested() {
            self.room.wait(&mut queues);
        }
        if exit.is_requested() {
            return PushOutcome::Cancelled;
        }
        if queues.flushing {
            return PushOutcome::Discarded;
        }
        queues.regular.push_back(frame);
        PushOutcome::Queued
    }

    /// Release a producer blocked on a full regular queue; frames pushed
    /// until the next `start_scratch` are discarded.
    pub fn begin_flush(&self) {
        let mut queues = self.inner.lock();
        queues.flushing = true;
        self.room.notify_all();
    }

    /// Seek start: empty both queues and collect into scratch.
    pub fn start_scratch(&self) {
        {
            let mut queues = self.inner.lock();
            queues.regular.clear();
            queues.scratch.clear();
            queues.active = QueueSlot::Scratch;
            queues.flushing = false;
            self.room.notify_all();
            self.drained.notify_all();
        }
        self.notify_cleared();
    }

    /// Seek end: drop the scratch queue and resume the regular queue with the
    /// landing frames in front.
    pub fn finish_scratch(&self, landing: Vec<Frame>) {
        let mut queues = self.inner.lock();
        queues.scratch.clear();
        queues.active = QueueSlot::Regular;
        let room = self.capacity.saturating_sub(queues.regular.len());
        let overflow = landing.len().saturating_sub(room);
        if overflow > 0 {
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        for frame in landing.into_iter().take(room).rev() {
            queues.regular.push_front(frame);
        }
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// Presentation gate: pop every frame due at `clock` and return the most
    /// recent one. Older due frames are counted as dropped.
    pub fn try_pop_ready(&self, clock: Pts) -> Option<Frame> {
        let mut queues = self.inner.lock();
        let mut ready: Option<Frame> = None;
        while queues.regular.front().is_some_and(|frame| frame.pts <= clock) {
            if ready.is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            ready = queues.regular.pop_front();
        }
        if ready.is_some() {
            self.presented.fetch_add(1, Ordering::Relaxed);
            self.after_pop(&queues);
        }
        ready
    }

    /// Unconditional pop of the regular queue (audio callback).
    pub fn pop_front(&self) -> Option<Frame> {
        let mut queues = self.inner.lock();
        let frame = queues.regular.pop_front();
        if frame.is_some() {
            self.after_pop(&queues);
        }
        frame
    }

    pub fn peek_front(&self) -> Option<Pts> {
        self.inner.lock().regular.front().map(|frame| frame.pts)
    }

    pub fn pop_scratch(&self) -> Option<Frame> {
        self.inner.lock().scratch.pop_front()
    }

    fn after_pop(&self, queues: &Queues) {
        self.room.notify_all();
        if queues.regular.is_empty() {
            self.drained.notify_all();
        }
    }

    // ========================================================================
    // Drain Wait (looping)
    // ========================================================================

    /// Block until the regular queue is empty. Returns false if the wait was
    /// interrupted or `exit` fired.
    pub fn wait_drained(&self, exit: &ExitFlag) -> bool {
        let mut queues = self.inner.lock();
        loop {
            if exit.is_requested() || queues.drain_interrupted {
                return false;
            }
            if queues.regular.is_empty() {
                return true;
            }
            self.drained.wait(&mut queues);
        }
    }

    pub fn interrupt_drain_wait(&self) {
        let mut queues = self.inner.lock();
        queues.drain_interrupted = true;
        self.drained.notify_all();
    }

    pub fn reset_drain_wait(&self) {
        self.inner.lock().drain_interrupted = false;
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Empty both queues and return to the regular queue.
    pub fn clear(&self) {
        {
            let mut queues = self.inner.lock();
            queues.regular.clear();
            queues.scratch.clear();
            queues.active = QueueSlot::Regular;
            queues.flushing = false;
            queues.drain_interrupted = false;
            self.room.notify_all();
            self.drained.notify_all();
        }
        self.notify_cleared();
    }

    pub fn wake_all(&self) {
        let _queues = self.inner.lock();
        self.room.notify_all();
        self.drained.notify_all();
    }

    fn notify_cleared(&self) {
        if let Some(listener) = &self.listener {
            listener.frame_queue_cleared();
        }
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn len(&self) -> usize {
        self.inner.lock().regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().regular.is_empty()
    }

    pub fn scratch_len(&self) -> usize {
        self.inner.lock().scratch.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        let queues = self.inner.lock();
        QueueStats {
            buffered: queues.regular.len(),
            scratch: queues.scratch.len(),
            presented: self.presented.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{PixelFormat, Picture};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn frame(secs: f64) -> Frame {
        Frame {
            pts: Pts::Secs(secs),
            first_chunk_dts: (secs * 1000.0) as i64,
            duration: 0.1,
            payload: FramePayload::Picture(Picture {
                width: 2,
                height: 2,
                format: PixelFormat::I420,
                data: vec![0; 6],
            }),
        }
    }

    fn queues(capacity: usize) -> FrameQueues {
        FrameQueues::new(capacity, 4, None)
    }

    #[test]
    fn test_frame_queue_ordering() {
        let q = queues(8);
        let exit = ExitFlag::new();
        for i in 0..3 {
            assert_eq!(q.push(frame(i as f64 * 0.1), &exit), PushOutcome::Queued);
        }
        assert_eq!(q.pop_front().unwrap().pts, Pts::Secs(0.0));
        assert_eq!(q.peek_front(), Some(Pts::Secs(0.1)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_presentation_gate_skips_stale_frames() {
        let q = queues(8);
        let exit = ExitFlag::new();
        for i in 0..5 {
            q.push(frame(i as f64 * 0.1), &exit);
        }

        assert!(q.try_pop_ready(Pts::Unset).is_none());
        let shown = q.try_pop_ready(Pts::Secs(0.25)).unwrap();
        assert_eq!(shown.pts, Pts::Secs(0.2));

        let stats = q.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.presented, 1);
        assert_eq!(stats.buffered, 2);
        assert!(q.try_pop_ready(Pts::Secs(0.25)).is_none());
    }

    #[test]
    fn test_unset_frame_is_always_due() {
        let q = queues(4);
        let exit = ExitFlag::new();
        let mut unknown = frame(0.0);
        unknown.pts = Pts::Unset;
        q.push(unknown, &exit);
        assert!(q.try_pop_ready(Pts::Unset).is_some());
    }

    #[test]
    fn test_regular_queue_blocks_when_full() {
        let q = Arc::new(queues(2));
        let exit = Arc::new(ExitFlag::new());
        q.push(frame(0.0), &exit);
        q.push(frame(0.1), &exit);

        let producer = {
            let (q, exit) = (Arc::clone(&q), Arc::clone(&exit));
            thread::spawn(move || q.push(frame(0.2), &exit))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 2);
        q.pop_front();
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_begin_flush_releases_blocked_push() {
        let q = Arc::new(queues(1));
        let exit = Arc::new(ExitFlag::new());
        q.push(frame(0.0), &exit);

        let producer = {
            let (q, exit) = (Arc::clone(&q), Arc::clone(&exit));
            thread::spawn(move || q.push(frame(0.1), &exit))
        };
        thread::sleep(Duration::from_millis(10));
        q.begin_flush();
        assert_eq!(producer.join().unwrap(), PushOutcome::Discarded);
    }

    #[test]
    fn test_scratch_evicts_oldest() {
        let q = queues(2);
        let exit = ExitFlag::new();
        q.start_scratch();
        assert_eq!(q.active(), QueueSlot::Scratch);
        for i in 0..6 {
            assert_eq!(q.push(frame(i as f64), &exit), PushOutcome::Queued);
        }
        assert_eq!(q.scratch_len(), 4);
        assert_eq!(q.pop_scratch().unwrap().pts, Pts::Secs(2.0));
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_after_exit_leaves_queues_empty() {
        let q = queues(4);
        let exit = ExitFlag::new();
        exit.request();
        q.clear();
        assert_eq!(q.push(frame(0.0), &exit), PushOutcome::Cancelled);

        q.start_scratch();
        assert_eq!(q.push(frame(0.1), &exit), PushOutcome::Cancelled);
        assert!(q.is_empty());
        assert_eq!(q.scratch_len(), 0);
    }

    #[test]
    fn test_finish_scratch_seeds_landing_frames() {
        let q = queues(2);
        let exit = ExitFlag::new();
        q.start_scratch();
        q.push(frame(9.0), &exit);
        q.finish_scratch(vec![frame(0.5), frame(0.6), frame(0.7)]);

        assert_eq!(q.active(), QueueSlot::Regular);
        assert_eq!(q.scratch_len(), 0);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front().unwrap().pts, Pts::Secs(0.5));
        assert_eq!(q.stats().dropped, 1);
    }

    #[test]
    fn test_drain_wait_interrupted() {
        let q = Arc::new(queues(4));
        let exit = Arc::new(ExitFlag::new());
        q.push(frame(0.0), &exit);

        let waiter = {
            let (q, exit) = (Arc::clone(&q), Arc::clone(&exit));
            thread::spawn(move || q.wait_drained(&exit))
        };
        thread::sleep(Duration::from_millis(10));
        q.interrupt_drain_wait();
        assert!(!waiter.join().unwrap());

        q.reset_drain_wait();
        q.pop_front();
        assert!(q.wait_drained(&exit));
    }

    #[test]
    fn test_clear_notifies_listener() {
        struct Counter(AtomicUsize);
        impl QueueListener for Counter {
            fn frame_queue_cleared(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let q = FrameQueues::new(4, 4, Some(counter.clone() as Arc<dyn QueueListener>));
        q.start_scratch();
        q.clear();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(q.active(), QueueSlot::Regular);
    }
}
