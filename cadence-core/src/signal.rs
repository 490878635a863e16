//! Thread signalling primitives shared by the demux driver and the decode
//! workers: exit flags, auto-reset events and the lock-step decode result
//! channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// A blocking wait was abandoned because its thread was asked to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait cancelled by exit request")]
pub struct Cancelled;

// ============================================================================
// Exit flag
// ============================================================================

/// One-shot exit request for a single thread.
///
/// Requesting exit sets the flag and drops the sending half of a private
/// channel, so anything `select!`ing on [`ExitFlag::closed`] wakes up
/// immediately. Condvar waiters still need an explicit wake from the owner
/// of the condvar.
pub struct ExitFlag {
    requested: AtomicBool,
    notify: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl ExitFlag {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            requested: AtomicBool::new(false),
            notify: Mutex::new(Some(tx)),
            closed: rx,
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.lock().take();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Disconnects once exit has been requested
    pub fn closed(&self) -> &Receiver<()> {
        &self.closed
    }
}

impl Default for ExitFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Auto-reset event
// ============================================================================

/// Binary event that resets itself when a waiter consumes it.
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until set, consuming the signal.
    pub fn wait(&self, exit: &ExitFlag) -> Result<(), Cancelled> {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if exit.is_requested() {
                return Err(Cancelled);
            }
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
        Ok(())
    }

    /// Wake waiters so they re-check their exit flag.
    pub fn wake(&self) {
        let _guard = self.signaled.lock();
        self.cond.notify_all();
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Lock-step decode results
// ============================================================================

/// What a decode worker reports after each step while it is in lock-step
/// with the demux driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    NeedMoreInput,
    FrameReady,
    EndOfStream,
    Fatal,
}

/// Single-slot rendezvous between a decode worker and the demux driver.
///
/// Every result carries the seek generation it belongs to; results left over
/// from an abandoned seek attempt are skipped by the receiver. Once the
/// driver has moved to a newer generation, older results are dropped by the
/// sender instead of waiting for a slot nobody will read.
pub struct ResultChannel {
    tx: Sender<(u64, DecodeResult)>,
    rx: Receiver<(u64, DecodeResult)>,
    current: AtomicU64,
}

impl ResultChannel {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            current: AtomicU64::new(0),
        }
    }

    /// Worker side. Blocks while the previous result is still unread, unless
    /// `generation` has been superseded.
    pub fn send(&self, generation: u64, result: DecodeResult, exit: &ExitFlag) -> Result<(), Cancelled> {
        if exit.is_requested() {
            return Err(Cancelled);
        }
        if generation < self.current.load(Ordering::SeqCst) {
            tracing::trace!(target: "cadence::signal", generation, ?result, "dropping superseded decode result");
            return Ok(());
        }
        select! {
            send(self.tx, (generation, result)) -> sent => sent.map_err(|_| Cancelled),
            recv(exit.closed()) -> _ => Err(Cancelled),
        }
    }

    /// Driver side. Supersede every generation below `generation` and free
    /// the slot, releasing a worker blocked on a stale send.
    pub fn advance(&self, generation: u64) {
        self.current.fetch_max(generation, Ordering::SeqCst);
        self.clear();
    }

    /// Demux side. Blocks until a result of `generation` arrives.
    pub fn recv(&self, generation: u64, exit: &ExitFlag) -> Result<DecodeResult, Cancelled> {
        loop {
            if exit.is_requested() {
                return Err(Cancelled);
            }
            select! {
                recv(self.rx) -> msg => match msg {
                    Ok((tag, result)) if tag == generation => return Ok(result),
                    Ok((tag, result)) => {
                        tracing::trace!(target: "cadence::signal", tag, generation, ?result, "discarding stale decode result");
                    }
                    Err(_) => return Err(Cancelled),
                },
                recv(exit.closed()) -> _ => return Err(Cancelled),
            }
        }
    }

    /// Throw away an unread result.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Forget all generations, for a fresh demux run.
    pub fn reset(&self) {
        self.current.store(0, Ordering::SeqCst);
        self.clear();
    }
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new()
    }
}
