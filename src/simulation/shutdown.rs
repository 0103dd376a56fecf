//! Cooperative shutdown signal shared by the threads of one process.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cloneable shutdown flag whose trigger also wakes every sleeper.
///
/// Triggering drops the only sender of an internal channel, so any thread
/// blocked in [`Shutdown::sleep`] or selecting on [`Shutdown::receiver`]
/// returns immediately.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam::channel::bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    /// Idempotent
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut trigger) = self.trigger.lock() {
            trigger.take();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless shutdown fires first.
    ///
    /// Returns `true` when the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        matches!(self.signal.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }

    /// Disconnects when shutdown is triggered; usable in `crossbeam::select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.signal
    }
}
