//! Logical (Lamport) and simulated clocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::shutdown::Shutdown;

/// Lamport clock giving a causal total order to events.
///
/// Never decreases. `tick` is used for locally generated events and
/// `merge` for every ingested message that carries a remote timestamp.
#[derive(Debug, Default)]
pub struct LogicalClock {
    time: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock for a local event and returns the new value
    pub fn tick(&self) -> u64 {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Applies the receive rule `max(local, remote) + 1`
    pub fn merge(&self, remote: u64) -> u64 {
        let previous = self
            .time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(remote) + 1)
            })
            .unwrap_or_else(|current| current);
        previous.max(remote) + 1
    }

    /// Ticks, or merges when the message carried a timestamp
    pub fn observe(&self, remote: Option<u64>) -> u64 {
        match remote {
            Some(remote) => self.merge(remote),
            None => self.tick(),
        }
    }

    pub fn now(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

/// Default ratio of real time to simulated time (1 simulated second = 50 ms)
pub const DEFAULT_TIME_SCALE: f64 = 0.05;

/// Virtual clock for one process.
///
/// Simulated time only moves through explicit deltas, so a fixed sequence
/// of deltas always yields the same sequence of timestamps. The scale
/// converts a simulated delta into the real delay that stands in for it.
#[derive(Debug)]
pub struct SimClock {
    current: Mutex<f64>,
    scale: f64,
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_SCALE)
    }
}

impl SimClock {
    pub fn new(scale: f64) -> Self {
        Self {
            current: Mutex::new(0.0),
            scale: scale.max(0.0),
        }
    }

    pub fn now(&self) -> f64 {
        *self.lock()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Adds `delta` simulated seconds and returns the new time.
    /// Negative deltas are ignored to keep time monotonic.
    pub fn advance(&self, delta: f64) -> f64 {
        let mut current = self.lock();
        if delta > 0.0 {
            *current += delta;
        }
        *current
    }

    /// Moves forward to `time` if it is ahead of the local clock
    pub fn advance_to(&self, time: f64) -> f64 {
        let mut current = self.lock();
        if time > *current {
            *current = time;
        }
        *current
    }

    /// Real delay standing in for `sim_seconds` of simulated time
    pub fn to_real(&self, sim_seconds: f64) -> Duration {
        if sim_seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(sim_seconds * self.scale)
    }

    /// Sleeps the scaled duration, then advances the clock.
    ///
    /// Returns `None` without advancing when shutdown interrupts the wait.
    pub fn pause(&self, sim_seconds: f64, shutdown: &Shutdown) -> Option<f64> {
        if !shutdown.sleep(self.to_real(sim_seconds)) {
            return None;
        }
        Some(self.advance(sim_seconds))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, f64> {
        // The guarded value is a plain f64, so a poisoned lock still holds a
        // usable time.
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
