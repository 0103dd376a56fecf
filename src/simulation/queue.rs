//! Per-direction vehicle queue
//!
//! A blocking FIFO shared between the threads that deliver arrivals and the
//! signal controller that drains it. Statistics are kept under the same lock
//! as the items so every operation is linearizable.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::types::{Vehicle, VehicleType};

/// Snapshot of a queue's running statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub depth: usize,
    pub max_depth: usize,
    pub enqueued: u64,
    pub processed: u64,
    /// Mean of all sampled depths (0 before the first sample)
    pub average_depth: f64,
    pub by_type: BTreeMap<VehicleType, u64>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Vehicle>,
    closed: bool,
    max_depth: usize,
    enqueued: u64,
    processed: u64,
    depth_sum: u64,
    samples: u64,
    by_type: BTreeMap<VehicleType, u64>,
}

impl QueueState {
    fn pop(&mut self) -> Option<Vehicle> {
        let vehicle = self.items.pop_front()?;
        self.processed += 1;
        Some(vehicle)
    }
}

/// Thread-safe FIFO of vehicles waiting at one approach
#[derive(Default)]
pub struct VehicleQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl VehicleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a vehicle and wakes one blocked consumer
    pub fn enqueue(&self, vehicle: Vehicle) {
        let mut state = self.lock();
        *state.by_type.entry(vehicle.vehicle_type).or_insert(0) += 1;
        state.items.push_back(vehicle);
        state.enqueued += 1;
        state.max_depth = state.max_depth.max(state.items.len());
        drop(state);
        self.available.notify_one();
    }

    /// Blocks until a vehicle is available and removes it.
    ///
    /// Returns `None` once the queue has been closed.
    pub fn poll(&self) -> Option<Vehicle> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(vehicle) = state.pop() {
                return Some(vehicle);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`poll`](Self::poll) but gives up after `timeout`
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Vehicle> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| !s.closed && s.items.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.closed {
            return None;
        }
        state.pop()
    }

    /// Removes the head without blocking
    pub fn try_poll(&self) -> Option<Vehicle> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.pop()
    }

    /// Records the current depth for average-depth telemetry
    pub fn sample(&self) {
        let mut state = self.lock();
        state.depth_sum += state.items.len() as u64;
        state.samples += 1;
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn average_depth(&self) -> f64 {
        let state = self.lock();
        if state.samples == 0 {
            0.0
        } else {
            state.depth_sum as f64 / state.samples as f64
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            depth: state.items.len(),
            max_depth: state.max_depth,
            enqueued: state.enqueued,
            processed: state.processed,
            average_depth: if state.samples == 0 {
                0.0
            } else {
                state.depth_sum as f64 / state.samples as f64
            },
            by_type: state.by_type.clone(),
        }
    }

    /// Wakes every blocked consumer; subsequent polls return `None`
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
