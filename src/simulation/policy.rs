//! Signal timing policy and the cell that distributes it to controllers.

use std::sync::{Condvar, Mutex, MutexGuard};

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use super::shutdown::Shutdown;

/// Read-only timing configuration for signal controllers.
///
/// All durations are simulated seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub min_green: f64,
    pub max_green: f64,
    /// Vehicles served per phase by quota-based schemes; carried for
    /// completeness of the distributed policy
    pub quota: u32,
    /// Queue depth at or above which a green phase is extended
    pub queue_threshold: usize,
    pub max_extensions: u32,
    pub yellow: f64,
    pub clearance: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_green: 5.0,
            max_green: 20.0,
            quota: 5,
            queue_threshold: 2,
            max_extensions: 3,
            yellow: 2.0,
            clearance: 1.0,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.min_green >= 0.0, "min_green must not be negative");
        ensure!(
            self.max_green >= self.min_green,
            "max_green ({}) must be at least min_green ({})",
            self.max_green,
            self.min_green
        );
        ensure!(self.yellow >= 0.0, "yellow must not be negative");
        ensure!(self.clearance >= 0.0, "clearance must not be negative");
        Ok(())
    }

    /// Upper bound on one full vehicle cycle, ignoring the final vehicle's overrun
    pub fn cycle_bound(&self) -> f64 {
        self.max_green + self.yellow + self.clearance
    }
}

#[derive(Default)]
struct PolicySlot {
    policy: Option<Policy>,
    closed: bool,
}

/// Latest policy delivered to a node; empty until the first delivery.
#[derive(Default)]
pub struct PolicyCell {
    slot: Mutex<PolicySlot>,
    delivered: Condvar,
}

impl PolicyCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: Policy) -> Self {
        let cell = Self::new();
        cell.set(policy);
        cell
    }

    /// Replaces the policy and wakes every waiting controller
    pub fn set(&self, policy: Policy) {
        self.lock().policy = Some(policy);
        self.delivered.notify_all();
    }

    pub fn get(&self) -> Option<Policy> {
        self.lock().policy
    }

    /// Blocks until a policy has been delivered.
    ///
    /// Returns `None` when the cell is closed or shutdown fires.
    pub fn wait(&self, shutdown: &Shutdown) -> Option<Policy> {
        let mut slot = self.lock();
        loop {
            if slot.closed || shutdown.is_triggered() {
                return None;
            }
            if let Some(policy) = slot.policy {
                return Some(policy);
            }
            slot = self
                .delivered
                .wait_timeout(slot, std::time::Duration::from_millis(80))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.delivered.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, PolicySlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
