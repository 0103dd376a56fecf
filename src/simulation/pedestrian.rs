//! Pedestrian crossing controller.
//!
//! Runs on a fixed real-time cycle rather than on demand. It never
//! preempts a vehicle phase: it waits for the vehicle groups to clear before
//! asking the gate for the pedestrian phase.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::clock::SimClock;
use super::policy::PolicyCell;
use super::shutdown::Shutdown;
use super::signal::{EventKind, PhaseGate, SignalEvent, SignalHost};
use super::types::{Direction, PhaseGroup};

/// Poll interval while waiting for vehicle phases to clear
const CLEAR_POLL: Duration = Duration::from_millis(80);

#[derive(Debug, Clone)]
pub struct PedestrianSettings {
    pub intersection: String,
    /// Real time between crossing requests
    pub cycle_interval: Duration,
    /// Simulated seconds the crossing stays green
    pub green_time: f64,
    /// Real-time pause after a crossing before the next request
    pub cooldown: Duration,
}

pub struct PedestrianController {
    settings: PedestrianSettings,
    gate: Arc<dyn PhaseGate>,
    policy: Arc<PolicyCell>,
    clock: Arc<SimClock>,
    host: Arc<dyn SignalHost>,
    shutdown: Shutdown,
}

impl PedestrianController {
    pub fn new(
        settings: PedestrianSettings,
        gate: Arc<dyn PhaseGate>,
        policy: Arc<PolicyCell>,
        clock: Arc<SimClock>,
        host: Arc<dyn SignalHost>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            settings,
            gate,
            policy,
            clock,
            host,
            shutdown,
        }
    }

    pub fn run(&self) {
        info!("{}: pedestrian controller started", self.settings.intersection);
        while self.shutdown.sleep(self.settings.cycle_interval) {
            if !self.run_crossing() {
                break;
            }
            if !self.shutdown.sleep(self.settings.cooldown) {
                break;
            }
        }
        info!("{}: pedestrian controller stopped", self.settings.intersection);
    }

    /// One crossing: wait, acquire, green, release. Returns `false` when
    /// interrupted by shutdown.
    pub fn run_crossing(&self) -> bool {
        if self.policy.wait(&self.shutdown).is_none() {
            return false;
        }

        while matches!(
            self.gate.active_group(&self.settings.intersection),
            Some(PhaseGroup::NorthSouth) | Some(PhaseGroup::EastWest)
        ) {
            if !self.shutdown.sleep(CLEAR_POLL) {
                return false;
            }
        }

        if let Err(e) = self
            .gate
            .acquire(&self.settings.intersection, Direction::Pedestrian, &self.shutdown)
        {
            debug!("{}: pedestrian phase not granted: {}", self.settings.intersection, e);
            return !self.shutdown.is_triggered();
        }

        self.emit(EventKind::PedestrianGreen, "pedestrians crossing");
        let completed = self.clock.pause(self.settings.green_time, &self.shutdown).is_some();
        self.gate.release(&self.settings.intersection, Direction::Pedestrian);
        if !completed {
            warn!("{}: pedestrian phase cut short by shutdown", self.settings.intersection);
            return false;
        }
        self.emit(EventKind::PedestrianRed, "pedestrians cleared");
        true
    }

    fn emit(&self, kind: EventKind, details: &str) {
        self.host.emit(SignalEvent {
            kind,
            sim_time: self.clock.now(),
            intersection: self.settings.intersection.clone(),
            vehicle_id: None,
            details: details.to_string(),
        });
    }
}
