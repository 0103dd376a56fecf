//! Per-direction signal-phase controller
//!
//! Each approach of an intersection runs one controller on its own thread:
//!
//! `IDLE -> ACQUIRING -> MIN_GREEN -> EXTENDING -> YELLOW -> CLEARANCE -> IDLE`
//!
//! The controller drains its queue while it holds the phase group, under
//! whatever policy was most recently delivered.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::arbitrator::{ArbitrationError, PhaseArbitrator};
use super::clock::SimClock;
use super::policy::{Policy, PolicyCell};
use super::queue::VehicleQueue;
use super::shutdown::Shutdown;
use super::types::{Direction, PhaseGroup, Vehicle};

/// Real-time pause before retrying after a failed cycle
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Kind of a simulation event reported to the coordinator's event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Register,
    Telemetry,
    VehicleEntry,
    VehicleArrival,
    VehicleTransfer,
    VehicleExit,
    GreenStart,
    Yellow,
    Clearance,
    GreenEnd,
    PedestrianGreen,
    PedestrianRed,
    InvariantViolation,
    /// Out-of-band record without a logical timestamp
    Raw,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.pad(&label)
    }
}

/// A phase or vehicle event produced by a controller
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub kind: EventKind,
    pub sim_time: f64,
    pub intersection: String,
    pub vehicle_id: Option<String>,
    pub details: String,
}

/// Where the controllers acquire their phase group.
///
/// The in-process [`PhaseArbitrator`] implements it directly; a node can also
/// defer to the coordinator's arbitrator over its link.
pub trait PhaseGate: Send + Sync {
    /// Blocks until granted, or fails once `shutdown` fires
    fn acquire(
        &self,
        intersection: &str,
        direction: Direction,
        shutdown: &Shutdown,
    ) -> Result<(), ArbitrationError>;

    fn release(&self, intersection: &str, direction: Direction);

    fn active_group(&self, intersection: &str) -> Option<PhaseGroup>;
}

impl PhaseGate for PhaseArbitrator {
    fn acquire(
        &self,
        intersection: &str,
        direction: Direction,
        shutdown: &Shutdown,
    ) -> Result<(), ArbitrationError> {
        self.request_green_until(intersection, direction, || shutdown.is_triggered())
            .map(|_| ())
    }

    fn release(&self, intersection: &str, direction: Direction) {
        self.release_green(intersection, direction);
    }

    fn active_group(&self, intersection: &str) -> Option<PhaseGroup> {
        PhaseArbitrator::active_group(self, intersection)
    }
}

/// Outputs of a controller: the event stream and the forwarding path.
pub trait SignalHost: Send + Sync {
    fn emit(&self, event: SignalEvent);

    /// Hands a vehicle that has cleared the intersection onwards
    fn forward(&self, vehicle: Vehicle);
}

/// Observable state of one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalState {
    Idle,
    Acquiring,
    MinGreen,
    Extending,
    Yellow,
    Clearance,
}

impl SignalState {
    /// Whether the approach is showing green
    pub fn is_green(self) -> bool {
        matches!(self, SignalState::MinGreen | SignalState::Extending)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller stopped")]
    Stopped,
    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),
    #[error("policy rejected: {0}")]
    InvalidPolicy(String),
}

/// Outcome of one completed green cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub vehicles: usize,
    pub extensions: u32,
    /// Simulated seconds of green (first vehicle through the last extension)
    pub green_time: f64,
    /// Simulated seconds from green start to the end of clearance
    pub cycle_time: f64,
}

/// Static parameters of a controller
#[derive(Debug, Clone)]
pub struct SignalSettings {
    pub intersection: String,
    pub direction: Direction,
    /// Base simulated time to clear one car; scaled by vehicle type
    pub crossing_time: f64,
}

/// Drives one approach through its phase cycle.
pub struct SignalPhaseController {
    settings: SignalSettings,
    queue: Arc<VehicleQueue>,
    gate: Arc<dyn PhaseGate>,
    policy: Arc<PolicyCell>,
    clock: Arc<SimClock>,
    host: Arc<dyn SignalHost>,
    state: Arc<Mutex<SignalState>>,
    shutdown: Shutdown,
}

impl SignalPhaseController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SignalSettings,
        queue: Arc<VehicleQueue>,
        gate: Arc<dyn PhaseGate>,
        policy: Arc<PolicyCell>,
        clock: Arc<SimClock>,
        host: Arc<dyn SignalHost>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            settings,
            queue,
            gate,
            policy,
            clock,
            host,
            state: Arc::new(Mutex::new(SignalState::Idle)),
            shutdown,
        }
    }

    pub fn direction(&self) -> Direction {
        self.settings.direction
    }

    /// Shared handle to the controller's current state
    pub fn state_handle(&self) -> Arc<Mutex<SignalState>> {
        Arc::clone(&self.state)
    }

    pub fn state(&self) -> SignalState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs cycles until shutdown. A failed cycle is logged and the
    /// controller starts again from IDLE.
    pub fn run(&self) {
        info!("{}-{}: controller started", self.settings.intersection, self.settings.direction);
        while !self.shutdown.is_triggered() {
            match self.run_cycle() {
                Ok(Some(report)) => debug!(
                    "{}-{}: cycle done, {} vehicles, {} extensions, green {:.1}s",
                    self.settings.intersection,
                    self.settings.direction,
                    report.vehicles,
                    report.extensions,
                    report.green_time
                ),
                Ok(None) | Err(ControllerError::Stopped) => break,
                Err(ControllerError::Arbitration(ArbitrationError::ShutDown))
                | Err(ControllerError::Arbitration(ArbitrationError::Cancelled { .. })) => break,
                Err(e) => {
                    error!(
                        "{}-{}: cycle failed: {:#}",
                        self.settings.intersection, self.settings.direction, e
                    );
                    if !self.shutdown.sleep(RETRY_BACKOFF) {
                        break;
                    }
                }
            }
            self.set_state(SignalState::Idle);
        }
        self.set_state(SignalState::Idle);
        info!("{}-{}: controller stopped", self.settings.intersection, self.settings.direction);
    }

    /// Runs one full cycle. Returns `Ok(None)` when the controller was told
    /// to stop while idle.
    pub fn run_cycle(&self) -> Result<Option<CycleReport>, ControllerError> {
        self.set_state(SignalState::Idle);

        // A controller without a policy must not touch its queue
        if self.policy.wait(&self.shutdown).is_none() {
            return Ok(None);
        }

        let Some(first) = self.queue.poll() else {
            return Ok(None);
        };

        // The wait for a vehicle can be long; serve under the latest policy
        let Some(policy) = self.policy.get() else {
            self.queue.enqueue(first);
            return Ok(None);
        };
        if let Err(e) = policy.validate() {
            self.queue.enqueue(first);
            return Err(ControllerError::InvalidPolicy(e.to_string()));
        }

        self.set_state(SignalState::Acquiring);
        let acquired =
            self.gate
                .acquire(&self.settings.intersection, self.settings.direction, &self.shutdown);
        if let Err(e) = acquired {
            // The vehicle stays ours; put it back so it is not lost
            warn!(
                "{}-{}: phase not granted ({}), requeueing {}",
                self.settings.intersection, self.settings.direction, e, first.id
            );
            self.queue.enqueue(first);
            return Err(e.into());
        }

        let result = self.serve_green(first, &policy);
        self.gate.release(&self.settings.intersection, self.settings.direction);

        let report = result?;
        self.emit(
            EventKind::GreenEnd,
            None,
            format!("direction={}, duration={:.2}", self.settings.direction, report.green_time),
        );
        Ok(Some(report))
    }

    fn serve_green(&self, first: Vehicle, policy: &Policy) -> Result<CycleReport, ControllerError> {
        let green_start = self.clock.now();
        self.emit(EventKind::GreenStart, None, format!("direction={}", self.settings.direction));

        // MIN_GREEN: the first vehicle always goes through
        self.set_state(SignalState::MinGreen);
        self.process_vehicle(first)?;
        let mut vehicles = 1;
        let mut green_time = self.clock.now() - green_start;

        while green_time < policy.min_green {
            let Some(vehicle) = self.queue.try_poll() else {
                break;
            };
            self.process_vehicle(vehicle)?;
            vehicles += 1;
            green_time = self.clock.now() - green_start;
        }

        // EXTENDING: a tie with the threshold still extends
        self.set_state(SignalState::Extending);
        let mut extensions = 0;
        while self.queue.len() >= policy.queue_threshold
            && extensions < policy.max_extensions
            && green_time < policy.max_green
        {
            let Some(vehicle) = self.queue.try_poll() else {
                break;
            };
            self.process_vehicle(vehicle)?;
            vehicles += 1;
            extensions += 1;
            green_time = self.clock.now() - green_start;
        }

        self.set_state(SignalState::Yellow);
        self.pause(policy.yellow)?;
        self.emit(EventKind::Yellow, None, format!("direction={}", self.settings.direction));

        self.set_state(SignalState::Clearance);
        self.pause(policy.clearance)?;
        self.emit(EventKind::Clearance, None, format!("direction={}", self.settings.direction));

        Ok(CycleReport {
            vehicles,
            extensions,
            green_time,
            cycle_time: self.clock.now() - green_start,
        })
    }

    fn process_vehicle(&self, vehicle: Vehicle) -> Result<(), ControllerError> {
        let delta = self.settings.crossing_time * vehicle.vehicle_type.time_factor();
        if self.clock.pause(delta, &self.shutdown).is_none() {
            // Interrupted mid-crossing: keep the vehicle queued for the record
            self.queue.enqueue(vehicle);
            return Err(ControllerError::Stopped);
        }
        self.host.forward(vehicle);
        Ok(())
    }

    fn pause(&self, sim_seconds: f64) -> Result<(), ControllerError> {
        self.clock
            .pause(sim_seconds, &self.shutdown)
            .map(|_| ())
            .ok_or(ControllerError::Stopped)
    }

    fn emit(&self, kind: EventKind, vehicle_id: Option<String>, details: String) {
        self.host.emit(SignalEvent {
            kind,
            sim_time: self.clock.now(),
            intersection: self.settings.intersection.clone(),
            vehicle_id,
            details,
        });
    }

    fn set_state(&self, state: SignalState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}
