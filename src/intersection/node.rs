//! State shared by the threads of one intersection process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, error, info, warn};
use thiserror::Error;

use super::forwarder::{InFlight, TripSender};
use super::gate::CoordinatorGate;
use crate::net::link::MessageLink;
use crate::net::protocol::{
    EventLogEntry, Frame, Message, TelemetryPayload, VehicleTransfer, DESTINATION_NOT_FOUND,
};
use crate::simulation::clock::SimClock;
use crate::simulation::policy::PolicyCell;
use crate::simulation::queue::VehicleQueue;
use crate::simulation::road_network::RoadTopology;
use crate::simulation::shutdown::Shutdown;
use crate::simulation::signal::{EventKind, PhaseGate, SignalEvent, SignalHost, SignalState};
use crate::simulation::types::{Direction, LightColor, PhaseGroup, Vehicle};

/// A transfer this node refuses to take ownership of
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArrivalError {
    #[error("vehicle {vehicle} is addressed to {to}, not {node}")]
    WrongNode { vehicle: String, to: String, node: String },
    #[error("vehicle {vehicle}: path index {index} does not point at {node}")]
    PathMismatch { vehicle: String, index: usize, node: String },
    #[error("no road from {from} to {to}")]
    UnknownRoad { from: String, to: String },
}

pub struct Node {
    id: String,
    link: Arc<MessageLink>,
    topology: Arc<RoadTopology>,
    clock: Arc<SimClock>,
    queues: BTreeMap<Direction, Arc<VehicleQueue>>,
    signals: Mutex<Vec<(Direction, Arc<Mutex<SignalState>>)>>,
    gate: Arc<dyn PhaseGate>,
    remote_gate: Option<Arc<CoordinatorGate>>,
    policy: Arc<PolicyCell>,
    trips: TripSender,
    shutdown: Shutdown,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        link: Arc<MessageLink>,
        topology: Arc<RoadTopology>,
        clock: Arc<SimClock>,
        gate: Arc<dyn PhaseGate>,
        remote_gate: Option<Arc<CoordinatorGate>>,
        policy: Arc<PolicyCell>,
        trips: TripSender,
        shutdown: Shutdown,
    ) -> Self {
        let queues = Direction::VEHICLE
            .into_iter()
            .map(|direction| (direction, Arc::new(VehicleQueue::new())))
            .collect();
        Self {
            id,
            link,
            topology,
            clock,
            queues,
            signals: Mutex::new(Vec::new()),
            gate,
            remote_gate,
            policy,
            trips,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn link(&self) -> &Arc<MessageLink> {
        &self.link
    }

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    pub fn gate(&self) -> &Arc<dyn PhaseGate> {
        &self.gate
    }

    pub fn policy(&self) -> &Arc<PolicyCell> {
        &self.policy
    }

    pub fn queue(&self, direction: Direction) -> Option<&Arc<VehicleQueue>> {
        self.queues.get(&direction)
    }

    pub fn queues(&self) -> impl Iterator<Item = (Direction, &Arc<VehicleQueue>)> {
        self.queues.iter().map(|(direction, queue)| (*direction, queue))
    }

    /// Makes a controller's state visible to telemetry
    pub fn watch_signal(&self, direction: Direction, state: Arc<Mutex<SignalState>>) {
        self.lock_signals().push((direction, state));
    }

    /// Takes ownership of a transferred vehicle and queues it on the
    /// approach its road leads into
    pub fn accept_arrival(&self, transfer: VehicleTransfer) -> Result<Direction, ArrivalError> {
        if let Err(violation) = self.check_arrival(&transfer) {
            error!("{}: rejected arrival: {}", self.id, violation);
            self.send_event(SignalEvent {
                kind: EventKind::InvariantViolation,
                sim_time: self.clock.now(),
                intersection: self.id.clone(),
                vehicle_id: Some(transfer.vehicle_id.clone()),
                details: violation.to_string(),
            });
            return Err(violation);
        }
        let direction = self
            .topology
            .approach(&transfer.from, &transfer.to)
            .ok_or_else(|| ArrivalError::UnknownRoad {
                from: transfer.from.clone(),
                to: transfer.to.clone(),
            })?;

        self.clock.advance_to(transfer.time);
        let from = transfer.from.clone();
        let vehicle = transfer.into_vehicle();
        let vehicle_id = vehicle.id.clone();
        let vehicle_type = vehicle.vehicle_type;

        if let Some(queue) = self.queues.get(&direction) {
            queue.enqueue(vehicle);
        }
        self.send_event(SignalEvent {
            kind: EventKind::VehicleArrival,
            sim_time: self.clock.now(),
            intersection: self.id.clone(),
            vehicle_id: Some(vehicle_id),
            details: format!(
                "from={}, to={}, dir={}, type={}",
                from,
                self.id,
                direction,
                vehicle_type.as_str()
            ),
        });
        Ok(direction)
    }

    fn check_arrival(&self, transfer: &VehicleTransfer) -> Result<(), ArrivalError> {
        if transfer.to != self.id {
            return Err(ArrivalError::WrongNode {
                vehicle: transfer.vehicle_id.clone(),
                to: transfer.to.clone(),
                node: self.id.clone(),
            });
        }
        if transfer.path.get(transfer.index) != Some(&self.id) {
            return Err(ArrivalError::PathMismatch {
                vehicle: transfer.vehicle_id.clone(),
                index: transfer.index,
                node: self.id.clone(),
            });
        }
        if self.topology.road(&transfer.from, &transfer.to).is_none() {
            return Err(ArrivalError::UnknownRoad {
                from: transfer.from.clone(),
                to: transfer.to.clone(),
            });
        }
        Ok(())
    }

    /// Called by the forwarder once a vehicle reaches the end of its road
    pub fn deliver(&self, trip: InFlight) {
        let InFlight {
            mut vehicle,
            arrival_time,
            ..
        } = trip;
        let Some(next) = vehicle.next_node().map(str::to_string) else {
            self.exit(vehicle, arrival_time);
            return;
        };

        if self.topology.is_exit(&next) {
            vehicle.path_index += 1;
            self.exit(vehicle, arrival_time);
            return;
        }

        let Some(transfer) = VehicleTransfer::hop(&vehicle, arrival_time) else {
            return;
        };
        debug!("{}: {} on to {}", self.id, vehicle.id, next);
        if let Err(e) = self.link.send(&Message::VehicleTransfer(transfer)) {
            warn!("{}: transfer of {} to {} not sent: {}", self.id, vehicle.id, next, e);
        }
    }

    fn exit(&self, mut vehicle: Vehicle, time: f64) {
        vehicle.exited_at = Some(time);
        let dwelling = vehicle.dwelling_time().unwrap_or_default();
        info!("{}: {} left the network after {:.1}s", self.id, vehicle.id, dwelling);
        self.send_event(SignalEvent {
            kind: EventKind::VehicleExit,
            sim_time: time,
            intersection: self.id.clone(),
            vehicle_id: Some(vehicle.id.clone()),
            details: format!(
                "exit={}, type={}, dwelling={:.2}",
                vehicle.current_node().unwrap_or_default(),
                vehicle.vehicle_type.as_str(),
                dwelling
            ),
        });
    }

    /// Snapshot published on every telemetry tick
    pub fn telemetry(&self) -> TelemetryPayload {
        let mut queued = 0;
        let mut average_sum = 0.0;
        for queue in self.queues.values() {
            queue.sample();
            queued += queue.len();
            average_sum += queue.average_depth();
        }
        let average = if self.queues.is_empty() {
            0.0
        } else {
            average_sum / self.queues.len() as f64
        };

        let pedestrian = self.gate.active_group(&self.id) == Some(PhaseGroup::Pedestrian);
        let signals: Vec<(Direction, SignalState)> = self
            .lock_signals()
            .iter()
            .map(|(direction, state)| {
                let state = *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                (*direction, state)
            })
            .collect();
        let direction_green = signals
            .iter()
            .find(|(_, state)| state.is_green())
            .map(|(direction, _)| *direction);
        let light_state = if pedestrian {
            LightColor::Pedestrian
        } else if direction_green.is_some() {
            LightColor::Green
        } else if signals.iter().any(|(_, state)| *state == SignalState::Yellow) {
            LightColor::Yellow
        } else {
            LightColor::Red
        };

        TelemetryPayload {
            crossing: self.id.clone(),
            queue: queued,
            avg: average,
            light_state,
            pedestrian,
            direction_green,
        }
    }

    /// Handles one message pushed by the coordinator
    pub fn on_coordinator_message(&self, frame: Frame) {
        match frame.message {
            Message::Policy(policy) => {
                info!("{}: policy received", self.id);
                self.policy.set(policy);
            }
            Message::VehicleArrival(transfer) | Message::VehicleTransfer(transfer) => {
                let _ = self.accept_arrival(transfer);
            }
            Message::PhaseGranted(request) => match &self.remote_gate {
                Some(gate) => gate.granted(&request),
                None => warn!("{}: unexpected grant for {}", self.id, request.direction),
            },
            Message::Stop => {
                info!("{}: STOP received", self.id);
                self.shutdown.trigger();
            }
            Message::Error(text) if text == DESTINATION_NOT_FOUND => {
                warn!("{}: a forwarded vehicle had no live destination", self.id);
            }
            Message::Error(text) => warn!("{}: coordinator reported: {}", self.id, text),
            Message::Ok(_) => {}
            other => debug!("{}: ignoring {}", self.id, other.kind()),
        }
    }

    fn send_event(&self, event: SignalEvent) {
        let entry = EventLogEntry {
            kind: event.kind,
            sim_time: event.sim_time,
            node: event.intersection,
            vehicle_id: event.vehicle_id,
            details: event.details,
        };
        if let Err(e) = self.link.send(&Message::EventLog(entry)) {
            debug!("{}: event not sent: {}", self.id, e);
        }
    }

    fn lock_signals(&self) -> MutexGuard<'_, Vec<(Direction, Arc<Mutex<SignalState>>)>> {
        self.signals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SignalHost for Node {
    fn emit(&self, event: SignalEvent) {
        debug!("{}: {} {}", event.intersection, event.kind, event.details);
        self.send_event(event);
    }

    fn forward(&self, vehicle: Vehicle) {
        let Some(current) = vehicle.current_node().map(str::to_string) else {
            error!("{}: vehicle {} has no position on its path", self.id, vehicle.id);
            return;
        };
        let Some(next) = vehicle.next_node().map(str::to_string) else {
            // Path ends here
            let now = self.clock.now();
            self.exit(vehicle, now);
            return;
        };
        let Some(travel) = self.topology.travel_time(&current, &next) else {
            error!("{}: no road {} -> {} for {}", self.id, current, next, vehicle.id);
            self.send_event(SignalEvent {
                kind: EventKind::InvariantViolation,
                sim_time: self.clock.now(),
                intersection: self.id.clone(),
                vehicle_id: Some(vehicle.id.clone()),
                details: format!("no road from {} to {}", current, next),
            });
            return;
        };

        let delta = travel * vehicle.vehicle_type.time_factor();
        let trip = InFlight {
            arrival_time: self.clock.now() + delta,
            due: Instant::now() + self.clock.to_real(delta),
            vehicle,
        };
        if let Err(e) = self.trips.send(trip) {
            warn!("{}: forwarder gone, {} dropped", self.id, e.into_inner().vehicle.id);
        }
    }
}
