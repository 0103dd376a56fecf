//! Wire protocol: one JSON envelope per line.
//!
//! `{"type": <tag>, "payload": <any>, "timestamp": <lamport>?}`
//!
//! Lines are decoded in two steps. The envelope is parsed first, so a line
//! that is not an envelope at all can be told apart from an envelope whose
//! tag nobody understands. The tag then selects exactly one payload shape.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::simulation::policy::Policy;
use crate::simulation::signal::EventKind;
use crate::simulation::types::{Direction, LightColor, Vehicle, VehicleType};

/// Reply text acknowledging a routed vehicle transfer
pub const TRANSFER_OK: &str = "VEHICLE_TRANSFER_OK";
/// Reply text when a transfer's destination has no live connection
pub const DESTINATION_NOT_FOUND: &str = "DESTINATION_NOT_FOUND";

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line is not a JSON envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Role a node declares when registering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    #[serde(rename = "CROSSING", alias = "crossing")]
    Crossing,
    #[serde(rename = "DASHBOARD", alias = "dashboard")]
    Dashboard,
    #[serde(rename = "SINK", alias = "sink")]
    Sink,
    #[serde(rename = "ENTRY", alias = "entry")]
    Entry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub node_id: String,
    pub role: NodeRole,
}

/// Periodic snapshot a crossing publishes for display subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub crossing: String,
    /// Vehicles waiting over all approaches
    pub queue: usize,
    /// Mean of the per-approach average depths
    pub avg: f64,
    pub light_state: LightColor,
    pub pedestrian: bool,
    #[serde(default)]
    pub direction_green: Option<Direction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub sim_time: f64,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub details: String,
}

/// Dwelling-time summary published by the statistics sink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficStats {
    pub total_vehicles: u64,
    pub count_by_type: BTreeMap<VehicleType, u64>,
    pub avg_dwelling_by_type: BTreeMap<VehicleType, f64>,
    pub min_dwelling_by_type: BTreeMap<VehicleType, f64>,
    pub max_dwelling_by_type: BTreeMap<VehicleType, f64>,
}

/// A vehicle handed from one node to the next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleTransfer {
    pub vehicle_id: String,
    pub from: String,
    pub to: String,
    /// Simulated time at which the vehicle reaches `to`
    pub time: f64,
    pub path: Vec<String>,
    /// Index of `to` within `path`
    pub index: usize,
    #[serde(rename = "type")]
    pub vehicle_type: VehicleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entered_at: Option<f64>,
}

impl VehicleTransfer {
    /// Transfer of `vehicle` from its current node to the next one on its path
    pub fn hop(vehicle: &Vehicle, time: f64) -> Option<Self> {
        let from = vehicle.current_node()?.to_string();
        let to = vehicle.next_node()?.to_string();
        Some(Self {
            vehicle_id: vehicle.id.clone(),
            from,
            to,
            time,
            path: vehicle.path.clone(),
            index: vehicle.path_index + 1,
            vehicle_type: vehicle.vehicle_type,
            entered_at: Some(vehicle.entered_at),
        })
    }

    /// The transferred vehicle, positioned at `to`
    pub fn into_vehicle(self) -> Vehicle {
        let entered_at = self.entered_at.unwrap_or(self.time);
        let mut vehicle = Vehicle::new(self.vehicle_id, self.vehicle_type, self.path, entered_at);
        vehicle.path_index = self.index;
        vehicle
    }
}

/// Phase acquire, release and grant all share this shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRequest {
    pub crossing: String,
    /// Kept as text so unknown labels reach the arbitrator and are rejected there
    pub direction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl PhaseRequest {
    pub fn new(crossing: impl Into<String>, direction: Direction) -> Self {
        Self {
            crossing: crossing.into(),
            direction: direction.as_str().to_string(),
            timestamp: None,
        }
    }
}

/// Every message the network exchanges
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Register(RegisterRequest),
    Telemetry(TelemetryPayload),
    EventLog(EventLogEntry),
    TrafficStats(TrafficStats),
    /// Without a payload asks for the current policy; with one replaces it
    PolicyUpdate(Option<Policy>),
    Policy(Policy),
    VehicleTransfer(VehicleTransfer),
    /// A routed transfer as delivered to its destination
    VehicleArrival(VehicleTransfer),
    PhaseRequest(PhaseRequest),
    PhaseRelease(PhaseRequest),
    PhaseGranted(PhaseRequest),
    /// Vehicle id whose records are wanted
    RequestHistory(String),
    History(Vec<EventLogEntry>),
    Ok(String),
    Error(String),
    Stop,
}

impl Message {
    /// Wire tag of the message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register(_) => "REGISTER",
            Message::Telemetry(_) => "TELEMETRY",
            Message::EventLog(_) => "EVENT_LOG",
            Message::TrafficStats(_) => "TRAFFIC_STATS",
            Message::PolicyUpdate(_) => "POLICY_UPDATE",
            Message::Policy(_) => "POLICY",
            Message::VehicleTransfer(_) => "VEHICLE_TRANSFER",
            Message::VehicleArrival(_) => "VEHICLE_ARRIVAL",
            Message::PhaseRequest(_) => "PHASE_REQUEST",
            Message::PhaseRelease(_) => "PHASE_RELEASE",
            Message::PhaseGranted(_) => "PHASE_GRANTED",
            Message::RequestHistory(_) => "REQUEST_HISTORY",
            Message::History(_) => "HISTORY",
            Message::Ok(_) => "OK",
            Message::Error(_) => "ERROR",
            Message::Stop => "STOP",
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Message::Error(text.into())
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::Register(p) => serde_json::to_value(p),
            Message::Telemetry(p) => serde_json::to_value(p),
            Message::EventLog(p) => serde_json::to_value(p),
            Message::TrafficStats(p) => serde_json::to_value(p),
            Message::PolicyUpdate(p) => serde_json::to_value(p),
            Message::Policy(p) => serde_json::to_value(p),
            Message::VehicleTransfer(p) | Message::VehicleArrival(p) => serde_json::to_value(p),
            Message::PhaseRequest(p) | Message::PhaseRelease(p) | Message::PhaseGranted(p) => {
                serde_json::to_value(p)
            }
            Message::RequestHistory(id) => serde_json::to_value(id),
            Message::History(records) => serde_json::to_value(records),
            Message::Ok(text) | Message::Error(text) => serde_json::to_value(text),
            Message::Stop => Ok(Value::Null),
        }
    }

    /// Builds the typed message for a decoded envelope
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.kind.as_str();
        let payload = &envelope.payload;
        let message = match kind {
            "REGISTER" => Message::Register(parse(kind, payload)?),
            "TELEMETRY" => Message::Telemetry(parse(kind, payload)?),
            "EVENT_LOG" => Message::EventLog(parse(kind, payload)?),
            "TRAFFIC_STATS" => Message::TrafficStats(parse(kind, payload)?),
            "POLICY_UPDATE" => Message::PolicyUpdate(parse(kind, payload)?),
            "POLICY" => Message::Policy(parse(kind, payload)?),
            "VEHICLE_TRANSFER" | "VehicleTransfer" => {
                Message::VehicleTransfer(parse(kind, payload)?)
            }
            "VEHICLE_ARRIVAL" => Message::VehicleArrival(parse(kind, payload)?),
            "PHASE_REQUEST" => Message::PhaseRequest(parse(kind, payload)?),
            "PHASE_RELEASE" => Message::PhaseRelease(parse(kind, payload)?),
            "PHASE_GRANTED" => Message::PhaseGranted(parse(kind, payload)?),
            "REQUEST_HISTORY" => Message::RequestHistory(history_target(kind, payload)?),
            "HISTORY" => Message::History(parse(kind, payload)?),
            "OK" => Message::Ok(text_payload(payload)),
            "ERROR" => Message::Error(text_payload(payload)),
            "STOP" => Message::Stop,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(message)
    }
}

/// A decoded line: the message plus the sender's logical timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: Message,
    pub timestamp: Option<u64>,
}

/// Parses only the envelope of a line
pub fn decode_envelope(line: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(ProtocolError::Malformed)
}

pub fn decode(line: &str) -> Result<Frame, ProtocolError> {
    let envelope = decode_envelope(line)?;
    let message = Message::from_envelope(&envelope)?;
    Ok(Frame {
        message,
        timestamp: envelope.timestamp,
    })
}

/// Serializes a message to one line, without the trailing newline
pub fn encode(message: &Message, timestamp: Option<u64>) -> Result<String, ProtocolError> {
    let kind = message.kind();
    let payload = message
        .payload()
        .map_err(|source| ProtocolError::Encode { kind, source })?;
    let envelope = Envelope {
        kind: kind.to_string(),
        payload,
        timestamp,
    };
    serde_json::to_string(&envelope).map_err(|source| ProtocolError::Encode { kind, source })
}

fn parse<T: DeserializeOwned>(kind: &str, payload: &Value) -> Result<T, ProtocolError> {
    T::deserialize(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Accepts either a bare vehicle id or `{"vehicleId": ..}`
fn history_target(kind: &str, payload: &Value) -> Result<String, ProtocolError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ByVehicle {
        vehicle_id: String,
    }

    if let Value::String(id) = payload {
        return Ok(id.clone());
    }
    parse::<ByVehicle>(kind, payload).map(|by| by.vehicle_id)
}

fn text_payload(payload: &Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
