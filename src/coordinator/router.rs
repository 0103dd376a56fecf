//! Message dispatch for the coordinator.
//!
//! Every line a connection delivers passes through [`Router::handle_line`].
//! An accepted envelope advances the coordinator's logical clock exactly
//! once; the handler for its type then runs with that timestamp.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use log::{debug, error, info, warn};
use ordered_float::OrderedFloat;

use super::event_log::{EventList, EventLogStore, LogRecord};
use super::registry::{Connection, ConnectionId, DeliveryError, NodeRegistry};
use crate::net::protocol::{
    self, EventLogEntry, Frame, Message, PhaseRequest, ProtocolError, VehicleTransfer,
    DESTINATION_NOT_FOUND, TRANSFER_OK,
};
use crate::simulation::arbitrator::PhaseArbitrator;
use crate::simulation::clock::LogicalClock;
use crate::simulation::policy::Policy;
use crate::simulation::shutdown::Shutdown;
use crate::simulation::signal::EventKind;
use crate::simulation::types::{Direction, SINK_NODE_ID};

/// Node id used for records the coordinator writes on its own behalf
const COORDINATOR_NODE: &str = "COORDINATOR";

/// A connection the router is serving
struct Attached {
    connection: Arc<Connection>,
    /// Set when the connection goes away; pending phase waiters give up
    gone: Arc<AtomicBool>,
}

/// Shared coordinator state and the per-type handlers
pub struct Router {
    registry: NodeRegistry,
    arbitrator: Arc<PhaseArbitrator>,
    clock: LogicalClock,
    events: EventList,
    store: Option<EventLogStore>,
    history: Mutex<HashMap<String, Vec<EventLogEntry>>>,
    policy: RwLock<Policy>,
    attached: Mutex<HashMap<ConnectionId, Attached>>,
    /// Phase groups each connection currently holds
    holds: Mutex<HashMap<ConnectionId, BTreeSet<(String, Direction)>>>,
    shutdown: Shutdown,
}

impl Router {
    pub fn new(store: Option<EventLogStore>, policy: Policy, shutdown: Shutdown) -> Self {
        Self {
            registry: NodeRegistry::new(),
            arbitrator: Arc::new(PhaseArbitrator::new()),
            clock: LogicalClock::new(),
            events: EventList::new(),
            store,
            history: Mutex::new(HashMap::new()),
            policy: RwLock::new(policy),
            attached: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn arbitrator(&self) -> &Arc<PhaseArbitrator> {
        &self.arbitrator
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn events(&self) -> &EventList {
        &self.events
    }

    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn policy(&self) -> Policy {
        *self.policy.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records of one vehicle ordered by simulated time
    pub fn history(&self, vehicle_id: &str) -> Vec<EventLogEntry> {
        let mut records = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(vehicle_id)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|record| OrderedFloat(record.sim_time));
        records
    }

    /// Starts serving a connection
    pub fn attach(&self, connection: Arc<Connection>) {
        debug!("{} attached ({})", connection.id(), connection.peer());
        self.lock_attached().insert(
            connection.id(),
            Attached {
                connection,
                gone: Arc::new(AtomicBool::new(false)),
            },
        );
    }

    /// Forgets a connection: registry entries, pending waiters and held phases
    pub fn detach(&self, id: ConnectionId) {
        if let Some(attached) = self.lock_attached().remove(&id) {
            attached.gone.store(true, Ordering::SeqCst);
            attached.connection.close();
        }
        let removed = self.registry.remove_connection(id);
        if !removed.is_empty() {
            info!("{} disconnected: {}", id, removed.join(", "));
        }

        let held = self.lock_holds().remove(&id).unwrap_or_default();
        for (intersection, direction) in held {
            warn!("releasing {} {} held by departed {}", intersection, direction, id);
            self.arbitrator.release_green(&intersection, direction);
        }
    }

    /// Closes every attached connection
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.lock_attached().keys().copied().collect();
        for id in ids {
            self.detach(id);
        }
    }

    /// Decodes and dispatches one inbound line. Malformed lines are logged
    /// and dropped without a reply.
    pub fn handle_line(self: &Arc<Self>, connection: &Arc<Connection>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let envelope = match protocol::decode_envelope(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}: ignoring line: {}", connection.id(), e);
                return;
            }
        };
        let timestamp = self.clock.observe(envelope.timestamp);

        match Message::from_envelope(&envelope) {
            Ok(message) => self.dispatch(connection, message, timestamp),
            Err(ProtocolError::UnknownType(kind)) => {
                warn!("{}: unknown message type {}", connection.id(), kind);
                self.reply(connection, &Message::error(format!("UNKNOWN_TYPE: {}", kind)));
            }
            Err(e) => {
                warn!("{}: {}", connection.id(), e);
                self.reply(connection, &Message::error(e.to_string()));
            }
        }
    }

    /// Dispatches an already decoded frame
    pub fn handle(self: &Arc<Self>, connection: &Arc<Connection>, frame: Frame) {
        let timestamp = self.clock.observe(frame.timestamp);
        self.dispatch(connection, frame.message, timestamp);
    }

    fn dispatch(self: &Arc<Self>, connection: &Arc<Connection>, message: Message, timestamp: u64) {
        match message {
            Message::Register(request) => {
                self.registry.register(&request.node_id, request.role, connection);
                self.record(LogRecord {
                    timestamp: Some(timestamp),
                    kind: EventKind::Register,
                    node: request.node_id.clone(),
                    vehicle_id: None,
                    sim_time: 0.0,
                    details: format!("role={:?}", request.role),
                });
                self.reply(connection, &Message::Ok("REGISTER_OK".to_string()));
            }
            Message::Telemetry(telemetry) => {
                let details = serde_json::to_string(&telemetry).unwrap_or_default();
                self.record(LogRecord {
                    timestamp: Some(timestamp),
                    kind: EventKind::Telemetry,
                    node: telemetry.crossing.clone(),
                    vehicle_id: None,
                    sim_time: 0.0,
                    details,
                });
                self.broadcast_telemetry(&Message::Telemetry(telemetry));
                self.reply(connection, &Message::Ok("TELEMETRY_OK".to_string()));
            }
            Message::EventLog(entry) => {
                self.record(LogRecord::from_entry(&entry, Some(timestamp)));
                if matches!(entry.kind, EventKind::VehicleEntry | EventKind::VehicleExit) {
                    self.notify_sink(entry);
                }
                self.reply(connection, &Message::Ok("EVENT_LOG_OK".to_string()));
            }
            Message::TrafficStats(stats) => {
                self.broadcast_telemetry(&Message::TrafficStats(stats));
                self.reply(connection, &Message::Ok("TRAFFIC_STATS_OK".to_string()));
            }
            Message::PolicyUpdate(None) => {
                self.reply(connection, &Message::Policy(self.policy()));
            }
            Message::PolicyUpdate(Some(policy)) => self.update_policy(connection, policy),
            Message::VehicleTransfer(transfer) => {
                self.route_transfer(connection, transfer, timestamp)
            }
            Message::PhaseRequest(request) => self.request_phase(connection, request),
            Message::PhaseRelease(request) => self.release_phase(connection, request),
            Message::RequestHistory(vehicle_id) => {
                let records = self.history(&vehicle_id);
                debug!("history for {}: {} records", vehicle_id, records.len());
                self.reply(connection, &Message::History(records));
            }
            Message::Stop => self.stop(timestamp),
            Message::Ok(_) | Message::Error(_) => {
                debug!("{}: ignoring acknowledgement", connection.id());
            }
            other @ (Message::Policy(_)
            | Message::VehicleArrival(_)
            | Message::PhaseGranted(_)
            | Message::History(_)) => {
                warn!("{}: {} is not accepted by the coordinator", connection.id(), other.kind());
                self.reply(connection, &Message::error(format!("UNSUPPORTED: {}", other.kind())));
            }
        }
    }

    /// Passes vehicle entries and exits on to the statistics sink, if one is
    /// registered
    fn notify_sink(&self, entry: EventLogEntry) {
        let Some(line) = self.encode(&Message::EventLog(entry)) else {
            return;
        };
        match self.registry.send_to_node(SINK_NODE_ID, &line) {
            Ok(()) | Err(DeliveryError::NotRegistered(_)) => {}
            Err(e) => warn!("sink missed an event: {}", e),
        }
    }

    fn update_policy(&self, connection: &Arc<Connection>, policy: Policy) {
        if let Err(e) = policy.validate() {
            warn!("rejecting policy update: {:#}", e);
            self.reply(connection, &Message::error(format!("INVALID_POLICY: {}", e)));
            return;
        }
        *self.policy.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
        if let Some(line) = self.encode(&Message::Policy(policy)) {
            let delivered = self.registry.broadcast_nodes(&line);
            info!("policy updated, redistributed to {} nodes", delivered);
        }
        self.reply(connection, &Message::Ok("POLICY_UPDATED".to_string()));
    }

    fn route_transfer(
        &self,
        connection: &Arc<Connection>,
        transfer: VehicleTransfer,
        timestamp: u64,
    ) {
        self.record(LogRecord {
            timestamp: Some(timestamp),
            kind: EventKind::VehicleTransfer,
            node: transfer.from.clone(),
            vehicle_id: Some(transfer.vehicle_id.clone()),
            sim_time: transfer.time,
            details: format!(
                "from={}, to={}, type={}",
                transfer.from,
                transfer.to,
                transfer.vehicle_type.as_str()
            ),
        });

        let destination = transfer.to.clone();
        let vehicle_id = transfer.vehicle_id.clone();
        let Some(line) = self.encode(&Message::VehicleArrival(transfer)) else {
            return;
        };
        match self.registry.send_to_node(&destination, &line) {
            Ok(()) => self.reply(connection, &Message::Ok(TRANSFER_OK.to_string())),
            Err(e) => {
                warn!("transfer of {} failed: {}", vehicle_id, e);
                self.reply(connection, &Message::Error(DESTINATION_NOT_FOUND.to_string()));
            }
        }
    }

    /// Waits for the group on a dedicated thread so the connection keeps
    /// serving, then answers with PHASE_GRANTED
    fn request_phase(self: &Arc<Self>, connection: &Arc<Connection>, request: PhaseRequest) {
        let direction: Direction = match request.direction.parse() {
            Ok(direction) => direction,
            Err(e) => {
                warn!("{}: phase request rejected: {}", connection.id(), e);
                self.reply(connection, &Message::error(e.to_string()));
                return;
            }
        };
        let gone = self
            .lock_attached()
            .get(&connection.id())
            .map(|attached| Arc::clone(&attached.gone))
            .unwrap_or_default();

        let router = Arc::clone(self);
        let connection = Arc::clone(connection);
        let spawned = thread::Builder::new()
            .name(format!("phase-{}-{}", request.crossing, direction))
            .spawn(move || router.wait_for_phase(&connection, request.crossing, direction, gone));
        if let Err(e) = spawned {
            error!("failed to spawn phase waiter: {}", e);
        }
    }

    fn wait_for_phase(
        &self,
        connection: &Arc<Connection>,
        crossing: String,
        direction: Direction,
        gone: Arc<AtomicBool>,
    ) {
        let granted = self.arbitrator.request_green_until(&crossing, direction, || {
            gone.load(Ordering::SeqCst) || self.shutdown.is_triggered()
        });
        if let Err(e) = granted {
            debug!("phase wait for {} {} ended: {}", crossing, direction, e);
            return;
        }

        {
            let mut holds = self.lock_holds();
            // Checked under the holds lock so a concurrent detach either
            // sees this hold or makes us drop it here
            if gone.load(Ordering::SeqCst) {
                drop(holds);
                self.arbitrator.release_green(&crossing, direction);
                return;
            }
            holds
                .entry(connection.id())
                .or_default()
                .insert((crossing.clone(), direction));
        }
        self.reply(connection, &Message::PhaseGranted(PhaseRequest::new(crossing, direction)));
    }

    fn release_phase(&self, connection: &Arc<Connection>, request: PhaseRequest) {
        let direction: Direction = match request.direction.parse() {
            Ok(direction) => direction,
            Err(e) => {
                warn!("{}: phase release rejected: {}", connection.id(), e);
                self.reply(connection, &Message::error(e.to_string()));
                return;
            }
        };
        if let Some(held) = self.lock_holds().get_mut(&connection.id()) {
            held.remove(&(request.crossing.clone(), direction));
        }
        self.arbitrator.release_green(&request.crossing, direction);
        self.reply(connection, &Message::Ok("PHASE_RELEASED".to_string()));
    }

    fn stop(&self, timestamp: u64) {
        info!("STOP received, shutting the network down");
        self.record(LogRecord {
            timestamp: Some(timestamp),
            kind: EventKind::Raw,
            node: COORDINATOR_NODE.to_string(),
            vehicle_id: None,
            sim_time: 0.0,
            details: "STOP".to_string(),
        });
        if let Some(line) = self.encode(&Message::Stop) {
            let delivered = self.registry.broadcast_all(&line);
            info!("STOP delivered to {} nodes", delivered);
        }
        self.shutdown.trigger();
        self.arbitrator.shutdown();
    }

    /// Appends to the log file, the ordered list and the vehicle index
    fn record(&self, record: LogRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&record) {
                error!("failed to append event: {}", e);
            }
        }
        if let Some(vehicle_id) = &record.vehicle_id {
            self.history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(vehicle_id.clone())
                .or_default()
                .push(record.entry());
        }
        self.events.add(record);
    }

    fn broadcast_telemetry(&self, message: &Message) {
        if let Some(line) = self.encode(message) {
            self.registry.broadcast_telemetry(&line);
        }
    }

    fn reply(&self, connection: &Connection, message: &Message) {
        let Some(line) = self.encode(message) else {
            return;
        };
        if let Err(e) = connection.write_line(&line) {
            debug!("reply {} to {} failed: {}", message.kind(), connection.id(), e);
        }
    }

    /// Outgoing messages carry the current logical time without advancing it
    fn encode(&self, message: &Message) -> Option<String> {
        match protocol::encode(message, Some(self.clock.now())) {
            Ok(line) => Some(line),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    fn lock_attached(&self) -> MutexGuard<'_, HashMap<ConnectionId, Attached>> {
        self.attached.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_holds(&self) -> MutexGuard<'_, HashMap<ConnectionId, BTreeSet<(String, Direction)>>> {
        self.holds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
