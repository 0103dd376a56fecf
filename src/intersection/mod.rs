//! Intersection process
//!
//! One process per crossing. It owns four approach queues, one signal
//! controller per approach, an optional pedestrian controller, and the
//! threads that connect it to the rest of the network:
//!
//! - the coordinator listener (policy, routed arrivals, grants, STOP)
//! - the inbound listener for direct arrivals from neighbours
//! - the telemetry loop
//! - the forwarder that models road travel

pub mod forwarder;
pub mod gate;
pub mod node;

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use crate::config::{PedestrianConfig, PhaseAuthority, SimConfig};
use crate::net::link::{LinkSettings, MessageLink};
use crate::net::protocol::{Message, NodeRole, RegisterRequest};
use crate::simulation::arbitrator::PhaseArbitrator;
use crate::simulation::clock::{LogicalClock, SimClock};
use crate::simulation::pedestrian::{PedestrianController, PedestrianSettings};
use crate::simulation::policy::PolicyCell;
use crate::simulation::queue::VehicleQueue;
use crate::simulation::road_network::{NodeKind, RoadTopology};
use crate::simulation::shutdown::Shutdown;
use crate::simulation::signal::{PhaseGate, SignalHost, SignalPhaseController, SignalSettings};
use crate::simulation::types::Direction;

pub use gate::CoordinatorGate;
pub use node::{ArrivalError, Node};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct IntersectionSettings {
    pub id: String,
    pub coordinator: String,
    /// Port for direct arrivals; 0 picks a free port
    pub listen_port: u16,
    pub link: LinkSettings,
    pub time_scale: f64,
    pub crossing_time: f64,
    pub telemetry_interval: Duration,
    pub phase_authority: PhaseAuthority,
    pub pedestrian: Option<PedestrianConfig>,
}

impl IntersectionSettings {
    pub fn from_config(config: &SimConfig, id: &str) -> Result<Self> {
        let crossing = config
            .crossing(id)
            .with_context(|| format!("crossing {} is not configured", id))?;
        Ok(Self {
            id: id.to_string(),
            coordinator: config.coordinator.address(),
            listen_port: crossing.port,
            link: config.link,
            time_scale: config.time_scale,
            crossing_time: config.crossing_time,
            telemetry_interval: config.telemetry_interval(),
            phase_authority: config.phase_authority,
            pedestrian: crossing.pedestrian,
        })
    }
}

/// A running intersection
pub struct IntersectionProcess {
    node: Arc<Node>,
    local_addr: SocketAddr,
    shutdown: Shutdown,
    threads: Vec<JoinHandle<()>>,
}

impl IntersectionProcess {
    /// Connects to the coordinator, registers, asks for the policy and
    /// starts every thread of the process
    pub fn start(settings: IntersectionSettings, topology: Arc<RoadTopology>) -> Result<Self> {
        if topology.kind(&settings.id) != Some(NodeKind::Crossing) {
            bail!("{} is not a crossing of the topology", settings.id);
        }

        let lamport = Arc::new(LogicalClock::new());
        let link = MessageLink::connect(&settings.coordinator, settings.link)
            .with_context(|| format!("{}: coordinator unreachable", settings.id))?
            .with_clock(Arc::clone(&lamport));
        let link = Arc::new(link);

        let listener =
            TcpListener::bind(("0.0.0.0", settings.listen_port)).with_context(|| {
                format!("{}: failed to bind port {}", settings.id, settings.listen_port)
            })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Shutdown::new();
        let clock = Arc::new(SimClock::new(settings.time_scale));
        let policy = Arc::new(PolicyCell::new());

        let local_arbitrator = Arc::new(PhaseArbitrator::new());
        let (gate, remote_gate): (Arc<dyn PhaseGate>, Option<Arc<CoordinatorGate>>) =
            match settings.phase_authority {
                PhaseAuthority::Coordinator => {
                    let remote = Arc::new(CoordinatorGate::new(Arc::clone(&link)));
                    (remote.clone() as Arc<dyn PhaseGate>, Some(remote))
                }
                PhaseAuthority::Local => (local_arbitrator.clone() as Arc<dyn PhaseGate>, None),
            };

        let (trips_tx, trips_rx) = forwarder::channel();
        let node = Arc::new(Node::new(
            settings.id.clone(),
            Arc::clone(&link),
            topology,
            Arc::clone(&clock),
            Arc::clone(&gate),
            remote_gate,
            Arc::clone(&policy),
            trips_tx,
            shutdown.clone(),
        ));

        link.send(&Message::Register(RegisterRequest {
            node_id: settings.id.clone(),
            role: NodeRole::Crossing,
        }))
        .context("failed to register")?;
        link.send(&Message::PolicyUpdate(None))
            .context("failed to request the policy")?;

        let mut threads = Vec::new();
        let id = settings.id.clone();

        let listener_node = Arc::clone(&node);
        let listener_shutdown = shutdown.clone();
        threads.push(spawn(format!("{}-coordinator", id), move || {
            listen_coordinator(&listener_node, &listener_shutdown)
        })?);

        let inbound_node = Arc::clone(&node);
        let inbound_shutdown = shutdown.clone();
        threads.push(spawn(format!("{}-inbound", id), move || {
            accept_neighbours(listener, &inbound_node, &inbound_shutdown)
        })?);

        let telemetry_node = Arc::clone(&node);
        let telemetry_shutdown = shutdown.clone();
        let interval = settings.telemetry_interval;
        threads.push(spawn(format!("{}-telemetry", id), move || {
            telemetry_loop(&telemetry_node, interval, &telemetry_shutdown)
        })?);

        let forward_node = Arc::clone(&node);
        let forward_shutdown = shutdown.clone();
        threads.push(spawn(format!("{}-forwarder", id), move || {
            forwarder::run(trips_rx, forward_shutdown, |trip| forward_node.deliver(trip))
        })?);

        let host: Arc<dyn SignalHost> = node.clone();
        for direction in Direction::VEHICLE {
            let Some(queue) = node.queue(direction).cloned() else {
                continue;
            };
            let controller = SignalPhaseController::new(
                SignalSettings {
                    intersection: id.clone(),
                    direction,
                    crossing_time: settings.crossing_time,
                },
                queue,
                Arc::clone(&gate),
                Arc::clone(&policy),
                Arc::clone(&clock),
                Arc::clone(&host),
                shutdown.clone(),
            );
            node.watch_signal(direction, controller.state_handle());
            threads.push(spawn(format!("{}-{}", id, direction), move || controller.run())?);
        }

        if let Some(pedestrian) = settings.pedestrian {
            let controller = PedestrianController::new(
                PedestrianSettings {
                    intersection: id.clone(),
                    cycle_interval: Duration::from_millis(pedestrian.cycle_interval_ms),
                    green_time: pedestrian.green_time,
                    cooldown: Duration::from_millis(pedestrian.cooldown_ms),
                },
                Arc::clone(&gate),
                Arc::clone(&policy),
                Arc::clone(&clock),
                Arc::clone(&host),
                shutdown.clone(),
            );
            threads.push(spawn(format!("{}-pedestrian", id), move || controller.run())?);
        }

        // Unblocks queues, the policy wait and the link once shutdown fires
        let watch_node = Arc::clone(&node);
        let watch_shutdown = shutdown.clone();
        threads.push(spawn(format!("{}-shutdown", id), move || {
            let _ = watch_shutdown.receiver().recv();
            for (_, queue) in watch_node.queues() {
                queue.close();
            }
            watch_node.policy().close();
            local_arbitrator.shutdown();
            watch_node.link().close();
        })?);

        info!("{} started, arrivals on {}", id, local_addr);
        Ok(Self {
            node,
            local_addr,
            shutdown,
            threads,
        })
    }

    pub fn id(&self) -> &str {
        self.node.id()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Address of the direct-arrival listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn queue(&self, direction: Direction) -> Option<&Arc<VehicleQueue>> {
        self.node.queue(direction)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Blocks until the process stops, normally after a STOP
    pub fn wait(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("an intersection thread panicked");
            }
        }
    }

    pub fn stop(self) {
        self.shutdown.trigger();
        self.wait();
    }
}

fn spawn<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .with_context(|| format!("failed to spawn {}", name))
}

fn listen_coordinator(node: &Node, shutdown: &Shutdown) {
    let link = node.link();
    loop {
        crossbeam::select! {
            recv(link.incoming()) -> line => match line {
                Ok(line) => {
                    if let Some(frame) = link.accept(&line) {
                        node.on_coordinator_message(frame);
                    }
                }
                Err(_) => {
                    if !shutdown.is_triggered() {
                        warn!("{}: coordinator link lost, stopping", node.id());
                        shutdown.trigger();
                    }
                    return;
                }
            },
            recv(shutdown.receiver()) -> _ => return,
        }
    }
}

fn accept_neighbours(listener: TcpListener, node: &Arc<Node>, shutdown: &Shutdown) {
    while !shutdown.is_triggered() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("{}: neighbour connected from {}", node.id(), peer);
                let node = Arc::clone(node);
                let shutdown = shutdown.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-arrivals", node.id()))
                    .spawn(move || serve_neighbour(stream, &node, &shutdown));
                if let Err(e) = spawned {
                    error!("failed to serve {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                shutdown.sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("{}: accept failed: {}", node.id(), e);
                shutdown.sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_neighbour(stream: TcpStream, node: &Node, shutdown: &Shutdown) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("{}: {}", node.id(), e);
        return;
    }
    let link = match MessageLink::from_stream(stream) {
        Ok(link) => link,
        Err(e) => {
            warn!("{}: {}", node.id(), e);
            return;
        }
    };
    loop {
        crossbeam::select! {
            recv(link.incoming()) -> line => match line {
                Ok(line) => match link.accept(&line).map(|frame| frame.message) {
                    Some(Message::VehicleArrival(transfer))
                    | Some(Message::VehicleTransfer(transfer)) => {
                        let reply = match node.accept_arrival(transfer) {
                            Ok(_) => Message::Ok("VEHICLE_ARRIVAL_OK".to_string()),
                            Err(e) => Message::error(e.to_string()),
                        };
                        let _ = link.send(&reply);
                    }
                    Some(other) => {
                        let reply = Message::error(format!("UNSUPPORTED: {}", other.kind()));
                        let _ = link.send(&reply);
                    }
                    None => {}
                },
                Err(_) => break,
            },
            recv(shutdown.receiver()) -> _ => break,
        }
    }
    link.close();
}

fn telemetry_loop(node: &Node, interval: Duration, shutdown: &Shutdown) {
    while shutdown.sleep(interval) {
        let telemetry = node.telemetry();
        debug!(
            "{}: queued={} avg={:.2} light={:?}",
            telemetry.crossing, telemetry.queue, telemetry.avg, telemetry.light_state
        );
        if let Err(e) = node.link().send(&Message::Telemetry(telemetry)) {
            warn!("{}: telemetry not sent: {}", node.id(), e);
        }
    }
}
