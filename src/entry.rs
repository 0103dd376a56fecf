//! Entry point traffic generator
//!
//! Vehicles appear at an entry node with exponentially distributed gaps in
//! simulated time. Each one draws a type and a route, is announced to the
//! event log and then travels the first road to its first crossing.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use rand::SeedableRng;

use crate::config::{EntryConfig, RouteConfig, SimConfig};
use crate::intersection::forwarder::{self, InFlight};
use crate::net::link::{LinkSettings, MessageLink};
use crate::net::protocol::{EventLogEntry, Message, NodeRole, RegisterRequest, VehicleTransfer};
use crate::simulation::clock::{LogicalClock, SimClock};
use crate::simulation::road_network::{NodeKind, RoadTopology};
use crate::simulation::shutdown::Shutdown;
use crate::simulation::signal::EventKind;
use crate::simulation::types::{Vehicle, VehicleType};

#[derive(Debug, Clone)]
pub struct EntrySettings {
    pub id: String,
    pub coordinator: String,
    pub link: LinkSettings,
    pub time_scale: f64,
    /// Vehicles per simulated second
    pub rate: f64,
    pub routes: Vec<RouteConfig>,
    /// Fixed seed for a reproducible vehicle stream
    pub seed: Option<u64>,
    /// Stop after this many vehicles
    pub limit: Option<u64>,
}

impl EntrySettings {
    pub fn from_config(config: &SimConfig, id: &str) -> Result<Self> {
        let entry = config.entry(id).cloned().unwrap_or_else(|| EntryConfig {
            id: id.to_string(),
            rate: 0.5,
            routes: Vec::new(),
        });
        Ok(Self {
            id: id.to_string(),
            coordinator: config.coordinator.address(),
            link: config.link,
            time_scale: config.time_scale,
            rate: entry.rate,
            routes: entry.routes,
            seed: None,
            limit: None,
        })
    }
}

/// Draws gaps, vehicle types and routes for one entry
pub struct EntryGenerator {
    id: String,
    rate: f64,
    routes: Vec<RouteConfig>,
    fallback: Option<Vec<String>>,
    rng: Option<StdRng>,
    generated: u64,
}

impl EntryGenerator {
    pub fn new(
        id: &str,
        rate: f64,
        routes: Vec<RouteConfig>,
        topology: &RoadTopology,
    ) -> Result<Self> {
        if topology.kind(id) != Some(NodeKind::Entry) {
            bail!("{} is not an entry of the topology", id);
        }
        if rate <= 0.0 {
            bail!("entry {} needs a positive rate", id);
        }
        for route in &routes {
            topology
                .validate_path(&route.path)
                .with_context(|| format!("invalid route for {}", id))?;
        }
        let fallback = topology.shortest_exit_path(id);
        if routes.iter().all(|route| route.weight == 0) && fallback.is_none() {
            bail!("entry {} has no usable route to an exit", id);
        }
        Ok(Self {
            id: id.to_string(),
            rate,
            routes,
            fallback,
            rng: None,
            generated: 0,
        })
    }

    /// Uses a seeded generator so runs can be repeated
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    fn random_unit(&mut self) -> f64 {
        match &mut self.rng {
            Some(rng) => rng.random::<f64>(),
            None => rand::rng().random::<f64>(),
        }
    }

    fn random_roll(&mut self) -> u32 {
        match &mut self.rng {
            Some(rng) => rng.random_range(0..100),
            None => rand::rng().random_range(0..100),
        }
    }

    /// Simulated seconds until the next vehicle: `-ln(u) / rate`
    pub fn next_interval(&mut self) -> f64 {
        // 1 - [0, 1) keeps u away from zero
        let u = 1.0 - self.random_unit();
        -u.ln() / self.rate
    }

    pub fn pick_vehicle_type(&mut self) -> VehicleType {
        VehicleType::from_roll(self.random_roll())
    }

    /// Weighted draw from the route table, or the fastest path when the
    /// table is empty
    pub fn pick_route(&mut self) -> Option<Vec<String>> {
        let chosen = match &mut self.rng {
            Some(rng) => self.routes.choose_weighted(rng, |route| route.weight).ok(),
            None => self.routes.choose_weighted(&mut rand::rng(), |route| route.weight).ok(),
        };
        chosen
            .map(|route| route.path.clone())
            .or_else(|| self.fallback.clone())
    }

    /// A fresh vehicle at the entry, entering at `now`
    pub fn spawn_vehicle(&mut self, now: f64) -> Option<Vehicle> {
        let vehicle_type = self.pick_vehicle_type();
        let path = self.pick_route()?;
        self.generated += 1;
        Some(Vehicle::new(
            format!("{}_{}", self.id, self.generated),
            vehicle_type,
            path,
            now,
        ))
    }
}

/// Runs an entry node until shutdown, STOP or the vehicle limit
pub fn run(settings: EntrySettings, topology: Arc<RoadTopology>, shutdown: Shutdown) -> Result<()> {
    let mut generator =
        EntryGenerator::new(&settings.id, settings.rate, settings.routes.clone(), &topology)?;
    if let Some(seed) = settings.seed {
        generator = generator.with_seed(seed);
    }

    let link = MessageLink::connect(&settings.coordinator, settings.link)
        .with_context(|| format!("{}: coordinator unreachable", settings.id))?
        .with_clock(Arc::new(LogicalClock::new()));
    let link = Arc::new(link);
    link.send(&Message::Register(RegisterRequest {
        node_id: settings.id.clone(),
        role: NodeRole::Entry,
    }))
    .context("failed to register")?;

    let listener = {
        let link = Arc::clone(&link);
        let shutdown = shutdown.clone();
        let id = settings.id.clone();
        thread::Builder::new()
            .name(format!("{}-coordinator", id))
            .spawn(move || {
                while let Some(frame) = link.receive() {
                    match frame.message {
                        Message::Stop => {
                            info!("{}: STOP received", id);
                            break;
                        }
                        Message::Error(text) => warn!("{}: coordinator reported: {}", id, text),
                        _ => {}
                    }
                }
                shutdown.trigger();
            })?
    };

    let (trips_tx, trips_rx) = forwarder::channel();
    let forwarder = {
        let link = Arc::clone(&link);
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name(format!("{}-forwarder", settings.id))
            .spawn(move || {
                forwarder::run(trips_rx, shutdown, |trip| {
                    let Some(transfer) = VehicleTransfer::hop(&trip.vehicle, trip.arrival_time)
                    else {
                        return;
                    };
                    if let Err(e) = link.send(&Message::VehicleTransfer(transfer)) {
                        warn!("transfer of {} not sent: {}", trip.vehicle.id, e);
                    }
                })
            })?
    };

    let clock = SimClock::new(settings.time_scale);
    info!("{}: generating at {} vehicles/s", settings.id, settings.rate);
    while !shutdown.is_triggered() {
        if settings.limit.is_some_and(|limit| generator.generated() >= limit) {
            break;
        }
        let gap = generator.next_interval();
        if clock.pause(gap, &shutdown).is_none() {
            break;
        }
        let Some(vehicle) = generator.spawn_vehicle(clock.now()) else {
            warn!("{}: no route available", settings.id);
            continue;
        };

        let entry = EventLogEntry {
            kind: EventKind::VehicleEntry,
            sim_time: clock.now(),
            node: settings.id.clone(),
            vehicle_id: Some(vehicle.id.clone()),
            details: format!(
                "type={}, route={}",
                vehicle.vehicle_type.as_str(),
                vehicle.path.join(">")
            ),
        };
        if let Err(e) = link.send(&Message::EventLog(entry)) {
            warn!("{}: entry event not sent: {}", settings.id, e);
            break;
        }

        let (Some(first), Some(next)) = (vehicle.current_node(), vehicle.next_node()) else {
            continue;
        };
        let travel = topology.travel_time(first, next).unwrap_or_default()
            * vehicle.vehicle_type.time_factor();
        debug!("{}: {} heading to {}", settings.id, vehicle.id, next);
        let trip = InFlight {
            arrival_time: clock.now() + travel,
            due: Instant::now() + clock.to_real(travel),
            vehicle,
        };
        if trips_tx.send(trip).is_err() {
            break;
        }
    }

    // Let vehicles already on the road arrive
    drop(trips_tx);
    let _ = forwarder.join();
    shutdown.trigger();
    link.close();
    let _ = listener.join();
    info!("{}: generated {} vehicles", settings.id, generator.generated());
    Ok(())
}
