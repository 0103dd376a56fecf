//! Statistics sink: follows vehicles from entry to exit and publishes
//! dwelling-time summaries to the coordinator.
//!
//! The coordinator passes every VEHICLE_ENTRY and VEHICLE_EXIT record on to
//! the node registered as [`SINK_NODE_ID`]. The sink tallies them and sends
//! TRAFFIC_STATS on a timer, plus a final summary when STOP arrives.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::config::SimConfig;
use crate::net::link::{LinkSettings, MessageLink};
use crate::net::protocol::{EventLogEntry, Message, NodeRole, RegisterRequest, TrafficStats};
use crate::simulation::clock::LogicalClock;
use crate::simulation::shutdown::Shutdown;
use crate::simulation::signal::EventKind;
use crate::simulation::types::{VehicleType, SINK_NODE_ID};

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub coordinator: String,
    pub link: LinkSettings,
    /// Real time between two TRAFFIC_STATS reports
    pub interval: Duration,
}

impl SinkSettings {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            coordinator: config.coordinator.address(),
            link: config.link,
            interval: config.stats_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Dwelling {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
}

impl Dwelling {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total += value;
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Running dwelling-time tally, keyed by vehicle type
#[derive(Debug, Default)]
pub struct SinkTally {
    /// Vehicles seen entering and not yet exited: type and entry time
    entered: HashMap<String, (VehicleType, f64)>,
    exited: HashSet<String>,
    by_type: BTreeMap<VehicleType, Dwelling>,
}

impl SinkTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event record into the tally. Returns `true` when it
    /// completed a vehicle's trip.
    pub fn observe(&mut self, entry: &EventLogEntry) -> bool {
        let Some(vehicle_id) = entry.vehicle_id.as_deref() else {
            return false;
        };
        match entry.kind {
            EventKind::VehicleEntry => {
                match detail(&entry.details, "type").and_then(vehicle_type) {
                    Some(vehicle_type) => {
                        self.entered.insert(vehicle_id.to_string(), (vehicle_type, entry.sim_time));
                    }
                    None => warn!(
                        "entry of {} carries no vehicle type: {}",
                        vehicle_id, entry.details
                    ),
                }
                false
            }
            EventKind::VehicleExit => self.record_exit(vehicle_id, entry),
            _ => false,
        }
    }

    fn record_exit(&mut self, vehicle_id: &str, entry: &EventLogEntry) -> bool {
        if self.exited.contains(vehicle_id) {
            debug!("duplicate exit of {} ignored", vehicle_id);
            return false;
        }
        let entered = self.entered.remove(vehicle_id);
        let Some(vehicle_type) = detail(&entry.details, "type")
            .and_then(vehicle_type)
            .or(entered.map(|(vehicle_type, _)| vehicle_type))
        else {
            warn!("exit of {} with unknown vehicle type", vehicle_id);
            return false;
        };
        let dwelling = detail(&entry.details, "dwelling")
            .and_then(|value| value.parse::<f64>().ok())
            .or(entered.map(|(_, at)| entry.sim_time - at))
            .unwrap_or_default()
            .max(0.0);

        self.by_type.entry(vehicle_type).or_default().add(dwelling);
        self.exited.insert(vehicle_id.to_string());
        debug!("{} ({}) exited after {:.2}s", vehicle_id, vehicle_type.as_str(), dwelling);
        true
    }

    /// Vehicles that have completed their trip
    pub fn exited(&self) -> u64 {
        self.by_type.values().map(|d| d.count).sum()
    }

    /// Vehicles seen entering that have not exited yet
    pub fn in_network(&self) -> usize {
        self.entered.len()
    }

    /// Snapshot in wire form; types with no exits report zeros
    pub fn summary(&self) -> TrafficStats {
        let mut stats = TrafficStats {
            total_vehicles: self.exited(),
            ..TrafficStats::default()
        };
        for vehicle_type in VehicleType::ALL {
            let dwelling = self.by_type.get(&vehicle_type).copied().unwrap_or_default();
            stats.count_by_type.insert(vehicle_type, dwelling.count);
            stats.avg_dwelling_by_type.insert(vehicle_type, dwelling.average());
            stats.min_dwelling_by_type.insert(vehicle_type, dwelling.min);
            stats.max_dwelling_by_type.insert(vehicle_type, dwelling.max);
        }
        stats
    }
}

/// Value of `key` in a `key=value, key=value` details string
fn detail<'a>(details: &'a str, key: &str) -> Option<&'a str> {
    details.split(',').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == key).then(|| value.trim())
    })
}

fn vehicle_type(label: &str) -> Option<VehicleType> {
    VehicleType::ALL.into_iter().find(|t| t.as_str() == label)
}

/// Registers as the sink and publishes statistics until STOP, shutdown or
/// the coordinator going away. Returns the final tally.
pub fn run(settings: SinkSettings, shutdown: &Shutdown) -> Result<TrafficStats> {
    let link = MessageLink::connect(&settings.coordinator, settings.link)
        .context("coordinator unreachable")?
        .with_clock(Arc::new(LogicalClock::new()));
    link.send(&Message::Register(RegisterRequest {
        node_id: SINK_NODE_ID.to_string(),
        role: NodeRole::Sink,
    }))
    .context("failed to register")?;
    info!("sink registered at {}", settings.coordinator);

    let mut tally = SinkTally::new();
    let ticker = crossbeam::channel::tick(settings.interval);
    loop {
        crossbeam::select! {
            recv(link.incoming()) -> line => {
                let Ok(line) = line else {
                    warn!("coordinator closed the connection");
                    break;
                };
                let Some(frame) = link.accept(&line) else {
                    continue;
                };
                match frame.message {
                    Message::EventLog(entry) => {
                        tally.observe(&entry);
                    }
                    Message::Stop => {
                        info!("STOP received, sending final statistics");
                        if let Err(e) = link.send(&Message::TrafficStats(tally.summary())) {
                            debug!("final statistics not delivered: {}", e);
                        }
                        break;
                    }
                    other => debug!("ignoring {}", other.kind()),
                }
            },
            recv(ticker) -> _ => {
                if let Err(e) = link.send(&Message::TrafficStats(tally.summary())) {
                    warn!("statistics not sent: {}", e);
                    break;
                }
                debug!("{} exited, {} in the network", tally.exited(), tally.in_network());
            },
            recv(shutdown.receiver()) -> _ => break,
        }
    }
    link.close();
    Ok(tally.summary())
}
