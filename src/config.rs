//! Simulation configuration
//!
//! Every field has a default matching the standard five-crossing network,
//! so an empty JSON object is a complete configuration. The command line
//! overrides individual values after loading.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::link::LinkSettings;
use crate::simulation::clock::DEFAULT_TIME_SCALE;
use crate::simulation::policy::Policy;
use crate::simulation::road_network::{NodeKind, NodeSpec, RoadSpec, RoadTopology};
use crate::simulation::types::{Direction, DEFAULT_COORDINATOR_PORT};

/// Where intersection controllers acquire their phase group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseAuthority {
    /// The coordinator's arbitrator, over the node's link
    Coordinator,
    /// An arbitrator inside the intersection process
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    /// Append-only event log
    pub event_log: PathBuf,
    /// Ordered event list written as JSON when the coordinator stops
    pub export: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_COORDINATOR_PORT,
            event_log: PathBuf::from("logs/events.jsonl"),
            export: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PedestrianConfig {
    /// Simulated seconds of pedestrian green
    pub green_time: f64,
    pub cycle_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for PedestrianConfig {
    fn default() -> Self {
        Self {
            green_time: 4.0,
            cycle_interval_ms: 12_000,
            cooldown_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingConfig {
    pub id: String,
    /// Port for direct vehicle arrivals
    pub port: u16,
    #[serde(default)]
    pub pedestrian: Option<PedestrianConfig>,
}

/// One weighted route of an entry's route table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: Vec<String>,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryConfig {
    pub id: String,
    /// Vehicles per simulated second
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_rate() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub nodes: Vec<NodeSpec>,
    pub roads: Vec<RoadSpec>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        default_topology(3.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub coordinator: CoordinatorConfig,
    /// Real seconds per simulated second
    pub time_scale: f64,
    /// Simulated seconds for a car to clear an intersection
    pub crossing_time: f64,
    pub telemetry_interval_ms: u64,
    /// How often the sink publishes traffic statistics
    pub stats_interval_ms: u64,
    pub phase_authority: PhaseAuthority,
    pub link: LinkSettings,
    pub policy: Policy,
    pub crossings: Vec<CrossingConfig>,
    pub entries: Vec<EntryConfig>,
    pub topology: TopologyConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        let crossings = (1..=5)
            .map(|n| CrossingConfig {
                id: format!("Cr{}", n),
                port: DEFAULT_COORDINATOR_PORT + n,
                pedestrian: (n == 4).then(PedestrianConfig::default),
            })
            .collect();
        Self {
            coordinator: CoordinatorConfig::default(),
            time_scale: DEFAULT_TIME_SCALE,
            crossing_time: 1.5,
            telemetry_interval_ms: 2000,
            stats_interval_ms: 3000,
            phase_authority: PhaseAuthority::Coordinator,
            link: LinkSettings::default(),
            policy: Policy::default(),
            crossings,
            entries: default_entries(),
            topology: TopologyConfig::default(),
        }
    }
}

impl SimConfig {
    /// Reads a JSON configuration; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: SimConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, the defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.time_scale >= 0.0, "time_scale must not be negative");
        ensure!(self.crossing_time >= 0.0, "crossing_time must not be negative");
        ensure!(self.telemetry_interval_ms > 0, "telemetry_interval_ms must be positive");
        ensure!(self.stats_interval_ms > 0, "stats_interval_ms must be positive");
        self.policy.validate().context("invalid policy")?;

        let topology = self.topology()?;
        let mut seen = HashSet::new();
        for crossing in &self.crossings {
            ensure!(seen.insert(&crossing.id), "duplicate crossing {}", crossing.id);
            if topology.kind(&crossing.id) != Some(NodeKind::Crossing) {
                bail!("crossing {} is not a crossing of the topology", crossing.id);
            }
        }
        for entry in &self.entries {
            ensure!(entry.rate > 0.0, "entry {} needs a positive rate", entry.id);
            for route in &entry.routes {
                topology
                    .validate_path(&route.path)
                    .with_context(|| format!("invalid route for entry {}", entry.id))?;
                ensure!(
                    route.path.first() == Some(&entry.id),
                    "route {:?} does not start at {}",
                    route.path,
                    entry.id
                );
            }
        }
        Ok(())
    }

    pub fn topology(&self) -> Result<RoadTopology> {
        RoadTopology::from_specs(&self.topology.nodes, &self.topology.roads)
            .context("invalid topology")
    }

    pub fn crossing(&self, id: &str) -> Option<&CrossingConfig> {
        self.crossings.iter().find(|crossing| crossing.id == id)
    }

    pub fn entry(&self, id: &str) -> Option<&EntryConfig> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

/// The standard network: a 2x3 grid of crossings fed by three entries and
/// drained by one exit
pub fn default_topology(road_time: f64) -> TopologyConfig {
    let mut nodes = Vec::new();
    for id in ["E1", "E2", "E3"] {
        nodes.push(node(id, NodeKind::Entry));
    }
    for id in ["Cr1", "Cr2", "Cr3", "Cr4", "Cr5"] {
        nodes.push(node(id, NodeKind::Crossing));
    }
    nodes.push(node("S", NodeKind::Exit));

    use Direction::*;
    let roads = [
        ("Cr1", "Cr2", South),
        ("Cr2", "Cr1", North),
        ("Cr2", "Cr3", South),
        ("Cr3", "Cr2", North),
        ("Cr1", "Cr4", East),
        ("Cr4", "Cr1", West),
        ("Cr4", "Cr5", South),
        ("Cr5", "Cr4", North),
        ("Cr2", "Cr5", East),
        ("Cr5", "Cr2", West),
        ("E1", "Cr1", South),
        ("E2", "Cr2", East),
        ("E3", "Cr3", North),
        ("Cr5", "S", South),
        ("Cr3", "S", East),
    ]
    .into_iter()
    .map(|(from, to, approach)| RoadSpec {
        from: from.to_string(),
        to: to.to_string(),
        travel_time: road_time,
        approach,
    })
    .collect();

    TopologyConfig { nodes, roads }
}

fn node(id: &str, kind: NodeKind) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        kind,
    }
}

fn default_entries() -> Vec<EntryConfig> {
    let table: [(&str, [(&[&str], u32); 3]); 3] = [
        (
            "E1",
            [
                (&["E1", "Cr1", "Cr4", "Cr5", "S"], 34),
                (&["E1", "Cr1", "Cr2", "Cr5", "S"], 33),
                (&["E1", "Cr1", "Cr2", "Cr3", "S"], 33),
            ],
        ),
        (
            "E2",
            [
                (&["E2", "Cr2", "Cr5", "S"], 34),
                (&["E2", "Cr2", "Cr3", "S"], 33),
                (&["E2", "Cr2", "Cr1", "Cr4", "Cr5", "S"], 33),
            ],
        ),
        (
            "E3",
            [
                (&["E3", "Cr3", "S"], 34),
                (&["E3", "Cr3", "Cr2", "Cr5", "S"], 33),
                (&["E3", "Cr3", "Cr2", "Cr1", "Cr4", "Cr5", "S"], 33),
            ],
        ),
    ];

    table
        .iter()
        .map(|(id, routes)| EntryConfig {
            id: id.to_string(),
            rate: default_rate(),
            routes: routes
                .iter()
                .map(|(path, weight)| RouteConfig {
                    path: path.iter().map(|node| node.to_string()).collect(),
                    weight: *weight,
                })
                .collect(),
        })
        .collect()
}
