//! Core types for the traffic simulation
//!
//! Directions, phase groups, vehicles and the light colours reported in
//! telemetry. These are shared by every node in the network.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Approach direction at an intersection.
///
/// The four compass approaches each own a vehicle queue and a signal
/// controller; `Pedestrian` names the crossing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "N")]
    North,
    #[serde(rename = "S")]
    South,
    #[serde(rename = "E")]
    East,
    #[serde(rename = "W")]
    West,
    #[serde(rename = "PEDESTRIAN")]
    Pedestrian,
}

impl Direction {
    /// The vehicle approaches, in controller start order
    pub const VEHICLE: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    /// The phase group this direction belongs to
    pub fn group(self) -> PhaseGroup {
        match self {
            Direction::North | Direction::South => PhaseGroup::NorthSouth,
            Direction::East | Direction::West => PhaseGroup::EastWest,
            Direction::Pedestrian => PhaseGroup::Pedestrian,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::North => "N",
            Direction::South => "S",
            Direction::East => "E",
            Direction::West => "W",
            Direction::Pedestrian => "PEDESTRIAN",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown direction {0:?}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N" => Ok(Direction::North),
            "S" => Ok(Direction::South),
            "E" => Ok(Direction::East),
            "W" => Ok(Direction::West),
            "PEDESTRIAN" => Ok(Direction::Pedestrian),
            other => Err(UnknownDirection(other.to_string())),
        }
    }
}

/// Mutually exclusive phase classes at one intersection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseGroup {
    #[serde(rename = "NS")]
    NorthSouth,
    #[serde(rename = "EW")]
    EastWest,
    #[serde(rename = "PEDESTRIAN")]
    Pedestrian,
}

impl fmt::Display for PhaseGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhaseGroup::NorthSouth => "NS",
            PhaseGroup::EastWest => "EW",
            PhaseGroup::Pedestrian => "PEDESTRIAN",
        })
    }
}

/// Type of vehicle in the simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    /// Twice as fast as a car
    Motorcycle,
    /// Reference speed
    Car,
    /// Half the speed of a car
    Truck,
}

impl VehicleType {
    pub const ALL: [VehicleType; 3] =
        [VehicleType::Motorcycle, VehicleType::Car, VehicleType::Truck];

    /// Multiplier applied to every base duration (crossing and road travel)
    pub fn time_factor(self) -> f64 {
        match self {
            VehicleType::Motorcycle => 0.5,
            VehicleType::Car => 1.0,
            VehicleType::Truck => 2.0,
        }
    }

    /// Share of generated traffic, in percent
    pub fn share_percent(self) -> u32 {
        match self {
            VehicleType::Motorcycle => 25,
            VehicleType::Car => 60,
            VehicleType::Truck => 15,
        }
    }

    /// Maps a roll in `0..100` onto the cumulative traffic shares
    pub fn from_roll(roll: u32) -> Self {
        let mut cumulative = 0;
        for vehicle_type in Self::ALL {
            cumulative += vehicle_type.share_percent();
            if roll < cumulative {
                return vehicle_type;
            }
        }
        VehicleType::Car
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Motorcycle => "MOTORCYCLE",
            VehicleType::Car => "CAR",
            VehicleType::Truck => "TRUCK",
        }
    }
}

/// Light state reported by a crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LightColor {
    Red,
    Yellow,
    Green,
    Pedestrian,
}

/// A vehicle travelling through the network.
///
/// Owned by exactly one process at a time; ownership moves with the
/// transfer message.
#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: String,
    pub vehicle_type: VehicleType,
    /// Full route, entry first and exit last
    pub path: Vec<String>,
    /// Index of the node currently holding the vehicle
    pub path_index: usize,
    /// Simulated time at which the vehicle entered the network
    pub entered_at: f64,
    /// Simulated time at which the vehicle left the network
    pub exited_at: Option<f64>,
}

impl Vehicle {
    pub fn new(
        id: impl Into<String>,
        vehicle_type: VehicleType,
        path: Vec<String>,
        entered_at: f64,
    ) -> Self {
        Self {
            id: id.into(),
            vehicle_type,
            path,
            path_index: 0,
            entered_at,
            exited_at: None,
        }
    }

    pub fn current_node(&self) -> Option<&str> {
        self.path.get(self.path_index).map(String::as_str)
    }

    pub fn next_node(&self) -> Option<&str> {
        self.path.get(self.path_index + 1).map(String::as_str)
    }

    /// Time spent in the network, once the vehicle has exited
    pub fn dwelling_time(&self) -> Option<f64> {
        self.exited_at.map(|exit| exit - self.entered_at)
    }
}

/// Default coordinator TCP port
pub const DEFAULT_COORDINATOR_PORT: u16 = 6000;

/// Node id the dashboard hub registers under
pub const DASHBOARD_NODE_ID: &str = "DashboardHub";

/// Node id the statistics sink registers under
pub const SINK_NODE_ID: &str = "SINK";
