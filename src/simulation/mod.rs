//! Process-local simulation engine
//!
//! Everything here runs inside one process and knows nothing about sockets:
//! clocks, vehicle queues, the phase arbitrator, the signal and pedestrian
//! controllers and the road topology. Controllers talk to the outside world
//! only through the [`PhaseGate`] and [`SignalHost`] traits.

pub mod arbitrator;
pub mod clock;
pub mod pedestrian;
pub mod policy;
pub mod queue;
pub mod road_network;
pub mod shutdown;
pub mod signal;
pub mod types;

pub use arbitrator::{can_activate, ArbitrationError, PhaseArbitrator};
pub use clock::{LogicalClock, SimClock, DEFAULT_TIME_SCALE};
pub use pedestrian::{PedestrianController, PedestrianSettings};
pub use policy::{Policy, PolicyCell};
pub use queue::{QueueStats, VehicleQueue};
pub use road_network::{NodeKind, NodeSpec, RoadSpec, RoadTopology};
pub use shutdown::Shutdown;
pub use signal::{
    ControllerError, CycleReport, EventKind, PhaseGate, SignalEvent, SignalHost,
    SignalPhaseController, SignalSettings, SignalState,
};
pub use types::{Direction, LightColor, PhaseGroup, UnknownDirection, Vehicle, VehicleType};
