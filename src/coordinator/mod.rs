//! The coordinator: node registry, message routing, the global phase
//! arbitrator and the event log.

pub mod event_log;
pub mod registry;
pub mod router;
pub mod server;

pub use event_log::{EventList, EventLogError, EventLogStore, LogRecord};
pub use registry::{Connection, ConnectionId, DeliveryError, NodeRegistry};
pub use router::Router;
pub use server::Coordinator;
