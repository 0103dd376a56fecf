//! Distributed traffic signal network
//!
//! A coordinator, intersection processes and traffic generators exchange
//! simulation events over a newline-delimited JSON protocol. The
//! [`simulation`] module holds the process-local engine (clocks, queues,
//! phase arbitration and signal controllers); the other modules wire it to
//! the network.

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod entry;
pub mod intersection;
pub mod net;
pub mod simulation;
pub mod sink;
