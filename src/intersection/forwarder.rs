//! Road travel between nodes.
//!
//! A vehicle that clears a crossing is handed to the forwarder, which holds
//! it for the scaled travel time of the road ahead and then delivers it.
//! The controller that served the vehicle is free to serve the next one
//! while the first is still on the road.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use log::debug;

use crate::simulation::shutdown::Shutdown;
use crate::simulation::types::Vehicle;

/// Upper bound on one wait when nothing is in flight
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// A vehicle on the road towards its next node
#[derive(Debug, Clone)]
pub struct InFlight {
    pub vehicle: Vehicle,
    /// Simulated time at which the vehicle reaches the next node
    pub arrival_time: f64,
    /// Real instant at which it is delivered
    pub due: Instant,
}

struct Scheduled {
    seq: u64,
    trip: InFlight,
}

impl Scheduled {
    fn key(&self) -> (Instant, u64) {
        (self.trip.due, self.seq)
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: the heap pops the earliest due trip first
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Sending half used by controllers
pub type TripSender = Sender<InFlight>;

pub fn channel() -> (TripSender, Receiver<InFlight>) {
    crossbeam::channel::unbounded()
}

/// Delivers every trip once it is due, in due order, until shutdown or
/// until all senders are gone and nothing remains in flight.
pub fn run<F>(trips: Receiver<InFlight>, shutdown: Shutdown, mut deliver: F)
where
    F: FnMut(InFlight),
{
    let mut heap: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq = 0u64;
    let mut open = true;

    while open || !heap.is_empty() {
        let wait = heap
            .peek()
            .map(|next| next.trip.due.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        if open {
            crossbeam::select! {
                recv(trips) -> trip => match trip {
                    Ok(trip) => {
                        seq += 1;
                        heap.push(Scheduled { seq, trip });
                    }
                    Err(_) => open = false,
                },
                recv(shutdown.receiver()) -> _ => break,
                default(wait) => {}
            }
        } else if !shutdown.sleep(wait) {
            break;
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|next| next.trip.due <= now) {
            if let Some(next) = heap.pop() {
                deliver(next.trip);
            }
        }
    }

    if !heap.is_empty() {
        debug!("forwarder stopped with {} vehicles on the road", heap.len());
    }
}
