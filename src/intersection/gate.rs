//! Phase gate backed by the coordinator's arbitrator.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, warn};

use crate::net::link::MessageLink;
use crate::net::protocol::{Message, PhaseRequest};
use crate::simulation::arbitrator::ArbitrationError;
use crate::simulation::shutdown::Shutdown;
use crate::simulation::signal::PhaseGate;
use crate::simulation::types::{Direction, PhaseGroup};

/// Sends PHASE_REQUEST / PHASE_RELEASE over the node's link.
///
/// Grants arrive on the link's listener thread, which hands them over
/// through [`CoordinatorGate::granted`]. Each direction has its own
/// one-slot grant channel.
pub struct CoordinatorGate {
    link: Arc<MessageLink>,
    grants: HashMap<Direction, (Sender<()>, Receiver<()>)>,
    held: Mutex<BTreeSet<Direction>>,
}

impl CoordinatorGate {
    pub fn new(link: Arc<MessageLink>) -> Self {
        let grants = Direction::VEHICLE
            .into_iter()
            .chain([Direction::Pedestrian])
            .map(|direction| (direction, crossbeam::channel::bounded(1)))
            .collect();
        Self {
            link,
            grants,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    /// Delivers a PHASE_GRANTED to the controller waiting for it
    pub fn granted(&self, request: &PhaseRequest) {
        let direction: Direction = match request.direction.parse() {
            Ok(direction) => direction,
            Err(e) => {
                warn!("ignoring grant for {}: {}", request.crossing, e);
                return;
            }
        };
        if let Some((tx, _)) = self.grants.get(&direction) {
            if tx.try_send(()).is_err() {
                warn!("{}: duplicate grant for {}", request.crossing, direction);
            }
        }
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<Direction>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PhaseGate for CoordinatorGate {
    fn acquire(
        &self,
        intersection: &str,
        direction: Direction,
        shutdown: &Shutdown,
    ) -> Result<(), ArbitrationError> {
        let Some((_, grant)) = self.grants.get(&direction) else {
            return Err(ArbitrationError::Unavailable(format!(
                "no grant channel for {}",
                direction
            )));
        };
        self.link
            .send(&Message::PhaseRequest(PhaseRequest::new(intersection, direction)))
            .map_err(|e| ArbitrationError::Unavailable(e.to_string()))?;

        crossbeam::select! {
            recv(grant) -> result => match result {
                Ok(()) => {
                    self.held().insert(direction);
                    debug!("{}: {} granted by coordinator", intersection, direction);
                    Ok(())
                }
                Err(_) => Err(ArbitrationError::ShutDown),
            },
            recv(shutdown.receiver()) -> _ => Err(ArbitrationError::Cancelled {
                intersection: intersection.to_string(),
                direction,
            }),
        }
    }

    fn release(&self, intersection: &str, direction: Direction) {
        if !self.held().remove(&direction) {
            return;
        }
        if let Err(e) = self
            .link
            .send(&Message::PhaseRelease(PhaseRequest::new(intersection, direction)))
        {
            warn!("{}: release of {} not delivered: {}", intersection, direction, e);
        }
    }

    fn active_group(&self, _intersection: &str) -> Option<PhaseGroup> {
        self.held().iter().next().map(|direction| direction.group())
    }
}
