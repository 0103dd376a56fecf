//! Phase arbitration for the traffic simulation
//!
//! One monitor guards the active phase group of every intersection. Vehicle
//! groups (NS, EW) and the pedestrian phase share the same state and the same
//! wake channel, so the exclusion decision for an intersection is always made
//! in one place.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use thiserror::Error;

use super::types::{Direction, PhaseGroup, UnknownDirection};

/// How often a cancellable waiter re-tests its cancellation predicate
const CANCEL_RECHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbitrationError {
    #[error(transparent)]
    UnknownDirection(#[from] UnknownDirection),
    #[error("phase request for {intersection}/{direction} was cancelled")]
    Cancelled {
        intersection: String,
        direction: Direction,
    },
    #[error("arbitrator is shutting down")]
    ShutDown,
    /// The arbitrator could not be reached
    #[error("arbitrator unavailable: {0}")]
    Unavailable(String),
}

/// Whether `requested` may turn green while `active` holds the intersection
pub fn can_activate(active: Option<PhaseGroup>, requested: PhaseGroup) -> bool {
    match active {
        None => true,
        // Pedestrians block every vehicle group
        Some(PhaseGroup::Pedestrian) => requested == PhaseGroup::Pedestrian,
        // Pedestrians never preempt cars
        Some(_) if requested == PhaseGroup::Pedestrian => false,
        Some(active) => active == requested,
    }
}

/// The group holding an intersection and the directions sharing it
#[derive(Debug, Clone)]
struct ActivePhase {
    group: PhaseGroup,
    holders: BTreeSet<Direction>,
}

#[derive(Default)]
struct ArbiterState {
    phases: HashMap<String, ActivePhase>,
    shut_down: bool,
}

impl ArbiterState {
    fn active_group(&self, intersection: &str) -> Option<PhaseGroup> {
        self.phases.get(intersection).map(|phase| phase.group)
    }

    fn grant(&mut self, intersection: &str, direction: Direction) {
        self.phases
            .entry(intersection.to_string())
            .or_insert_with(|| ActivePhase {
                group: direction.group(),
                holders: BTreeSet::new(),
            })
            .holders
            .insert(direction);
    }
}

/// Global mutual-exclusion engine for signal phases.
///
/// No ordering is imposed among waiters: whichever waiter finds its
/// predicate true after a wake proceeds.
#[derive(Default)]
pub struct PhaseArbitrator {
    state: Mutex<ArbiterState>,
    changed: Condvar,
}

impl PhaseArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `direction`'s group may be active at `intersection`,
    /// then activates it.
    pub fn request_green(
        &self,
        intersection: &str,
        direction: Direction,
    ) -> Result<PhaseGroup, ArbitrationError> {
        self.request_green_until(intersection, direction, || false)
    }

    /// Parses a wire direction label before requesting. Unknown labels are
    /// rejected without touching any state.
    pub fn request_green_label(
        &self,
        intersection: &str,
        direction: &str,
    ) -> Result<PhaseGroup, ArbitrationError> {
        let direction: Direction = direction.parse()?;
        self.request_green(intersection, direction)
    }

    /// Like [`request_green`](Self::request_green) but gives up once
    /// `cancelled` returns true.
    pub fn request_green_until<F>(
        &self,
        intersection: &str,
        direction: Direction,
        cancelled: F,
    ) -> Result<PhaseGroup, ArbitrationError>
    where
        F: Fn() -> bool,
    {
        let requested = direction.group();
        let mut state = self.lock();
        loop {
            if state.shut_down {
                return Err(ArbitrationError::ShutDown);
            }
            if can_activate(state.active_group(intersection), requested) {
                state.grant(intersection, direction);
                debug!("{}: {} granted ({})", intersection, requested, direction);
                return Ok(requested);
            }
            if cancelled() {
                return Err(ArbitrationError::Cancelled {
                    intersection: intersection.to_string(),
                    direction,
                });
            }
            // Woken waiters re-test their own predicate; a broadcast is not a grant.
            state = self
                .changed
                .wait_timeout(state, CANCEL_RECHECK)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Non-blocking variant; returns whether the group was granted
    pub fn try_request_green(&self, intersection: &str, direction: Direction) -> bool {
        let mut state = self.lock();
        if state.shut_down || !can_activate(state.active_group(intersection), direction.group()) {
            return false;
        }
        state.grant(intersection, direction);
        true
    }

    pub fn request_pedestrian(&self, intersection: &str) -> Result<PhaseGroup, ArbitrationError> {
        self.request_green(intersection, Direction::Pedestrian)
    }

    /// Drops `direction`'s hold. The group is cleared, and every waiter
    /// woken, once no direction holds it. Releasing twice is a no-op.
    pub fn release_green(&self, intersection: &str, direction: Direction) {
        let mut state = self.lock();
        let Some(phase) = state.phases.get_mut(intersection) else {
            return;
        };
        if !phase.holders.remove(&direction) {
            return;
        }
        if phase.holders.is_empty() {
            state.phases.remove(intersection);
            debug!("{}: phase released by {}", intersection, direction);
            drop(state);
            self.changed.notify_all();
        }
    }

    pub fn release_pedestrian(&self, intersection: &str) {
        self.release_green(intersection, Direction::Pedestrian);
    }

    /// Clears the intersection regardless of holders
    pub fn clear(&self, intersection: &str) {
        let removed = self.lock().phases.remove(intersection).is_some();
        if removed {
            self.changed.notify_all();
        }
    }

    pub fn active_group(&self, intersection: &str) -> Option<PhaseGroup> {
        self.lock().active_group(intersection)
    }

    /// Directions currently holding the intersection's active group
    pub fn holders(&self, intersection: &str) -> Vec<Direction> {
        self.lock()
            .phases
            .get(intersection)
            .map(|phase| phase.holders.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fails every current and future request
    pub fn shutdown(&self) {
        self.lock().shut_down = true;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
