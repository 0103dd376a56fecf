use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use traffic_net::simulation::{
    ArbitrationError, Direction, EventKind, PedestrianController, PedestrianSettings,
    PhaseArbitrator, PhaseGate, PhaseGroup, Policy, PolicyCell, Shutdown, SignalEvent, SignalHost,
    SignalPhaseController, SignalSettings, SimClock, Vehicle, VehicleQueue, VehicleType,
};

/// Collects everything a controller emits
#[derive(Default)]
struct RecordingHost {
    events: Mutex<Vec<SignalEvent>>,
    forwarded: Mutex<Vec<Vehicle>>,
}

impl RecordingHost {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn forwarded_ids(&self) -> Vec<String> {
        self.forwarded.lock().unwrap().iter().map(|v| v.id.clone()).collect()
    }
}

impl SignalHost for RecordingHost {
    fn emit(&self, event: SignalEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn forward(&self, vehicle: Vehicle) {
        self.forwarded.lock().unwrap().push(vehicle);
    }
}

struct Fixture {
    queue: Arc<VehicleQueue>,
    arbitrator: Arc<PhaseArbitrator>,
    policy: Arc<PolicyCell>,
    clock: Arc<SimClock>,
    host: Arc<RecordingHost>,
    shutdown: Shutdown,
}

impl Fixture {
    /// Zero time scale: simulated durations take no real time
    fn new(policy: Option<Policy>) -> Self {
        let cell = match policy {
            Some(policy) => PolicyCell::with_policy(policy),
            None => PolicyCell::new(),
        };
        Self {
            queue: Arc::new(VehicleQueue::new()),
            arbitrator: Arc::new(PhaseArbitrator::new()),
            policy: Arc::new(cell),
            clock: Arc::new(SimClock::new(0.0)),
            host: Arc::new(RecordingHost::default()),
            shutdown: Shutdown::new(),
        }
    }

    fn controller(&self, direction: Direction) -> SignalPhaseController {
        SignalPhaseController::new(
            SignalSettings {
                intersection: "Cr1".to_string(),
                direction,
                crossing_time: 1.5,
            },
            Arc::clone(&self.queue),
            Arc::clone(&self.arbitrator) as Arc<dyn PhaseGate>,
            Arc::clone(&self.policy),
            Arc::clone(&self.clock),
            Arc::clone(&self.host) as Arc<dyn SignalHost>,
            self.shutdown.clone(),
        )
    }

    fn fill(&self, cars: usize) {
        for i in 0..cars {
            self.queue.enqueue(Vehicle::new(
                format!("v{}", i),
                VehicleType::Car,
                vec!["E1".into(), "Cr1".into(), "Cr2".into()],
                0.0,
            ));
        }
    }
}

/// Test the green extension with six queued cars under the default policy
#[test]
fn test_cycle_with_one_extension() {
    let fixture = Fixture::new(Some(Policy::default()));
    fixture.fill(6);
    let controller = fixture.controller(Direction::North);

    let report = controller
        .run_cycle()
        .expect("cycle should succeed")
        .expect("a vehicle was queued");

    assert_eq!(report.vehicles, 5);
    assert_eq!(report.extensions, 1);
    assert!((report.green_time - 7.5).abs() < 1e-9, "green was {}", report.green_time);
    assert!((report.cycle_time - 10.5).abs() < 1e-9, "cycle was {}", report.cycle_time);
    assert!(report.cycle_time <= Policy::default().cycle_bound());

    assert_eq!(fixture.queue.len(), 1);
    assert_eq!(fixture.host.forwarded_ids(), vec!["v0", "v1", "v2", "v3", "v4"]);
    assert_eq!(fixture.arbitrator.active_group("Cr1"), None, "phase not released");
}

/// Test the event sequence of one cycle
#[test]
fn test_cycle_event_order() {
    let fixture = Fixture::new(Some(Policy::default()));
    fixture.fill(1);
    fixture.controller(Direction::East).run_cycle().expect("cycle succeeds");

    assert_eq!(
        fixture.host.kinds(),
        vec![
            EventKind::GreenStart,
            EventKind::Yellow,
            EventKind::Clearance,
            EventKind::GreenEnd
        ]
    );
    let events = fixture.host.events.lock().unwrap();
    assert!(events.windows(2).all(|pair| pair[0].sim_time <= pair[1].sim_time));
    assert!(events.iter().all(|e| e.intersection == "Cr1"));
    // One car (1.5) plus yellow and clearance
    assert!((events[3].sim_time - 4.5).abs() < 1e-9);
}

/// Test that extensions stop at max_extensions even with a long queue
#[test]
fn test_extensions_capped() {
    let fixture = Fixture::new(Some(Policy::default()));
    fixture.fill(10);
    let report = fixture
        .controller(Direction::South)
        .run_cycle()
        .expect("cycle succeeds")
        .expect("vehicles queued");

    assert_eq!(report.extensions, 3);
    assert_eq!(report.vehicles, 7);
    assert!((report.green_time - 10.5).abs() < 1e-9);
    assert!(report.cycle_time <= Policy::default().cycle_bound());
    assert_eq!(fixture.queue.len(), 3);
}

/// Test that a queue depth equal to the threshold still extends
#[test]
fn test_threshold_tie_extends() {
    let policy = Policy {
        min_green: 1.0,
        queue_threshold: 2,
        ..Policy::default()
    };
    let fixture = Fixture::new(Some(policy));
    fixture.fill(3);
    let report = fixture
        .controller(Direction::West)
        .run_cycle()
        .expect("cycle succeeds")
        .expect("vehicles queued");

    // First car alone satisfies min green, leaving exactly two queued
    assert_eq!(report.extensions, 1);
    assert_eq!(report.vehicles, 2);
}

/// Test that slower vehicle types take proportionally longer to cross
#[test]
fn test_vehicle_type_scales_crossing() {
    let fixture = Fixture::new(Some(Policy {
        min_green: 0.0,
        ..Policy::default()
    }));
    fixture.queue.enqueue(Vehicle::new("truck", VehicleType::Truck, vec!["Cr1".into()], 0.0));
    let report = fixture
        .controller(Direction::North)
        .run_cycle()
        .expect("cycle succeeds")
        .expect("vehicle queued");
    assert!((report.green_time - 3.0).abs() < 1e-9);
}

/// Test that a controller without a policy leaves its queue untouched
#[test]
fn test_no_policy_means_no_service() {
    let fixture = Fixture::new(None);
    fixture.fill(2);
    let controller = fixture.controller(Direction::North);

    let worker = thread::spawn(move || controller.run_cycle().map(|report| report.is_none()));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(fixture.queue.len(), 2);
    assert!(fixture.host.kinds().is_empty());

    fixture.shutdown.trigger();
    let stopped = worker.join().expect("controller panicked").expect("no error");
    assert!(stopped);
    assert_eq!(fixture.queue.len(), 2);
}

/// Test that a policy delivered while the controller idles governs its next cycle
#[test]
fn test_policy_update_while_idle() {
    let mut fixture = Fixture::new(Some(Policy {
        min_green: 1.0,
        max_green: 1.0,
        ..Policy::default()
    }));
    // Real crossing time so the queue fills while the first car crosses
    fixture.clock = Arc::new(SimClock::new(0.02));
    let controller = fixture.controller(Direction::North);
    let worker = thread::spawn(move || controller.run_cycle());

    // Let the controller block on its empty queue
    thread::sleep(Duration::from_millis(100));
    fixture.policy.set(Policy {
        min_green: 5.0,
        max_green: 20.0,
        ..Policy::default()
    });
    fixture.fill(6);

    let report = worker
        .join()
        .expect("controller panicked")
        .expect("cycle succeeds")
        .expect("vehicles queued");
    assert_eq!(report.vehicles, 5, "cycle ran under the old policy");
    assert_eq!(report.extensions, 1);
    assert_eq!(fixture.queue.len(), 1);
}

/// Grants nothing on the first request, then defers to an arbitrator
struct FlakyGate {
    inner: PhaseArbitrator,
    attempts: AtomicUsize,
}

impl PhaseGate for FlakyGate {
    fn acquire(
        &self,
        intersection: &str,
        direction: Direction,
        shutdown: &Shutdown,
    ) -> Result<(), ArbitrationError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ArbitrationError::Unavailable("coordinator link down".to_string()));
        }
        self.inner.acquire(intersection, direction, shutdown)
    }

    fn release(&self, intersection: &str, direction: Direction) {
        self.inner.release(intersection, direction);
    }

    fn active_group(&self, intersection: &str) -> Option<PhaseGroup> {
        PhaseGate::active_group(&self.inner, intersection)
    }
}

/// Test that a failed cycle keeps the controller running with its queue intact
#[test]
fn test_controller_survives_failed_cycle() {
    let fixture = Fixture::new(Some(Policy::default()));
    fixture.fill(3);
    let gate = Arc::new(FlakyGate {
        inner: PhaseArbitrator::new(),
        attempts: AtomicUsize::new(0),
    });
    let controller = SignalPhaseController::new(
        SignalSettings {
            intersection: "Cr1".to_string(),
            direction: Direction::South,
            crossing_time: 1.5,
        },
        Arc::clone(&fixture.queue),
        Arc::clone(&gate) as Arc<dyn PhaseGate>,
        Arc::clone(&fixture.policy),
        Arc::clone(&fixture.clock),
        Arc::clone(&fixture.host) as Arc<dyn SignalHost>,
        fixture.shutdown.clone(),
    );
    let worker = thread::spawn(move || controller.run());

    let deadline = Instant::now() + Duration::from_secs(5);
    while fixture.host.forwarded.lock().unwrap().len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    fixture.shutdown.trigger();
    fixture.queue.close();
    worker.join().expect("controller panicked");

    assert!(gate.attempts.load(Ordering::SeqCst) >= 2, "controller gave up after the failure");
    let mut served = fixture.host.forwarded_ids();
    served.sort();
    assert_eq!(served, vec!["v0", "v1", "v2"], "a vehicle was lost or duplicated");
    assert!(fixture.queue.is_empty());
    assert_eq!(gate.active_group("Cr1"), None);
}

/// Test that conflicting controllers never overlap their green phases
#[test]
fn test_controllers_share_intersection() {
    let fixture = Fixture::new(Some(Policy {
        min_green: 1.0,
        max_green: 3.0,
        ..Policy::default()
    }));
    let ew_queue = Arc::new(VehicleQueue::new());
    for i in 0..4 {
        let north = Vehicle::new(format!("n{}", i), VehicleType::Car, vec!["Cr1".into()], 0.0);
        let east = Vehicle::new(format!("e{}", i), VehicleType::Car, vec!["Cr1".into()], 0.0);
        fixture.queue.enqueue(north);
        ew_queue.enqueue(east);
    }

    let north = fixture.controller(Direction::North);
    let east = SignalPhaseController::new(
        SignalSettings {
            intersection: "Cr1".to_string(),
            direction: Direction::East,
            crossing_time: 1.5,
        },
        Arc::clone(&ew_queue),
        Arc::clone(&fixture.arbitrator) as Arc<dyn PhaseGate>,
        Arc::clone(&fixture.policy),
        Arc::new(SimClock::new(0.0)),
        Arc::clone(&fixture.host) as Arc<dyn SignalHost>,
        fixture.shutdown.clone(),
    );

    let handles = vec![thread::spawn(move || north.run()), thread::spawn(move || east.run())];
    let deadline = Instant::now() + Duration::from_secs(5);
    while fixture.host.forwarded.lock().unwrap().len() < 8 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    fixture.shutdown.trigger();
    fixture.queue.close();
    ew_queue.close();
    for handle in handles {
        handle.join().expect("controller panicked");
    }

    assert_eq!(fixture.host.forwarded.lock().unwrap().len(), 8);
    // Clearance is emitted while the phase is still held, so every
    // GREEN_START must be closed by a CLEARANCE before the next one
    let mut open = false;
    for kind in fixture.host.kinds() {
        match kind {
            EventKind::GreenStart => {
                assert!(!open, "two green phases overlapped");
                open = true;
            }
            EventKind::Clearance => open = false,
            _ => {}
        }
    }
}

/// Test one pedestrian crossing on a free intersection
#[test]
fn test_pedestrian_crossing() {
    let fixture = Fixture::new(Some(Policy::default()));
    let controller = PedestrianController::new(
        PedestrianSettings {
            intersection: "Cr1".to_string(),
            cycle_interval: Duration::from_millis(10),
            green_time: 4.0,
            cooldown: Duration::ZERO,
        },
        Arc::clone(&fixture.arbitrator) as Arc<dyn PhaseGate>,
        Arc::clone(&fixture.policy),
        Arc::clone(&fixture.clock),
        Arc::clone(&fixture.host) as Arc<dyn SignalHost>,
        fixture.shutdown.clone(),
    );

    assert!(controller.run_crossing());
    assert_eq!(
        fixture.host.kinds(),
        vec![EventKind::PedestrianGreen, EventKind::PedestrianRed]
    );
    assert!((fixture.clock.now() - 4.0).abs() < 1e-9);
    assert_eq!(fixture.arbitrator.active_group("Cr1"), None);
}

/// Test that the pedestrian phase waits for a vehicle phase to end
#[test]
fn test_pedestrian_waits_for_vehicles() {
    let fixture = Fixture::new(Some(Policy::default()));
    fixture
        .arbitrator
        .request_green("Cr1", Direction::North)
        .expect("NS granted");

    let controller = PedestrianController::new(
        PedestrianSettings {
            intersection: "Cr1".to_string(),
            cycle_interval: Duration::from_millis(10),
            green_time: 4.0,
            cooldown: Duration::ZERO,
        },
        Arc::clone(&fixture.arbitrator) as Arc<dyn PhaseGate>,
        Arc::clone(&fixture.policy),
        Arc::clone(&fixture.clock),
        Arc::clone(&fixture.host) as Arc<dyn SignalHost>,
        fixture.shutdown.clone(),
    );
    let worker = thread::spawn(move || controller.run_crossing());

    thread::sleep(Duration::from_millis(200));
    assert!(fixture.host.kinds().is_empty(), "pedestrians crossed during NS green");
    assert_eq!(fixture.arbitrator.active_group("Cr1"), Some(PhaseGroup::NorthSouth));

    fixture.arbitrator.release_green("Cr1", Direction::North);
    assert!(worker.join().expect("pedestrian controller panicked"));
    assert_eq!(
        fixture.host.kinds(),
        vec![EventKind::PedestrianGreen, EventKind::PedestrianRed]
    );
}
