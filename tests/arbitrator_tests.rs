use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use traffic_net::simulation::{
    can_activate, ArbitrationError, Direction, PhaseArbitrator, PhaseGroup,
};

const BLOCKED: Duration = Duration::from_millis(200);
const GRANTED: Duration = Duration::from_secs(5);

/// Test the activation table for every active/requested pair
#[test]
fn test_can_activate_table() {
    use PhaseGroup::*;
    assert!(can_activate(None, NorthSouth));
    assert!(can_activate(None, EastWest));
    assert!(can_activate(None, Pedestrian));

    assert!(can_activate(Some(NorthSouth), NorthSouth));
    assert!(!can_activate(Some(NorthSouth), EastWest));
    assert!(!can_activate(Some(NorthSouth), Pedestrian));

    assert!(can_activate(Some(EastWest), EastWest));
    assert!(!can_activate(Some(EastWest), NorthSouth));
    assert!(!can_activate(Some(EastWest), Pedestrian));

    assert!(can_activate(Some(Pedestrian), Pedestrian));
    assert!(!can_activate(Some(Pedestrian), NorthSouth));
    assert!(!can_activate(Some(Pedestrian), EastWest));
}

/// Test that NS blocks while EW is active and proceeds once EW releases
#[test]
fn test_ns_waits_for_ew_release() {
    let arbitrator = Arc::new(PhaseArbitrator::new());
    arbitrator
        .request_green("Cr1", Direction::East)
        .expect("EW should be granted on a free intersection");

    let (tx, rx) = crossbeam::channel::bounded(1);
    let waiter = {
        let arbitrator = Arc::clone(&arbitrator);
        thread::spawn(move || {
            let group = arbitrator.request_green("Cr1", Direction::North);
            tx.send(group).expect("test receiver alive");
        })
    };

    assert_eq!(rx.recv_timeout(BLOCKED), Err(RecvTimeoutError::Timeout));
    assert_eq!(arbitrator.active_group("Cr1"), Some(PhaseGroup::EastWest));

    arbitrator.release_green("Cr1", Direction::East);
    let granted = rx.recv_timeout(GRANTED).expect("NS should be granted after release");
    assert_eq!(granted, Ok(PhaseGroup::NorthSouth));
    assert_eq!(arbitrator.active_group("Cr1"), Some(PhaseGroup::NorthSouth));
    waiter.join().expect("waiter panicked");
}

/// Test that pedestrians wait for NS, and cars wait for pedestrians
#[test]
fn test_pedestrian_exclusivity() {
    let arbitrator = Arc::new(PhaseArbitrator::new());
    arbitrator.request_green("Cr4", Direction::South).expect("NS granted");

    let (ped_tx, ped_rx) = crossbeam::channel::bounded(1);
    let pedestrian = {
        let arbitrator = Arc::clone(&arbitrator);
        thread::spawn(move || {
            ped_tx
                .send(arbitrator.request_pedestrian("Cr4"))
                .expect("test receiver alive");
        })
    };
    assert_eq!(ped_rx.recv_timeout(BLOCKED), Err(RecvTimeoutError::Timeout));

    arbitrator.release_green("Cr4", Direction::South);
    assert_eq!(
        ped_rx.recv_timeout(GRANTED).expect("pedestrian phase granted"),
        Ok(PhaseGroup::Pedestrian)
    );
    pedestrian.join().expect("pedestrian thread panicked");

    // Cars of both groups now wait for the pedestrian phase
    let (car_tx, car_rx) = crossbeam::channel::unbounded();
    let cars: Vec<_> = [Direction::North, Direction::West]
        .into_iter()
        .map(|direction| {
            let arbitrator = Arc::clone(&arbitrator);
            let car_tx = car_tx.clone();
            thread::spawn(move || {
                let group = arbitrator.request_green("Cr4", direction);
                car_tx.send(group.clone()).expect("test receiver alive");
                if let Ok(group) = group {
                    thread::sleep(Duration::from_millis(20));
                    arbitrator.release_green("Cr4", direction);
                    return Some(group);
                }
                None
            })
        })
        .collect();
    assert_eq!(car_rx.recv_timeout(BLOCKED), Err(RecvTimeoutError::Timeout));
    assert_eq!(arbitrator.active_group("Cr4"), Some(PhaseGroup::Pedestrian));

    arbitrator.release_pedestrian("Cr4");
    for car in cars {
        assert!(car.join().expect("car thread panicked").is_some());
    }
    assert_eq!(arbitrator.active_group("Cr4"), None);
}

/// Test that releasing twice, or releasing an idle intersection, is harmless
#[test]
fn test_release_is_idempotent() {
    let arbitrator = PhaseArbitrator::new();
    arbitrator.release_green("Cr1", Direction::North);
    assert_eq!(arbitrator.active_group("Cr1"), None);

    arbitrator.request_green("Cr1", Direction::North).expect("granted");
    arbitrator.release_green("Cr1", Direction::North);
    arbitrator.release_green("Cr1", Direction::North);
    assert_eq!(arbitrator.active_group("Cr1"), None);

    arbitrator.request_green("Cr1", Direction::East).expect("EW granted after release");
    assert_eq!(arbitrator.active_group("Cr1"), Some(PhaseGroup::EastWest));
}

/// Test that a group stays active until every holding direction released it
#[test]
fn test_group_held_until_last_holder_releases() {
    let arbitrator = PhaseArbitrator::new();
    arbitrator.request_green("Cr2", Direction::North).expect("N granted");
    arbitrator.request_green("Cr2", Direction::South).expect("S shares NS");
    assert_eq!(arbitrator.holders("Cr2"), vec![Direction::North, Direction::South]);

    arbitrator.release_green("Cr2", Direction::North);
    assert_eq!(arbitrator.active_group("Cr2"), Some(PhaseGroup::NorthSouth));
    assert!(!arbitrator.try_request_green("Cr2", Direction::East));

    arbitrator.release_green("Cr2", Direction::South);
    assert_eq!(arbitrator.active_group("Cr2"), None);
    assert!(arbitrator.try_request_green("Cr2", Direction::East));
}

/// Test that intersections are arbitrated independently
#[test]
fn test_intersections_are_independent() {
    let arbitrator = PhaseArbitrator::new();
    arbitrator.request_green("Cr1", Direction::North).expect("granted");
    arbitrator.request_green("Cr2", Direction::East).expect("granted");
    arbitrator.request_pedestrian("Cr3").expect("granted");
    assert_eq!(arbitrator.active_group("Cr1"), Some(PhaseGroup::NorthSouth));
    assert_eq!(arbitrator.active_group("Cr2"), Some(PhaseGroup::EastWest));
    assert_eq!(arbitrator.active_group("Cr3"), Some(PhaseGroup::Pedestrian));
}

/// Test that an unknown direction label is rejected without touching state
#[test]
fn test_unknown_direction_rejected() {
    let arbitrator = PhaseArbitrator::new();
    let result = arbitrator.request_green_label("Cr1", "NE");
    assert!(matches!(result, Err(ArbitrationError::UnknownDirection(_))));
    assert_eq!(arbitrator.active_group("Cr1"), None);

    assert_eq!(
        arbitrator.request_green_label("Cr1", "W"),
        Ok(PhaseGroup::EastWest)
    );
}

/// Test that a cancellable request gives up once cancelled
#[test]
fn test_cancelled_request_returns() {
    let arbitrator = Arc::new(PhaseArbitrator::new());
    arbitrator.request_green("Cr1", Direction::North).expect("granted");

    let cancelled = Arc::new(AtomicBool::new(false));
    let waiter = {
        let arbitrator = Arc::clone(&arbitrator);
        let cancelled = Arc::clone(&cancelled);
        thread::spawn(move || {
            arbitrator
                .request_green_until("Cr1", Direction::East, || cancelled.load(Ordering::SeqCst))
        })
    };
    thread::sleep(Duration::from_millis(100));
    cancelled.store(true, Ordering::SeqCst);

    let result = waiter.join().expect("waiter panicked");
    assert!(matches!(result, Err(ArbitrationError::Cancelled { .. })));
    assert_eq!(arbitrator.active_group("Cr1"), Some(PhaseGroup::NorthSouth));
}

/// Test that clear force-releases and shutdown fails pending requests
#[test]
fn test_clear_and_shutdown() {
    let arbitrator = Arc::new(PhaseArbitrator::new());
    arbitrator.request_green("Cr1", Direction::North).expect("granted");
    arbitrator.clear("Cr1");
    assert_eq!(arbitrator.active_group("Cr1"), None);
    assert!(arbitrator.holders("Cr1").is_empty());

    arbitrator.request_green("Cr1", Direction::North).expect("granted");
    let waiter = {
        let arbitrator = Arc::clone(&arbitrator);
        thread::spawn(move || arbitrator.request_green("Cr1", Direction::West))
    };
    thread::sleep(Duration::from_millis(100));
    arbitrator.shutdown();
    assert_eq!(waiter.join().expect("waiter panicked"), Err(ArbitrationError::ShutDown));
}

/// Test that conflicting groups are never active at the same time under contention
#[test]
fn test_mutual_exclusion_under_contention() {
    let arbitrator = Arc::new(PhaseArbitrator::new());
    let active: Arc<[AtomicUsize; 3]> =
        Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
    let violations = Arc::new(AtomicUsize::new(0));
    let slot = |group: PhaseGroup| match group {
        PhaseGroup::NorthSouth => 0,
        PhaseGroup::EastWest => 1,
        PhaseGroup::Pedestrian => 2,
    };

    let directions = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
        Direction::Pedestrian,
    ];
    let workers: Vec<_> = directions
        .into_iter()
        .map(|direction| {
            let arbitrator = Arc::clone(&arbitrator);
            let active = Arc::clone(&active);
            let violations = Arc::clone(&violations);
            thread::spawn(move || {
                let mine = slot(direction.group());
                for _ in 0..40 {
                    arbitrator.request_green("Cr1", direction).expect("granted");
                    active[mine].fetch_add(1, Ordering::SeqCst);
                    for (other, count) in active.iter().enumerate() {
                        if other != mine && count.load(Ordering::SeqCst) > 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    thread::sleep(Duration::from_micros(200));
                    active[mine].fetch_sub(1, Ordering::SeqCst);
                    arbitrator.release_green("Cr1", direction);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(arbitrator.active_group("Cr1"), None);
}
