use traffic_net::net::protocol::EventLogEntry;
use traffic_net::simulation::{EventKind, VehicleType};
use traffic_net::sink::SinkTally;

fn event(kind: EventKind, vehicle: &str, sim_time: f64, details: &str) -> EventLogEntry {
    EventLogEntry {
        kind,
        sim_time,
        node: "Cr3".to_string(),
        vehicle_id: Some(vehicle.to_string()),
        details: details.to_string(),
    }
}

/// Test that an exit reporting its dwelling time is counted under its type
#[test]
fn test_exit_counts_reported_dwelling() {
    let mut tally = SinkTally::new();
    let entry = event(EventKind::VehicleEntry, "E1_1", 1.0, "type=TRUCK, route=E1>Cr1>S");
    assert!(!tally.observe(&entry));
    assert_eq!(tally.in_network(), 1);
    let exit = event(EventKind::VehicleExit, "E1_1", 21.0, "exit=S, type=TRUCK, dwelling=20.00");
    assert!(tally.observe(&exit));

    let stats = tally.summary();
    assert_eq!(stats.total_vehicles, 1);
    assert_eq!(stats.count_by_type[&VehicleType::Truck], 1);
    assert_eq!(stats.avg_dwelling_by_type[&VehicleType::Truck], 20.0);
    assert_eq!(tally.in_network(), 0);
}

/// Test that a bare exit falls back to the recorded entry
#[test]
fn test_exit_without_details_uses_entry() {
    let mut tally = SinkTally::new();
    tally.observe(&event(EventKind::VehicleEntry, "E2_1", 4.0, "type=MOTORCYCLE, route=E2>Cr2>S"));
    assert!(tally.observe(&event(EventKind::VehicleExit, "E2_1", 10.5, "exit=S")));

    let stats = tally.summary();
    assert_eq!(stats.count_by_type[&VehicleType::Motorcycle], 1);
    assert_eq!(stats.min_dwelling_by_type[&VehicleType::Motorcycle], 6.5);
}

/// Test min, max and average across several exits of one type
#[test]
fn test_dwelling_aggregates() {
    let mut tally = SinkTally::new();
    for (id, dwelling) in [("a", 10.0), ("b", 30.0), ("c", 20.0)] {
        tally.observe(&event(
            EventKind::VehicleExit,
            id,
            dwelling,
            &format!("exit=S, type=CAR, dwelling={:.2}", dwelling),
        ));
    }
    let stats = tally.summary();
    assert_eq!(stats.total_vehicles, 3);
    assert_eq!(stats.min_dwelling_by_type[&VehicleType::Car], 10.0);
    assert_eq!(stats.max_dwelling_by_type[&VehicleType::Car], 30.0);
    assert!((stats.avg_dwelling_by_type[&VehicleType::Car] - 20.0).abs() < 1e-9);
}

/// Test that exits of unknown type, repeated exits and other events are not counted
#[test]
fn test_ignored_events() {
    let mut tally = SinkTally::new();
    assert!(!tally.observe(&event(EventKind::VehicleExit, "ghost", 5.0, "exit=S")));
    assert!(!tally.observe(&event(EventKind::GreenStart, "x", 1.0, "direction=N")));

    tally.observe(&event(EventKind::VehicleExit, "E3_1", 5.0, "exit=S, type=CAR, dwelling=5.00"));
    let repeat = event(EventKind::VehicleExit, "E3_1", 6.0, "exit=S, type=CAR, dwelling=6.00");
    assert!(!tally.observe(&repeat));
    assert_eq!(tally.exited(), 1);
}

/// Test that every vehicle type appears in the summary, with zeros when unseen
#[test]
fn test_empty_summary_lists_every_type() {
    let stats = SinkTally::new().summary();
    assert_eq!(stats.total_vehicles, 0);
    for vehicle_type in VehicleType::ALL {
        assert_eq!(stats.count_by_type[&vehicle_type], 0);
        assert_eq!(stats.avg_dwelling_by_type[&vehicle_type], 0.0);
    }
}
