use traffic_net::coordinator::{EventList, EventLogStore, LogRecord};
use traffic_net::simulation::EventKind;

fn record(timestamp: Option<u64>, kind: EventKind, details: &str) -> LogRecord {
    LogRecord {
        timestamp,
        kind,
        node: "Cr1".to_string(),
        vehicle_id: Some("E1_1".to_string()),
        sim_time: 2.5,
        details: details.to_string(),
    }
}

/// Test that appended records read back unchanged and in order
#[test]
fn test_store_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("logs").join("nested").join("events.jsonl");
    let store = EventLogStore::open(&path).expect("open creates parent directories");
    assert!(path.parent().is_some_and(|parent| parent.is_dir()));

    let written = vec![
        record(Some(1), EventKind::VehicleEntry, "type=CAR, route=E1>Cr1>Cr2>S"),
        record(Some(2), EventKind::VehicleArrival, "from=E1, to=Cr1"),
        LogRecord::raw("COORDINATOR", "STOP"),
    ];
    for r in &written {
        store.append(r).expect("append");
    }
    assert_eq!(store.read_all().expect("read back"), written);
}

/// Test that reopening a log appends instead of truncating
#[test]
fn test_store_reopen_appends() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    {
        let store = EventLogStore::open(&path).expect("open");
        store.append(&record(Some(1), EventKind::GreenStart, "")).expect("append");
    }
    let store = EventLogStore::open(&path).expect("reopen");
    store.append(&record(Some(2), EventKind::GreenEnd, "")).expect("append");

    let kinds: Vec<EventKind> = store.read_all().expect("read").iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![EventKind::GreenStart, EventKind::GreenEnd]);
}

/// Test the on-disk field names of a record
#[test]
fn test_store_line_format() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = EventLogStore::open(dir.path().join("events.jsonl")).expect("open");
    store.append(&record(Some(7), EventKind::VehicleExit, "exit=S")).expect("append");

    let text = std::fs::read_to_string(store.path()).expect("read file");
    let value: serde_json::Value = serde_json::from_str(text.trim()).expect("one JSON object");
    assert_eq!(value["timestamp"], 7);
    assert_eq!(value["type"], "VEHICLE_EXIT");
    assert_eq!(value["vehicleId"], "E1_1");
    assert_eq!(value["simTime"], 2.5);
}

/// Test that a corrupt line is reported with its line number
#[test]
fn test_store_reports_corrupt_line() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("events.jsonl");
    let store = EventLogStore::open(&path).expect("open");
    store.append(&record(Some(1), EventKind::Yellow, "")).expect("append");
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut file| std::io::Write::write_all(&mut file, b"{broken\n"))
        .expect("corrupt the file");

    let error = store.read_all().expect_err("corrupt line must fail");
    assert!(error.to_string().contains("line 2"), "unexpected error: {}", error);
}

/// Test that the list orders by timestamp with untimestamped records last
#[test]
fn test_event_list_ordering() {
    let list = EventList::new();
    assert!(list.is_empty());
    list.add(record(Some(3), EventKind::Yellow, "c"));
    list.add(record(None, EventKind::Raw, "raw-1"));
    list.add(record(Some(1), EventKind::GreenStart, "a"));
    list.add_raw("raw-2");
    list.add(record(Some(2), EventKind::VehicleTransfer, "b"));

    let details: Vec<String> = list.snapshot().into_iter().map(|r| r.details).collect();
    assert_eq!(details, vec!["a", "b", "c", "raw-1", "raw-2"]);
    assert_eq!(list.len(), 5);
}

/// Test that records sharing a timestamp keep their insertion order
#[test]
fn test_event_list_ties_keep_insertion_order() {
    let list = EventList::new();
    list.add(record(Some(5), EventKind::GreenStart, "first"));
    list.add(record(Some(5), EventKind::Yellow, "second"));
    list.add(record(Some(4), EventKind::Clearance, "earlier"));

    let details: Vec<String> = list.snapshot().into_iter().map(|r| r.details).collect();
    assert_eq!(details, vec!["earlier", "first", "second"]);
}

/// Test that the export is a JSON array in list order
#[test]
fn test_event_list_export() {
    let list = EventList::new();
    list.add(record(Some(2), EventKind::GreenEnd, "later"));
    list.add(record(Some(1), EventKind::GreenStart, "earlier"));

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("export").join("events.json");
    list.export(&path).expect("export");

    let text = std::fs::read_to_string(&path).expect("read export");
    let exported: Vec<LogRecord> = serde_json::from_str(&text).expect("JSON array of records");
    assert_eq!(exported, list.snapshot());
    assert_eq!(exported[0].details, "earlier");
}
