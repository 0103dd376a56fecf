use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use traffic_net::simulation::{Vehicle, VehicleQueue, VehicleType};

fn vehicle(id: &str, vehicle_type: VehicleType) -> Vehicle {
    Vehicle::new(id, vehicle_type, vec!["E1".into(), "Cr1".into(), "S".into()], 0.0)
}

/// Test that vehicles leave in arrival order
#[test]
fn test_queue_is_fifo() {
    let queue = VehicleQueue::new();
    for i in 0..5 {
        queue.enqueue(vehicle(&format!("v{}", i), VehicleType::Car));
    }
    assert_eq!(queue.len(), 5);
    for i in 0..5 {
        let next = queue.try_poll().expect("queue should not be empty");
        assert_eq!(next.id, format!("v{}", i));
    }
    assert!(queue.is_empty());
    assert!(queue.try_poll().is_none());
}

/// Test that concurrent producers lose, duplicate and reorder nothing
#[test]
fn test_concurrent_producers_single_consumer() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 1000;
    let queue = Arc::new(VehicleQueue::new());

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut received = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
            while received.len() < PRODUCERS * PER_PRODUCER {
                let vehicle = queue.poll().expect("queue closed early");
                received.push(vehicle.id);
            }
            received
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.enqueue(vehicle(&format!("p{}-{}", producer, seq), VehicleType::Car));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer panicked");
    }

    let received = consumer.join().expect("consumer panicked");
    assert_eq!(received.len(), PRODUCERS * PER_PRODUCER);

    let unique: HashSet<&String> = received.iter().collect();
    assert_eq!(unique.len(), received.len(), "a vehicle was delivered twice");

    // Each producer's vehicles come out in the order it enqueued them
    let mut last_seen: HashMap<usize, usize> = HashMap::new();
    for id in &received {
        let (producer, seq) = id[1..].split_once('-').expect("id format");
        let producer: usize = producer.parse().expect("producer index");
        let seq: usize = seq.parse().expect("sequence number");
        if let Some(previous) = last_seen.insert(producer, seq) {
            assert!(seq > previous, "producer {} reordered: {} after {}", producer, seq, previous);
        }
    }

    let stats = queue.stats();
    assert_eq!(stats.enqueued, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.processed, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.depth, 0);
}

/// Test that a blocked poll wakes up when a vehicle arrives
#[test]
fn test_poll_blocks_until_enqueue() {
    let queue = Arc::new(VehicleQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.poll())
    };
    thread::sleep(Duration::from_millis(100));
    queue.enqueue(vehicle("late", VehicleType::Truck));
    let polled = consumer.join().expect("consumer panicked");
    assert_eq!(polled.map(|v| v.id), Some("late".to_string()));
}

/// Test that closing the queue releases blocked consumers
#[test]
fn test_close_unblocks_poll() {
    let queue = Arc::new(VehicleQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.poll())
    };
    thread::sleep(Duration::from_millis(100));
    queue.close();
    assert!(consumer.join().expect("consumer panicked").is_none());
    assert!(queue.is_closed());
    assert!(queue.poll_timeout(Duration::from_millis(10)).is_none());
}

/// Test that poll_timeout gives up on an empty queue
#[test]
fn test_poll_timeout_expires() {
    let queue = VehicleQueue::new();
    assert!(queue.poll_timeout(Duration::from_millis(50)).is_none());
    queue.enqueue(vehicle("v1", VehicleType::Motorcycle));
    assert!(queue.poll_timeout(Duration::from_millis(50)).is_some());
}

/// Test depth statistics and the per-type counters
#[test]
fn test_queue_statistics() {
    let queue = VehicleQueue::new();
    assert_eq!(queue.average_depth(), 0.0);

    queue.enqueue(vehicle("a", VehicleType::Car));
    queue.enqueue(vehicle("b", VehicleType::Truck));
    queue.sample(); // depth 2
    queue.enqueue(vehicle("c", VehicleType::Car));
    queue.enqueue(vehicle("d", VehicleType::Motorcycle));
    queue.sample(); // depth 4
    queue.try_poll();
    queue.try_poll();
    queue.try_poll();
    queue.sample(); // depth 1

    let stats = queue.stats();
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.max_depth, 4);
    assert_eq!(stats.enqueued, 4);
    assert_eq!(stats.processed, 3);
    assert!((stats.average_depth - 7.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.by_type.get(&VehicleType::Car), Some(&2));
    assert_eq!(stats.by_type.get(&VehicleType::Truck), Some(&1));
    assert_eq!(stats.by_type.get(&VehicleType::Motorcycle), Some(&1));
}
