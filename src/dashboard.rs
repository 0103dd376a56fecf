//! Display client: subscribes to telemetry and logs what it receives.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::net::link::{LinkSettings, MessageLink};
use crate::net::protocol::{Message, NodeRole, RegisterRequest};
use crate::simulation::clock::LogicalClock;
use crate::simulation::shutdown::Shutdown;
use crate::simulation::types::DASHBOARD_NODE_ID;

/// Registers as a dashboard and logs telemetry until STOP, shutdown or
/// the coordinator going away. Returns how many updates were received.
pub fn run(coordinator: &str, settings: LinkSettings, shutdown: &Shutdown) -> Result<u64> {
    let link = MessageLink::connect(coordinator, settings)
        .context("coordinator unreachable")?
        .with_clock(Arc::new(LogicalClock::new()));
    link.send(&Message::Register(RegisterRequest {
        node_id: DASHBOARD_NODE_ID.to_string(),
        role: NodeRole::Dashboard,
    }))
    .context("failed to register")?;
    info!("dashboard subscribed at {}", coordinator);

    let mut updates = 0;
    loop {
        crossbeam::select! {
            recv(link.incoming()) -> line => {
                let Ok(line) = line else {
                    warn!("coordinator closed the connection");
                    break;
                };
                let Some(frame) = link.accept(&line) else {
                    continue;
                };
                match frame.message {
                    Message::Telemetry(t) => {
                        updates += 1;
                        info!(
                            "[{}] queue={} avg={:.2} light={:?} pedestrian={} green={}",
                            t.crossing,
                            t.queue,
                            t.avg,
                            t.light_state,
                            t.pedestrian,
                            t.direction_green.map(|d| d.as_str()).unwrap_or("-")
                        );
                    }
                    Message::TrafficStats(stats) => {
                        updates += 1;
                        info!("[stats] {} vehicles exited", stats.total_vehicles);
                        for (vehicle_type, count) in &stats.count_by_type {
                            info!(
                                "[stats] {}: {} vehicles, avg dwelling {:.2}s",
                                vehicle_type.as_str(),
                                count,
                                stats
                                    .avg_dwelling_by_type
                                    .get(vehicle_type)
                                    .copied()
                                    .unwrap_or_default()
                            );
                        }
                    }
                    Message::Stop => {
                        info!("STOP received");
                        break;
                    }
                    other => debug!("ignoring {}", other.kind()),
                }
            },
            recv(shutdown.receiver()) -> _ => break,
        }
    }
    link.close();
    Ok(updates)
}
