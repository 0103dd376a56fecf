//! One-shot administrative requests against a running coordinator.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::net::link::{LinkSettings, MessageLink};
use crate::net::protocol::{EventLogEntry, Message};

/// How long to wait for the coordinator's answer
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Every logged record of one vehicle, ordered by simulated time
pub fn request_history(
    coordinator: &str,
    settings: LinkSettings,
    vehicle_id: &str,
) -> Result<Vec<EventLogEntry>> {
    let link = MessageLink::connect(coordinator, settings).context("coordinator unreachable")?;
    link.send(&Message::RequestHistory(vehicle_id.to_string()))?;

    let deadline = Instant::now() + REPLY_TIMEOUT;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match link.receive_timeout(remaining)? {
            Some(frame) => match frame.message {
                Message::History(records) => {
                    link.close();
                    return Ok(records);
                }
                Message::Error(text) => bail!("coordinator refused: {}", text),
                _ => continue,
            },
            // Timed out or an undecodable line; the deadline ends the wait
            None => continue,
        }
    }
    bail!("no history reply within {:?}", REPLY_TIMEOUT)
}

/// Asks the coordinator to stop the whole network
pub fn send_stop(coordinator: &str, settings: LinkSettings) -> Result<()> {
    let link = MessageLink::connect(coordinator, settings).context("coordinator unreachable")?;
    link.send(&Message::Stop)?;
    // The coordinator drops every connection once it has stopped
    let deadline = Instant::now() + REPLY_TIMEOUT;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if link.receive_timeout(remaining).is_err() {
            break;
        }
    }
    link.close();
    Ok(())
}
