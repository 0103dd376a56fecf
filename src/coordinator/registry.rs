//! Node registry: which live connection answers for which node id.
//!
//! Connections are identified by an integer handle handed out at accept
//! time. Lookups clone the connection out of the lock, so a slow write to
//! one node never blocks routing to the others.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown as SocketShutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use thiserror::Error;

use crate::net::protocol::NodeRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("node {0} is not registered")]
    NotRegistered(String),
    #[error("connection of node {0} is closed")]
    Closed(String),
    #[error("write to node {node} failed: {source}")]
    Write {
        node: String,
        #[source]
        source: io::Error,
    },
}

/// Write side of one accepted connection
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: Mutex<Box<dyn Write + Send>>,
    socket: Option<TcpStream>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: impl Into<String>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            id,
            peer: peer.into(),
            writer: Mutex::new(writer),
            socket: None,
            closed: AtomicBool::new(false),
        }
    }

    fn for_stream(id: ConnectionId, stream: &TcpStream) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let writer = stream.try_clone()?;
        let mut connection = Self::new(id, peer, Box::new(writer));
        connection.socket = Some(stream.try_clone()?);
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes one line. A failed write closes the connection.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if result.is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Idempotent. Shuts the socket down so the handler's reader sees end of stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(SocketShutdown::Both);
        }
        debug!("{} ({}) closed", self.id, self.peer);
    }
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, Arc<Connection>>,
    dashboards: HashMap<String, Arc<Connection>>,
}

impl RegistryState {
    /// Removes `node_id` only while it still maps to `connection`
    fn evict(&mut self, node_id: &str, connection: ConnectionId) -> bool {
        let mut evicted = false;
        for map in [&mut self.nodes, &mut self.dashboards] {
            if map.get(node_id).is_some_and(|c| c.id() == connection) {
                map.remove(node_id);
                evicted = true;
            }
        }
        evicted
    }
}

/// Coordinator view of the live network
#[derive(Default)]
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Wraps an accepted socket under a fresh handle
    pub fn open_stream(&self, stream: &TcpStream) -> io::Result<Arc<Connection>> {
        Ok(Arc::new(Connection::for_stream(self.allocate(), stream)?))
    }

    /// Wraps an arbitrary writer under a fresh handle
    pub fn open(&self, peer: &str, writer: Box<dyn Write + Send>) -> Arc<Connection> {
        Arc::new(Connection::new(self.allocate(), peer, writer))
    }

    /// Binds `node_id` to `connection`. A different connection previously
    /// bound to the id is closed.
    pub fn register(&self, node_id: &str, role: NodeRole, connection: &Arc<Connection>) {
        let replaced = {
            let mut state = self.lock();
            let previous_node = state.nodes.remove(node_id);
            let previous_dashboard = state.dashboards.remove(node_id);
            let target = if role == NodeRole::Dashboard {
                &mut state.dashboards
            } else {
                &mut state.nodes
            };
            target.insert(node_id.to_string(), Arc::clone(connection));
            previous_node
                .into_iter()
                .chain(previous_dashboard)
                .filter(|previous| previous.id() != connection.id())
                .collect::<Vec<_>>()
        };

        for previous in replaced {
            warn!("{} re-registered; closing {} ({})", node_id, previous.id(), previous.peer());
            previous.close();
        }
        info!("registered {} as {:?} on {}", node_id, role, connection.id());
    }

    /// Writes one line to the node's live connection, evicting the entry
    /// when the connection turns out to be dead
    pub fn send_to_node(&self, node_id: &str, line: &str) -> Result<(), DeliveryError> {
        let connection = {
            let state = self.lock();
            state.nodes.get(node_id).or_else(|| state.dashboards.get(node_id)).cloned()
        };
        let Some(connection) = connection else {
            return Err(DeliveryError::NotRegistered(node_id.to_string()));
        };

        if connection.is_closed() {
            self.lock().evict(node_id, connection.id());
            return Err(DeliveryError::Closed(node_id.to_string()));
        }

        connection.write_line(line).map_err(|source| {
            self.lock().evict(node_id, connection.id());
            DeliveryError::Write {
                node: node_id.to_string(),
                source,
            }
        })
    }

    /// Fans a line out to every dashboard. Returns how many received it.
    pub fn broadcast_telemetry(&self, line: &str) -> usize {
        let subscribers: Vec<(String, Arc<Connection>)> = {
            let mut state = self.lock();
            state.dashboards.retain(|_, connection| !connection.is_closed());
            state
                .dashboards
                .iter()
                .map(|(id, connection)| (id.clone(), Arc::clone(connection)))
                .collect()
        };
        deliver_each(self, subscribers, line)
    }

    /// Sends a line to every registered node and dashboard
    pub fn broadcast_all(&self, line: &str) -> usize {
        let targets: Vec<(String, Arc<Connection>)> = {
            let state = self.lock();
            state
                .nodes
                .iter()
                .chain(state.dashboards.iter())
                .map(|(id, connection)| (id.clone(), Arc::clone(connection)))
                .collect()
        };
        deliver_each(self, targets, line)
    }

    /// Sends a line to every registered node that is not a dashboard
    pub fn broadcast_nodes(&self, line: &str) -> usize {
        let targets: Vec<(String, Arc<Connection>)> = {
            let state = self.lock();
            state
                .nodes
                .iter()
                .map(|(id, connection)| (id.clone(), Arc::clone(connection)))
                .collect()
        };
        deliver_each(self, targets, line)
    }

    /// Drops every entry pointing at `connection`; returns the ids removed
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<String> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut removed = Vec::new();
        for map in [&mut state.nodes, &mut state.dashboards] {
            map.retain(|id, c| {
                let keep = c.id() != connection;
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
        }
        removed
    }

    pub fn lookup(&self, node_id: &str) -> Option<ConnectionId> {
        let state = self.lock();
        state
            .nodes
            .get(node_id)
            .or_else(|| state.dashboards.get(node_id))
            .map(|connection| connection.id())
    }

    pub fn is_registered(&self, node_id: &str) -> bool {
        self.lookup(node_id).is_some()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn dashboard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().dashboards.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writes to each target in turn; a failure only affects its own target
fn deliver_each(
    registry: &NodeRegistry,
    targets: Vec<(String, Arc<Connection>)>,
    line: &str,
) -> usize {
    let mut delivered = 0;
    for (id, connection) in targets {
        match connection.write_line(line) {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!("delivery to {} failed: {}", id, e);
                registry.lock().evict(&id, connection.id());
            }
        }
    }
    delivered
}
