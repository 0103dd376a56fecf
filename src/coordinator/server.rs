//! Coordinator TCP server: accept loop and per-connection handlers.

use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use super::event_log::EventLogStore;
use super::router::Router;
use crate::config::CoordinatorConfig;
use crate::net::link::read_text_line;
use crate::simulation::policy::Policy;
use crate::simulation::shutdown::Shutdown;

/// How often the accept loop checks for shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct Coordinator {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown: Shutdown,
    export: Option<PathBuf>,
}

impl Coordinator {
    /// Opens the event log and binds the listening socket
    pub fn bind(config: &CoordinatorConfig, policy: Policy) -> Result<Self> {
        let store = EventLogStore::open(&config.event_log)
            .with_context(|| format!("failed to open event log {}", config.event_log.display()))?;
        let mut coordinator = Self::bind_with(&config.address(), Some(store), policy)?;
        coordinator.export = config.export.clone();
        Ok(coordinator)
    }

    /// Binds `addr` with an optional log file; port 0 picks a free port
    pub fn bind_with(addr: &str, store: Option<EventLogStore>, policy: Policy) -> Result<Self> {
        policy.validate().context("invalid initial policy")?;
        let listener = TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("failed to make listener non-blocking")?;
        let shutdown = Shutdown::new();
        let router = Arc::new(Router::new(store, policy, shutdown.clone()));
        Ok(Self {
            listener,
            router,
            shutdown,
            export: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Handle that stops the server when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serves until shutdown fires, either locally or through a STOP message
    pub fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("coordinator listening on {}", addr);

        while !self.shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted {}", peer);
                    if let Err(e) = self.spawn_handler(stream) {
                        warn!("failed to serve {}: {:#}", peer, e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.shutdown.sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    self.shutdown.sleep(ACCEPT_POLL);
                }
            }
        }

        info!("coordinator stopping");
        self.router.arbitrator().shutdown();
        self.router.close_all();
        if let Some(path) = &self.export {
            self.router
                .events()
                .export(path)
                .with_context(|| format!("failed to export events to {}", path.display()))?;
            info!("exported {} events to {}", self.router.events().len(), path.display());
        }
        Ok(())
    }

    /// Runs [`serve`](Self::serve) on its own thread
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || self.serve())
            .context("failed to spawn coordinator thread")
    }

    fn spawn_handler(&self, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        let _ = stream.set_nodelay(true);
        let connection = self.router.registry().open_stream(&stream)?;
        let router = Arc::clone(&self.router);
        thread::Builder::new()
            .name(format!("client-{}", connection.id().0))
            .spawn(move || {
                router.attach(Arc::clone(&connection));
                let mut reader = BufReader::new(stream);
                let mut buf = Vec::new();
                loop {
                    match read_text_line(&mut reader, &mut buf, connection.peer()) {
                        Ok(Some(line)) => router.handle_line(&connection, &line),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("{} read failed: {}", connection.id(), e);
                            break;
                        }
                    }
                    if router.shutdown_signal().is_triggered() {
                        break;
                    }
                }
                router.detach(connection.id());
                debug!("{} handler finished", connection.id());
            })?;
        Ok(())
    }
}
