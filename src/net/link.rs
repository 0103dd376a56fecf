//! Line-oriented TCP link between two nodes.
//!
//! Writes go through a lock so concurrent senders never interleave lines.
//! A single reader thread owns the buffered reader and feeds complete lines
//! into a bounded channel; every receive variant reads from that channel.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::protocol::{self, Frame, Message, ProtocolError};
use crate::simulation::clock::LogicalClock;

/// Lines buffered between the reader thread and the consumer
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("link is closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retry behaviour for [`MessageLink::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
            connect_timeout_ms: 2000,
        }
    }
}

impl LinkSettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reads the next newline-terminated line that is valid UTF-8.
///
/// Lines that are not UTF-8 are logged and skipped. Returns `Ok(None)` at
/// end of stream.
pub fn read_text_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    peer: &str,
) -> std::io::Result<Option<String>> {
    loop {
        buf.clear();
        if reader.read_until(b'\n', buf)? == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        match String::from_utf8(std::mem::take(buf)) {
            Ok(line) => return Ok(Some(line)),
            Err(e) => warn!("ignoring non-UTF-8 line from {}: {}", peer, e.utf8_error()),
        }
    }
}

/// Bidirectional connection carrying protocol envelopes
pub struct MessageLink {
    peer: String,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    incoming: Receiver<String>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    clock: Option<Arc<LogicalClock>>,
}

impl MessageLink {
    /// Connects to `addr`, retrying with a fixed backoff
    pub fn connect(addr: &str, settings: LinkSettings) -> Result<Self, LinkError> {
        let attempts = settings.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match open(addr, settings.connect_timeout()) {
                Ok(stream) => {
                    debug!("connected to {} on attempt {}", addr, attempt);
                    return Self::from_stream(stream);
                }
                Err(LinkError::Io(e)) => {
                    warn!("connect to {} failed (attempt {}/{}): {}", addr, attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        thread::sleep(settings.backoff());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(LinkError::Connect {
            addr: addr.to_string(),
            attempts,
            source: last_error.unwrap_or_else(|| std::io::Error::other("no attempt made")),
        })
    }

    /// Wraps an already connected stream, such as an accepted one
    pub fn from_stream(stream: TcpStream) -> Result<Self, LinkError> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let connected = Arc::new(AtomicBool::new(true));

        let (tx, rx) = crossbeam::channel::bounded(INBOUND_CAPACITY);
        let reader_connected = Arc::clone(&connected);
        let reader_peer = peer.clone();
        thread::Builder::new()
            .name(format!("link-reader-{}", peer))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut buf = Vec::new();
                while let Ok(Some(line)) = read_text_line(&mut reader, &mut buf, &reader_peer) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                reader_connected.store(false, Ordering::SeqCst);
                debug!("link to {} reached end of stream", reader_peer);
            })?;

        Ok(Self {
            peer,
            stream,
            writer: Mutex::new(writer),
            incoming: rx,
            connected,
            closed: AtomicBool::new(false),
            clock: None,
        })
    }

    /// Stamps outgoing messages with `clock` and merges incoming timestamps into it
    pub fn with_clock(mut self, clock: Arc<LogicalClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Serializes `message` as one line
    pub fn send(&self, message: &Message) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let timestamp = self.clock.as_ref().map(|clock| clock.tick());
        let line = protocol::encode(message, timestamp)?;
        self.send_line(&line)
    }

    pub fn send_line(&self, line: &str) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if let Err(e) = result {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    /// Blocks for the next line; `None` at end of stream
    pub fn receive_line(&self) -> Option<String> {
        self.incoming.recv().ok()
    }

    /// A line only if one is already buffered
    pub fn try_receive_line(&self) -> Option<String> {
        self.incoming.try_recv().ok()
    }

    /// Blocks for the next well-formed message. Lines that fail to decode
    /// are logged and skipped.
    pub fn receive(&self) -> Option<Frame> {
        loop {
            let line = self.receive_line()?;
            if let Some(frame) = self.accept(&line) {
                return Some(frame);
            }
        }
    }

    pub fn try_receive(&self) -> Option<Frame> {
        while let Some(line) = self.try_receive_line() {
            if let Some(frame) = self.accept(&line) {
                return Some(frame);
            }
        }
        None
    }

    /// Waits at most `timeout`; `Err(Closed)` once the stream has ended
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Frame>, LinkError> {
        match self.incoming.recv_timeout(timeout) {
            Ok(line) => Ok(self.accept(&line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }

    /// Raw inbound lines, for use in `crossbeam::select!`
    pub fn incoming(&self) -> &Receiver<String> {
        &self.incoming
    }

    /// Decodes a line taken from [`incoming`](Self::incoming)
    pub fn accept(&self, line: &str) -> Option<Frame> {
        match protocol::decode(line) {
            Ok(frame) => {
                if let (Some(clock), Some(remote)) = (&self.clock, frame.timestamp) {
                    clock.merge(remote);
                }
                Some(frame)
            }
            Err(e) => {
                warn!("dropping line from {}: {}", self.peer, e);
                None
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    /// Idempotent; safe from any thread
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        // Unblocks the reader thread
        let _ = self.stream.shutdown(SocketShutdown::Both);
        debug!("link to {} closed", self.peer);
    }
}

impl Drop for MessageLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn open(addr: &str, timeout: Duration) -> Result<TcpStream, LinkError> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| LinkError::Resolve(addr.to_string()))?
        .collect();
    let mut last_error = None;
    for candidate in addrs {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(LinkError::Io(
        last_error.unwrap_or_else(|| {
            std::io::Error::other(format!("{} resolved to no addresses", addr))
        }),
    ))
}
