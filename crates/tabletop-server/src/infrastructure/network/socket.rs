//! Direct TCP transport.
//!
//! One dedicated thread runs the accept loop for the listener.  Every
//! accepted socket becomes a [`SocketConnection`] with its own reader and
//! writer threads:
//!
//! ```text
//!            ┌──────────── reader thread ───────────┐
//! TcpStream ─┤ read_frame → mpsc::Sender<Vec<u8>> ──┼──→ AcceptedConnection::inbound
//!            └──────────────────────────────────────┘
//!            ┌──────────── writer thread ───────────┐
//! TcpStream ←┤ write_frame ← OutboundQueue::pop ←───┼──── Connection::send
//!            └──────────────────────────────────────┘
//! ```
//!
//! # Read timeout
//!
//! Each socket gets a read timeout of a few heartbeat intervals.  Clients
//! send a heartbeat at least that often, so a read that times out means the
//! peer is gone even though it never closed the socket.  The reader then
//! marks the connection dead and the next reap removes it.
//!
//! # Stopping
//!
//! The listener is non-blocking and polled every
//! [`ACCEPT_POLL_INTERVAL`], checking the `running` flag in between, so
//! [`ServerTransport::close`] returns promptly.  Accept errors seen after a
//! stop was requested are not logged.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tabletop_core::protocol::{read_frame, write_frame, Channel, SequenceCounter, MAX_FRAME_SIZE};
use tracing::{debug, error, info, warn};

use super::connection::{AcceptedConnection, Connection, ConnectionError, Outbound, OutboundQueue};
use super::transport::{ServerTransport, TransportError, TransportHandler};

/// How often the non-blocking accept loop polls for a new socket.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings for the direct transport.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub bind_address: SocketAddr,
    /// Applied to every accepted socket; roughly 2–3× the client heartbeat.
    pub read_timeout: Duration,
}

// ── Connection ────────────────────────────────────────────────────────────────

/// A framed TCP connection served by a reader and a writer thread.
pub struct SocketConnection {
    id: String,
    peer: SocketAddr,
    outbound: Arc<OutboundQueue>,
    alive: Arc<AtomicBool>,
}

impl SocketConnection {
    /// Wraps `stream` and starts its reader and writer threads.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be configured or cloned, or
    /// a thread cannot be spawned.
    pub fn open(
        stream: TcpStream,
        id: String,
        read_timeout: Duration,
    ) -> io::Result<AcceptedConnection> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(read_timeout))?;

        let reader = stream.try_clone()?;
        let writer = stream;
        let outbound = Arc::new(OutboundQueue::new());
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        {
            let id = id.clone();
            let outbound = Arc::clone(&outbound);
            let alive = Arc::clone(&alive);
            std::thread::Builder::new()
                .name(format!("tabletop-read-{id}"))
                .spawn(move || read_loop(reader, id, tx, outbound, alive))?;
        }
        {
            let id = id.clone();
            let outbound = Arc::clone(&outbound);
            let alive = Arc::clone(&alive);
            std::thread::Builder::new()
                .name(format!("tabletop-write-{id}"))
                .spawn(move || write_loop(writer, id, outbound, alive))?;
        }

        let connection = Arc::new(SocketConnection {
            id,
            peer,
            outbound,
            alive,
        });
        Ok(AcceptedConnection {
            connection,
            inbound: rx,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for SocketConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn send(&self, channel: Channel, payload: &[u8]) -> Result<(), ConnectionError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ConnectionError::Encoding(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        if !self.is_alive() || !self.outbound.push(channel, payload.to_vec()) {
            return Err(ConnectionError::Closed(self.id.clone()));
        }
        Ok(())
    }

    /// Marks the connection dead and lets the writer flush what is queued
    /// before it shuts the socket down.
    fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!("closing connection {}", self.id);
        }
        self.outbound.close();
    }

    fn queued(&self, channel: Channel) -> usize {
        self.outbound.queued(channel)
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.outbound.close();
    }
}

fn read_loop(
    mut stream: TcpStream,
    id: String,
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: Arc<OutboundQueue>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut stream) {
            Ok(payload) => {
                if inbound.send(payload).is_err() {
                    debug!("receiver for {id} dropped; stopping reader");
                    break;
                }
            }
            Err(e) => {
                if alive.load(Ordering::SeqCst) {
                    match e.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                            info!("connection {id} timed out waiting for data")
                        }
                        io::ErrorKind::UnexpectedEof => info!("connection {id} closed by peer"),
                        _ => warn!("read error on {id}: {e}"),
                    }
                }
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    outbound.abort();
}

fn write_loop(
    mut stream: TcpStream,
    id: String,
    outbound: Arc<OutboundQueue>,
    alive: Arc<AtomicBool>,
) {
    while let Outbound::Frame(payload) = outbound.pop() {
        if let Err(e) = write_frame(&mut stream, &payload) {
            if alive.swap(false, Ordering::SeqCst) {
                warn!("write error on {id}: {e}");
            }
            outbound.abort();
            break;
        }
    }
    stream.shutdown(Shutdown::Both).ok();
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Accepts TCP connections on one listening socket.
pub struct DirectSocketTransport {
    config: SocketConfig,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DirectSocketTransport {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            handler: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            accept_thread: Mutex::new(None),
        }
    }

    /// The bound address once started; useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ServerTransport for DirectSocketTransport {
    fn on_accepted(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn start(&self) -> Result<(), TransportError> {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::NoHandler)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let addr = self.config.bind_address;
        let listener = match bind_listener(addr) {
            Ok(l) => l,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(TransportError::Bind { addr, source });
            }
        };
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);

        let running = Arc::clone(&self.running);
        let read_timeout = self.config.read_timeout;
        let thread = std::thread::Builder::new()
            .name("tabletop-accept".to_string())
            .spawn(move || accept_loop(listener, handler, running, read_timeout))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                TransportError::Io(e)
            })?;
        *self.accept_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread);

        info!("accepting connections on tcp://{bound}");
        Ok(())
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let thread = self
            .accept_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("accept thread panicked");
            }
            info!("stopped accepting on {}", self.describe());
        }
    }

    fn describe(&self) -> String {
        let addr = self.local_addr().unwrap_or(self.config.bind_address);
        format!("tcp://{addr}")
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn TransportHandler>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    let sequence = SequenceCounter::new();

    while running.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("accept error: {e}");
                }
                continue;
            }
        };

        let id = format!("{}-{}", peer.ip(), sequence.next());
        debug!("accepted {id} from {peer}");
        let opened = stream
            .set_nonblocking(false)
            .and_then(|()| SocketConnection::open(stream, id.clone(), read_timeout));
        match opened {
            Ok(accepted) => handler.connection_accepted(accepted),
            Err(e) => warn!("failed to set up connection {id}: {e}"),
        }
    }
}
