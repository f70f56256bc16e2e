//! Relay-brokered transport.
//!
//! The server connects *outward* to a signaling service over WebSocket and
//! logs in under its server name.  Clients reach it through the service:
//!
//! ```text
//! client ──offer──▶ signaling ──offer──▶ server
//! client ◀─answer── signaling ◀─answer── server      peer channel open
//! client ──data───▶ signaling ──data───▶ server      (base64 frames)
//! client ──leave──▶ signaling ──leave──▶ server      peer channel closed
//! ```
//!
//! Once the server has answered an offer the peer channel counts as open and
//! is surfaced to the handler as an ordinary [`Connection`].  Candidate
//! messages are accepted and logged; the data itself is tunneled through the
//! signaling connection, so no candidate has to be acted upon.
//!
//! # Reconnection
//!
//! When the signaling connection drops, every peer channel carried by it
//! dies and the transport reconnects with exponential backoff
//! (`initial_backoff`, doubling up to `max_backoff`).  The attempt counter
//! resets after every successful connect.  After `max_retries` consecutive
//! failures the handler's [`TransportHandler::transport_failed`] is called
//! and the transport stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tabletop_core::protocol::Channel;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use super::connection::{AcceptedConnection, Connection, ConnectionError};
use super::transport::{ServerTransport, TransportError, TransportHandler};

/// Settings for the relay transport.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the signaling service, e.g. `wss://relay.example.org/signal`.
    pub signaling_url: String,
    /// Name the server logs in under; clients address their offers to it.
    pub server_name: String,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

/// JSON messages exchanged with the signaling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Sent by us with `success: None`; echoed by the service with the outcome.
    Login {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },
    Offer {
        source: String,
        destination: String,
        offer: String,
    },
    Answer {
        source: String,
        destination: String,
        answer: String,
    },
    Candidate {
        source: String,
        destination: String,
        candidate: String,
    },
    /// One frame payload, base64 encoded.
    Data {
        source: String,
        destination: String,
        payload: String,
    },
    Leave {
        source: String,
        destination: String,
    },
}

impl SignalMessage {
    fn destination(&self) -> Option<&str> {
        match self {
            Self::Login { .. } => None,
            Self::Offer { destination, .. }
            | Self::Answer { destination, .. }
            | Self::Candidate { destination, .. }
            | Self::Data { destination, .. }
            | Self::Leave { destination, .. } => Some(destination),
        }
    }
}

// ── Peer connection ───────────────────────────────────────────────────────────

/// A peer channel tunneled through the signaling connection.
struct RelayPeerConnection {
    id: String,
    server_name: String,
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    inbound: Mutex<Option<std_mpsc::Sender<Vec<u8>>>>,
    alive: AtomicBool,
}

impl RelayPeerConnection {
    /// Hands a received payload to the reader.  Returns `false` once the
    /// channel is closed or the reader is gone.
    fn deliver(&self, payload: Vec<u8>) -> bool {
        let inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        match inbound.as_ref() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Marks the channel dead and ends the inbound stream.
    fn drop_channel(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Connection for RelayPeerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }

    fn send(&self, _channel: Channel, payload: &[u8]) -> Result<(), ConnectionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed(self.id.clone()));
        }
        self.outgoing
            .send(SignalMessage::Data {
                source: self.server_name.clone(),
                destination: self.id.clone(),
                payload: BASE64.encode(payload),
            })
            .map_err(|_| ConnectionError::Closed(self.id.clone()))
    }

    fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!("closing relay peer {}", self.id);
            self.outgoing
                .send(SignalMessage::Leave {
                    source: self.server_name.clone(),
                    destination: self.id.clone(),
                })
                .ok();
        }
        self.drop_channel();
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Accepts peer channels brokered by a signaling service.
pub struct RelayTransport {
    config: RelayConfig,
    runtime: Handle,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    /// Creates a transport whose signaling client runs on `runtime`.
    pub fn new(config: RelayConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            handler: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Creates a transport on the runtime of the calling context.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Runtime`] when called outside a tokio runtime.
    pub fn with_current_runtime(config: RelayConfig) -> Result<Self, TransportError> {
        let runtime = Handle::try_current().map_err(|e| TransportError::Runtime(e.to_string()))?;
        Ok(Self::new(config, runtime))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl ServerTransport for RelayTransport {
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

        let task = self.runtime.spawn(run_signaling(
            self.config.clone(),
            handler,
            Arc::clone(&self.running),
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(
            "relay transport started as '{}' via {}",
            self.config.server_name, self.config.signaling_url
        );
        Ok(())
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            info!("relay transport stopped");
        }
    }

    fn describe(&self) -> String {
        format!("relay:{}@{}", self.config.server_name, self.config.signaling_url)
    }
}

/// How a signaling session ended.
enum SessionEnd {
    /// The connection dropped; reconnect.
    Disconnected,
    /// The service refused us; retrying would not help.
    Refused(TransportError),
}

async fn run_signaling(
    config: RelayConfig,
    handler: Arc<dyn TransportHandler>,
    running: Arc<AtomicBool>,
) {
    let mut failures: u32 = 0;
    let mut backoff = config.initial_backoff;

    while running.load(Ordering::SeqCst) {
        match connect_async(config.signaling_url.as_str()).await {
            Ok((ws, _)) => {
                info!("connected to signaling service {}", config.signaling_url);
                failures = 0;
                backoff = config.initial_backoff;
                match run_session(ws, &config, &handler).await {
                    SessionEnd::Disconnected => {
                        if running.load(Ordering::SeqCst) {
                            warn!("signaling connection lost; reconnecting");
                        }
                    }
                    SessionEnd::Refused(e) => {
                        handler.transport_failed(&e);
                        break;
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "signaling connect attempt {failures}/{} failed: {e}",
                    config.max_retries
                );
                if failures >= config.max_retries {
                    handler.transport_failed(&TransportError::RetriesExhausted {
                        attempts: failures,
                    });
                    break;
                }
            }
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }

    running.store(false, Ordering::SeqCst);
    debug!("signaling loop exited");
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    config: &RelayConfig,
    handler: &Arc<dyn TransportHandler>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let mut peers: HashMap<String, Arc<RelayPeerConnection>> = HashMap::new();

    out_tx
        .send(SignalMessage::Login {
            source: config.server_name.clone(),
            success: None,
        })
        .ok();

    let end = loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Disconnected,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("signaling read error: {e}");
                        break SessionEnd::Disconnected;
                    }
                };
                let message: SignalMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("unreadable signaling message: {e}");
                        continue;
                    }
                };
                if let Some(end) = handle_signal(message, config, handler, &out_tx, &mut peers) {
                    break end;
                }
            }
            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else { break SessionEnd::Disconnected };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("cannot encode signaling message: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json)).await {
                    debug!("signaling write error: {e}");
                    break SessionEnd::Disconnected;
                }
            }
        }
    };

    for peer in peers.values() {
        peer.drop_channel();
    }
    end
}

/// Applies one signaling message.  Returns `Some` when the session must end.
fn handle_signal(
    message: SignalMessage,
    config: &RelayConfig,
    handler: &Arc<dyn TransportHandler>,
    out_tx: &mpsc::UnboundedSender<SignalMessage>,
    peers: &mut HashMap<String, Arc<RelayPeerConnection>>,
) -> Option<SessionEnd> {
    if message
        .destination()
        .is_some_and(|d| d != config.server_name)
    {
        debug!("ignoring signaling message addressed elsewhere");
        return None;
    }

    match message {
        SignalMessage::Login { success, .. } => match success {
            Some(false) => {
                return Some(SessionEnd::Refused(TransportError::Signaling(format!(
                    "login as '{}' refused",
                    config.server_name
                ))))
            }
            _ => info!("logged in to signaling service as '{}'", config.server_name),
        },
        SignalMessage::Offer { source, .. } => {
            if let Some(old) = peers.remove(&source) {
                old.drop_channel();
            }
            let (tx, rx) = std_mpsc::channel();
            let peer = Arc::new(RelayPeerConnection {
                id: source.clone(),
                server_name: config.server_name.clone(),
                outgoing: out_tx.clone(),
                inbound: Mutex::new(Some(tx)),
                alive: AtomicBool::new(true),
            });
            peers.insert(source.clone(), Arc::clone(&peer));
            out_tx
                .send(SignalMessage::Answer {
                    source: config.server_name.clone(),
                    destination: source.clone(),
                    answer: format!("relay:{}", config.server_name),
                })
                .ok();
            info!("peer channel opened for {source}");

            let handler = Arc::clone(handler);
            let accepted = AcceptedConnection {
                connection: peer,
                inbound: rx,
            };
            tokio::task::spawn_blocking(move || handler.connection_accepted(accepted));
        }
        SignalMessage::Candidate { source, .. } => {
            debug!("candidate from {source}");
        }
        SignalMessage::Data {
            source, payload, ..
        } => {
            let Some(peer) = peers.get(&source) else {
                debug!("data from {source} without an open channel");
                return None;
            };
            match BASE64.decode(payload.as_bytes()) {
                Ok(bytes) => {
                    if !peer.deliver(bytes) {
                        if let Some(peer) = peers.remove(&source) {
                            peer.drop_channel();
                        }
                    }
                }
                Err(e) => warn!("undecodable data from {source}: {e}"),
            }
        }
        SignalMessage::Leave { source, .. } => {
            if let Some(peer) = peers.remove(&source) {
                info!("peer {source} left");
                peer.drop_channel();
            }
        }
        SignalMessage::Answer { source, .. } => {
            debug!("unexpected answer from {source}");
        }
    }
    None
}
