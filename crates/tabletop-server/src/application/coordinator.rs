//! The session server's composition root.
//!
//! [`ConnectionCoordinator`] owns the shared session state and wires the
//! pieces together:
//!
//! ```text
//! ServerTransport ──accepted──▶ handshake ──Player──▶ install
//!                                                      │
//!          ┌───────────────────────────────────────────┤
//!          ▼                                           ▼
//!   ConnectionRegistry                        per-connection session
//!   (broadcast / reap)                        (player, AssetTransferManager,
//!                                              reader thread)
//! ```
//!
//! Three kinds of threads call into it concurrently:
//!
//! - one handshake thread per accepted connection, spawned from
//!   [`TransportHandler::connection_accepted`], which authenticates and
//!   installs the player;
//! - one reader thread per admitted connection, dispatching its
//!   [`ClientMessage`]s and releasing the connection when its inbound
//!   stream ends;
//! - two workers owned by the coordinator: the reaper, which releases
//!   connections that died without a clean close, and the asset pump, which
//!   moves one chunk per connection per pass and sleeps only when a whole
//!   pass produced nothing.  A connection whose image queue holds
//!   [`CoordinatorConfig::asset_queue_limit`] chunks is skipped until its
//!   writer catches up, so a slow client never has more than that in memory.
//!
//! # Locking
//!
//! `sessions` is taken before the registry's own lock, never the other way
//! round.  Observer callbacks run with no coordinator lock held.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tabletop_core::observer::{same_instance, ObserverList};
use tabletop_core::protocol::{
    decode_message, encode_message, Channel, ClientMessage, HandshakeErrorKind, ProtocolError,
    ServerMessage,
};
use tabletop_core::transfer::{AssetProducer, AssetTransferManager};
use tabletop_core::{AssetId, Player, ServerPolicy};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::handshake::{HandshakeError, HandshakeValidator, ServerHandshake};
use crate::infrastructure::network::{
    AcceptedConnection, Connection, ConnectionRegistry, ServerTransport, TransportError,
    TransportHandler,
};

/// Largest chunk the asset pump sends in one message.
pub const ASSET_CHUNK_SIZE: usize = 5 * 1024;

/// How long the asset pump sleeps after a pass that sent nothing.
pub const ASSET_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Image frames a connection may have waiting before the pump skips it.
pub const ASSET_QUEUE_LIMIT: usize = 8;

/// Pump pause while every pending transfer waits on a full queue.
const ASSET_THROTTLE_INTERVAL: Duration = Duration::from_millis(10);

/// Errors returned by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cannot {operation} a server that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no connected player named {0}")]
    UnknownPlayer(String),

    #[error("no connection with id {0}")]
    UnknownConnection(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of a coordinator.  Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    New,
    Started,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::New => "new",
            ServerState::Started => "started",
            ServerState::Stopped => "stopped",
        })
    }
}

/// Timing and sizing knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub handshake_timeout: Duration,
    pub reap_interval: Duration,
    pub asset_chunk_size: usize,
    pub asset_poll_interval: Duration,
    pub asset_queue_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(5),
            asset_chunk_size: ASSET_CHUNK_SIZE,
            asset_poll_interval: ASSET_POLL_INTERVAL,
            asset_queue_limit: ASSET_QUEUE_LIMIT,
        }
    }
}

/// Notified when players join and leave.
pub trait ConnectionObserver: Send + Sync {
    fn connection_added(&self, connection_id: &str, player: &Player);
    fn connection_removed(&self, connection_id: &str, player: &Player);
}

/// Resolves asset ids requested by clients to something that can be streamed.
#[cfg_attr(test, mockall::automock)]
pub trait AssetStore: Send + Sync {
    fn locate(&self, id: &AssetId) -> Option<AssetProducer>;
}

/// Receives the opaque [`ClientMessage::Session`] payloads.
#[cfg_attr(test, mockall::automock)]
pub trait SessionHandler: Send + Sync {
    fn handle_message(&self, connection_id: &str, player: &Player, payload: &[u8]);
}

#[derive(Clone)]
struct Session {
    connection: Arc<dyn Connection>,
    player: Player,
    transfers: Arc<AssetTransferManager>,
}

#[derive(Debug, Default)]
struct PumpPass {
    sent: usize,
    /// Connections with pending chunks whose image queue was full.
    throttled: usize,
}

/// Lets worker threads sleep until either a timeout or shutdown.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits up to `timeout`; returns `true` if shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Admits connections and keeps the session's shared state.
pub struct ConnectionCoordinator {
    config: CoordinatorConfig,
    validator: HandshakeValidator,
    registry: ConnectionRegistry,
    /// Keyed by connection id, compared exactly as the registry does.
    sessions: Mutex<HashMap<String, Session>>,
    campaign: RwLock<Vec<u8>>,
    policy: RwLock<ServerPolicy>,
    observers: ObserverList<dyn ConnectionObserver>,
    transports: Mutex<Vec<Arc<dyn ServerTransport>>>,
    asset_store: RwLock<Option<Arc<dyn AssetStore>>>,
    session_handler: RwLock<Option<Arc<dyn SessionHandler>>>,
    state: Mutex<ServerState>,
    running: AtomicBool,
    stop_signal: StopSignal,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        validator: HandshakeValidator,
        policy: ServerPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            validator,
            registry: ConnectionRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
            campaign: RwLock::new(Vec::new()),
            policy: RwLock::new(policy),
            observers: ObserverList::new(),
            transports: Mutex::new(Vec::new()),
            asset_store: RwLock::new(None),
            session_handler: RwLock::new(None),
            state: Mutex::new(ServerState::New),
            running: AtomicBool::new(false),
            stop_signal: StopSignal::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Wiring ────────────────────────────────────────────────────────────────

    /// Adds a transport; it is started together with the coordinator.
    pub fn add_transport(&self, transport: Arc<dyn ServerTransport>) {
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(transport);
    }

    pub fn set_asset_store(&self, store: Arc<dyn AssetStore>) {
        *self.asset_store.write().unwrap_or_else(|e| e.into_inner()) = Some(store);
    }

    pub fn set_session_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self
            .session_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) -> bool {
        self.observers.remove(observer)
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Starts every transport and the worker threads.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::InvalidState`] unless the coordinator is new;
    /// the first transport error otherwise, in which case transports that
    /// did start are closed again.
    pub fn start(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ServerState::New {
            return Err(CoordinatorError::InvalidState {
                operation: "start",
                state: *state,
            });
        }
        self.running.store(true, Ordering::SeqCst);

        let transports = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let bridge: Arc<dyn TransportHandler> = Arc::new(AcceptBridge(Arc::downgrade(self)));
        for (started, transport) in transports.iter().enumerate() {
            transport.on_accepted(Arc::clone(&bridge));
            if let Err(e) = transport.start() {
                error!("cannot start {}: {e}", transport.describe());
                for t in &transports[..started] {
                    t.close();
                }
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            info!("listening on {}", transport.describe());
        }

        let workers = [
            ("tabletop-reaper", Self::reap_loop as fn(Weak<Self>)),
            ("tabletop-asset-pump", Self::asset_loop as fn(Weak<Self>)),
        ];
        let mut handles = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for (name, body) in workers {
            let weak = Arc::downgrade(self);
            let handle = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || body(weak))
                .map_err(|source| CoordinatorError::Spawn { name, source })?;
            handles.push(handle);
        }

        *state = ServerState::Started;
        info!("session server started");
        Ok(())
    }

    /// Closes the transports, releases every connection and joins the workers.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::InvalidState`] unless the coordinator is started.
    pub fn stop(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ServerState::Started {
                return Err(CoordinatorError::InvalidState {
                    operation: "stop",
                    state: *state,
                });
            }
            *state = ServerState::Stopped;
        }
        {
            // Flipped under the sessions lock so no install lands after the drain.
            let _sessions = self.sessions();
            self.running.store(false, Ordering::SeqCst);
        }
        self.stop_signal.stop();

        let transports = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for transport in transports {
            transport.close();
        }

        for connection in self.registry.drain_all() {
            connection.close();
            self.forget(&connection);
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("session server stopped");
        Ok(())
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    fn admit(self: &Arc<Self>, accepted: AcceptedConnection) {
        let AcceptedConnection {
            connection,
            inbound,
        } = accepted;
        if !self.running.load(Ordering::SeqCst) {
            connection.close();
            return;
        }

        let handshake = ServerHandshake::new(
            connection.as_ref(),
            &inbound,
            self.config.handshake_timeout,
        );
        let player = match handshake
            .authenticate(&self.validator, &|name: &str| self.is_player_connected(name))
        {
            Ok(player) => player,
            Err(HandshakeError::Rejected(_)) => {
                connection.close();
                return;
            }
            Err(e) => {
                info!("handshake with {} failed: {e}", connection.id());
                connection.close();
                return;
            }
        };

        let session = match self.install(&connection, player, &handshake) {
            Ok(session) => session,
            Err(e) => {
                info!("could not admit {}: {e}", connection.id());
                connection.close();
                return;
            }
        };

        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("tabletop-session-{}", connection.id()))
            .spawn(move || this.session_loop(session, inbound));
        if let Err(e) = spawned {
            error!("cannot spawn reader for {}: {e}", connection.id());
            self.release(&connection);
        }
    }

    /// Registers an authenticated connection and greets it.
    ///
    /// The name check is repeated under the sessions lock: two connections
    /// may pass the handshake with the same name at the same time.  So is the
    /// running check, since `stop` may have drained the registry meanwhile.
    fn install(
        &self,
        connection: &Arc<dyn Connection>,
        player: Player,
        handshake: &ServerHandshake<'_>,
    ) -> Result<Session, HandshakeError> {
        self.reap();

        let id = connection.id().to_string();
        let session = Session {
            connection: Arc::clone(connection),
            player: player.clone(),
            transfers: Arc::new(AssetTransferManager::new()),
        };

        {
            let mut sessions = self.sessions();
            if !self.running.load(Ordering::SeqCst) {
                return Err(HandshakeError::Stopped);
            }
            if sessions.values().any(|s| s.player.has_name(&player.name)) {
                drop(sessions);
                return Err(handshake.reject(HandshakeErrorKind::PlayerAlreadyConnected));
            }
            if !self.registry.add(Arc::clone(connection)) {
                drop(sessions);
                return Err(handshake.reject(HandshakeErrorKind::InvalidHandshake));
            }
            sessions.insert(id.clone(), session.clone());

            let policy = self.policy();
            if let Err(e) = handshake.accept(&policy) {
                warn!("could not confirm admission to {id}: {e}");
            }

            for other in sessions
                .values()
                .filter(|s| !same_instance(&s.connection, connection))
            {
                let greeting = ServerMessage::PlayerConnected(other.player.clone());
                self.send_to(connection.as_ref(), Channel::Default, &greeting);
            }
            if let Some(payload) = encode(&ServerMessage::PlayerConnected(player.clone())) {
                self.registry.broadcast(Channel::Default, &payload, &[]);
            }
            let campaign = ServerMessage::SetCampaign(self.campaign());
            self.send_to(connection.as_ref(), Channel::Default, &campaign);
        }

        info!("{player} joined as {id}");
        self.observers
            .for_each(|o| o.connection_added(&id, &player));
        Ok(session)
    }

    fn session_loop(self: Arc<Self>, session: Session, inbound: Receiver<Vec<u8>>) {
        let id = session.connection.id().to_string();
        for payload in inbound.iter() {
            match decode_message::<ClientMessage>(&payload) {
                Ok(message) => self.dispatch(&session, message),
                Err(e) => warn!("unreadable message from {id}: {e}"),
            }
        }
        debug!("inbound stream of {id} ended");
        self.release(&session.connection);
    }

    fn dispatch(&self, session: &Session, message: ClientMessage) {
        let id = session.connection.id();
        match message {
            ClientMessage::Heartbeat => debug!("heartbeat from {id}"),
            ClientMessage::RequestAsset(asset) => self.serve_asset(session, &asset),
            ClientMessage::Session(payload) => {
                let handler = self
                    .session_handler
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match handler {
                    Some(handler) => handler.handle_message(id, &session.player, &payload),
                    None => debug!("no session handler; dropping message from {id}"),
                }
            }
        }
    }

    fn serve_asset(&self, session: &Session, asset: &AssetId) {
        let id = session.connection.id();
        let store = self.asset_store.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(producer) = store.and_then(|s| s.locate(asset)) else {
            warn!("{id} requested unknown asset {asset}");
            return;
        };
        self.send_to(
            session.connection.as_ref(),
            Channel::Image,
            &ServerMessage::StartAssetTransfer(producer.header().clone()),
        );
        session.transfers.add_producer(producer);
    }

    // ── Release ───────────────────────────────────────────────────────────────

    /// Closes `connection` and, if it is still the registered instance,
    /// removes its player and tells everyone else.
    pub fn release(&self, connection: &Arc<dyn Connection>) {
        connection.close();
        if self.registry.remove(connection) {
            self.forget(connection);
        }
    }

    /// Releases every connection whose liveness probe fails.
    pub fn reap(&self) -> usize {
        let dead = self.registry.reap();
        for connection in &dead {
            info!("reaping dead connection {}", connection.id());
            connection.close();
            self.forget(connection);
        }
        dead.len()
    }

    fn forget(&self, connection: &Arc<dyn Connection>) {
        let key = connection.id();
        let session = {
            let mut sessions = self.sessions();
            match sessions.get(key) {
                Some(s) if same_instance(&s.connection, connection) => sessions.remove(key),
                _ => None,
            }
        };
        let Some(session) = session else { return };

        session.transfers.flush();
        let id = connection.id();
        if let Some(payload) = encode(&ServerMessage::PlayerDisconnected(session.player.clone())) {
            self.registry.broadcast(Channel::Default, &payload, &[id]);
        }
        info!("{} left ({id})", session.player);
        self.observers
            .for_each(|o| o.connection_removed(id, &session.player));
    }

    // ── Workers ───────────────────────────────────────────────────────────────

    fn reap_loop(weak: Weak<Self>) {
        loop {
            let Some(this) = weak.upgrade() else { break };
            if this.stop_signal.wait(this.config.reap_interval) {
                break;
            }
            this.reap();
        }
        debug!("reaper exited");
    }

    fn asset_loop(weak: Weak<Self>) {
        loop {
            let Some(this) = weak.upgrade() else { break };
            if this.stop_signal.is_stopped() {
                break;
            }
            let pass = this.pump_assets();
            if pass.sent > 0 {
                continue;
            }
            let pause = if pass.throttled > 0 {
                ASSET_THROTTLE_INTERVAL
            } else {
                this.config.asset_poll_interval
            };
            if this.stop_signal.wait(pause) {
                break;
            }
        }
        debug!("asset pump exited");
    }

    /// One pass: at most one chunk per connection with room in its queue.
    fn pump_assets(&self) -> PumpPass {
        let sessions: Vec<Session> = self.sessions().values().cloned().collect();
        let mut pass = PumpPass::default();
        for session in sessions {
            let id = session.connection.id();
            if session.transfers.pending_producers() == 0 {
                continue;
            }
            if session.connection.queued(Channel::Image) >= self.config.asset_queue_limit {
                pass.throttled += 1;
                continue;
            }
            match session.transfers.next_chunk(self.config.asset_chunk_size) {
                Ok(Some(chunk)) => {
                    debug!("sending {} bytes of {} to {id}", chunk.len(), chunk.id);
                    self.send_to(
                        session.connection.as_ref(),
                        Channel::Image,
                        &ServerMessage::UpdateAssetTransfer(chunk),
                    );
                    pass.sent += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("asset transfer to {id} aborted: {e}"),
            }
        }
        pass
    }

    // ── Session state ─────────────────────────────────────────────────────────

    /// Whether a live connection belongs to a player called `name` (any case).
    pub fn is_player_connected(&self, name: &str) -> bool {
        self.sessions()
            .values()
            .any(|s| s.player.has_name(name) && s.connection.is_alive())
    }

    /// Connected players, sorted by name.
    pub fn players(&self) -> Vec<Player> {
        let mut players: Vec<Player> =
            self.sessions().values().map(|s| s.player.clone()).collect();
        players.sort_by_key(|p| p.name.to_lowercase());
        players
    }

    pub fn connection_id_of(&self, name: &str) -> Option<String> {
        self.sessions()
            .values()
            .find(|s| s.player.has_name(name))
            .map(|s| s.connection.id().to_string())
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn policy(&self) -> ServerPolicy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stores `policy` and sends it to every connected client.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Protocol`] if the message cannot be encoded.
    pub fn update_policy(&self, policy: ServerPolicy) -> Result<usize, CoordinatorError> {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy.clone();
        self.broadcast_message(&ServerMessage::UpdatePolicy(policy), &[])
    }

    /// Replaces the campaign snapshot and sends it to every connected client.
    /// Clients admitted later receive it as part of their greeting.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Protocol`] if the message cannot be encoded.
    pub fn set_campaign(&self, snapshot: Vec<u8>) -> Result<usize, CoordinatorError> {
        *self.campaign.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        self.broadcast_message(&ServerMessage::SetCampaign(snapshot), &[])
    }

    pub fn campaign(&self) -> Vec<u8> {
        self.campaign.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sends `message` to every admitted connection not in `exclude`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Protocol`] if the message cannot be encoded.
    pub fn broadcast_message(
        &self,
        message: &ServerMessage,
        exclude: &[&str],
    ) -> Result<usize, CoordinatorError> {
        let payload = encode_message(message)?;
        Ok(self.registry.broadcast(Channel::Default, &payload, exclude))
    }

    /// Sends `message` to one connection; unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Protocol`] if the message cannot be encoded.
    pub fn send_message(
        &self,
        connection_id: &str,
        message: &ServerMessage,
    ) -> Result<bool, CoordinatorError> {
        let payload = encode_message(message)?;
        Ok(self.registry.send(connection_id, Channel::Default, &payload))
    }

    /// Queues an asset to be streamed to one connection.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownConnection`] if no session has that id.
    pub fn send_asset(
        &self,
        connection_id: &str,
        producer: AssetProducer,
    ) -> Result<(), CoordinatorError> {
        let session = self
            .sessions()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownConnection(connection_id.to_string()))?;
        self.send_to(
            session.connection.as_ref(),
            Channel::Image,
            &ServerMessage::StartAssetTransfer(producer.header().clone()),
        );
        session.transfers.add_producer(producer);
        Ok(())
    }

    /// Tells a player they were removed and disconnects them.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownPlayer`] if nobody by that name is connected.
    pub fn boot_player(&self, name: &str, reason: &str) -> Result<(), CoordinatorError> {
        let connection = self
            .sessions()
            .values()
            .find(|s| s.player.has_name(name))
            .map(|s| Arc::clone(&s.connection))
            .ok_or_else(|| CoordinatorError::UnknownPlayer(name.to_string()))?;
        self.send_to(
            connection.as_ref(),
            Channel::Default,
            &ServerMessage::Booted {
                reason: reason.to_string(),
            },
        );
        info!("booting {name}: {reason}");
        self.release(&connection);
        Ok(())
    }

    fn send_to(&self, connection: &dyn Connection, channel: Channel, message: &ServerMessage) {
        let Some(payload) = encode(message) else { return };
        if let Err(e) = connection.send(channel, &payload) {
            debug!("send to {} failed: {e}", connection.id());
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Vec<u8>> {
    encode_message(message)
        .map_err(|e| error!("cannot encode server message: {e}"))
        .ok()
}

/// Delivers accepted connections to a coordinator without keeping it alive.
struct AcceptBridge(Weak<ConnectionCoordinator>);

impl TransportHandler for AcceptBridge {
    /// Runs the handshake on its own thread so a slow client cannot stall
    /// the transport's accept loop.
    fn connection_accepted(&self, accepted: AcceptedConnection) {
        let Some(coordinator) = self.0.upgrade() else {
            accepted.connection.close();
            return;
        };
        let connection = Arc::clone(&accepted.connection);
        let spawned = std::thread::Builder::new()
            .name(format!("tabletop-handshake-{}", connection.id()))
            .spawn(move || coordinator.admit(accepted));
        if let Err(e) = spawned {
            error!("cannot spawn handshake for {}: {e}", connection.id());
            connection.close();
        }
    }

    fn transport_failed(&self, error: &TransportError) {
        error!("transport gave up: {error}; no further connections will arrive through it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Sender};
    use std::time::Instant;

    use mockall::predicate::eq;
    use tabletop_core::domain::player::AuthMethod;
    use tabletop_core::protocol::{HandshakeMessage, HandshakeRequest, HandshakeResponse};
    use tabletop_core::{AssetHeader, Role};

    use crate::infrastructure::network::registry::testing::FakeConnection;

    fn coordinator() -> Arc<ConnectionCoordinator> {
        let validator = HandshakeValidator::new("1.0")
            .with_password(Role::Gm, "dungeon")
            .with_password(Role::Player, "correct");
        let config = CoordinatorConfig {
            handshake_timeout: Duration::from_secs(2),
            reap_interval: Duration::from_secs(60),
            asset_chunk_size: 4,
            asset_poll_interval: Duration::from_millis(10),
            asset_queue_limit: 2,
        };
        let coordinator = ConnectionCoordinator::new(config, validator, ServerPolicy::default());
        coordinator.start().unwrap();
        coordinator
    }

    /// Runs a handshake for `name` on a fake connection; returns the
    /// connection and the sender feeding its inbound stream.
    fn join(
        coordinator: &Arc<ConnectionCoordinator>,
        id: &str,
        name: &str,
        password: &str,
    ) -> (Arc<FakeConnection>, Sender<Vec<u8>>) {
        let connection = Arc::new(FakeConnection::new(id));
        let (tx, rx) = mpsc::channel();
        let request = HandshakeMessage::Request(HandshakeRequest::new(
            name,
            password,
            Role::Player,
            "1.0",
        ));
        tx.send(encode_message(&request).unwrap()).unwrap();
        coordinator.admit(AcceptedConnection {
            connection: connection.clone(),
            inbound: rx,
        });
        (connection, tx)
    }

    /// Session messages a fake connection received after the handshake reply.
    fn session_messages(connection: &FakeConnection) -> Vec<ServerMessage> {
        connection
            .sent_payloads()
            .iter()
            .skip(1)
            .map(|p| decode_message(p).unwrap())
            .collect()
    }

    fn handshake_reply(connection: &FakeConnection) -> HandshakeResponse {
        match decode_message(&connection.sent_payloads()[0]).unwrap() {
            HandshakeMessage::Response(response) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConnectionObserver for Recorder {
        fn connection_added(&self, connection_id: &str, player: &Player) {
            self.events
                .lock()
                .unwrap()
                .push(format!("+{} {connection_id}", player.name));
        }

        fn connection_removed(&self, connection_id: &str, player: &Player) {
            self.events
                .lock()
                .unwrap()
                .push(format!("-{} {connection_id}", player.name));
        }
    }

    #[test]
    fn test_start_twice_and_stop_before_start_are_rejected() {
        let fresh = ConnectionCoordinator::new(
            CoordinatorConfig::default(),
            HandshakeValidator::new("1.0"),
            ServerPolicy::default(),
        );
        assert!(matches!(
            fresh.stop(),
            Err(CoordinatorError::InvalidState { state: ServerState::New, .. })
        ));

        fresh.start().unwrap();
        assert!(fresh.start().is_err());
        fresh.stop().unwrap();
        assert_eq!(fresh.state(), ServerState::Stopped);
        assert!(fresh.start().is_err());
    }

    #[test]
    fn test_admission_greets_newcomer_in_order() {
        // Arrange
        let coordinator = coordinator();
        coordinator.set_campaign(b"campaign-v1".to_vec()).unwrap();
        let (_alice, _alice_tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        // Act
        let (bob, _bob_tx) = join(&coordinator, "10.0.0.2-1", "Bob", "correct");

        // Assert
        assert!(handshake_reply(&bob).is_ok());
        let messages = session_messages(&bob);
        assert!(matches!(&messages[0], ServerMessage::PlayerConnected(p) if p.name == "Alice"));
        assert!(matches!(&messages[1], ServerMessage::PlayerConnected(p) if p.name == "Bob"));
        assert_eq!(messages[2], ServerMessage::SetCampaign(b"campaign-v1".to_vec()));
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_existing_players_hear_about_newcomer() {
        let coordinator = coordinator();
        let (alice, _alice_tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        let (_bob, _bob_tx) = join(&coordinator, "10.0.0.2-1", "Bob", "correct");

        let bob = Player::new("Bob", Role::Player, AuthMethod::Password);
        assert!(session_messages(&alice).contains(&ServerMessage::PlayerConnected(bob)));
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_rejected_connection_is_never_registered() {
        // Arrange
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::default());
        coordinator.add_observer(recorder.clone());

        // Act
        let (mallory, _tx) = join(&coordinator, "10.0.0.9-0", "Mallory", "guess");

        // Assert
        assert!(!handshake_reply(&mallory).is_ok());
        assert!(session_messages(&mallory).is_empty());
        assert_eq!(coordinator.connection_count(), 0);
        assert!(recorder.events.lock().unwrap().is_empty());
        assert!(!mallory.is_alive());
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_duplicate_name_is_refused_case_insensitively() {
        let coordinator = coordinator();
        let (_alice, _tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        let (imposter, _tx2) = join(&coordinator, "10.0.0.7-1", "ALICE", "correct");

        assert_eq!(
            handshake_reply(&imposter).error,
            Some(HandshakeErrorKind::PlayerAlreadyConnected)
        );
        assert_eq!(coordinator.players().len(), 1);
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_end_of_inbound_stream_releases_player() {
        // Arrange
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::default());
        coordinator.add_observer(recorder.clone());
        let (alice, _alice_tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");
        let (_bob, bob_tx) = join(&coordinator, "10.0.0.2-1", "Bob", "correct");

        // Act
        drop(bob_tx);

        // Assert
        assert!(wait_until(|| !coordinator.is_player_connected("bob")));
        let bob = Player::new("Bob", Role::Player, AuthMethod::Password);
        assert!(session_messages(&alice).contains(&ServerMessage::PlayerDisconnected(bob)));
        assert!(wait_until(|| recorder.events.lock().unwrap().len() == 3));
        assert_eq!(
            recorder.events.lock().unwrap().clone(),
            vec![
                "+Alice 10.0.0.1-0".to_string(),
                "+Bob 10.0.0.2-1".to_string(),
                "-Bob 10.0.0.2-1".to_string(),
            ]
        );
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_reap_releases_dead_connections_only() {
        // Arrange
        let coordinator = coordinator();
        let (alice, _alice_tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");
        let (bob, _bob_tx) = join(&coordinator, "10.0.0.2-1", "Bob", "correct");

        // Act
        bob.alive.store(false, Ordering::SeqCst);
        let reaped = coordinator.reap();

        // Assert
        assert_eq!(reaped, 1);
        assert!(coordinator.is_player_connected("Alice"));
        assert!(!coordinator.is_player_connected("Bob"));
        assert!(matches!(
            session_messages(&alice).last(),
            Some(ServerMessage::PlayerDisconnected(p)) if p.name == "Bob"
        ));
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_dead_holder_of_a_name_does_not_block_rejoin() {
        let coordinator = coordinator();
        let (old, _old_tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");
        old.alive.store(false, Ordering::SeqCst);

        let (new, _new_tx) = join(&coordinator, "10.0.0.1-5", "Alice", "correct");

        assert!(handshake_reply(&new).is_ok());
        assert_eq!(coordinator.connection_id_of("alice").as_deref(), Some("10.0.0.1-5"));
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_update_policy_is_broadcast() {
        let coordinator = coordinator();
        let (alice, _tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");
        let policy = ServerPolicy {
            movement_locked: true,
            ..ServerPolicy::default()
        };

        let delivered = coordinator.update_policy(policy.clone()).unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(coordinator.policy(), policy);
        assert_eq!(
            session_messages(&alice).last(),
            Some(&ServerMessage::UpdatePolicy(policy))
        );
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_boot_player_sends_reason_and_disconnects() {
        let coordinator = coordinator();
        let (alice, _tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        coordinator.boot_player("alice", "table is full").unwrap();

        assert!(session_messages(&alice).contains(&ServerMessage::Booted {
            reason: "table is full".to_string()
        }));
        assert!(!alice.is_alive());
        assert!(coordinator.players().is_empty());
        assert!(matches!(
            coordinator.boot_player("alice", "again"),
            Err(CoordinatorError::UnknownPlayer(_))
        ));
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_session_payload_reaches_handler() {
        // Arrange
        let coordinator = coordinator();
        let mut handler = MockSessionHandler::new();
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);
        handler
            .expect_handle_message()
            .withf(|id, player, payload| {
                id == "10.0.0.1-0" && player.name == "Alice" && payload == b"roll 1d20"
            })
            .times(1)
            .returning(move |_, _, _| {
                done_tx.lock().unwrap().send(()).ok();
            });
        coordinator.set_session_handler(Arc::new(handler));
        let (_alice, tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        // Act
        tx.send(encode_message(&ClientMessage::Session(b"roll 1d20".to_vec())).unwrap())
            .unwrap();

        // Assert
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_requested_asset_is_announced_then_streamed_on_image_channel() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("tabletop-coord-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("goblin.png");
        std::fs::write(&path, b"0123456789").unwrap();
        let asset = AssetId::new("abc123");
        let header = AssetHeader::new(asset.clone(), "goblin.png", 10);

        let mut store = MockAssetStore::new();
        let (h, p) = (header.clone(), path.clone());
        store
            .expect_locate()
            .with(eq(asset.clone()))
            .returning(move |_| Some(AssetProducer::new(h.clone(), p.clone())));

        let coordinator = coordinator();
        coordinator.set_asset_store(Arc::new(store));
        let (alice, tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        // Act
        tx.send(encode_message(&ClientMessage::RequestAsset(asset)).unwrap())
            .unwrap();

        // Assert: header first, then 4 + 4 + 2 bytes, all on the image channel.
        let image = || -> Vec<ServerMessage> {
            alice
                .sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == Channel::Image)
                .map(|(_, p)| decode_message(p).unwrap())
                .collect()
        };
        assert!(wait_until(|| image().len() == 4));
        let messages = image();
        assert_eq!(messages[0], ServerMessage::StartAssetTransfer(header));
        let data: Vec<u8> = messages[1..]
            .iter()
            .flat_map(|m| match m {
                ServerMessage::UpdateAssetTransfer(chunk) => chunk.data.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(data, b"0123456789");

        coordinator.stop().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ids_differing_only_in_case_are_separate_sessions() {
        // Arrange: relay peer names are used verbatim as connection ids.
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::default());
        coordinator.add_observer(recorder.clone());
        let (_alice, alice_tx) = join(&coordinator, "peer-a", "Alice", "correct");
        let (bob, _bob_tx) = join(&coordinator, "PEER-A", "Bob", "correct");

        // Act
        let players = coordinator.players();

        // Assert
        assert_eq!(players.len(), 2);
        assert_eq!(coordinator.connection_count(), 2);
        assert_eq!(coordinator.connection_id_of("alice").as_deref(), Some("peer-a"));

        drop(alice_tx);
        assert!(wait_until(|| !coordinator.is_player_connected("alice")));
        let alice = Player::new("Alice", Role::Player, AuthMethod::Password);
        assert!(session_messages(&bob).contains(&ServerMessage::PlayerDisconnected(alice)));
        assert!(wait_until(|| recorder
            .events
            .lock()
            .unwrap()
            .contains(&"-Alice peer-a".to_string())));
        assert!(coordinator.is_player_connected("bob"));
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_handshake_finishing_after_stop_is_not_admitted() {
        // Arrange: the handshake is waiting for its request when the server stops.
        let coordinator = coordinator();
        let connection = Arc::new(FakeConnection::new("10.0.0.1-0"));
        let (tx, rx) = mpsc::channel();
        let admitting = {
            let coordinator = Arc::clone(&coordinator);
            let accepted = AcceptedConnection {
                connection: connection.clone(),
                inbound: rx,
            };
            std::thread::spawn(move || coordinator.admit(accepted))
        };
        std::thread::sleep(Duration::from_millis(50));

        // Act
        coordinator.stop().unwrap();
        let request = HandshakeMessage::Request(HandshakeRequest::new(
            "Alice",
            "correct",
            Role::Player,
            "1.0",
        ));
        tx.send(encode_message(&request).unwrap()).ok();
        admitting.join().unwrap();

        // Assert
        assert_eq!(coordinator.connection_count(), 0);
        assert!(coordinator.players().is_empty());
        assert!(!connection.is_alive());
        let admitted = connection.sent_payloads().iter().any(|p| {
            matches!(decode_message(p), Ok(HandshakeMessage::Response(r)) if r.is_ok())
        });
        assert!(!admitted);
    }

    #[test]
    fn test_asset_pump_waits_while_image_queue_is_full() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("tabletop-coord-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dragon.png");
        std::fs::write(&path, b"0123456789abcdef").unwrap();
        let header = AssetHeader::new(AssetId::new("d1"), "dragon.png", 16);

        let coordinator = coordinator();
        let (alice, _tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");
        let chunks = || {
            alice
                .sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, p)| {
                    *c == Channel::Image
                        && matches!(decode_message(p), Ok(ServerMessage::UpdateAssetTransfer(_)))
                })
                .count()
        };
        alice.image_backlog.store(2, Ordering::SeqCst);

        // Act
        coordinator
            .send_asset("10.0.0.1-0", AssetProducer::new(header, path))
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        // Assert: nothing moves while the queue is at its limit.
        assert_eq!(chunks(), 0);

        alice.image_backlog.store(0, Ordering::SeqCst);
        assert!(wait_until(|| chunks() == 4));

        coordinator.stop().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stop_releases_everyone_and_notifies_observers() {
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::default());
        coordinator.add_observer(recorder.clone());
        let (alice, _tx) = join(&coordinator, "10.0.0.1-0", "Alice", "correct");

        coordinator.stop().unwrap();

        assert!(!alice.is_alive());
        assert_eq!(coordinator.connection_count(), 0);
        assert!(coordinator.players().is_empty());
        assert!(recorder
            .events
            .lock()
            .unwrap()
            .contains(&"-Alice 10.0.0.1-0".to_string()));
    }
}
