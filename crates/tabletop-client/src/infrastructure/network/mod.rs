//! Blocking session client.
//!
//! Architecture:
//! - [`SessionClient::connect`] opens the TCP stream and runs the handshake
//!   on the calling thread.
//! - A receive thread decodes [`ServerMessage`]s, keeps the [`SessionView`]
//!   current and feeds asset chunks into an [`AssetTransferManager`].
//! - A heartbeat thread sends [`ClientMessage::Heartbeat`] so the server's
//!   read timeout never fires on an idle client.
//! - Everything worth reacting to is reported as a [`ClientEvent`] on the
//!   channel returned by `connect`; [`ClientEvent::Disconnected`] is always
//!   the last event.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tabletop_core::cipher::KeyPair;
use tabletop_core::protocol::HandshakeRequest;
use tabletop_core::transfer::{TransferEvent, TransferListener};
use tabletop_core::{
    decode_message, encode_message, read_frame, write_frame, AssetConsumer, AssetId,
    AssetTransferManager, ClientMessage, Player, Role, ServerMessage, ServerPolicy,
};
use tracing::{debug, info, warn};

use crate::application::handshake::{client_handshake, key_request};
use crate::error::ClientError;

/// Connection settings for one session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub name: String,
    /// Ignored when logging in with a key pair.
    pub password: String,
    pub role: Role,
    pub version: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    /// Limit for the whole handshake, challenge included.
    pub handshake_timeout: Duration,
    /// Downloaded assets are written here, named by their id.
    pub download_dir: PathBuf,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr, name: impl Into<String>, role: Role) -> Self {
        Self {
            server_addr,
            name: name.into(),
            password: String::new(),
            role,
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            download_dir: std::env::temp_dir().join("tabletop-assets"),
        }
    }
}

/// Something the session reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    PlayerJoined(Player),
    PlayerLeft(Player),
    CampaignChanged(Vec<u8>),
    PolicyChanged(ServerPolicy),
    AssetProgress {
        id: AssetId,
        received: u64,
        total: u64,
    },
    AssetReady {
        id: AssetId,
        name: String,
        path: PathBuf,
    },
    /// The GM removed us; the connection closes right after.
    Booted { reason: String },
    Disconnected,
}

/// What the client currently knows about the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    /// In the order the server announced them.
    pub players: Vec<Player>,
    pub campaign: Vec<u8>,
    pub policy: ServerPolicy,
}

impl SessionView {
    fn apply(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::PlayerConnected(player) => {
                self.players.retain(|p| !p.has_name(&player.name));
                self.players.push(player.clone());
            }
            ServerMessage::PlayerDisconnected(player) => {
                self.players.retain(|p| !p.has_name(&player.name));
            }
            ServerMessage::SetCampaign(snapshot) => self.campaign = snapshot.clone(),
            ServerMessage::UpdatePolicy(policy) => self.policy = policy.clone(),
            _ => {}
        }
    }
}

/// Turns transfer notifications into client events.
struct TransferForwarder(Mutex<Sender<ClientEvent>>);

impl TransferListener for TransferForwarder {
    fn on_transfer_event(&self, event: &TransferEvent) {
        let event = match event.clone() {
            TransferEvent::Progress {
                id,
                received,
                total,
            } => ClientEvent::AssetProgress {
                id,
                received,
                total,
            },
            TransferEvent::Complete { id, name, path } => ClientEvent::AssetReady { id, name, path },
        };
        self.0.lock().unwrap_or_else(|e| e.into_inner()).send(event).ok();
    }
}

/// State shared between the client handle and its receive thread.
struct Shared {
    view: RwLock<SessionView>,
    transfers: AssetTransferManager,
    download_dir: PathBuf,
    connected: AtomicBool,
}

/// An admitted session with the server.
pub struct SessionClient {
    name: String,
    role: Role,
    shared: Arc<Shared>,
    writer: Mutex<TcpStream>,
    /// Dropping the sender wakes the heartbeat thread for good.
    stop_heartbeat: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionClient {
    /// Connects, logs in and starts the background threads.
    ///
    /// With `key_pair` the login proves possession of the key instead of
    /// sending `config.password`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Connect`] if the server cannot be reached.
    /// - [`ClientError::Refused`] if the server turned the login down.
    /// - Any I/O or protocol error raised during the handshake.
    pub fn connect(
        config: ClientConfig,
        key_pair: Option<&KeyPair>,
    ) -> Result<(Self, Receiver<ClientEvent>), ClientError> {
        let mut stream = TcpStream::connect_timeout(&config.server_addr, config.connect_timeout)
            .map_err(|source| ClientError::Connect {
                addr: config.server_addr,
                source,
            })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.handshake_timeout))?;

        let request = match key_pair {
            Some(pair) => key_request(&config.name, config.role, &config.version, pair)?,
            None => HandshakeRequest::new(
                &config.name,
                &config.password,
                config.role,
                &config.version,
            ),
        };
        let response = client_handshake(&mut stream, &request, key_pair)?;
        if !response.is_ok() {
            return Err(ClientError::Refused {
                kind: response.error,
                message: response.message.unwrap_or_default(),
            });
        }
        stream.set_read_timeout(None)?;
        info!(
            "joined {} as {} ({})",
            config.server_addr, config.name, config.role
        );

        let (events_tx, events_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            view: RwLock::new(SessionView {
                policy: response.policy.unwrap_or_default(),
                ..SessionView::default()
            }),
            transfers: AssetTransferManager::new(),
            download_dir: config.download_dir.clone(),
            connected: AtomicBool::new(true),
        });
        shared
            .transfers
            .add_listener(Arc::new(TransferForwarder(Mutex::new(events_tx.clone()))));

        let reader = stream.try_clone()?;
        let heartbeat_writer = stream.try_clone()?;
        let (stop_tx, stop_rx) = mpsc::channel();

        let receive_shared = Arc::clone(&shared);
        let receive = std::thread::Builder::new()
            .name("tabletop-client-receive".to_string())
            .spawn(move || receive_loop(reader, &receive_shared, &events_tx))?;

        let heartbeat_shared = Arc::clone(&shared);
        let interval = config.heartbeat_interval;
        let heartbeat = std::thread::Builder::new()
            .name("tabletop-client-heartbeat".to_string())
            .spawn(move || heartbeat_loop(heartbeat_writer, &heartbeat_shared, &stop_rx, interval))?;

        let client = Self {
            name: config.name,
            role: config.role,
            shared,
            writer: Mutex::new(stream),
            stop_heartbeat: Mutex::new(Some(stop_tx)),
            threads: Mutex::new(vec![receive, heartbeat]),
        };
        Ok((client, events_rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn view(&self) -> SessionView {
        self.shared
            .view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn players(&self) -> Vec<Player> {
        self.view().players
    }

    pub fn policy(&self) -> ServerPolicy {
        self.view().policy
    }

    pub fn is_downloading(&self, id: &AssetId) -> bool {
        self.shared.transfers.is_downloading(id)
    }

    /// Asks the server to stream an asset.  A download already in progress
    /// is not requested twice.
    ///
    /// # Errors
    ///
    /// [`ClientError::Disconnected`] after the session ended, otherwise any
    /// error writing the request.
    pub fn request_asset(&self, id: &AssetId) -> Result<(), ClientError> {
        if self.shared.transfers.is_downloading(id) {
            debug!("asset {id} is already downloading");
            return Ok(());
        }
        self.send(&ClientMessage::RequestAsset(id.clone()))
    }

    /// Sends an application payload to the server's session handler.
    ///
    /// # Errors
    ///
    /// Same as [`request_asset`](Self::request_asset).
    pub fn send_session(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Session(payload))
    }

    fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        let payload = encode_message(message)?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut *writer, &payload)?;
        Ok(())
    }

    /// Closes the connection and waits for the background threads.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.stop_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Err(e) = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown(Shutdown::Both)
        {
            debug!("shutdown after close: {e}");
        }

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for thread in threads {
            if thread.join().is_err() {
                warn!("client thread panicked");
            }
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receive_loop(mut reader: TcpStream, shared: &Shared, events: &Sender<ClientEvent>) {
    loop {
        let payload = match read_frame(&mut reader) {
            Ok(payload) => payload,
            Err(e) => {
                if shared.connected.load(Ordering::SeqCst) {
                    info!("connection to server lost: {e}");
                }
                break;
            }
        };
        let message = match decode_message::<ServerMessage>(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("unreadable server message: {e}");
                continue;
            }
        };
        if !handle_message(message, shared, events) {
            break;
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.transfers.flush();
    events.send(ClientEvent::Disconnected).ok();
}

/// Applies one message.  Returns `false` once the session is over.
fn handle_message(message: ServerMessage, shared: &Shared, events: &Sender<ClientEvent>) -> bool {
    shared
        .view
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .apply(&message);

    let event = match message {
        ServerMessage::PlayerConnected(player) => ClientEvent::PlayerJoined(player),
        ServerMessage::PlayerDisconnected(player) => ClientEvent::PlayerLeft(player),
        ServerMessage::SetCampaign(snapshot) => ClientEvent::CampaignChanged(snapshot),
        ServerMessage::UpdatePolicy(policy) => ClientEvent::PolicyChanged(policy),
        ServerMessage::StartAssetTransfer(header) => {
            if !header.id.is_well_formed() {
                warn!("refusing asset with unusable id {:?}", header.id.as_str());
                return true;
            }
            debug!("receiving asset {} ({} bytes)", header.id, header.size);
            let destination = shared.download_dir.join(header.id.as_str());
            if let Err(e) = std::fs::create_dir_all(&shared.download_dir) {
                warn!("cannot create {}: {e}", shared.download_dir.display());
                return true;
            }
            if let Err(e) = shared
                .transfers
                .add_consumer(AssetConsumer::new(header, destination))
            {
                warn!("cannot start download: {e}");
            }
            return true;
        }
        ServerMessage::UpdateAssetTransfer(chunk) => {
            if let Err(e) = shared.transfers.update(&chunk) {
                warn!("dropping asset chunk: {e}");
            }
            return true;
        }
        ServerMessage::Booted { reason } => {
            info!("removed from the session: {reason}");
            events.send(ClientEvent::Booted { reason }).ok();
            return false;
        }
    };
    events.send(event).ok();
    true
}

fn heartbeat_loop(mut writer: TcpStream, shared: &Shared, stop: &Receiver<()>, interval: Duration) {
    let payload = match encode_message(&ClientMessage::Heartbeat) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("cannot encode heartbeat: {e}");
            return;
        }
    };
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
        if !shared.connected.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = write_frame(&mut writer, &payload) {
            debug!("heartbeat failed: {e}");
            break;
        }
    }
}
