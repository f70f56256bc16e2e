//! Typed messages exchanged between the server and its clients.
//!
//! Three families travel over a connection:
//!
//! - [`HandshakeMessage`] – only during admission, before the connection is
//!   registered for broadcasts.
//! - [`ServerMessage`] – session traffic from the server to a client.
//! - [`ClientMessage`] – session traffic from a client to the server.
//!
//! All of them are `bincode`-encoded and carried inside a length-prefixed
//! frame (see [`crate::protocol::codec`]).

use serde::{Deserialize, Serialize};

use crate::domain::asset::{AssetChunk, AssetHeader, AssetId};
use crate::domain::player::{Player, Role};
use crate::domain::policy::ServerPolicy;

/// Logical stream a frame is queued on.
///
/// Connections keep one outbound queue per channel and serve them
/// round-robin, so a burst of image chunks cannot delay session messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Default,
    Image,
}

impl Channel {
    /// Every channel, in the order outbound queues are served.
    pub const ALL: [Channel; 2] = [Channel::Default, Channel::Image];

    pub fn index(self) -> usize {
        match self {
            Channel::Default => 0,
            Channel::Image => 1,
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// The credentials a client presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub name: String,
    pub password: String,
    pub role: Role,
    pub version: String,
    /// Set when the client wants to log in by proving possession of a key
    /// pair instead of knowing the role password.
    #[serde(default)]
    pub public_key_fingerprint: Option<String>,
}

impl HandshakeRequest {
    /// A password-based request.
    pub fn new(
        name: impl Into<String>,
        password: impl Into<String>,
        role: Role,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            role,
            version: version.into(),
            public_key_fingerprint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeCode {
    Ok,
    Error,
}

/// Why the server refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeErrorKind {
    InvalidPassword,
    InvalidPublicKey,
    PlayerAlreadyConnected,
    WrongVersion,
    InvalidHandshake,
}

impl HandshakeErrorKind {
    /// Translation key the client looks up to show the refusal to the user.
    pub fn message_key(self) -> &'static str {
        match self {
            HandshakeErrorKind::InvalidPassword => "Handshake.msg.incorrectPassword",
            HandshakeErrorKind::InvalidPublicKey => "Handshake.msg.incorrectPublicKey",
            HandshakeErrorKind::PlayerAlreadyConnected => "Handshake.msg.playerAlreadyConnected",
            HandshakeErrorKind::WrongVersion => "Handshake.msg.wrongVersion",
            HandshakeErrorKind::InvalidHandshake => "Handshake.msg.invalidHandshake",
        }
    }
}

/// The server's verdict on a [`HandshakeRequest`].
///
/// On success `policy` is present and `error`/`message` are absent; on
/// failure it is the other way round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub code: HandshakeCode,
    pub error: Option<HandshakeErrorKind>,
    pub message: Option<String>,
    pub policy: Option<ServerPolicy>,
}

impl HandshakeResponse {
    pub fn ok(policy: ServerPolicy) -> Self {
        Self {
            code: HandshakeCode::Ok,
            error: None,
            message: None,
            policy: Some(policy),
        }
    }

    pub fn error(kind: HandshakeErrorKind) -> Self {
        Self {
            code: HandshakeCode::Error,
            error: Some(kind),
            message: Some(kind.message_key().to_string()),
            policy: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == HandshakeCode::Ok
    }
}

/// Every message that can appear on a connection before admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    Request(HandshakeRequest),
    /// Random bytes the client must sign to prove key possession.
    Challenge { nonce: Vec<u8> },
    ChallengeResponse { signature: Vec<u8> },
    Response(HandshakeResponse),
}

// ── Session traffic ───────────────────────────────────────────────────────────

/// Messages the server sends to admitted clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    PlayerConnected(Player),
    PlayerDisconnected(Player),
    /// Opaque campaign snapshot, delivered to each newly admitted client.
    SetCampaign(Vec<u8>),
    UpdatePolicy(ServerPolicy),
    /// Announces an asset; its chunks follow on [`Channel::Image`].
    StartAssetTransfer(AssetHeader),
    UpdateAssetTransfer(AssetChunk),
    /// The GM removed this client from the session.
    Booted { reason: String },
}

/// Messages admitted clients send to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Heartbeat,
    RequestAsset(AssetId),
    /// Application payload routed to the server's session handler.
    Session(Vec<u8>),
}
