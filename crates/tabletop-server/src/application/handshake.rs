//! Server side of the admission handshake.
//!
//! A freshly accepted connection must send exactly one
//! [`HandshakeMessage::Request`].  It is checked in a fixed order and the
//! first failure wins:
//!
//! 1. **Credential**: the role password, or, when the request names a
//!    public-key fingerprint the server has on file for that player, a signed
//!    challenge proving possession of the private key.
//! 2. **Uniqueness**: no live connection already uses the name (case-insensitive).
//! 3. **Version**: the client version equals the server's, or is listed in
//!    `version_bypass`.
//!
//! A refused connection receives an error [`HandshakeResponse`] carrying a
//! translatable message key.  An accepted one receives nothing from this
//! module: the coordinator sends the OK response once the player is
//! actually registered (see [`ServerHandshake::accept`]).

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tabletop_core::cipher::asymmetric::{
    decode_public_key_text, public_key_fingerprint, verify_signature,
};
use tabletop_core::cipher::symmetric::create_salt;
use tabletop_core::cipher::{CipherError, SaltedMac, VerifyingKey};
use tabletop_core::domain::player::AuthMethod;
use tabletop_core::protocol::{
    decode_message, encode_message, Channel, HandshakeErrorKind, HandshakeMessage,
    HandshakeRequest, HandshakeResponse, ProtocolError,
};
use tabletop_core::{Player, Role, ServerPolicy};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::network::{Connection, ConnectionError};

/// Size of the random challenge a key-authenticating client must sign.
pub const CHALLENGE_SIZE: usize = 32;

/// Why a handshake did not produce a player.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The request was read and refused; the client has been told why.
    #[error("handshake rejected: {}", .0.message_key())]
    Rejected(HandshakeErrorKind),

    #[error("no handshake received within {0:?}")]
    Timeout(Duration),

    #[error("connection closed during handshake")]
    Disconnected,

    #[error("server stopped before the player could be admitted")]
    Stopped,

    #[error("cannot encode handshake message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("cannot send handshake message: {0}")]
    Send(#[from] ConnectionError),
}

/// A public key a player may log in with instead of a password.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub role: Role,
    pub fingerprint: String,
    pub key: VerifyingKey,
}

/// The server's credentials and version rules.
///
/// Passwords are turned into salted MACs on the way in; the plaintext is
/// never stored.
#[derive(Debug, Clone)]
pub struct HandshakeValidator {
    gm_mac: Option<SaltedMac>,
    player_mac: Option<SaltedMac>,
    version: String,
    version_bypass: Vec<String>,
    authorized_keys: HashMap<String, Vec<AuthorizedKey>>,
}

impl HandshakeValidator {
    /// A validator for `version` with no passwords and no keys: nobody can log in yet.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            gm_mac: None,
            player_mac: None,
            version: version.into(),
            version_bypass: Vec::new(),
            authorized_keys: HashMap::new(),
        }
    }

    /// Sets the password for `role`.  An empty password disables password
    /// login for that role.
    pub fn with_password(mut self, role: Role, password: &str) -> Self {
        let mac = (!password.is_empty()).then(|| SaltedMac::from_password(password));
        match role {
            Role::Gm => self.gm_mac = mac,
            Role::Player => self.player_mac = mac,
        }
        self
    }

    /// Client versions accepted in addition to the server's own.
    pub fn with_version_bypass(mut self, versions: Vec<String>) -> Self {
        self.version_bypass = versions;
        self
    }

    /// Lets `name` log in as `role` by proving possession of the key in `public_key_text`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::KeyEncoding`] if the text is not a public key.
    pub fn authorize_key(
        &mut self,
        name: &str,
        role: Role,
        public_key_text: &str,
    ) -> Result<String, CipherError> {
        let key = decode_public_key_text(public_key_text)?;
        let fingerprint = public_key_fingerprint(public_key_text)?;
        self.authorized_keys
            .entry(name.to_lowercase())
            .or_default()
            .push(AuthorizedKey {
                role,
                fingerprint: fingerprint.clone(),
                key,
            });
        Ok(fingerprint)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn password_matches(&self, role: Role, password: &str) -> bool {
        let mac = match role {
            Role::Gm => self.gm_mac.as_ref(),
            Role::Player => self.player_mac.as_ref(),
        };
        mac.is_some_and(|mac| mac.matches(password))
    }

    pub fn key_for(&self, name: &str, fingerprint: &str) -> Option<&AuthorizedKey> {
        self.authorized_keys
            .get(&name.to_lowercase())?
            .iter()
            .find(|k| k.fingerprint.eq_ignore_ascii_case(fingerprint))
    }

    pub fn version_accepted(&self, version: &str) -> bool {
        version == self.version || self.version_bypass.iter().any(|v| v == version)
    }
}

/// One handshake in progress on one connection.
pub struct ServerHandshake<'a> {
    connection: &'a dyn Connection,
    inbound: &'a Receiver<Vec<u8>>,
    deadline: Instant,
    timeout: Duration,
}

impl<'a> ServerHandshake<'a> {
    /// Starts the clock: everything, the challenge round included, must
    /// finish within `timeout`.
    pub fn new(
        connection: &'a dyn Connection,
        inbound: &'a Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            inbound,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// Reads the request and checks it.
    ///
    /// `is_connected` answers whether a live player already has a name.
    /// On refusal the error response has already been sent.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Rejected`] for a refused request, otherwise the
    /// transport problem that stopped the exchange.
    pub fn authenticate(
        &self,
        validator: &HandshakeValidator,
        is_connected: &dyn Fn(&str) -> bool,
    ) -> Result<Player, HandshakeError> {
        let request = match self.receive()? {
            HandshakeMessage::Request(request) if !request.name.trim().is_empty() => request,
            _ => return Err(self.reject(HandshakeErrorKind::InvalidHandshake)),
        };
        debug!(
            "handshake from {} as {} ({}), version {}",
            self.connection.id(),
            request.name,
            request.role,
            request.version
        );

        let auth = self.check_credential(&request, validator)?;

        if is_connected(&request.name) {
            return Err(self.reject(HandshakeErrorKind::PlayerAlreadyConnected));
        }
        if !validator.version_accepted(&request.version) {
            return Err(self.reject(HandshakeErrorKind::WrongVersion));
        }

        Ok(Player::new(request.name, request.role, auth))
    }

    /// Sends the OK response with the session policy.
    ///
    /// # Errors
    ///
    /// Returns an error when the response cannot be encoded or sent.
    pub fn accept(&self, policy: &ServerPolicy) -> Result<(), HandshakeError> {
        self.respond(HandshakeMessage::Response(HandshakeResponse::ok(
            policy.clone(),
        )))
    }

    /// Sends an error response and returns the matching error.
    pub fn reject(&self, kind: HandshakeErrorKind) -> HandshakeError {
        warn!(
            "refusing connection {}: {}",
            self.connection.id(),
            kind.message_key()
        );
        if let Err(e) = self.respond(HandshakeMessage::Response(HandshakeResponse::error(kind))) {
            debug!("could not deliver refusal to {}: {e}", self.connection.id());
        }
        HandshakeError::Rejected(kind)
    }

    fn check_credential(
        &self,
        request: &HandshakeRequest,
        validator: &HandshakeValidator,
    ) -> Result<AuthMethod, HandshakeError> {
        let Some(fingerprint) = request.public_key_fingerprint.as_deref() else {
            if validator.password_matches(request.role, &request.password) {
                return Ok(AuthMethod::Password);
            }
            return Err(self.reject(HandshakeErrorKind::InvalidPassword));
        };

        let key = match validator.key_for(&request.name, fingerprint) {
            Some(key) if key.role == request.role => key,
            _ => return Err(self.reject(HandshakeErrorKind::InvalidPublicKey)),
        };

        let nonce = create_salt(CHALLENGE_SIZE);
        self.respond(HandshakeMessage::Challenge {
            nonce: nonce.clone(),
        })?;
        let signature = match self.receive()? {
            HandshakeMessage::ChallengeResponse { signature } => signature,
            _ => return Err(self.reject(HandshakeErrorKind::InvalidHandshake)),
        };
        if !verify_signature(&key.key, &nonce, &signature) {
            return Err(self.reject(HandshakeErrorKind::InvalidPublicKey));
        }

        info!("{} proved possession of key {}", request.name, key.fingerprint);
        Ok(AuthMethod::PublicKey {
            fingerprint: key.fingerprint.clone(),
        })
    }

    fn receive(&self) -> Result<HandshakeMessage, HandshakeError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let payload = self.inbound.recv_timeout(remaining).map_err(|e| match e {
            RecvTimeoutError::Timeout => HandshakeError::Timeout(self.timeout),
            RecvTimeoutError::Disconnected => HandshakeError::Disconnected,
        })?;
        decode_message(&payload).map_err(|e| {
            debug!("unreadable handshake from {}: {e}", self.connection.id());
            self.reject(HandshakeErrorKind::InvalidHandshake)
        })
    }

    fn respond(&self, message: HandshakeMessage) -> Result<(), HandshakeError> {
        let payload = encode_message(&message)?;
        self.connection.send(Channel::Default, &payload)?;
        Ok(())
    }
}
