//! Errors surfaced by the client library.

use std::net::SocketAddr;

use tabletop_core::cipher::CipherError;
use tabletop_core::protocol::HandshakeErrorKind;
use tabletop_core::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("key error: {0}")]
    Cipher(#[from] CipherError),

    /// The server answered the handshake with an error.  `message` is the
    /// translation key it sent.
    #[error("server refused the connection: {message}")]
    Refused {
        kind: Option<HandshakeErrorKind>,
        message: String,
    },

    /// The server challenged us but no key pair was supplied.
    #[error("server requested a key signature but no key pair is loaded")]
    NoKeyPair,

    #[error("unexpected handshake message: {0}")]
    UnexpectedMessage(String),

    #[error("not connected")]
    Disconnected,
}
