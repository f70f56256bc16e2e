//! The capability shared by every way of accepting connections.
//!
//! A transport accepts raw connections and hands each one to its
//! [`TransportHandler`] *before* any authentication happens.  Which
//! transport a server uses is decided when it is constructed; the
//! coordinator only ever sees `Arc<dyn ServerTransport>`.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use super::connection::AcceptedConnection;

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called twice.
    #[error("transport already started")]
    AlreadyStarted,

    /// `start` was called before `on_accepted`.
    #[error("no accept handler registered")]
    NoHandler,

    /// The signaling service refused us or sent something unreadable.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The signaling service stayed unreachable for every allowed attempt.
    #[error("signaling service unreachable after {attempts} attempt(s)")]
    RetriesExhausted { attempts: u32 },

    /// No tokio runtime was available to drive the transport.
    #[error("runtime unavailable: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives what a transport produces.
pub trait TransportHandler: Send + Sync {
    /// Called once per accepted connection, on a thread the transport owns.
    /// Implementations should return promptly.
    fn connection_accepted(&self, accepted: AcceptedConnection);

    /// Called when the transport gives up for good, e.g. after exhausting
    /// its reconnection attempts.
    fn transport_failed(&self, error: &TransportError) {
        error!("transport failed: {error}");
    }
}

/// Something that accepts connections: a socket listener or a relay.
pub trait ServerTransport: Send + Sync {
    /// Sets the handler accepted connections are delivered to.
    fn on_accepted(&self, handler: Arc<dyn TransportHandler>);

    /// Begins accepting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transport cannot begin, e.g. the
    /// port is taken or no handler is set.
    fn start(&self) -> Result<(), TransportError>;

    /// Stops accepting and releases the listener.  Errors raised while
    /// stopping are expected and suppressed.
    fn close(&self);

    /// Human-readable description for logs, e.g. `tcp://0.0.0.0:51234`.
    fn describe(&self) -> String;
}
