//! Network infrastructure for the session server.
//!
//! # Sub-modules
//!
//! - **`connection`** – The [`Connection`] trait every transport produces,
//!   plus the per-channel outbound queue socket connections write from.
//!
//! - **`registry`** – [`ConnectionRegistry`]: the set of admitted
//!   connections, targeted and broadcast sends, and reaping of connections
//!   that died without a clean close.
//!
//! - **`transport`** – The [`ServerTransport`] capability shared by both
//!   transports and the handler they report accepted connections to.
//!
//! - **`socket`** – Direct TCP transport: one accept thread per listener,
//!   one reader and one writer thread per connection.
//!
//! - **`relay`** – Relay-brokered transport: a WebSocket client to a
//!   signaling service through which peers offer data channels.

pub mod connection;
pub mod registry;
pub mod relay;
pub mod socket;
pub mod transport;

pub use connection::{AcceptedConnection, Connection, ConnectionError, OutboundQueue};
pub use registry::ConnectionRegistry;
pub use relay::{RelayConfig, RelayTransport};
pub use socket::{DirectSocketTransport, SocketConfig, SocketConnection};
pub use transport::{ServerTransport, TransportError, TransportHandler};
