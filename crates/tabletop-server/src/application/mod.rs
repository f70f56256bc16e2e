//! Application layer of the session server.
//!
//! - **`handshake`** – Admits or refuses one freshly accepted connection:
//!   reads its credentials, checks them in a fixed order and answers.
//!
//! - **`coordinator`** – Wires transports, handshake, registry and asset
//!   transfer together and owns the session's shared state (players,
//!   campaign snapshot, policy).
//!
//! Both depend only on the [`Connection`](crate::infrastructure::network::Connection)
//! and [`ServerTransport`](crate::infrastructure::network::ServerTransport)
//! traits, never on a concrete socket type.

pub mod coordinator;
pub mod handshake;
