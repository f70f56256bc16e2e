//! # tabletop-core
//!
//! Shared library for the tabletop session server and its clients.  It holds
//! the wire protocol, the domain entities exchanged during a session, the
//! cipher service used for authentication, and the chunked asset transfer
//! machinery.
//!
//! This crate opens no sockets and spawns no threads.  The server and client
//! crates own all I/O scheduling; everything here is safe to call from any
//! number of threads at once.
//!
//! # Architecture overview (for beginners)
//!
//! A virtual tabletop session has one server and many clients.  The server
//! admits each client through a handshake, then keeps everybody's view of the
//! session in sync by broadcasting messages, and streams large images
//! ("assets") to the clients in small chunks so that a big map never blocks
//! chat or token movement.
//!
//! - **`protocol`** – How bytes travel over the network.  Messages are
//!   `bincode`-encoded and wrapped in a 4-byte length-prefixed frame.
//!
//! - **`domain`** – Players, roles, the server policy and asset descriptors.
//!
//! - **`cipher`** – Password-derived symmetric keys, salted password MACs and
//!   Ed25519 key pairs for possession-based logins.
//!
//! - **`transfer`** – Producers that slice a file into chunks, consumers that
//!   reassemble them, and the per-connection manager that interleaves several
//!   transfers fairly.
//!
//! - **`paths`** – Where configuration, key files and cached assets live.
//!
//! - **`observer`** – A small listener collection that notifies over a
//!   snapshot so listeners may unsubscribe while being notified.

pub mod cipher;
pub mod domain;
pub mod observer;
pub mod paths;
pub mod protocol;
pub mod transfer;

// Re-export the most-used types at the crate root so callers can write
// `tabletop_core::Player` instead of `tabletop_core::domain::player::Player`.
pub use domain::asset::{AssetChunk, AssetHeader, AssetId};
pub use domain::player::{Player, Role};
pub use domain::policy::ServerPolicy;
pub use observer::ObserverList;
pub use protocol::codec::{
    decode_frame, decode_message, encode_frame, encode_message, read_frame, write_frame,
    ProtocolError,
};
pub use protocol::messages::{
    Channel, ClientMessage, HandshakeMessage, HandshakeRequest, HandshakeResponse, ServerMessage,
};
pub use transfer::{
    AssetConsumer, AssetProducer, AssetTransferManager, TransferError, TransferEvent,
};
