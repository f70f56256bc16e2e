//! Infrastructure layer of the session server.
//!
//! Contains the OS-facing adapters: socket and relay transports, the
//! connection registry, and TOML configuration storage.

pub mod network;
pub mod storage;
