//! tabletop-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! A client connects to the session server, proves who it is with a
//! password or a key pair, and then mostly listens: the server tells it who
//! else is at the table, hands it the campaign and the session policy, and
//! streams the images it asks for in small chunks on a channel of their own.

pub mod application;
pub mod error;
pub mod infrastructure;

pub use error::ClientError;
