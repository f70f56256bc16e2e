//! Infrastructure layer of the client.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `tabletop_core`, but MUST NOT be imported by the `application` layer.
//!
//! - **`network`** – The blocking [`network::SessionClient`]: TCP connection,
//!   receive and heartbeat threads, session view and asset downloads.

pub mod network;
