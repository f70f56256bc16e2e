//! Application layer of the client.
//!
//! - **`handshake`** – The client half of the admission exchange: send the
//!   request, sign a challenge if the server sends one, return the verdict.

pub mod handshake;
