//! Domain entities shared by the server and its clients.
//!
//! Everything in this module is plain data: serialisable with `serde`,
//! comparable, and free of I/O.
//!
//! - **`player`** – who is connected and with which authority.
//! - **`policy`** – the session rules the server hands to every admitted client.
//! - **`asset`** – content-addressed binary blobs and the chunks they travel in.

pub mod asset;
pub mod player;
pub mod policy;
