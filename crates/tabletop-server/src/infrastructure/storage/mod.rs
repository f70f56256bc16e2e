//! Storage infrastructure: configuration file persistence and the asset
//! directory served to clients.
//!
//! - **`config`** – Reads and writes `server.toml` and derives the handshake,
//!   coordinator and transport settings from it.
//! - **`assets`** – [`DirectoryAssetStore`](assets::DirectoryAssetStore),
//!   which resolves requested asset ids to files named by their content hash.

pub mod assets;
pub mod config;
