//! Chunked asset transfer.
//!
//! - [`AssetProducer`] slices one source file into chunks on demand.
//! - [`AssetConsumer`] appends arriving chunks to a destination file.
//! - [`AssetTransferManager`] holds every producer and consumer for one
//!   connection, interleaves producers round-robin and routes chunks to
//!   their consumers.
//!
//! Scheduling is left to the caller: the server polls each manager for its
//! next chunk, and the client feeds arriving chunks into
//! [`AssetTransferManager::update`].

pub mod consumer;
pub mod manager;
pub mod producer;

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::asset::AssetId;

pub use consumer::AssetConsumer;
pub use manager::{AssetTransferManager, TransferListener};
pub use producer::AssetProducer;

/// Errors raised by producers, consumers and the manager.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A consumer for this asset is already registered on this manager.
    #[error("a download of asset {0} is already registered")]
    DuplicateConsumer(AssetId),

    /// A chunk arrived for an asset whose header was never announced.
    #[error("received a chunk for unannounced asset {0}")]
    UnknownAsset(AssetId),

    /// A chunk was routed to the consumer of a different asset.
    #[error("chunk for asset {got} delivered to consumer of {expected}")]
    MismatchedChunk { expected: AssetId, got: AssetId },

    /// More bytes arrived than the header declared.
    #[error("asset {id} overflow: {received} bytes received, {size} declared")]
    Overflow {
        id: AssetId,
        received: u64,
        size: u64,
    },

    /// Reading the source or writing the destination failed.
    #[error("I/O error transferring asset {id}: {source}")]
    Io {
        id: AssetId,
        #[source]
        source: std::io::Error,
    },
}

/// Progress notifications delivered to [`TransferListener`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        id: AssetId,
        received: u64,
        total: u64,
    },
    Complete {
        id: AssetId,
        name: String,
        path: PathBuf,
    },
}
