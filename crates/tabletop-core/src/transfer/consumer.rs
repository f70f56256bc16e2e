//! Receive side of one asset transfer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::TransferError;
use crate::domain::asset::{AssetChunk, AssetHeader, AssetId};

/// Reassembles one announced asset into a destination file.
///
/// The first chunk truncates the destination; later chunks append to it.
#[derive(Debug)]
pub struct AssetConsumer {
    header: AssetHeader,
    destination: PathBuf,
    received: u64,
}

impl AssetConsumer {
    pub fn new(header: AssetHeader, destination: impl Into<PathBuf>) -> Self {
        Self {
            header,
            destination: destination.into(),
            received: 0,
        }
    }

    pub fn header(&self) -> &AssetHeader {
        &self.header
    }

    pub fn id(&self) -> &AssetId {
        &self.header.id
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// True exactly when the declared number of bytes has arrived.
    pub fn is_complete(&self) -> bool {
        self.received == self.header.size
    }

    /// Writes `chunk` to the destination.
    ///
    /// # Errors
    ///
    /// - [`TransferError::MismatchedChunk`] if the chunk belongs to another asset.
    /// - [`TransferError::Overflow`] if it would exceed the declared size; nothing is written.
    /// - [`TransferError::Io`] if the destination cannot be written.
    pub fn update(&mut self, chunk: &AssetChunk) -> Result<(), TransferError> {
        if chunk.id != self.header.id {
            return Err(TransferError::MismatchedChunk {
                expected: self.header.id.clone(),
                got: chunk.id.clone(),
            });
        }
        let after = self.received + chunk.len() as u64;
        if after > self.header.size {
            return Err(TransferError::Overflow {
                id: self.header.id.clone(),
                received: after,
                size: self.header.size,
            });
        }

        self.write(&chunk.data)
            .map_err(|source| TransferError::Io {
                id: self.header.id.clone(),
                source,
            })?;
        self.received = after;
        Ok(())
    }

    fn write(&self, data: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.destination.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let first = self.received == 0;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(first)
            .append(!first)
            .open(&self.destination)?;
        file.write_all(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tabletop_dst_{}", Uuid::new_v4()))
            .join("asset.bin")
    }

    fn chunk(id: &AssetId, data: &[u8]) -> AssetChunk {
        AssetChunk {
            id: id.clone(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_complete_exactly_at_declared_size() {
        // Arrange
        let id = AssetId::new("abc");
        let path = temp_path();
        let mut consumer = AssetConsumer::new(AssetHeader::new(id.clone(), "map.png", 6), &path);

        // Act / Assert
        assert!(!consumer.is_complete());
        consumer.update(&chunk(&id, b"abc")).unwrap();
        assert!(!consumer.is_complete());
        consumer.update(&chunk(&id, b"def")).unwrap();
        assert!(consumer.is_complete());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_first_chunk_truncates_stale_destination() {
        let id = AssetId::new("abc");
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"old contents that are longer").unwrap();
        let mut consumer = AssetConsumer::new(AssetHeader::new(id.clone(), "a", 2), &path);

        consumer.update(&chunk(&id, b"hi")).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hi");
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_overflowing_chunk_is_rejected_and_not_written() {
        let id = AssetId::new("abc");
        let path = temp_path();
        let mut consumer = AssetConsumer::new(AssetHeader::new(id.clone(), "a", 3), &path);
        consumer.update(&chunk(&id, b"ab")).unwrap();

        let result = consumer.update(&chunk(&id, b"cd"));

        assert!(matches!(result, Err(TransferError::Overflow { .. })));
        assert_eq!(consumer.received(), 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"ab");
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_chunk_for_other_asset_is_rejected() {
        let mut consumer =
            AssetConsumer::new(AssetHeader::new(AssetId::new("a"), "a", 3), temp_path());
        let result = consumer.update(&chunk(&AssetId::new("b"), b"x"));
        assert!(matches!(result, Err(TransferError::MismatchedChunk { .. })));
    }

    #[test]
    fn test_zero_size_asset_is_complete_without_chunks() {
        let consumer = AssetConsumer::new(AssetHeader::new(AssetId::new("e"), "e", 0), temp_path());
        assert!(consumer.is_complete());
    }
}
