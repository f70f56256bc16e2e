//! Send side of one asset transfer.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::domain::asset::{AssetChunk, AssetHeader, AssetId};

/// Streams one source file to one connection.
///
/// The file is reopened and seeked for every chunk instead of being held
/// open, which keeps descriptor usage bounded no matter how many transfers
/// are queued.
#[derive(Debug)]
pub struct AssetProducer {
    header: AssetHeader,
    source: PathBuf,
    offset: u64,
}

impl AssetProducer {
    /// Streams `source`, trusting `header.size` as its length.
    pub fn new(header: AssetHeader, source: impl Into<PathBuf>) -> Self {
        Self {
            header,
            source: source.into(),
            offset: 0,
        }
    }

    /// Builds the header from the file itself: content hash, file name and length.
    ///
    /// # Errors
    ///
    /// Propagates any error reading `path`.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = AssetHeader::new(AssetId::for_content(&bytes), name, bytes.len() as u64);
        Ok(Self::new(header, path))
    }

    pub fn header(&self) -> &AssetHeader {
        &self.header
    }

    pub fn id(&self) -> &AssetId {
        &self.header.id
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.header.size
    }

    /// Returns the next `min(max_size, remaining)` bytes and advances the offset.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidInput`] for a zero `max_size`, and
    /// propagates open/seek/read failures, including
    /// [`io::ErrorKind::UnexpectedEof`] when the file is shorter than its header.
    pub fn next_chunk(&mut self, max_size: usize) -> io::Result<AssetChunk> {
        if max_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk size must be positive",
            ));
        }
        let remaining = self.header.size.saturating_sub(self.offset);
        let len = remaining.min(max_size as u64) as usize;

        let mut file = File::open(&self.source)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;

        self.offset += len as u64;
        Ok(AssetChunk {
            id: self.header.id.clone(),
            data,
        })
    }
}
