//! Content-addressed binary assets and the chunks they travel in.

use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Content hash identifying an asset.
///
/// Two assets with identical bytes share an id, so a client that already
/// holds an asset never needs to download it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    /// Wraps an existing hash string (e.g. one received over the wire).
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Computes the id of `bytes` as a lowercase hex MD5 digest.
    pub fn for_content(bytes: &[u8]) -> Self {
        Self(hex_digest(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is safe to use as a file name: non-empty ASCII
    /// letters and digits only, so no separators, dots or drive prefixes.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex MD5 digest of `bytes`.
pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    Md5::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Announces an asset before its chunks start arriving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetHeader {
    pub id: AssetId,
    pub name: String,
    /// Total size in bytes; a consumer is complete once it has received exactly this many.
    pub size: u64,
}

impl AssetHeader {
    pub fn new(id: AssetId, name: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            name: name.into(),
            size,
        }
    }
}

/// One slice of an asset's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetChunk {
    pub id: AssetId,
    pub data: Vec<u8>,
}

impl AssetChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
