//! Content-addressed asset directory.
//!
//! Every asset is a file named by its MD5 content hash.  Display names are
//! remembered for assets imported during this run; files that were already
//! in the directory are announced under their id.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tabletop_core::transfer::AssetProducer;
use tabletop_core::{AssetHeader, AssetId};
use tracing::{debug, info};

use crate::application::coordinator::AssetStore;

/// Serves assets from one directory.
#[derive(Debug)]
pub struct DirectoryAssetStore {
    dir: PathBuf,
    names: RwLock<HashMap<AssetId, String>>,
}

impl DirectoryAssetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            names: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies `source` into the store under its content hash.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors reading `source` or writing the store.
    pub fn import(&self, source: &Path) -> io::Result<AssetHeader> {
        let bytes = fs::read(source)?;
        let id = AssetId::for_content(&bytes);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());

        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(id.as_str());
        if !target.exists() {
            fs::write(&target, &bytes)?;
        }
        self.names
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), name.clone());
        info!("imported asset {name} as {id}");
        Ok(AssetHeader::new(id, name, bytes.len() as u64))
    }

    fn path_for(&self, id: &AssetId) -> Option<PathBuf> {
        id.is_well_formed().then(|| self.dir.join(id.as_str()))
    }
}

impl AssetStore for DirectoryAssetStore {
    fn locate(&self, id: &AssetId) -> Option<AssetProducer> {
        let Some(path) = self.path_for(id) else {
            debug!("rejecting malformed asset id {id:?}");
            return None;
        };
        let metadata = fs::metadata(&path).ok().filter(|m| m.is_file())?;
        let name = self
            .names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string());
        Some(AssetProducer::new(
            AssetHeader::new(id.clone(), name, metadata.len()),
            path,
        ))
    }
}
