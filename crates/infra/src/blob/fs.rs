//! Filesystem blob store: `<root>/<bucket>/<key>`.
//!
//! Writes go to a temporary file in the destination directory and are renamed into
//! place, so readers never observe a partially written object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::instrument;

use karaoke_core::BlobLocation;

use super::{BlobError, BlobStore};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of an object. Key segments are validated by [`BlobLocation`],
    /// so the result always stays under the root.
    pub fn path_for(&self, location: &BlobLocation) -> PathBuf {
        location
            .key()
            .split('/')
            .fold(self.root.join(location.bucket()), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self), fields(location = %location), err)]
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        match tokio::fs::read(self.path_for(location)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(location.clone())),
            Err(e) => Err(BlobError::io(location, e)),
        }
    }

    #[instrument(skip(self, bytes), fields(location = %location, size = bytes.len()), err)]
    async fn put(&self, location: &BlobLocation, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(location);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BlobError::io(location, e))?;

        // tempfile's API is blocking; keep it off the async workers.
        let location_text = location.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;

            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| BlobError::Backend(format!("write task failed: {e}")))?
        .map_err(|e| BlobError::io(location_text, e))
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool, BlobError> {
        tokio::fs::try_exists(self.path_for(location))
            .await
            .map_err(|e| BlobError::io(location, e))
    }
}
