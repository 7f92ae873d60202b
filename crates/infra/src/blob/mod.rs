//! Blob storage addressed by `s3://bucket/key` locators.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryBlobStore`]: a map of byte vectors (tests/dev).
//! - [`FsBlobStore`]: one directory per bucket under a root directory.
//!
//! [`credentials`] issues and verifies the scoped, time-limited tokens clients use
//! to upload an input file directly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use karaoke_core::BlobLocation;

pub mod credentials;
pub mod fs;
pub mod in_memory;

pub use credentials::{CredentialError, UploadClaims, UploadCredential, UploadSigner};
pub use fs::FsBlobStore;
pub use in_memory::InMemoryBlobStore;

/// Blob store error.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(BlobLocation),
    #[error("blob I/O error at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob backend error: {0}")]
    Backend(String),
}

impl BlobError {
    pub fn io(location: impl ToString, source: std::io::Error) -> Self {
        Self::Io {
            location: location.to_string(),
            source,
        }
    }
}

/// Opaque get/put object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError>;

    /// Write (or overwrite) an object.
    async fn put(&self, location: &BlobLocation, bytes: Vec<u8>) -> Result<(), BlobError>;

    async fn exists(&self, location: &BlobLocation) -> Result<bool, BlobError>;

    /// Copy an object into a local file.
    async fn download_to(&self, location: &BlobLocation, path: &Path) -> Result<(), BlobError> {
        let bytes = self.get(location).await?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| BlobError::io(path.display(), e))
    }

    /// Store a local file as an object.
    async fn upload_from(&self, path: &Path, location: &BlobLocation) -> Result<(), BlobError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BlobError::io(path.display(), e))?;
        self.put(location, bytes).await
    }
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        (**self).get(location).await
    }

    async fn put(&self, location: &BlobLocation, bytes: Vec<u8>) -> Result<(), BlobError> {
        (**self).put(location, bytes).await
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool, BlobError> {
        (**self).exists(location).await
    }

    async fn download_to(&self, location: &BlobLocation, path: &Path) -> Result<(), BlobError> {
        (**self).download_to(location, path).await
    }

    async fn upload_from(&self, path: &Path, location: &BlobLocation) -> Result<(), BlobError> {
        (**self).upload_from(path, location).await
    }
}
