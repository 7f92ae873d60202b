use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use karaoke_core::BlobLocation;

use super::{BlobError, BlobStore};

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<BlobLocation, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored location, sorted.
    pub fn locations(&self) -> Vec<BlobLocation> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut locations: Vec<_> = objects.keys().cloned().collect();
        locations.sort_by_key(|l| l.to_string());
        locations
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, BlobError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(location)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(location.clone()))
    }

    async fn put(&self, location: &BlobLocation, bytes: Vec<u8>) -> Result<(), BlobError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(location.clone(), bytes);
        Ok(())
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool, BlobError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.contains_key(location))
    }
}
