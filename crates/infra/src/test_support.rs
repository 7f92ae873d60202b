//! Test doubles shared by unit and integration tests.

use std::path::Path;

use async_trait::async_trait;

use crate::separation::{ACCOMPANIMENT, SeparatedStems, SeparationError, SeparationParams, Separator};

/// Writes a deterministic accompaniment derived from the input bytes.
///
/// Inputs equal to [`FakeSeparator::CORRUPT`] fail like an undecodable file.
#[derive(Debug, Default)]
pub struct FakeSeparator;

impl FakeSeparator {
    pub const CORRUPT: &'static [u8] = b"corrupt";

    pub fn accompaniment_of(input: &[u8]) -> Vec<u8> {
        let mut out = b"accompaniment:".to_vec();
        out.extend_from_slice(input);
        out
    }
}

#[async_trait]
impl Separator for FakeSeparator {
    async fn separate(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &SeparationParams,
    ) -> Result<SeparatedStems, SeparationError> {
        let bytes = tokio::fs::read(input).await?;
        if bytes == Self::CORRUPT {
            return Err(SeparationError::ExitStatus {
                code: Some(1),
                stderr: "could not decode input".to_string(),
            });
        }

        tokio::fs::create_dir_all(output_dir).await?;
        let path = params.stem_path(output_dir, input, ACCOMPANIMENT);
        tokio::fs::write(&path, Self::accompaniment_of(&bytes)).await?;

        let mut stems = SeparatedStems::new();
        stems.insert(ACCOMPANIMENT, path);
        Ok(stems)
    }
}

#[derive(Debug, Default)]
pub struct PanickingSeparator;

#[async_trait]
impl Separator for PanickingSeparator {
    async fn separate(
        &self,
        _input: &Path,
        _output_dir: &Path,
        _params: &SeparationParams,
    ) -> Result<SeparatedStems, SeparationError> {
        panic!("separator crashed");
    }
}
