//! Source separation: input audio file in, named stem files out.
//!
//! The algorithm itself is external. [`Separator`] is the seam; the production
//! implementation is [`CommandSeparator`], which drives a separation CLI as a
//! child process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use karaoke_core::render_template;

pub mod command;

pub use command::CommandSeparator;

/// Stem uploaded as the job output.
pub const ACCOMPANIMENT: &str = "accompaniment";

/// Knobs passed through to the separation tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparationParams {
    /// Stem configuration, e.g. `spleeter:2stems`.
    pub model: String,
    pub max_duration: Duration,
    pub start_offset: Duration,
    pub codec: String,
    pub bitrate: String,
    /// Output file naming, placeholders `{filename}`, `{instrument}`, `{codec}`.
    pub filename_format: String,
    /// Wall-clock limit for one separation.
    pub timeout: Duration,
}

impl Default for SeparationParams {
    fn default() -> Self {
        Self {
            model: "spleeter:2stems".to_string(),
            max_duration: Duration::from_secs(600),
            start_offset: Duration::ZERO,
            codec: "mp3".to_string(),
            bitrate: "128k".to_string(),
            filename_format: "{instrument}.{codec}".to_string(),
            timeout: Duration::from_secs(1800),
        }
    }
}

impl SeparationParams {
    /// Stem names the configured model produces.
    pub fn stem_names(&self) -> &'static [&'static str] {
        stem_names(&self.model)
    }

    /// Where the tool writes `instrument` for `input` under `output_dir`.
    pub fn stem_path(&self, output_dir: &Path, input: &Path, instrument: &str) -> PathBuf {
        let filename = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative = render_template(
            &self.filename_format,
            &[
                ("filename", filename.as_str()),
                ("instrument", instrument),
                ("codec", self.codec.as_str()),
            ],
        );
        output_dir.join(relative)
    }
}

/// Stems produced for one input, keyed by instrument name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeparatedStems {
    stems: BTreeMap<String, PathBuf>,
}

impl SeparatedStems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instrument: impl Into<String>, path: PathBuf) {
        self.stems.insert(instrument.into(), path);
    }

    pub fn get(&self, instrument: &str) -> Option<&Path> {
        self.stems.get(instrument).map(PathBuf::as_path)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.stems.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeparationError {
    #[error("failed to start separator `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("separation timed out after {0:?}")]
    Timeout(Duration),
    #[error("separator exited with {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },
    #[error("separator produced no `{0}` stem")]
    MissingStem(String),
    #[error("separation I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque separation function.
#[async_trait]
pub trait Separator: Send + Sync {
    /// Separate `input`, writing stems under `output_dir`.
    async fn separate(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &SeparationParams,
    ) -> Result<SeparatedStems, SeparationError>;
}

#[async_trait]
impl<T: Separator + ?Sized> Separator for Arc<T> {
    async fn separate(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &SeparationParams,
    ) -> Result<SeparatedStems, SeparationError> {
        (**self).separate(input, output_dir, params).await
    }
}

/// Stems emitted by a `spleeter:Nstems` configuration.
pub fn stem_names(model: &str) -> &'static [&'static str] {
    let variant = model.rsplit(':').next().unwrap_or(model);
    let variant = variant.split('-').next().unwrap_or(variant);
    match variant {
        "4stems" => &["vocals", "drums", "bass", "other"],
        "5stems" => &["vocals", "drums", "bass", "piano", "other"],
        _ => &["vocals", ACCOMPANIMENT],
    }
}
