//! Separation via an external CLI (`spleeter separate ...` by default).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{ACCOMPANIMENT, SeparatedStems, SeparationError, SeparationParams, Separator};

/// Longest stderr tail kept in an error.
const STDERR_TAIL: usize = 2048;

/// Runs the separation tool as a child process.
///
/// The child is killed if the timeout fires or the calling task is dropped.
#[derive(Debug, Clone)]
pub struct CommandSeparator {
    program: String,
    leading_args: Vec<String>,
}

impl CommandSeparator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Parse a whitespace-separated command line such as `python -m spleeter`.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            leading_args: parts.collect(),
        })
    }

    /// Arguments placed before the `separate` subcommand.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn args(&self, input: &Path, output_dir: &Path, params: &SeparationParams) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "separate".to_string(),
            "-p".to_string(),
            params.model.clone(),
            "-o".to_string(),
            output_dir.display().to_string(),
            "-d".to_string(),
            params.max_duration.as_secs_f64().to_string(),
            "-s".to_string(),
            params.start_offset.as_secs_f64().to_string(),
            "-c".to_string(),
            params.codec.clone(),
            "-b".to_string(),
            params.bitrate.clone(),
            "-f".to_string(),
            params.filename_format.clone(),
            input.display().to_string(),
        ]);
        args
    }
}

impl Default for CommandSeparator {
    fn default() -> Self {
        Self::new("spleeter")
    }
}

#[async_trait]
impl Separator for CommandSeparator {
    #[instrument(skip(self, params), fields(program = %self.program, model = %params.model), err)]
    async fn separate(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &SeparationParams,
    ) -> Result<SeparatedStems, SeparationError> {
        tokio::fs::create_dir_all(output_dir).await?;

        let args = self.args(input, output_dir, params);
        debug!(args = ?args, "starting separator");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SeparationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(params.timeout, child.wait_with_output())
            .await
            .map_err(|_| SeparationError::Timeout(params.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SeparationError::ExitStatus {
                code: output.status.code(),
                stderr: tail(&stderr, STDERR_TAIL).to_string(),
            });
        }

        let mut stems = SeparatedStems::new();
        for instrument in params.stem_names() {
            let path = params.stem_path(output_dir, input, instrument);
            if tokio::fs::try_exists(&path).await? {
                stems.insert(*instrument, path);
            } else {
                warn!(instrument, path = %path.display(), "expected stem not written");
            }
        }

        if stems.get(ACCOMPANIMENT).is_none() {
            return Err(SeparationError::MissingStem(ACCOMPANIMENT.to_string()));
        }

        info!(stems = stems.len(), "separation finished");
        Ok(stems)
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text.trim();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim()
}
