//! Typed configuration parsed from environment variables.
//!
//! Everything is read once at startup through a lookup function, so tests can feed
//! a map instead of mutating the process environment. Missing required keys and
//! unparsable values are [`ConfigError`]s, which the binaries treat as fatal.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use karaoke_core::{BlobLocation, JobId, render_template};

use crate::queue::ReceiveOptions;
use crate::separation::SeparationParams;

/// Signing secret used when `UPLOAD_SIGNING_SECRET` is unset. Development only.
pub const DEV_SIGNING_SECRET: &str = "karaoke-dev-upload-secret";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Reads raw values by key.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

impl<F> Lookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

/// Process environment.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn optional(lookup: &impl Lookup, key: &'static str) -> Option<String> {
    lookup.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(lookup: &impl Lookup, key: &'static str) -> Result<String, ConfigError> {
    optional(lookup, key).ok_or(ConfigError::Missing(key))
}

fn string_or(lookup: &impl Lookup, key: &'static str, default: &str) -> String {
    optional(lookup, key).unwrap_or_else(|| default.to_string())
}

fn parsed_or<T>(lookup: &impl Lookup, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, key) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn seconds_or(lookup: &impl Lookup, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: f64 = parsed_or(lookup, key, default as f64)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Invalid {
        key,
        value: secs.to_string(),
        reason: "expected a non-negative number of seconds".to_string(),
    })
}

fn flag_or(lookup: &impl Lookup, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(lookup, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: v.clone(),
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

fn bucket(lookup: &impl Lookup, key: &'static str) -> Result<String, ConfigError> {
    let name = required(lookup, key)?;
    // Validate with a throwaway key.
    BlobLocation::new(name.as_str(), "key").map_err(|e| ConfigError::Invalid {
        key,
        value: name.clone(),
        reason: e.to_string(),
    })?;
    Ok(name)
}

/// Where a backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Memory,
    Url(String),
}

impl BackendTarget {
    fn parse(value: Option<String>) -> Self {
        match value {
            None => Self::Memory,
            Some(v) if v.eq_ignore_ascii_case("memory") => Self::Memory,
            Some(v) => Self::Url(v),
        }
    }
}

/// Storage backend selection, shared by both binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Queue name (stream key for Redis).
    pub queue_name: String,
    /// Job table name.
    pub table_name: String,
    /// `JOB_STORE_URL`: `memory` or `postgres://...`.
    pub job_store: BackendTarget,
    /// `QUEUE_URL`: `memory` or `redis://...`.
    pub queue: BackendTarget,
    /// `BLOB_STORE_ROOT`: `memory` or a directory.
    pub blob_root: Option<PathBuf>,
}

impl BackendConfig {
    pub fn from_lookup(lookup: &impl Lookup) -> Result<Self, ConfigError> {
        let blob_root = match BackendTarget::parse(optional(lookup, "BLOB_STORE_ROOT")) {
            BackendTarget::Memory => None,
            BackendTarget::Url(path) => Some(PathBuf::from(path)),
        };

        Ok(Self {
            queue_name: required(lookup, "QUEUE_NAME")?,
            table_name: required(lookup, "TRACKS_TABLE_NAME")?,
            job_store: BackendTarget::parse(optional(lookup, "JOB_STORE_URL")),
            queue: BackendTarget::parse(optional(lookup, "QUEUE_URL")),
            blob_root,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

/// Naming of the produced output: storage key and public download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNaming {
    pub bucket: String,
    pub region: String,
    /// Placeholders `{job_id}`, `{codec}`.
    pub key_format: String,
    /// Placeholders `{bucket}`, `{region}`, `{key}`.
    pub public_url_format: String,
}

impl OutputNaming {
    pub const DEFAULT_KEY_FORMAT: &'static str = "track_{job_id}.{codec}";
    pub const DEFAULT_PUBLIC_URL_FORMAT: &'static str = "https://{bucket}.s3-{region}.amazonaws.com/{key}";

    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: "eu-west-1".to_string(),
            key_format: Self::DEFAULT_KEY_FORMAT.to_string(),
            public_url_format: Self::DEFAULT_PUBLIC_URL_FORMAT.to_string(),
        }
    }

    pub fn from_lookup(lookup: &impl Lookup) -> Result<Self, ConfigError> {
        Ok(Self {
            bucket: bucket(lookup, "OUTPUT_BUCKET_NAME")?,
            region: string_or(lookup, "OUTPUT_BUCKET_REGION", "eu-west-1"),
            key_format: string_or(lookup, "OUTPUT_KEY_FORMAT", Self::DEFAULT_KEY_FORMAT),
            public_url_format: string_or(lookup, "OUTPUT_PUBLIC_URL_FORMAT", Self::DEFAULT_PUBLIC_URL_FORMAT),
        })
    }

    /// Storage location of the output for `job_id`.
    pub fn location(&self, job_id: JobId, codec: &str) -> Result<BlobLocation, karaoke_core::DomainError> {
        let id = job_id.to_string();
        let key = render_template(&self.key_format, &[("job_id", id.as_str()), ("codec", codec)]);
        BlobLocation::new(self.bucket.as_str(), key)
    }

    /// Download URL recorded on the job.
    pub fn public_url(&self, location: &BlobLocation) -> String {
        render_template(
            &self.public_url_format,
            &[
                ("bucket", location.bucket()),
                ("region", self.region.as_str()),
                ("key", location.key()),
            ],
        )
    }
}

/// Settings for the HTTP controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub backends: BackendConfig,
    pub upload_bucket: String,
    /// Bucket served by the download route, when configured.
    pub output_bucket: Option<String>,
    pub upload_ttl: Duration,
    pub signing_secret: String,
    /// `true` when the built-in development secret is in use.
    pub insecure_secret: bool,
    pub upload_base_url: String,
    pub max_upload_bytes: usize,
    pub bind_addr: String,
    pub embedded_worker: bool,
}

impl ControllerConfig {
    pub fn from_lookup(lookup: &impl Lookup) -> Result<Self, ConfigError> {
        let secret = optional(lookup, "UPLOAD_SIGNING_SECRET");
        let output_bucket = match optional(lookup, "OUTPUT_BUCKET_NAME") {
            Some(_) => Some(bucket(lookup, "OUTPUT_BUCKET_NAME")?),
            None => None,
        };

        Ok(Self {
            backends: BackendConfig::from_lookup(lookup)?,
            upload_bucket: bucket(lookup, "UPLOAD_BUCKET_NAME")?,
            output_bucket,
            upload_ttl: seconds_or(lookup, "UPLOAD_AUTH_TIMEOUT", 120)?,
            insecure_secret: secret.is_none(),
            signing_secret: secret.unwrap_or_else(|| DEV_SIGNING_SECRET.to_string()),
            upload_base_url: string_or(lookup, "UPLOAD_BASE_URL", "http://localhost:8080"),
            max_upload_bytes: parsed_or(lookup, "MAX_UPLOAD_BYTES", 200 * 1024 * 1024)?,
            bind_addr: string_or(lookup, "BIND_ADDR", "0.0.0.0:8080"),
            embedded_worker: flag_or(lookup, "EMBEDDED_WORKER", false)?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

/// Settings for the worker poll loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backends: BackendConfig,
    pub output: OutputNaming,
    pub polling_interval: Duration,
    pub receive: ReceiveOptions,
    pub max_concurrent_jobs: usize,
    pub separation: SeparationParams,
    pub separator_command: String,
}

impl WorkerConfig {
    pub fn from_lookup(lookup: &impl Lookup) -> Result<Self, ConfigError> {
        let max_concurrent_jobs: usize = parsed_or(lookup, "MAX_CONCURRENT_JOBS", 1)?;
        let batch_size: usize = parsed_or(lookup, "BATCH_SIZE", 10)?;
        for (key, value) in [("MAX_CONCURRENT_JOBS", max_concurrent_jobs), ("BATCH_SIZE", batch_size)] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        let visibility_timeout = seconds_or(lookup, "VISIBILITY_TIMEOUT", 3600)?;
        let separation_timeout = seconds_or(lookup, "SEPARATION_TIMEOUT", 1800)?;
        // A message must stay hidden for as long as its separation may run.
        if visibility_timeout <= separation_timeout {
            return Err(ConfigError::Invalid {
                key: "VISIBILITY_TIMEOUT",
                value: visibility_timeout.as_secs_f64().to_string(),
                reason: format!(
                    "must exceed SEPARATION_TIMEOUT ({}s)",
                    separation_timeout.as_secs_f64()
                ),
            });
        }

        Ok(Self {
            backends: BackendConfig::from_lookup(lookup)?,
            output: OutputNaming::from_lookup(lookup)?,
            polling_interval: seconds_or(lookup, "POLLING_INTERVAL", 10)?,
            receive: ReceiveOptions {
                max_messages: batch_size,
                visibility_timeout,
                wait_time: seconds_or(lookup, "RECEIVE_WAIT", 0)?,
            },
            max_concurrent_jobs,
            separation: SeparationParams {
                model: string_or(lookup, "SPLEETER_CONFIGURATION", "spleeter:2stems"),
                max_duration: seconds_or(lookup, "MAX_AUDIO_DURATION", 600)?,
                start_offset: seconds_or(lookup, "AUDIO_START_OFFSET", 0)?,
                codec: string_or(lookup, "OUTPUT_CODEC", "mp3"),
                bitrate: string_or(lookup, "OUTPUT_BITRATE", "128k"),
                filename_format: string_or(lookup, "OUTPUT_FILENAME_FORMAT", "{instrument}.{codec}"),
                timeout: separation_timeout,
            },
            separator_command: string_or(lookup, "SEPARATOR_COMMAND", "spleeter"),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("QUEUE_NAME", "tracks-queue"),
        ("TRACKS_TABLE_NAME", "tracks"),
        ("UPLOAD_BUCKET_NAME", "input"),
        ("OUTPUT_BUCKET_NAME", "output"),
    ];

    #[test]
    fn worker_defaults() {
        let cfg = WorkerConfig::from_lookup(&lookup(BASE)).unwrap();

        assert_eq!(cfg.polling_interval, Duration::from_secs(10));
        assert_eq!(cfg.receive.max_messages, 10);
        assert_eq!(cfg.receive.visibility_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.max_concurrent_jobs, 1);
        assert_eq!(cfg.separation, SeparationParams::default());
        assert_eq!(cfg.separator_command, "spleeter");
        assert_eq!(cfg.output.region, "eu-west-1");
        assert_eq!(cfg.backends.job_store, BackendTarget::Memory);
        assert_eq!(cfg.backends.blob_root, None);
    }

    #[test]
    fn missing_required_keys_are_fatal() {
        let err = WorkerConfig::from_lookup(&lookup(&[("QUEUE_NAME", "q")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("TRACKS_TABLE_NAME"));

        let err = WorkerConfig::from_lookup(&lookup(&BASE[..3])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("OUTPUT_BUCKET_NAME"));

        let err = ControllerConfig::from_lookup(&lookup(&BASE[..2])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("UPLOAD_BUCKET_NAME"));
    }

    #[test]
    fn bad_values_are_reported_with_their_key() {
        let mut pairs = BASE.to_vec();
        pairs.push(("POLLING_INTERVAL", "soon"));
        assert!(matches!(
            WorkerConfig::from_lookup(&lookup(&pairs)),
            Err(ConfigError::Invalid { key: "POLLING_INTERVAL", .. })
        ));

        let mut pairs = BASE.to_vec();
        pairs.push(("MAX_CONCURRENT_JOBS", "0"));
        assert!(matches!(
            WorkerConfig::from_lookup(&lookup(&pairs)),
            Err(ConfigError::Invalid { key: "MAX_CONCURRENT_JOBS", .. })
        ));
    }

    #[test]
    fn out_of_range_seconds_are_invalid() {
        for value in ["1e300", "-1", "inf", "NaN"] {
            let mut pairs = BASE.to_vec();
            pairs.push(("POLLING_INTERVAL", value));
            assert!(
                matches!(
                    WorkerConfig::from_lookup(&lookup(&pairs)),
                    Err(ConfigError::Invalid { key: "POLLING_INTERVAL", .. })
                ),
                "{value} accepted"
            );
        }
    }

    #[test]
    fn visibility_timeout_must_outlast_separation() {
        let mut pairs = BASE.to_vec();
        pairs.extend([("VISIBILITY_TIMEOUT", "900"), ("SEPARATION_TIMEOUT", "1800")]);
        assert!(matches!(
            WorkerConfig::from_lookup(&lookup(&pairs)),
            Err(ConfigError::Invalid { key: "VISIBILITY_TIMEOUT", .. })
        ));

        let mut pairs = BASE.to_vec();
        pairs.extend([("VISIBILITY_TIMEOUT", "900"), ("SEPARATION_TIMEOUT", "600")]);
        let cfg = WorkerConfig::from_lookup(&lookup(&pairs)).unwrap();
        assert_eq!(cfg.separation.timeout, Duration::from_secs(600));
    }

    #[test]
    fn controller_settings() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("UPLOAD_AUTH_TIMEOUT", "30"),
            ("EMBEDDED_WORKER", "true"),
            ("JOB_STORE_URL", "postgres://localhost/karaoke"),
            ("BLOB_STORE_ROOT", "/var/lib/karaoke"),
        ]);
        let cfg = ControllerConfig::from_lookup(&lookup(&pairs)).unwrap();

        assert_eq!(cfg.upload_ttl, Duration::from_secs(30));
        assert!(cfg.embedded_worker);
        assert!(cfg.insecure_secret);
        assert_eq!(cfg.output_bucket.as_deref(), Some("output"));
        assert_eq!(
            cfg.backends.job_store,
            BackendTarget::Url("postgres://localhost/karaoke".to_string())
        );
        assert_eq!(cfg.backends.blob_root, Some(PathBuf::from("/var/lib/karaoke")));
    }

    #[test]
    fn output_naming_defaults() {
        let naming = OutputNaming::new("output");
        let id = JobId::new();

        let loc = naming.location(id, "mp3").unwrap();
        assert_eq!(loc.to_string(), format!("s3://output/track_{id}.mp3"));
        assert_eq!(
            naming.public_url(&loc),
            format!("https://output.s3-eu-west-1.amazonaws.com/track_{id}.mp3")
        );
    }
}
