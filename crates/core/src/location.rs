//! Blob locators and naming templates.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const SCHEME: &str = "s3://";

/// Address of an object in the blob store: `s3://<bucket>/<key>`.
///
/// Keys may contain `/` separators but never empty, `.` or `..` segments, so a
/// location can always be mapped onto a directory tree safely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
    bucket: String,
    key: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self, DomainError> {
        let bucket = bucket.into();
        let key = key.into();
        validate_bucket(&bucket)?;
        validate_key(&key)?;
        Ok(Self { bucket, key })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl core::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{SCHEME}{}/{}", self.bucket, self.key)
    }
}

impl FromStr for BlobLocation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| DomainError::invalid_location(format!("missing {SCHEME} scheme: {s}")))?;

        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| DomainError::invalid_location(format!("missing key: {s}")))?;

        Self::new(bucket, key.trim_start_matches('/'))
    }
}

fn validate_bucket(bucket: &str) -> Result<(), DomainError> {
    let valid = !bucket.is_empty()
        && bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && bucket != "."
        && bucket != "..";

    if valid {
        Ok(())
    } else {
        Err(DomainError::invalid_location(format!("bad bucket name: {bucket:?}")))
    }
}

fn validate_key(key: &str) -> Result<(), DomainError> {
    if key.is_empty() {
        return Err(DomainError::invalid_location("empty key"));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(DomainError::invalid_location(format!("bad key: {key:?}")));
    }
    Ok(())
}

/// Substitute `{name}` placeholders in `template`.
///
/// Unknown placeholders are left as-is.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_key() {
        let loc: BlobLocation = "s3://bucket/key".parse().unwrap();
        assert_eq!(loc.bucket(), "bucket");
        assert_eq!(loc.key(), "key");
    }

    #[test]
    fn parses_nested_key() {
        let loc: BlobLocation = "s3://bucket/with/deep/nested/path.ext".parse().unwrap();
        assert_eq!(loc.bucket(), "bucket");
        assert_eq!(loc.key(), "with/deep/nested/path.ext");
        assert_eq!(loc.file_name(), "path.ext");
        assert_eq!(loc.to_string(), "s3://bucket/with/deep/nested/path.ext");
    }

    #[test]
    fn rejects_bad_locations() {
        for bad in [
            "bucket/key",
            "s3://bucket",
            "s3://bucket/",
            "s3:///key",
            "s3://bucket/a/../b",
            "s3://../key",
        ] {
            assert!(bad.parse::<BlobLocation>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn renders_known_placeholders_only() {
        let out = render_template(
            "track_{job_id}.{codec}?{other}",
            &[("job_id", "abc"), ("codec", "mp3")],
        );
        assert_eq!(out, "track_abc.mp3?{other}");
    }
}
