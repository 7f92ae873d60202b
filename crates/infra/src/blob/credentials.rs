//! Scoped, time-limited upload credentials.
//!
//! A credential authorises exactly one `PUT` of one object: the token is an HS256
//! JWT whose claims pin the bucket, the key and the job id, and which expires
//! `ttl` after issue. Verification uses zero leeway.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use karaoke_core::{BlobLocation, JobId};

/// Header carrying the upload token.
pub const UPLOAD_TOKEN_HEADER: &str = "x-upload-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadClaims {
    /// Job id.
    pub sub: String,
    pub bucket: String,
    pub key: String,
    pub iat: i64,
    pub exp: i64,
}

impl UploadClaims {
    pub fn job_id(&self) -> Result<JobId, CredentialError> {
        self.sub.parse().map_err(|_| CredentialError::Invalid("bad subject".into()))
    }

    /// Whether the token was issued for `location`.
    pub fn covers(&self, location: &BlobLocation) -> bool {
        self.bucket == location.bucket() && self.key == location.key()
    }
}

/// What the client needs to perform the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredential {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

impl UploadCredential {
    pub fn token(&self) -> Option<&str> {
        self.headers.get(UPLOAD_TOKEN_HEADER).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("upload credential expired")]
    Expired,
    #[error("invalid upload credential: {0}")]
    Invalid(String),
    #[error("failed to sign upload credential: {0}")]
    Signing(String),
}

/// Issues and verifies upload credentials.
#[derive(Clone)]
pub struct UploadSigner {
    secret: Vec<u8>,
    ttl: Duration,
    base_url: String,
}

impl core::fmt::Debug for UploadSigner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UploadSigner")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl UploadSigner {
    /// `base_url` is the public root of the upload endpoint, e.g. `http://localhost:8080`.
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, job_id: JobId, location: &BlobLocation) -> Result<UploadCredential, CredentialError> {
        self.issue_at(job_id, location, Utc::now())
    }

    pub fn issue_at(
        &self,
        job_id: JobId,
        location: &BlobLocation,
        now: DateTime<Utc>,
    ) -> Result<UploadCredential, CredentialError> {
        let iat = now.timestamp();
        let exp = i64::try_from(self.ttl.as_secs())
            .ok()
            .and_then(|ttl| iat.checked_add(ttl))
            .ok_or_else(|| CredentialError::Signing(format!("ttl out of range: {:?}", self.ttl)))?;
        let claims = UploadClaims {
            sub: job_id.to_string(),
            bucket: location.bucket().to_string(),
            key: location.key().to_string(),
            iat,
            exp,
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| CredentialError::Signing(format!("expiry out of range: {exp}")))?;

        Ok(UploadCredential {
            url: format!("{}/uploads/{}/{}", self.base_url, location.bucket(), location.key()),
            method: "PUT".to_string(),
            headers: BTreeMap::from([(UPLOAD_TOKEN_HEADER.to_string(), token)]),
            key: location.key().to_string(),
            expires_at,
        })
    }

    /// Check signature and expiry; the caller still has to check the scope.
    pub fn verify(&self, token: &str) -> Result<UploadClaims, CredentialError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        jsonwebtoken::decode::<UploadClaims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(secret: &str) -> UploadSigner {
        UploadSigner::new(secret, Duration::from_secs(120), "http://localhost:8080/")
    }

    fn location(id: JobId) -> BlobLocation {
        BlobLocation::new("input", format!("track_{id}")).unwrap()
    }

    #[test]
    fn issued_token_verifies_and_is_scoped() {
        let signer = signer("secret");
        let id = JobId::new();
        let loc = location(id);

        let cred = signer.issue(id, &loc).unwrap();
        assert_eq!(cred.method, "PUT");
        assert_eq!(cred.url, format!("http://localhost:8080/uploads/input/track_{id}"));
        assert_eq!(cred.key, format!("track_{id}"));

        let claims = signer.verify(cred.token().unwrap()).unwrap();
        assert_eq!(claims.job_id().unwrap(), id);
        assert!(claims.covers(&loc));
        assert!(!claims.covers(&location(JobId::new())));
        assert_eq!(claims.exp - claims.iat, 120);
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = signer("secret");
        let id = JobId::new();
        let issued = Utc::now() - chrono::Duration::seconds(600);

        let cred = signer.issue_at(id, &location(id), issued).unwrap();
        assert_eq!(signer.verify(cred.token().unwrap()), Err(CredentialError::Expired));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let id = JobId::new();
        let cred = signer("other").issue(id, &location(id)).unwrap();

        assert!(matches!(
            signer("secret").verify(cred.token().unwrap()),
            Err(CredentialError::Invalid(_))
        ));
        assert!(matches!(signer("secret").verify("garbage"), Err(CredentialError::Invalid(_))));
    }

    #[test]
    fn huge_ttl_is_a_signing_error() {
        let signer = UploadSigner::new("secret", Duration::from_secs(u64::MAX), "http://localhost");
        let id = JobId::new();

        assert!(matches!(
            signer.issue(id, &location(id)),
            Err(CredentialError::Signing(_))
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let rendered = format!("{:?}", signer("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
