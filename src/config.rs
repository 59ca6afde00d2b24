// src/config.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Proxy configuration: remote endpoint, region, fallback credentials and
//! HTTP client tuning. Loaded from the environment (and `.env`) by
//! [`MirrorConfig::from_env`] or built directly.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::constants::{
    DEFAULT_ENDPOINT, DEFAULT_REGION, ENV_ACCESS_KEY, ENV_AWS_ENDPOINT, ENV_ENDPOINT,
    ENV_OPERATION_TIMEOUT, ENV_REGION, ENV_SECRET_KEY, ENV_UNSIGNED,
};
use crate::error::{MirrorError, Result};
use crate::http::HttpClientConfig;

/// An access-key / secret-key pair used to sign remote requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self { access_key: access_key.into(), secret_key: secret_key.into() }
    }

    /// Fixed test double. Never used unless a caller asks for it explicitly.
    pub fn placeholder() -> Self {
        Self::new("placeholder-access-key", "placeholder-secret-key")
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_key.trim().is_empty() {
            return Err(MirrorError::InvalidRequest("empty access key".into()));
        }
        if self.secret_key.is_empty() {
            return Err(MirrorError::InvalidRequest(format!(
                "empty secret key for access key {}",
                self.access_key
            )));
        }
        Ok(())
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Runtime parameters for the mirroring proxy.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Base URL of the S3-compatible endpoint, e.g. `http://10.0.0.5:8000`
    pub endpoint: String,
    pub region: String,
    /// Used only when the acting user has no access keys of its own
    pub credentials: Option<Credentials>,
    /// Sign requests with SigV4 (disable for anonymous test endpoints)
    pub sign_requests: bool,
    pub http: HttpClientConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl MirrorConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            http: HttpClientConfig::auto_detect(&endpoint),
            endpoint,
            region: DEFAULT_REGION.to_string(),
            credentials: None,
            sign_requests: true,
        }
    }

    /// Build from environment variables, reading `.env` first.
    ///
    /// * `S3MIRROR_ENDPOINT` (falls back to `AWS_ENDPOINT_URL`)
    /// * `AWS_REGION`
    /// * `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` (fallback credentials)
    /// * `S3MIRROR_OPERATION_TIMEOUT_SECS`
    /// * `S3MIRROR_UNSIGNED` (any of 1/true/yes/on disables signing)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let endpoint = env::var(ENV_ENDPOINT)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| env::var(ENV_AWS_ENDPOINT).ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let mut cfg = Self::new(endpoint);

        if let Ok(region) = env::var(ENV_REGION) {
            if !region.is_empty() {
                cfg.region = region;
            }
        }

        match (env::var(ENV_ACCESS_KEY), env::var(ENV_SECRET_KEY)) {
            (Ok(ak), Ok(sk)) => cfg.credentials = Some(Credentials::new(ak, sk)),
            (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
                return Err(MirrorError::InvalidRequest(format!(
                    "both {ENV_ACCESS_KEY} and {ENV_SECRET_KEY} must be set"
                )));
            }
            _ => {}
        }

        if let Some(secs) = env::var(ENV_OPERATION_TIMEOUT).ok().and_then(|s| s.parse().ok()) {
            cfg.http.request_timeout = Duration::from_secs(secs);
        }

        cfg.sign_requests = !matches!(
            env::var(ENV_UNSIGNED).unwrap_or_default().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.sign_requests = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(MirrorError::InvalidRequest(format!(
                "endpoint must be an http(s) URL, got {:?}",
                self.endpoint
            )));
        }
        if let Some(creds) = &self.credentials {
            creds.validate()?;
        }
        Ok(())
    }

    /// Endpoint without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let c = Credentials::new("AKID", "very-secret");
        let s = format!("{:?}", c);
        assert!(s.contains("AKID"));
        assert!(!s.contains("very-secret"));
    }

    #[test]
    fn test_credentials_validation() {
        assert!(Credentials::new("a", "b").validate().is_ok());
        assert!(Credentials::new("", "b").validate().is_err());
        assert!(Credentials::new("a", "").validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(MirrorConfig::new("http://localhost:9000").validate().is_ok());
        assert!(MirrorConfig::new("localhost:9000").validate().is_err());
        let cfg = MirrorConfig::new("https://s3.example.com/");
        assert_eq!(cfg.base_url(), "https://s3.example.com");
        assert!(cfg.sign_requests);
        assert!(!cfg.unsigned().sign_requests);
    }
}
