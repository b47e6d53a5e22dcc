// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archive delivery.
//!
//! A [`Shipper`] moves a finished archive to the ingestion service. Shipping is a
//! single attempt: a failure leaves the watermarks of the archive's metrics
//! untouched so the next run re-sends the same window.
//!
//! - [`HttpShipper`]: multipart POST (or a signed S3 `PUT`) with pluggable auth
//! - [`DisabledShipper`]: for dry runs, never configured

mod http;
pub mod sigv4;

pub use http::{development_identity, HttpShipper, IDENTITY_HEADER};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ShipError};

/// Content type registered for harvest payloads.
pub const DEFAULT_CONTENT_TYPE: &str = "application/vnd.harvest.payload+tgz";

/// CA bundle used for server verification when present on the host.
pub const DEFAULT_CA_CERT: &str = "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem";

/// Connect and total timeout of an upload.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(31);

/// Delivers archives to the ingestion service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Shipper: Send + Sync {
    /// Check target and credentials without network I/O.
    ///
    /// The error names the missing piece.
    fn check_configured(&self) -> Result<(), ShipError>;

    /// Upload one archive. Any response status >= 300 is a failure.
    async fn upload(&self, archive: &Path) -> Result<(), ShipError>;
}

/// Shipper that is never configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledShipper;

#[async_trait]
impl Shipper for DisabledShipper {
    fn check_configured(&self) -> Result<(), ShipError> {
        Err(ShipError::NotConfigured("shipping is disabled".to_string()))
    }

    async fn upload(&self, _archive: &Path) -> Result<(), ShipError> {
        Err(ShipError::NotConfigured("shipping is disabled".to_string()))
    }
}

/// How uploads authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// HTTP basic auth.
    #[default]
    UserPass,
    /// Pre-encoded identity header, development only.
    Identity,
    /// Client certificate and key.
    MutualTls,
    /// Signed `PUT` into an S3 bucket.
    S3,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserPass => "user-pass",
            Self::Identity => "identity",
            Self::MutualTls => "mutual-tls",
            Self::S3 => "s3",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user-pass" | "userpass" | "basic" => Ok(Self::UserPass),
            "identity" | "x-rh-identity" => Ok(Self::Identity),
            "mutual-tls" | "mtls" => Ok(Self::MutualTls),
            "s3" => Ok(Self::S3),
            other => Err(ConfigError::invalid(
                "shipping.authMode",
                format!("unknown auth mode '{}'", other),
            )),
        }
    }
}

/// S3 bucket and credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Target {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Resolved shipping settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ShippingConfig {
    pub url: Option<String>,
    pub auth_mode: AuthMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub s3: Option<S3Target>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub identity: Option<String>,
    pub content_type: String,
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_mode: AuthMode::default(),
            username: None,
            password: None,
            s3: None,
            client_cert: None,
            client_key: None,
            ca_cert: Some(PathBuf::from(DEFAULT_CA_CERT)),
            identity: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            headers: BTreeMap::new(),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl ShippingConfig {
    /// First missing setting for the selected auth mode, if any.
    pub fn missing(&self) -> Option<String> {
        if is_blank(&self.url) {
            return Some("ingestion URL is not set".to_string());
        }
        match self.auth_mode {
            AuthMode::UserPass if is_blank(&self.username) => {
                Some("shipping username is not set".to_string())
            }
            AuthMode::UserPass if is_blank(&self.password) => {
                Some("shipping password is not set".to_string())
            }
            AuthMode::MutualTls if self.client_cert.is_none() => {
                Some("client certificate is not set".to_string())
            }
            AuthMode::MutualTls if self.client_key.is_none() => {
                Some("client key is not set".to_string())
            }
            AuthMode::S3 => match &self.s3 {
                None => Some("S3 settings are not set".to_string()),
                Some(s3) if s3.bucket.is_empty() => Some("S3 bucket is not set".to_string()),
                Some(s3) if s3.region.is_empty() => Some("S3 region is not set".to_string()),
                Some(s3) if s3.access_key_id.is_empty() || s3.secret_access_key.is_empty() => {
                    Some("S3 credentials are not set".to_string())
                }
                Some(_) => None,
            },
            _ => None,
        }
    }

    /// CA bundle to trust, only when it exists on disk.
    pub fn ca_cert_if_present(&self) -> Option<&Path> {
        self.ca_cert.as_deref().filter(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ShippingConfig {
        ShippingConfig {
            url: Some("https://ingest.example.com/upload".to_string()),
            username: Some("svc".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ShippingConfig::default();
        assert_eq!(config.auth_mode, AuthMode::UserPass);
        assert_eq!(config.timeout, Duration::from_secs(31));
        assert_eq!(config.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(config.missing().as_deref(), Some("ingestion URL is not set"));
    }

    #[test]
    fn test_user_pass_requirements() {
        assert_eq!(configured().missing(), None);

        let mut config = configured();
        config.password = Some("  ".to_string());
        assert_eq!(config.missing().as_deref(), Some("shipping password is not set"));
    }

    #[test]
    fn test_identity_needs_only_url() {
        let config = ShippingConfig {
            url: Some("http://localhost:8080".to_string()),
            auth_mode: AuthMode::Identity,
            ..Default::default()
        };
        assert_eq!(config.missing(), None);
    }

    #[test]
    fn test_mutual_tls_and_s3_requirements() {
        let mut config = configured();
        config.auth_mode = AuthMode::MutualTls;
        assert_eq!(config.missing().as_deref(), Some("client certificate is not set"));
        config.client_cert = Some(PathBuf::from("/etc/harvest/client.pem"));
        config.client_key = Some(PathBuf::from("/etc/harvest/client.key"));
        assert_eq!(config.missing(), None);

        config.auth_mode = AuthMode::S3;
        assert_eq!(config.missing().as_deref(), Some("S3 settings are not set"));
        config.s3 = Some(S3Target {
            bucket: "analytics".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "AKIA".to_string(),
            secret_access_key: String::new(),
        });
        assert_eq!(config.missing().as_deref(), Some("S3 credentials are not set"));
    }

    #[test]
    fn test_auth_mode_parsing() {
        assert_eq!("user-pass".parse::<AuthMode>().unwrap(), AuthMode::UserPass);
        assert_eq!("x-rh-identity".parse::<AuthMode>().unwrap(), AuthMode::Identity);
        assert_eq!("MTLS".parse::<AuthMode>().unwrap(), AuthMode::MutualTls);
        assert!("kerberos".parse::<AuthMode>().is_err());
        assert_eq!(
            serde_json::to_string(&AuthMode::MutualTls).unwrap(),
            "\"mutual-tls\""
        );
    }

    #[test]
    fn test_ca_cert_only_when_present() {
        let config = ShippingConfig {
            ca_cert: Some(PathBuf::from("/nonexistent/harvest/ca.pem")),
            ..Default::default()
        };
        assert!(config.ca_cert_if_present().is_none());
    }

    #[tokio::test]
    async fn test_disabled_shipper() {
        let shipper = DisabledShipper;
        assert!(shipper.check_configured().unwrap_err().is_precondition());
        assert!(shipper.upload(Path::new("/tmp/x.tar.gz")).await.is_err());
    }
}
