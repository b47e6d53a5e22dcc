// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport for archives.

use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Certificate, Client, Identity, Response, Url};
use tracing::{debug, error};

use super::sigv4::{self, Credentials, SigningRequest};
use super::{AuthMode, S3Target, Shipper, ShippingConfig};
use crate::error::ShipError;

/// Header carrying the development identity.
pub const IDENTITY_HEADER: &str = "x-rh-identity";

/// Base64-encoded identity accepted by development ingestion endpoints.
pub fn development_identity() -> String {
    let identity = serde_json::json!({
        "identity": {
            "type": "User",
            "account_number": "0000001",
            "user": {"is_org_admin": true},
            "internal": {"org_id": "000001"}
        }
    });
    STANDARD.encode(identity.to_string())
}

/// Uploads archives over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpShipper {
    config: ShippingConfig,
}

impl HttpShipper {
    pub fn new(config: ShippingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShippingConfig {
        &self.config
    }

    fn target(&self) -> Result<&str, ShipError> {
        self.config
            .url
            .as_deref()
            .ok_or_else(|| ShipError::NotConfigured("ingestion URL is not set".to_string()))
    }

    fn build_client(&self) -> Result<Client, ShipError> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.timeout)
            .timeout(self.config.timeout);

        if let Some(ca) = self.config.ca_cert_if_present() {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        if self.config.auth_mode == AuthMode::MutualTls {
            let (cert, key) = match (&self.config.client_cert, &self.config.client_key) {
                (Some(cert), Some(key)) => (std::fs::read(cert)?, std::fs::read(key)?),
                _ => {
                    return Err(ShipError::NotConfigured(
                        "client certificate and key are required for mutual TLS".to_string(),
                    ))
                }
            };
            builder = builder.identity(Identity::from_pkcs8_pem(&cert, &key)?);
        }

        Ok(builder.build()?)
    }

    fn extra_headers(&self) -> Result<HeaderMap, ShipError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ShipError::NotConfigured(format!("invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ShipError::NotConfigured(format!("invalid value for header '{}': {}", name, e))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn post_multipart(&self, client: &Client, archive: &Path) -> Result<Response, ShipError> {
        let url = self.target()?;
        let body = tokio::fs::read(archive).await?;
        let filename = archive_name(archive)?;

        let part = Part::bytes(body)
            .file_name(filename)
            .mime_str(&self.config.content_type)?;
        let form = Form::new().part("file", part);

        let mut request = client
            .post(url)
            .headers(self.extra_headers()?)
            .multipart(form);

        match self.config.auth_mode {
            AuthMode::UserPass => {
                request = request.basic_auth(
                    self.config.username.as_deref().unwrap_or_default(),
                    self.config.password.as_deref(),
                );
            }
            AuthMode::Identity => {
                let identity = self
                    .config
                    .identity
                    .clone()
                    .unwrap_or_else(development_identity);
                request = request.header(IDENTITY_HEADER, identity);
            }
            AuthMode::MutualTls | AuthMode::S3 => {}
        }

        Ok(request.send().await?)
    }

    async fn put_s3(&self, client: &Client, archive: &Path, s3: &S3Target) -> Result<Response, ShipError> {
        let base = Url::parse(self.target()?)
            .map_err(|e| ShipError::NotConfigured(format!("invalid S3 endpoint: {}", e)))?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ShipError::NotConfigured(
                    "S3 endpoint has no host".to_string(),
                ))
            }
        };

        let key = format!(
            "{}/{}/{}",
            base.path().trim_end_matches('/'),
            s3.bucket,
            archive_name(archive)?
        );
        let path = sigv4::encode_path(&key);
        let url = format!("{}://{}{}", base.scheme(), host, path);

        let body = tokio::fs::read(archive).await?;
        let now = Utc::now();
        let payload_hash = sigv4::payload_hash(&body);
        let amz_date = sigv4::amz_date(now);

        let signed = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        let authorization = sigv4::authorization(
            &SigningRequest {
                method: "PUT",
                path: &path,
                headers: &signed,
                payload_hash: &payload_hash,
                region: &s3.region,
                service: "s3",
                time: now,
            },
            &Credentials {
                access_key_id: &s3.access_key_id,
                secret_access_key: &s3.secret_access_key,
            },
        )?;

        let response = client
            .put(url)
            .headers(self.extra_headers()?)
            .header(CONTENT_TYPE, &self.config.content_type)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
            .header(AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

fn archive_name(archive: &Path) -> Result<String, ShipError> {
    archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ShipError::IoError(format!("{} has no file name", archive.display())))
}

#[async_trait]
impl Shipper for HttpShipper {
    fn check_configured(&self) -> Result<(), ShipError> {
        match self.config.missing() {
            Some(missing) => Err(ShipError::NotConfigured(missing)),
            None => Ok(()),
        }
    }

    async fn upload(&self, archive: &Path) -> Result<(), ShipError> {
        self.check_configured()?;
        debug!(archive = %archive.display(), mode = %self.config.auth_mode, "Shipping analytics file");

        let client = self.build_client()?;
        let response = match (&self.config.auth_mode, &self.config.s3) {
            (AuthMode::S3, Some(s3)) => self.put_s3(&client, archive, s3).await?,
            _ => self.post_multipart(&client, archive).await?,
        };

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Upload failed");
            return Err(ShipError::rejected(status.as_u16(), body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one request, answer with `status`, return the raw request text.
    async fn one_shot_server(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 8\r\nconnection: close\r\n\r\nrejected",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    fn archive(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("analytics-2024-01-01-000000+0000-0.tar.gz");
        std::fs::write(&path, b"tarball-bytes").unwrap();
        path
    }

    fn config(url: String, auth_mode: AuthMode) -> ShippingConfig {
        ShippingConfig {
            url: Some(url),
            auth_mode,
            username: Some("svc".to_string()),
            password: Some("pw".to_string()),
            ca_cert: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_development_identity_decodes() {
        let decoded = STANDARD.decode(development_identity()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["identity"]["internal"]["org_id"], "000001");
    }

    #[test]
    fn test_check_configured_reports_missing_piece() {
        let shipper = HttpShipper::new(ShippingConfig::default());
        let err = shipper.check_configured().unwrap_err();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("ingestion URL"));
    }

    #[tokio::test]
    async fn test_multipart_upload_with_basic_auth() {
        let temp = TempDir::new().unwrap();
        let (url, server) = one_shot_server("202 Accepted").await;
        let shipper = HttpShipper::new(config(url, AuthMode::UserPass));

        shipper.upload(&archive(&temp)).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST / HTTP/1.1"));
        // svc:pw
        assert!(request.contains("authorization: Basic c3ZjOnB3"));
        assert!(request.contains("name=\"file\"; filename=\"analytics-2024-01-01-000000+0000-0.tar.gz\""));
        assert!(request.contains("application/vnd.harvest.payload+tgz"));
        assert!(request.contains("tarball-bytes"));
    }

    #[tokio::test]
    async fn test_identity_header_sent() {
        let temp = TempDir::new().unwrap();
        let (url, server) = one_shot_server("200 OK").await;
        let shipper = HttpShipper::new(config(url, AuthMode::Identity));

        shipper.upload(&archive(&temp)).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.contains(&format!("x-rh-identity: {}", development_identity())));
        assert!(!request.contains("authorization:"));
    }

    #[tokio::test]
    async fn test_status_300_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (url, server) = one_shot_server("300 Multiple Choices").await;
        let shipper = HttpShipper::new(config(url, AuthMode::UserPass));

        let err = shipper.upload(&archive(&temp)).await.unwrap_err();
        server.await.unwrap();
        match err {
            ShipError::Rejected { status, body } => {
                assert_eq!(status, 300);
                assert_eq!(body, "rejected");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_s3_put_is_signed() {
        let temp = TempDir::new().unwrap();
        let (url, server) = one_shot_server("200 OK").await;
        let mut cfg = config(url, AuthMode::S3);
        cfg.s3 = Some(S3Target {
            bucket: "analytics".to_string(),
            region: "eu-west-1".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
        });
        let shipper = HttpShipper::new(cfg);

        shipper.upload(&archive(&temp)).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "PUT /analytics/analytics-2024-01-01-000000%2B0000-0.tar.gz HTTP/1.1"
        ));
        assert!(request.contains("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(request.contains("/eu-west-1/s3/aws4_request"));
        assert!(request.contains(&format!(
            "x-amz-content-sha256: {}",
            sigv4::payload_hash(b"tarball-bytes")
        )));
    }

    #[tokio::test]
    async fn test_missing_client_cert_files_fail_before_request() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config("https://127.0.0.1:9".to_string(), AuthMode::MutualTls);
        cfg.client_cert = Some(temp.path().join("missing.pem"));
        cfg.client_key = Some(temp.path().join("missing.key"));
        let shipper = HttpShipper::new(cfg);

        let err = shipper.upload(&archive(&temp)).await.unwrap_err();
        assert!(matches!(err, ShipError::IoError(_)));
    }
}
