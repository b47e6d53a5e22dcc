// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! AWS Signature Version 4 for S3 uploads.
//!
//! Only what a single-part `PUT` needs: header-based signing with an unsigned
//! query string.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::ShipError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Access key pair used for signing.
#[derive(Debug, Clone)]
pub struct Credentials<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

/// Request to sign. Header names may be in any case; `host` must be present.
#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    /// Already URI-encoded path, see [`encode_path`].
    pub path: &'a str,
    pub headers: &'a [(String, String)],
    /// Hex SHA-256 of the body, also sent as `x-amz-content-sha256`.
    pub payload_hash: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

/// `x-amz-date` value for `time`.
pub fn amz_date(time: DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Hex SHA-256 of a payload.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Percent-encode each path segment, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, ShipError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ShipError::NotConfigured(format!("invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute the `Authorization` header value.
pub fn authorization(request: &SigningRequest<'_>, credentials: &Credentials<'_>) -> Result<String, ShipError> {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        request.method, request.path, canonical_headers, signed_headers, request.payload_hash
    );

    let date = request.time.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date, request.region, request.service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date(request.time),
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", credentials.secret_access_key);
    let k_date = hmac(secret.as_bytes(), &date)?;
    let k_region = hmac(&k_date, request.region)?;
    let k_service = hmac(&k_region, request.service)?;
    let k_signing = hmac(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

    Ok(format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, credentials.access_key_id, scope, signed_headers, signature
    ))
}
