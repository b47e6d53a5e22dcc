// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`HarvestConfig`] is the file form: every field optional, camelCase, JSON or
//! YAML. [`ResolvedConfig`] is what a run actually uses after merging.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::collector::{CollectionType, DEFAULT_ARCHIVE_PREFIX};
use crate::package::DEFAULT_CAPACITY;
use crate::shipping::{S3Target, ShippingConfig};

use super::loader::get_global_config_dir;

/// Harvest configuration as written in `.harvest.json` or `~/.harvest/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestConfig {
    /// manual, scheduled or dry-run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_type: Option<CollectionType>,

    /// Directory receiving archives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,

    /// SQLite file holding watermarks and the gather lock
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_db: Option<PathBuf>,

    /// Byte budget of one archive before compression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_capacity_bytes: Option<u64>,

    /// Archive name prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_prefix: Option<String>,

    /// Whether this installation is licensed to send analytics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping: Option<ShippingFileConfig>,
}

/// Shipping section of a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingFileConfig {
    /// Ingestion endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// user-pass, identity, mutual-tls or s3
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Target>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Pre-encoded identity header value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Extra request headers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub collection_type: CollectionType,
    pub destination: PathBuf,
    pub state_db: PathBuf,
    pub package_capacity_bytes: u64,
    pub archive_prefix: String,
    pub entitled: bool,
    pub shipping: ShippingConfig,
}

/// `~/.harvest/state.db`, or a temp directory location without a home directory.
pub fn default_state_db() -> PathBuf {
    get_global_config_dir()
        .unwrap_or_else(|| std::env::temp_dir().join("harvest"))
        .join("state.db")
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            collection_type: CollectionType::default(),
            destination: std::env::temp_dir(),
            state_db: default_state_db(),
            package_capacity_bytes: DEFAULT_CAPACITY,
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            entitled: true,
            shipping: ShippingConfig::default(),
        }
    }
}

const REDACTED: &str = "********";

impl ResolvedConfig {
    /// File form of this configuration with secrets masked, for display.
    pub fn to_display_config(&self) -> HarvestConfig {
        let shipping = &self.shipping;
        HarvestConfig {
            collection_type: Some(self.collection_type),
            destination: Some(self.destination.clone()),
            state_db: Some(self.state_db.clone()),
            package_capacity_bytes: Some(self.package_capacity_bytes),
            archive_prefix: Some(self.archive_prefix.clone()),
            entitled: Some(self.entitled),
            shipping: Some(ShippingFileConfig {
                url: shipping.url.clone(),
                auth_mode: Some(shipping.auth_mode.to_string()),
                username: shipping.username.clone(),
                password: shipping.password.as_ref().map(|_| REDACTED.to_string()),
                s3: shipping.s3.as_ref().map(|s3| S3Target {
                    secret_access_key: REDACTED.to_string(),
                    ..s3.clone()
                }),
                client_cert: shipping.client_cert.clone(),
                client_key: shipping.client_key.clone(),
                ca_cert: shipping.ca_cert.clone(),
                identity: shipping.identity.as_ref().map(|_| REDACTED.to_string()),
                content_type: Some(shipping.content_type.clone()),
                timeout_secs: Some(shipping.timeout.as_secs()),
                headers: (!shipping.headers.is_empty()).then(|| shipping.headers.clone()),
            }),
        }
    }
}
