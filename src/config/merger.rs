// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;
use std::time::Duration;

use crate::collector::CollectionType;
use crate::error::ConfigError;
use crate::shipping::AuthMode;

use super::types::{HarvestConfig, ResolvedConfig, ShippingFileConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub collection_type: Option<CollectionType>,
    pub destination: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    pub package_capacity_bytes: Option<u64>,
    pub url: Option<String>,
    pub auth_mode: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.harvest.local.json)
/// 3. Workspace config (.harvest.json)
/// 4. Global config (~/.harvest/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<HarvestConfig>,
    workspace: Option<HarvestConfig>,
    local: Option<HarvestConfig>,
    cli: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_harvest_config(&mut result, &config)?;
    }

    apply_cli_options(&mut result, &cli)?;
    validate(&result)?;

    Ok(result)
}

fn apply_harvest_config(result: &mut ResolvedConfig, config: &HarvestConfig) -> Result<(), ConfigError> {
    if let Some(collection_type) = config.collection_type {
        result.collection_type = collection_type;
    }

    if let Some(ref destination) = config.destination {
        result.destination = destination.clone();
    }

    if let Some(ref state_db) = config.state_db {
        result.state_db = state_db.clone();
    }

    if let Some(capacity) = config.package_capacity_bytes {
        result.package_capacity_bytes = capacity;
    }

    if let Some(ref prefix) = config.archive_prefix {
        result.archive_prefix = prefix.clone();
    }

    if let Some(entitled) = config.entitled {
        result.entitled = entitled;
    }

    if let Some(ref shipping) = config.shipping {
        apply_shipping(result, shipping)?;
    }

    Ok(())
}

fn apply_shipping(result: &mut ResolvedConfig, file: &ShippingFileConfig) -> Result<(), ConfigError> {
    let shipping = &mut result.shipping;

    if file.url.is_some() {
        shipping.url = file.url.clone();
    }

    if let Some(ref mode) = file.auth_mode {
        shipping.auth_mode = mode.parse::<AuthMode>()?;
    }

    if file.username.is_some() {
        shipping.username = file.username.clone();
    }

    if file.password.is_some() {
        shipping.password = file.password.clone();
    }

    if file.s3.is_some() {
        shipping.s3 = file.s3.clone();
    }

    if file.client_cert.is_some() {
        shipping.client_cert = file.client_cert.clone();
    }

    if file.client_key.is_some() {
        shipping.client_key = file.client_key.clone();
    }

    if file.ca_cert.is_some() {
        shipping.ca_cert = file.ca_cert.clone();
    }

    if file.identity.is_some() {
        shipping.identity = file.identity.clone();
    }

    if let Some(ref content_type) = file.content_type {
        shipping.content_type = content_type.clone();
    }

    if let Some(secs) = file.timeout_secs {
        shipping.timeout = Duration::from_secs(secs);
    }

    if let Some(ref headers) = file.headers {
        shipping.headers.extend(headers.clone());
    }

    Ok(())
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) -> Result<(), ConfigError> {
    if let Some(collection_type) = cli.collection_type {
        result.collection_type = collection_type;
    }

    if let Some(ref destination) = cli.destination {
        result.destination = destination.clone();
    }

    if let Some(ref state_db) = cli.state_db {
        result.state_db = state_db.clone();
    }

    if let Some(capacity) = cli.package_capacity_bytes {
        result.package_capacity_bytes = capacity;
    }

    if cli.url.is_some() {
        result.shipping.url = cli.url.clone();
    }

    if let Some(ref mode) = cli.auth_mode {
        result.shipping.auth_mode = mode.parse::<AuthMode>()?;
    }

    if cli.username.is_some() {
        result.shipping.username = cli.username.clone();
    }

    if cli.password.is_some() {
        result.shipping.password = cli.password.clone();
    }

    Ok(())
}

fn validate(config: &ResolvedConfig) -> Result<(), ConfigError> {
    if config.package_capacity_bytes == 0 {
        return Err(ConfigError::invalid(
            "packageCapacityBytes",
            "must be greater than zero",
        ));
    }
    if config.shipping.timeout.is_zero() {
        return Err(ConfigError::invalid(
            "shipping.timeoutSecs",
            "must be greater than zero",
        ));
    }
    if config.archive_prefix.is_empty() || config.archive_prefix.contains('/') {
        return Err(ConfigError::invalid(
            "archivePrefix",
            "must be a non-empty file name",
        ));
    }
    Ok(())
}
