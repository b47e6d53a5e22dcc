// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics the `harvest` binary registers for itself.

use std::thread;

use serde::Serialize;

use crate::error::MetricError;
use crate::registry::{GatherContext, MetricDescriptor, MetricOutput, MetricRegistry, CONFIG_KEY};

/// Version of the `config` payload layout.
pub const CONFIG_VERSION: &str = "1.0";

/// Version of the `host` payload layout.
pub const HOST_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct ConfigPayload<'a> {
    harvest_version: &'a str,
    os: &'a str,
    arch: &'a str,
    collection_type: &'a str,
    max_data_size: u64,
}

#[derive(Debug, Serialize)]
struct HostPayload {
    hostname: Option<String>,
    available_parallelism: Option<usize>,
    pid: u32,
}

fn config_metric(ctx: &GatherContext<'_>) -> Result<MetricOutput, MetricError> {
    MetricOutput::json(&ConfigPayload {
        harvest_version: crate::VERSION,
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        collection_type: ctx.collection_type.as_str(),
        max_data_size: ctx.max_data_size,
    })
}

fn host_metric(_ctx: &GatherContext<'_>) -> Result<MetricOutput, MetricError> {
    MetricOutput::json(&HostPayload {
        hostname: hostname(),
        available_parallelism: thread::available_parallelism().ok().map(|n| n.get()),
        pid: std::process::id(),
    })
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Registry with the built-in `config` and `host` metrics.
pub fn default_registry() -> MetricRegistry {
    MetricRegistry::new()
        .with(
            MetricDescriptor::json(CONFIG_KEY, CONFIG_VERSION, config_metric)
                .description("harvest build and run settings")
                .config(),
        )
        .with(
            MetricDescriptor::json("host", HOST_VERSION, host_metric)
                .description("host name, CPU parallelism and process id"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectionType;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn ctx<'a>(dir: &'a TempDir) -> GatherContext<'a> {
        GatherContext {
            key: CONFIG_KEY,
            since: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            max_data_size: 1024,
            staging_dir: dir.path(),
            collection_type: CollectionType::Manual,
        }
    }

    #[test]
    fn test_default_registry() {
        let registry = default_registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(CONFIG_KEY).unwrap().is_config);
        assert!(!registry.get("host").unwrap().is_config);
    }

    #[test]
    fn test_config_payload() {
        let dir = TempDir::new().unwrap();
        let MetricOutput::Json(value) = config_metric(&ctx(&dir)).unwrap() else {
            panic!("config must be JSON");
        };
        assert_eq!(value["harvest_version"], crate::VERSION);
        assert_eq!(value["collection_type"], "manual");
        assert_eq!(value["max_data_size"], 1024);
    }

    #[test]
    fn test_host_payload() {
        let dir = TempDir::new().unwrap();
        let MetricOutput::Json(value) = host_metric(&ctx(&dir)).unwrap() else {
            panic!("host must be JSON");
        };
        assert_eq!(value["pid"], std::process::id());
    }
}
