// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;

use harvest::error::ShipError;
use harvest::registry::{MetricDescriptor, MetricOutput, MetricRegistry, CONFIG_KEY};
use harvest::shipping::Shipper;

/// End of every test window.
pub fn until() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
}

/// Registry holding only the config metric.
pub fn config_only() -> MetricRegistry {
    MetricRegistry::new().with(
        MetricDescriptor::json(CONFIG_KEY, "1.0", |ctx| {
            MetricOutput::json(&serde_json::json!({"collection_type": ctx.collection_type.as_str()}))
        })
        .config(),
    )
}

/// Archive members by name, with their contents.
pub fn read_archive(path: &Path) -> BTreeMap<String, String> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    let mut entries = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = String::from_utf8(entry.path_bytes().into_owned()).unwrap();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        entries.insert(name, body);
    }
    entries
}

/// Manifest of an archive.
pub fn read_manifest(path: &Path) -> BTreeMap<String, String> {
    serde_json::from_str(&read_archive(path)["./manifest.json"]).unwrap()
}

/// Files left in a directory, sorted.
pub fn list_dir(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    paths.sort();
    paths
}

/// Shipper counting uploads, accepting or rejecting all of them.
#[derive(Debug, Default)]
pub struct CountingShipper {
    uploads: AtomicUsize,
    reject: bool,
}

impl CountingShipper {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Shipper for CountingShipper {
    fn check_configured(&self) -> Result<(), ShipError> {
        Ok(())
    }

    async fn upload(&self, archive: &Path) -> Result<(), ShipError> {
        assert!(archive.exists(), "archive must exist while uploading");
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            Err(ShipError::rejected(503, "ingestion unavailable"))
        } else {
            Ok(())
        }
    }
}
