// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Packages: capacity-bounded groups of collections, one archive each.
//!
//! A [`Package`] admits gathered collections until its byte budget is spent,
//! then is processed exactly once: the archive is built, optionally shipped, and
//! the collections' staged files are deleted.
//!
//! Every archive carries, after the admitted collections, the run's config
//! collection, a `data_collection_status.csv` audit of the package, and a
//! `manifest.json` mapping file names to versions. These three are written
//! regardless of the remaining capacity.

pub mod archive;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::collection::{render_status, Collection, STATUS_FILENAME, STATUS_VERSION};
use crate::error::{ArchiveError, ShipError};
use crate::shipping::Shipper;
use crate::watermark::WatermarkUpdates;

use archive::{entry_name, next_archive_path, ArchiveWriter};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Default byte budget of a package. Uploads are limited to 100 MiB, assuming
/// roughly 50% compression.
pub const DEFAULT_CAPACITY: u64 = 200 * 1024 * 1024;

/// Archive member listing `{filename: version}`.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Run-wide inputs for building an archive.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveContext<'a> {
    /// Directory receiving the archive.
    pub destination: &'a Path,
    /// `{prefix}-{until}` shared by all archives of the run.
    pub tarname_base: &'a str,
    /// mtime of every entry.
    pub until: DateTime<Utc>,
    /// The run's config collection, attached to every archive.
    pub config: Option<&'a Collection>,
}

/// A bounded container of collections backing one archive.
#[derive(Debug)]
pub struct Package {
    group: String,
    collections: Vec<Collection>,
    used_keys: HashSet<String>,
    failed_keys: HashSet<String>,
    total_bytes: u64,
    capacity: u64,
    processed: bool,
    tar_path: Option<PathBuf>,
    shipping_succeeded: Option<bool>,
    manifest: BTreeMap<String, String>,
}

impl Package {
    /// Create an empty package for a shipping group.
    pub fn new(group: impl Into<String>, capacity: u64) -> Self {
        Self {
            group: group.into(),
            collections: Vec::new(),
            used_keys: HashSet::new(),
            failed_keys: HashSet::new(),
            total_bytes: 0,
            capacity,
            processed: false,
            tar_path: None,
            shipping_succeeded: None,
            manifest: BTreeMap::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Admitted collections, in admission order.
    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Path of the built archive, if building succeeded.
    pub fn tar_path(&self) -> Option<&Path> {
        self.tar_path.as_deref()
    }

    /// `None` until shipping was attempted.
    pub fn shipping_succeeded(&self) -> Option<bool> {
        self.shipping_succeeded
    }

    /// Files written to the archive and their versions.
    pub fn manifest(&self) -> &BTreeMap<String, String> {
        &self.manifest
    }

    /// Check whether `requested` more bytes fit the budget.
    pub fn has_room(&self, requested: u64) -> bool {
        self.total_bytes.saturating_add(requested) <= self.capacity
    }

    pub fn is_key_used(&self, key: &str) -> bool {
        self.used_keys.contains(key)
    }

    /// Open, without `key`, and with room for `size` bytes.
    pub fn accepts(&self, key: &str, size: u64) -> bool {
        !self.processed && !self.is_key_used(key) && self.has_room(size)
    }

    /// Add a collection. The caller has checked [`Package::accepts`].
    pub fn admit(&mut self, collection: Collection) {
        self.used_keys.insert(collection.key().to_string());
        self.total_bytes += collection.payload_size();
        self.collections.push(collection);
    }

    /// Write the archive into the destination directory.
    ///
    /// Failures are logged and reported as `false`; no partial archive is left.
    pub fn build_archive(&mut self, ctx: &ArchiveContext<'_>) -> bool {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let path = match next_archive_path(ctx.destination, ctx.tarname_base) {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "Failed to write analytics archive file");
                return false;
            }
        };

        let result = self.write_archive(&path, ctx);

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("package.build", start.elapsed());

        match result {
            Ok(()) => {
                info!(archive = %path.display(), entries = self.manifest.len(), "Built analytics archive");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_archive_built(self.total_bytes);
                self.tar_path = Some(path);
                true
            }
            Err(e) => {
                error!(archive = %path.display(), error = %e, "Failed to write analytics archive file");
                if let Err(e) = fs::remove_file(&path) {
                    debug!(error = %e, "No partial archive to remove");
                }
                false
            }
        }
    }

    fn write_archive(&mut self, path: &Path, ctx: &ArchiveContext<'_>) -> Result<(), ArchiveError> {
        let mut writer = ArchiveWriter::create(path)?;

        for collection in self.collections.iter().chain(ctx.config) {
            if !append_collection(&mut writer, &mut self.manifest, collection, ctx.until)? {
                self.failed_keys.insert(collection.key().to_string());
            }
        }
        if ctx.config.is_none() {
            error!("'config' collector data is missing, and is required to ship");
        }

        let status = render_status(&self.collections);
        writer.append_bytes(&entry_name(STATUS_FILENAME), status.as_bytes(), ctx.until)?;
        self.manifest
            .insert(STATUS_FILENAME.to_string(), STATUS_VERSION.to_string());

        let manifest = serde_json::to_vec(&self.manifest)?;
        writer.append_bytes(&entry_name(MANIFEST_FILENAME), &manifest, ctx.until)?;

        writer.finish()?;
        Ok(())
    }

    /// Upload the archive. Single attempt; the outcome is recorded.
    pub async fn ship(&mut self, shipper: &dyn Shipper) -> bool {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let result = match self.check_shippable(shipper) {
            Ok(path) => {
                debug!(archive = %path.display(), "Shipping analytics file");
                shipper.upload(&path).await
            }
            Err(e) => Err(e),
        };

        let succeeded = match result {
            Ok(()) => {
                info!(archive = ?self.tar_path, "Shipped analytics archive");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_archive_shipped();
                true
            }
            Err(e) if e.is_precondition() => {
                error!(reason = %e, "Not shipping analytics archive");
                false
            }
            Err(e) => {
                error!(archive = ?self.tar_path, error = %e, "Shipping analytics archive failed");
                false
            }
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("package.ship", start.elapsed());

        self.shipping_succeeded = Some(succeeded);
        succeeded
    }

    fn check_shippable(&self, shipper: &dyn Shipper) -> Result<PathBuf, ShipError> {
        let path = self
            .tar_path
            .clone()
            .ok_or_else(|| ShipError::NotConfigured("analytics archive not found".to_string()))?;
        if !path.exists() {
            return Err(ShipError::NotConfigured(format!(
                "analytics archive {} not found",
                path.display()
            )));
        }
        shipper.check_configured()?;
        Ok(path)
    }

    /// Remove the staged payload files of every admitted collection.
    pub fn delete_collected_files(&mut self) {
        for collection in &mut self.collections {
            collection.cleanup();
        }
    }

    /// Build, ship when a shipper is given, then delete staged files.
    ///
    /// A processed package is left alone.
    pub async fn process(&mut self, ctx: &ArchiveContext<'_>, shipper: Option<&dyn Shipper>) {
        if self.processed {
            return;
        }
        self.build_archive(ctx);
        if let Some(shipper) = shipper {
            self.ship(shipper).await;
        }
        self.delete_collected_files();
        self.processed = true;
    }

    /// Forward watermark updates when the archive was delivered; otherwise
    /// lock every key it carried.
    ///
    /// Keys whose payload could not be written into the archive are locked
    /// either way.
    pub fn update_watermarks(&self, updates: &mut WatermarkUpdates) {
        if self.shipping_succeeded == Some(true) {
            for collection in &self.collections {
                if !self.failed_keys.contains(collection.key()) {
                    collection.update_watermark(updates);
                }
            }
        } else {
            for key in &self.used_keys {
                updates.lock(key);
            }
        }
        for key in &self.failed_keys {
            updates.lock(key);
        }
    }
}

/// Append a non-empty collection and record it in the manifest.
///
/// Returns `false` when the entry was skipped. I/O errors abort the archive,
/// the tar stream may be truncated mid-entry.
fn append_collection(
    writer: &mut ArchiveWriter,
    manifest: &mut BTreeMap<String, String>,
    collection: &Collection,
    mtime: DateTime<Utc>,
) -> Result<bool, ArchiveError> {
    if collection.is_empty() {
        return Ok(true);
    }
    match collection.append_to_archive(writer.builder(), mtime) {
        Ok(()) => {
            manifest.insert(collection.filename(), collection.version().to_string());
            Ok(true)
        }
        Err(e @ ArchiveError::IoError(_)) => Err(e),
        Err(e) => {
            error!(filename = %collection.filename(), error = %e, "Could not generate metric");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::GatherSettings;
    use crate::collector::CollectionType;
    use crate::error::MetricError;
    use crate::registry::{MetricDescriptor, MetricOutput};
    use crate::shipping::MockShipper;
    use crate::slicing::TimeSlice;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn until() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap()
    }

    fn gathered(meta: MetricDescriptor, staging: &Path) -> Collection {
        let slice = TimeSlice::new(until() - chrono::TimeDelta::days(1), until());
        let mut collection = Collection::new(Arc::new(meta), slice);
        collection.gather(&GatherSettings {
            staging_dir: staging,
            max_data_size: DEFAULT_CAPACITY,
            collection_type: CollectionType::DryRun,
        });
        collection
    }

    fn json_metric(key: &str, version: &str, body: &'static str) -> MetricDescriptor {
        MetricDescriptor::json(key, version, move |_ctx| {
            Ok(MetricOutput::Json(serde_json::from_str(body)?))
        })
    }

    fn read_archive(path: &Path) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(path).unwrap()));
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

    #[test]
    fn test_admission_bookkeeping() {
        let temp = TempDir::new().unwrap();
        let mut package = Package::new("default", 30);
        assert!(package.has_room(30));
        assert!(!package.has_room(31));

        package.admit(gathered(json_metric("a", "1.0", r#""0123456789""#), temp.path()));
        assert_eq!(package.total_bytes(), 12);
        assert!(package.is_key_used("a"));
        assert!(!package.accepts("a", 1));
        assert!(package.accepts("b", 18));
        assert!(!package.accepts("b", 19));
    }

    #[test]
    fn test_build_archive_layout() {
        let temp = TempDir::new().unwrap();
        let config = gathered(
            json_metric("config", "1.2", r#"{"platform":"linux"}"#).config(),
            temp.path(),
        );
        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(json_metric("hosts", "1.0", "[1,2]"), temp.path()));
        package.admit(gathered(
            MetricDescriptor::json("broken", "1.0", |_ctx| {
                Err(MetricError::Failed("offline".to_string()))
            }),
            temp.path(),
        ));

        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: Some(&config),
        };
        assert!(package.build_archive(&ctx));

        let path = package.tar_path().unwrap().to_path_buf();
        assert!(path.ends_with("analytics-2024-02-02-000000+0000-0.tar.gz"));

        let entries = read_archive(&path);
        assert_eq!(
            entries.keys().collect::<Vec<_>>(),
            vec![
                "./config.json",
                "./data_collection_status.csv",
                "./hosts.json",
                "./manifest.json"
            ]
        );
        assert_eq!(entries["./hosts.json"], "[1,2]");

        let manifest: BTreeMap<String, String> =
            serde_json::from_str(&entries["./manifest.json"]).unwrap();
        assert_eq!(manifest["config.json"], "1.2");
        assert_eq!(manifest["hosts.json"], "1.0");
        assert_eq!(manifest["data_collection_status.csv"], "1.0");
        assert!(!manifest.contains_key("broken.json"));

        let status = &entries["./data_collection_status.csv"];
        assert!(status.contains(",hosts.json,ok,"));
        assert!(status.contains(",broken.json,failed,"));
    }

    #[test]
    fn test_second_archive_gets_next_index() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };

        let mut first = Package::new("default", DEFAULT_CAPACITY);
        let mut second = Package::new("default", DEFAULT_CAPACITY);
        assert!(first.build_archive(&ctx));
        assert!(second.build_archive(&ctx));
        assert!(second
            .tar_path()
            .unwrap()
            .ends_with(format!("{}-1.tar.gz", base)));
    }

    #[test]
    fn test_build_failure_leaves_no_tar_path() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: &temp.path().join("missing"),
            tarname_base: &base,
            until: until(),
            config: None,
        };
        let mut package = Package::new("default", DEFAULT_CAPACITY);
        assert!(!package.build_archive(&ctx));
        assert!(package.tar_path().is_none());
    }

    #[tokio::test]
    async fn test_ship_without_archive_skips_upload() {
        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().never();
        shipper.expect_upload().never();

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        assert!(!package.ship(&shipper).await);
        assert_eq!(package.shipping_succeeded(), Some(false));
    }

    #[tokio::test]
    async fn test_ship_not_configured_skips_upload() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };
        let mut shipper = MockShipper::new();
        shipper
            .expect_check_configured()
            .returning(|| Err(ShipError::NotConfigured("ingestion URL is not set".to_string())));
        shipper.expect_upload().never();

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.build_archive(&ctx);
        assert!(!package.ship(&shipper).await);
    }

    #[tokio::test]
    async fn test_process_runs_once() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("stage");
        fs::create_dir(&staging).unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };

        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().returning(|| Ok(()));
        shipper.expect_upload().times(1).returning(|_| Ok(()));

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(
            MetricDescriptor::csv("jobs", "1.0", |ctx| {
                let path = ctx.csv_path("jobs");
                fs::write(&path, "id\n1\n")?;
                Ok(MetricOutput::csv_file(path))
            }),
            &staging,
        ));

        package.process(&ctx, Some(&shipper)).await;
        package.process(&ctx, Some(&shipper)).await;

        assert!(package.is_processed());
        assert_eq!(package.shipping_succeeded(), Some(true));
        assert!(!staging.join("jobs.csv").exists());
        assert_eq!(read_archive(package.tar_path().unwrap())["./jobs.csv"], "id\n1\n");
    }

    #[tokio::test]
    async fn test_failed_shipping_locks_keys() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };
        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().returning(|| Ok(()));
        shipper
            .expect_upload()
            .returning(|_| Err(ShipError::rejected(503, "unavailable")));

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(json_metric("hosts", "1.0", "{}"), temp.path()));
        package.process(&ctx, Some(&shipper)).await;

        let mut updates = WatermarkUpdates::new();
        package.update_watermarks(&mut updates);
        assert!(updates.is_locked("hosts"));
        assert_eq!(updates.pending("hosts"), None);
    }

    #[tokio::test]
    async fn test_shipped_package_advances_watermarks() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };
        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().returning(|| Ok(()));
        shipper.expect_upload().returning(|_| Ok(()));

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(json_metric("hosts", "1.0", "{}"), temp.path()));
        package.process(&ctx, Some(&shipper)).await;

        let mut updates = WatermarkUpdates::new();
        package.update_watermarks(&mut updates);
        assert_eq!(updates.pending("hosts"), Some(until()));
    }

    #[tokio::test]
    async fn test_long_key_is_archived_and_advances() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };
        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().returning(|| Ok(()));
        shipper.expect_upload().times(1).returning(|_| Ok(()));

        let key = "k".repeat(95);
        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(json_metric(&key, "1.0", "[1]"), temp.path()));
        package.process(&ctx, Some(&shipper)).await;

        let filename = format!("{}.json", key);
        let entries = read_archive(package.tar_path().unwrap());
        assert_eq!(entries[&format!("./{}", filename)], "[1]");
        assert_eq!(package.manifest()[&filename], "1.0");

        let mut updates = WatermarkUpdates::new();
        package.update_watermarks(&mut updates);
        assert_eq!(updates.pending(&key), Some(until()));
    }

    #[tokio::test]
    async fn test_unwritable_entry_locks_its_key() {
        let temp = TempDir::new().unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: temp.path(),
            tarname_base: &base,
            until: until(),
            config: None,
        };
        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().returning(|| Ok(()));
        shipper.expect_upload().times(1).returning(|_| Ok(()));

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(json_metric("bad\0key", "1.0", "{}"), temp.path()));
        package.admit(gathered(json_metric("hosts", "1.0", "{}"), temp.path()));
        package.process(&ctx, Some(&shipper)).await;

        assert_eq!(package.shipping_succeeded(), Some(true));
        assert!(!package.manifest().contains_key("bad\0key.json"));

        let mut updates = WatermarkUpdates::new();
        package.update_watermarks(&mut updates);
        assert!(updates.is_locked("bad\0key"));
        assert_eq!(updates.pending("bad\0key"), None);
        assert_eq!(updates.pending("hosts"), Some(until()));
    }

    #[tokio::test]
    async fn test_io_error_fails_build_and_locks_keys() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("stage");
        let out = temp.path().join("out");
        fs::create_dir(&staging).unwrap();
        fs::create_dir(&out).unwrap();
        let base = archive::tarname_base("analytics", until());
        let ctx = ArchiveContext {
            destination: &out,
            tarname_base: &base,
            until: until(),
            config: None,
        };

        let mut package = Package::new("default", DEFAULT_CAPACITY);
        package.admit(gathered(json_metric("hosts", "1.0", "{}"), &staging));
        package.admit(gathered(
            MetricDescriptor::csv("jobs", "1.0", |ctx| {
                let path = ctx.csv_path("jobs");
                fs::write(&path, "id\n1\n")?;
                Ok(MetricOutput::csv_file(path))
            }),
            &staging,
        ));
        // Staged payload disappears before the archive is written
        fs::remove_file(staging.join("jobs.csv")).unwrap();

        assert!(!package.build_archive(&ctx));
        assert!(package.tar_path().is_none());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);

        let mut shipper = MockShipper::new();
        shipper.expect_check_configured().never();
        shipper.expect_upload().never();
        assert!(!package.ship(&shipper).await);

        let mut updates = WatermarkUpdates::new();
        package.update_watermarks(&mut updates);
        assert!(updates.is_locked("hosts"));
        assert!(updates.is_locked("jobs"));
    }
}
