// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gather orchestration.
//!
//! [`Collector::gather`] runs the whole lifecycle of one harvest:
//!
//! ```text
//! idle -> locking -> initializing -> gathering-config -> gathering-json
//!      -> gathering-csv -> packaging -> persisting -> cleanup -> idle
//! ```
//!
//! Metrics are gathered one after another. Each gathered collection is placed
//! into the first open package of its shipping group that does not carry its
//! key yet and still has room; collections of sliced metrics close their package
//! right away so the next slice lands in a fresh archive.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collection::{Collection, GatherSettings};
use crate::error::{ConfigError, GatherError};
use crate::interval::GatherInterval;
use crate::package::archive::tarname_base;
use crate::package::{ArchiveContext, Package, DEFAULT_CAPACITY};
use crate::registry::{DataFormat, MetricRegistry};
use crate::shipping::{DisabledShipper, Shipper};
use crate::slicing::{SliceRequest, Slicer, TimeSlice, TrivialSlicer};
use crate::store::{
    AdvisoryLock, Entitlement, LockGuard, MemoryStore, NoLock, StaticEntitlement,
    WatermarkStore, GATHER_LOCK_NAME,
};
use crate::watermark::{WatermarkUpdates, Watermarks};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Default archive name prefix.
pub const DEFAULT_ARCHIVE_PREFIX: &str = "analytics";

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionType {
    /// Requested by an operator; gathers and ships.
    Manual,
    /// Triggered by a scheduler; gathers and ships, skips quietly.
    Scheduled,
    /// Gathers and keeps the archives, nothing is shipped or persisted.
    #[default]
    DryRun,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::DryRun => "dry-run",
        }
    }

    pub fn is_dry_run(&self) -> bool {
        *self == Self::DryRun
    }

    /// Manual and scheduled runs ship their archives.
    pub fn is_shipping_enabled(&self) -> bool {
        !self.is_dry_run()
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            other => Err(ConfigError::invalid(
                "collectionType",
                format!("unknown collection type '{}'", other),
            )),
        }
    }
}

/// Arguments of a single [`Collector::gather`] call.
#[derive(Debug, Clone, Default)]
pub struct GatherRequest {
    /// Directory receiving archives and the staging directory. Defaults to the
    /// system temp directory.
    pub destination: Option<PathBuf>,
    /// Only gather these keys. `config` must be included.
    pub subset: Option<BTreeSet<String>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl GatherRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    pub fn subset<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subset = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    fn includes(&self, key: &str) -> bool {
        self.subset.as_ref().map_or(true, |keys| keys.contains(key))
    }
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Locking,
    Initializing,
    GatheringConfig,
    GatheringJson,
    GatheringCsv,
    Packaging,
    Persisting,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locking => "locking",
            Self::Initializing => "initializing",
            Self::GatheringConfig => "gathering-config",
            Self::GatheringJson => "gathering-json",
            Self::GatheringCsv => "gathering-csv",
            Self::Packaging => "packaging",
            Self::Persisting => "persisting",
            Self::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// State of one gather invocation.
struct GatherRun {
    phase: Phase,
    staging: TempDir,
    destination: PathBuf,
    tarname_base: String,
    interval: GatherInterval,
    watermarks: Watermarks,
    config: Option<Collection>,
    json: Vec<Collection>,
    csv: Vec<Collection>,
    /// All packages in creation order; first-fit scans filter by group.
    packages: Vec<Package>,
    updates: WatermarkUpdates,
}

impl GatherRun {
    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "Gather phase");
        self.phase = phase;
    }

    fn tar_paths(&self) -> Vec<PathBuf> {
        self.packages
            .iter()
            .filter_map(|p| p.tar_path().map(Path::to_path_buf))
            .collect()
    }
}

/// Entry point for harvesting registered metrics.
pub struct Collector {
    registry: MetricRegistry,
    collection_type: CollectionType,
    store: Arc<dyn WatermarkStore>,
    lock: Arc<dyn AdvisoryLock>,
    entitlement: Arc<dyn Entitlement>,
    shipper: Arc<dyn Shipper>,
    capacity: u64,
    archive_prefix: String,
}

impl Collector {
    /// Create a dry-run collector with in-memory state and no shipping.
    pub fn new(registry: MetricRegistry) -> Self {
        Self {
            registry,
            collection_type: CollectionType::default(),
            store: Arc::new(MemoryStore::new()),
            lock: Arc::new(NoLock),
            entitlement: Arc::new(StaticEntitlement::allow_all()),
            shipper: Arc::new(DisabledShipper),
            capacity: DEFAULT_CAPACITY,
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
        }
    }

    pub fn with_collection_type(mut self, collection_type: CollectionType) -> Self {
        self.collection_type = collection_type;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WatermarkStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn AdvisoryLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_entitlement(mut self, entitlement: Arc<dyn Entitlement>) -> Self {
        self.entitlement = entitlement;
        self
    }

    pub fn with_shipper(mut self, shipper: Arc<dyn Shipper>) -> Self {
        self.shipper = shipper;
        self
    }

    /// Byte budget of each package, also handed to handlers as their output bound.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_archive_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.archive_prefix = prefix.into();
        self
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn collection_type(&self) -> CollectionType {
        self.collection_type
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Gather, package and (outside dry runs) ship every registered metric.
    ///
    /// Returns `Ok(None)` when the run was skipped: unlicensed, shipping not
    /// configured, another run holds the lock, or no `config` metric. Otherwise
    /// the paths of the archives produced, which outside dry runs have already
    /// been shipped and deleted.
    pub async fn gather(&self, request: GatherRequest) -> Result<Option<Vec<PathBuf>>, GatherError> {
        let span = info_span!(
            "gather",
            run_id = %Uuid::new_v4(),
            collection_type = %self.collection_type
        );
        self.gather_locked(request).instrument(span).await
    }

    async fn gather_locked(&self, request: GatherRequest) -> Result<Option<Vec<PathBuf>>, GatherError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        if !self.is_enabled() {
            return Ok(None);
        }

        debug!(from = %Phase::Idle, to = %Phase::Locking, "Gather phase");
        let _guard = match LockGuard::try_acquire(self.lock.as_ref(), GATHER_LOCK_NAME)? {
            Some(guard) => guard,
            None => {
                self.log_skip("Not gathering analytics, another task holds lock");
                return Ok(None);
            }
        };

        let mut run = self.initialize(&request)?;
        let outcome = self.execute(&mut run).await;
        let paths = run.tar_paths();
        self.cleanup(run);

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("collector.gather", start.elapsed());

        if outcome? {
            info!(archives = paths.len(), "Gather finished");
            Ok(Some(paths))
        } else {
            Ok(None)
        }
    }

    fn is_enabled(&self) -> bool {
        if !self.entitlement.is_valid_license() {
            self.log_skip("Invalid License provided, or No License Provided");
            return false;
        }
        if self.collection_type.is_shipping_enabled() && !self.entitlement.is_shipping_configured() {
            self.log_skip("Not gathering analytics, shipping is not configured");
            return false;
        }
        true
    }

    /// Skips are routine for scheduled runs, so they only log at debug level.
    fn log_skip(&self, message: &str) {
        if self.collection_type == CollectionType::Scheduled {
            debug!("{}", message);
        } else {
            error!("{}", message);
        }
    }

    fn initialize(&self, request: &GatherRequest) -> Result<GatherRun, GatherError> {
        let last_gather = self.store.last_gather()?;
        debug!(last_gather = ?last_gather, "Last analytics run");

        let destination = request
            .destination
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&destination)?;
        let staging = tempfile::Builder::new()
            .prefix("harvest-")
            .tempdir_in(&destination)?;

        let watermarks = self.store.load()?;
        let interval = GatherInterval::calculate(request.since, request.until, last_gather, Utc::now())?;
        debug!(since = ?interval.since, until = %interval.until, last_gather = %interval.last_gather, "Collection interval");

        let mut run = GatherRun {
            phase: Phase::Locking,
            staging,
            tarname_base: tarname_base(&self.archive_prefix, interval.until),
            destination,
            interval,
            watermarks,
            config: None,
            json: Vec::new(),
            csv: Vec::new(),
            packages: Vec::new(),
            updates: WatermarkUpdates::new(),
        };
        run.enter(Phase::Initializing);
        self.create_collections(&mut run, request);
        Ok(run)
    }

    /// Expand every registered metric into one collection per slice.
    fn create_collections(&self, run: &mut GatherRun, request: &GatherRequest) {
        for meta in self.registry.iter() {
            if !request.includes(&meta.key) {
                continue;
            }
            let slice_request = SliceRequest {
                key: &meta.key,
                last_gather: run.interval.last_gather,
                since: run.interval.since,
                until: run.interval.until,
                watermarks: &run.watermarks,
            };

            if meta.is_config {
                let since = run.interval.default_since(run.watermarks.get(&meta.key).copied());
                let slice = TimeSlice::new(since, run.interval.until);
                run.config = Some(Collection::new(Arc::clone(meta), slice));
                continue;
            }

            let slicer: &dyn Slicer = meta.slicer_ref().unwrap_or(&TrivialSlicer);
            let target = match meta.format {
                DataFormat::Json => &mut run.json,
                DataFormat::Csv => &mut run.csv,
            };
            for slice in slicer.slices(&slice_request) {
                target.push(Collection::new(Arc::clone(meta), slice));
            }
        }
        debug!(
            json = run.json.len(),
            csv = run.csv.len(),
            "Created collections"
        );
    }

    /// Gather and package. `false` when the run has no config collection.
    async fn execute(&self, run: &mut GatherRun) -> Result<bool, GatherError> {
        run.enter(Phase::GatheringConfig);
        let staging_dir = run.staging.path().to_path_buf();
        let settings = GatherSettings {
            staging_dir: &staging_dir,
            max_data_size: self.capacity,
            collection_type: self.collection_type,
        };

        match run.config.as_mut() {
            Some(config) => config.gather(&settings),
            None => {
                self.log_skip("'config' collector data is missing");
                return Ok(false);
            }
        }

        run.enter(Phase::GatheringJson);
        for mut collection in std::mem::take(&mut run.json) {
            collection.gather(&settings);
            self.admit(run, collection).await;
        }

        run.enter(Phase::GatheringCsv);
        for mut collection in std::mem::take(&mut run.csv) {
            collection.gather(&settings);
            if !collection.is_successful() {
                run.updates.lock(collection.key());
                continue;
            }
            if collection.is_empty() {
                continue;
            }
            if collection.has_sub_collections() {
                for sub in collection.take_sub_collections() {
                    self.admit(run, sub).await;
                }
            } else {
                self.admit(run, collection).await;
            }
        }

        run.enter(Phase::Packaging);
        for index in 0..run.packages.len() {
            self.process_package(run, index).await;
        }

        if self.collection_type.is_shipping_enabled() {
            run.enter(Phase::Persisting);
            self.persist(run)?;
        }

        Ok(true)
    }

    /// First-fit admission into the collection's shipping group.
    async fn admit(&self, run: &mut GatherRun, collection: Collection) {
        let size = collection.payload_size();
        let ship_now = collection.ship_immediately();

        let index = match run
            .packages
            .iter()
            .position(|p| p.group() == collection.shipping_group() && p.accepts(collection.key(), size))
        {
            Some(index) => index,
            None => {
                debug!(group = %collection.shipping_group(), key = %collection.key(), "Opening new package");
                run.packages
                    .push(Package::new(collection.shipping_group(), self.capacity));
                run.packages.len() - 1
            }
        };
        run.packages[index].admit(collection);

        if ship_now {
            self.process_package(run, index).await;
        }
    }

    async fn process_package(&self, run: &mut GatherRun, index: usize) {
        let ctx = ArchiveContext {
            destination: &run.destination,
            tarname_base: &run.tarname_base,
            until: run.interval.until,
            config: run.config.as_ref(),
        };
        let shipper = self
            .collection_type
            .is_shipping_enabled()
            .then_some(self.shipper.as_ref());
        run.packages[index].process(&ctx, shipper).await;
    }

    fn persist(&self, run: &mut GatherRun) -> Result<(), GatherError> {
        for package in &run.packages {
            package.update_watermarks(&mut run.updates);
        }
        for key in run.updates.locked_keys() {
            warn!(key, "Not advancing watermark, gathering or shipping failed");
        }

        let mut watermarks = run.watermarks.clone();
        let changed = run.updates.merge_into(&mut watermarks);
        self.store.save(&watermarks)?;
        self.store.persist_last_gather(run.interval.until)?;
        debug!(changed, "Persisted watermarks");
        Ok(())
    }

    fn cleanup(&self, mut run: GatherRun) {
        run.enter(Phase::Cleanup);
        let tar_paths = run.tar_paths();

        if let Err(e) = run.staging.close() {
            warn!(error = %e, "Failed to remove staging directory");
        }
        if !self.collection_type.is_dry_run() {
            for path in tar_paths {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(archive = %path.display(), error = %e, "Failed to delete archive");
                }
            }
        }
        debug!(from = %Phase::Cleanup, to = %Phase::Idle, "Gather phase");
    }
}
