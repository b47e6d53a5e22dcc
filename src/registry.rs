// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metric registry and handler contract.
//!
//! This module defines the core abstractions for plugging data sources into a run:
//! - [`MetricHandler`] trait that every data-producing function implements
//! - [`MetricDescriptor`] carrying a handler's key, version, format and policies
//! - [`MetricRegistry`] holding the descriptors a collector expands into collections
//!
//! # Example
//!
//! ```rust,ignore
//! use harvest::registry::{MetricDescriptor, MetricOutput, MetricRegistry};
//!
//! let mut registry = MetricRegistry::new();
//! registry.register(
//!     MetricDescriptor::json("config", "1.0", |_ctx| MetricOutput::json(&serde_json::json!({"version": "1.0"})))
//!         .config(),
//! );
//! registry.register(MetricDescriptor::csv("jobs", "1.2", |ctx| {
//!     let mut out = ctx.csv_splitter("jobs")?;
//!     out.write_str("id,status\n")?;
//!     Ok(MetricOutput::csv_files(out.finalize()?))
//! }));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collector::CollectionType;
use crate::error::MetricError;
use crate::slicing::Slicer;
use crate::splitter::CsvFileSplitter;

/// Shipping group used when a metric does not name one.
pub const DEFAULT_SHIPPING_GROUP: &str = "default";

/// Key of the mandatory configuration metric.
pub const CONFIG_KEY: &str = "config";

/// Payload format produced by a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Csv,
}

impl DataFormat {
    /// File extension used inside archives.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Arguments handed to a metric handler for one slice.
#[derive(Debug, Clone, Copy)]
pub struct GatherContext<'a> {
    pub key: &'a str,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Upper bound for a single output file, in bytes.
    pub max_data_size: u64,
    /// Directory where CSV output should be written.
    pub staging_dir: &'a Path,
    pub collection_type: CollectionType,
}

impl GatherContext<'_> {
    /// Path for a CSV file named `name` inside the staging directory.
    pub fn csv_path(&self, name: &str) -> PathBuf {
        self.staging_dir.join(format!("{}.csv", name))
    }

    /// Splitter writing `name.csv` into the staging directory, bounded by `max_data_size`.
    pub fn csv_splitter(&self, name: &str) -> io::Result<CsvFileSplitter> {
        CsvFileSplitter::new(self.csv_path(name), self.max_data_size)
    }
}

/// Output of a metric handler.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOutput {
    /// JSON-serializable value.
    Json(serde_json::Value),
    /// Zero or more CSV files on disk, in order.
    Csv(Vec<PathBuf>),
}

impl MetricOutput {
    /// Serialize any value into a JSON output.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, MetricError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Single CSV file.
    pub fn csv_file(path: impl Into<PathBuf>) -> Self {
        Self::Csv(vec![path.into()])
    }

    /// CSV files, typically from [`CsvFileSplitter::finalize`].
    pub fn csv_files(paths: Vec<PathBuf>) -> Self {
        Self::Csv(paths)
    }

    /// Format of this output.
    pub fn format(&self) -> DataFormat {
        match self {
            Self::Json(_) => DataFormat::Json,
            Self::Csv(_) => DataFormat::Csv,
        }
    }
}

/// Trait that all data-producing functions implement.
///
/// Handlers run synchronously, one at a time. Errors and panics are caught by the
/// collection that invoked the handler and only mark that collection failed.
pub trait MetricHandler: Send + Sync {
    /// Produce the payload for `ctx.since..ctx.until`.
    fn gather(&self, ctx: &GatherContext<'_>) -> Result<MetricOutput, MetricError>;
}

impl<F> MetricHandler for F
where
    F: Fn(&GatherContext<'_>) -> Result<MetricOutput, MetricError> + Send + Sync,
{
    fn gather(&self, ctx: &GatherContext<'_>) -> Result<MetricOutput, MetricError> {
        self(ctx)
    }
}

/// Registration record of one metric.
#[derive(Clone)]
pub struct MetricDescriptor {
    pub key: String,
    pub version: String,
    pub description: String,
    pub format: DataFormat,
    pub is_config: bool,
    pub shipping_group: String,
    slicer: Option<Arc<dyn Slicer>>,
    handler: Arc<dyn MetricHandler>,
}

impl MetricDescriptor {
    /// Create a descriptor around an existing handler.
    pub fn new(
        key: impl Into<String>,
        version: impl Into<String>,
        format: DataFormat,
        handler: Arc<dyn MetricHandler>,
    ) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            description: String::new(),
            format,
            is_config: false,
            shipping_group: DEFAULT_SHIPPING_GROUP.to_string(),
            slicer: None,
            handler,
        }
    }

    /// JSON metric backed by a closure.
    pub fn json<F>(key: impl Into<String>, version: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&GatherContext<'_>) -> Result<MetricOutput, MetricError> + Send + Sync + 'static,
    {
        Self::new(key, version, DataFormat::Json, Arc::new(handler))
    }

    /// CSV metric backed by a closure.
    pub fn csv<F>(key: impl Into<String>, version: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&GatherContext<'_>) -> Result<MetricOutput, MetricError> + Send + Sync + 'static,
    {
        Self::new(key, version, DataFormat::Csv, Arc::new(handler))
    }

    /// Set the human readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark this metric as the run's configuration metric.
    pub fn config(mut self) -> Self {
        self.is_config = true;
        self
    }

    /// Slice the run window with `slicer`; every slice is shipped on its own.
    pub fn slicer(mut self, slicer: impl Slicer + 'static) -> Self {
        self.slicer = Some(Arc::new(slicer));
        self
    }

    /// Put this metric into a named shipping group.
    pub fn shipping_group(mut self, group: impl Into<String>) -> Self {
        self.shipping_group = group.into();
        self
    }

    /// Custom slicer, if any.
    pub fn slicer_ref(&self) -> Option<&dyn Slicer> {
        self.slicer.as_deref()
    }

    /// Check if a custom slicer is registered.
    pub fn has_slicer(&self) -> bool {
        self.slicer.is_some()
    }

    /// Handler producing the payload.
    pub fn handler(&self) -> &dyn MetricHandler {
        self.handler.as_ref()
    }

    /// Archive file name, `{key}.{format}`.
    pub fn filename(&self) -> String {
        format!("{}.{}", self.key, self.format.extension())
    }
}

impl fmt::Debug for MetricDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("format", &self.format)
            .field("is_config", &self.is_config)
            .field("shipping_group", &self.shipping_group)
            .field("has_slicer", &self.has_slicer())
            .finish()
    }
}

/// Summary of a registered metric, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricInfo {
    pub key: String,
    pub version: String,
    pub description: String,
    pub format: DataFormat,
}

/// Registry of available metrics, keyed by metric key.
///
/// Iteration is in key order, which fixes the gather order of a run.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, Arc<MetricDescriptor>>,
}

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, replacing any earlier registration of the same key.
    pub fn register(&mut self, descriptor: MetricDescriptor) -> &mut Self {
        let key = descriptor.key.clone();
        if self.metrics.insert(key.clone(), Arc::new(descriptor)).is_some() {
            warn!(key = %key, "Metric registered twice, keeping the last registration");
        }
        self
    }

    /// Builder-style registration.
    pub fn with(mut self, descriptor: MetricDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Get a metric by key.
    pub fn get(&self, key: &str) -> Option<&Arc<MetricDescriptor>> {
        self.metrics.get(key)
    }

    /// Check if a metric is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.metrics.contains_key(key)
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Iterate over registered metrics in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MetricDescriptor>> {
        self.metrics.values()
    }

    /// Key, version and description of every registered metric.
    pub fn catalog(&self) -> Vec<MetricInfo> {
        self.metrics
            .values()
            .map(|m| MetricInfo {
                key: m.key.clone(),
                version: m.version.clone(),
                description: m.description.clone(),
                format: m.format,
            })
            .collect()
    }
}
