// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collections: one metric gathered over one time slice.
//!
//! A [`Collection`] binds a registered [`MetricDescriptor`] to a `(since, until)`
//! slice and carries the outcome of invoking its handler. Payloads come in two
//! shapes:
//!
//! - JSON, kept in memory as encoded text
//! - CSV, kept on disk in the staging directory; a handler returning several
//!   files makes the collection a container of sub-collections, one per file
//!
//! Gathering never fails outward. Handler errors and panics are logged and leave
//! the collection marked failed.

mod status;

pub use status::{render_status, STATUS_FILENAME, STATUS_HEADER, STATUS_VERSION};

use std::fs;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::collector::CollectionType;
use crate::error::{ArchiveError, MetricError};
use crate::package::archive::{append_bytes, append_file, entry_name};
use crate::registry::{DataFormat, GatherContext, MetricDescriptor, MetricOutput};
use crate::slicing::TimeSlice;
use crate::watermark::WatermarkUpdates;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Run-wide arguments for invoking handlers.
#[derive(Debug, Clone, Copy)]
pub struct GatherSettings<'a> {
    pub staging_dir: &'a Path,
    pub max_data_size: u64,
    pub collection_type: CollectionType,
}

/// Materialized result of a gather.
#[derive(Debug)]
pub enum Payload {
    /// Encoded JSON document, `None` until gathered.
    Json(Option<String>),
    /// A single CSV file, or sub-collections when the handler produced several.
    Csv {
        path: Option<PathBuf>,
        subs: Vec<Collection>,
    },
}

/// One metric key over one time slice.
#[derive(Debug)]
pub struct Collection {
    meta: Arc<MetricDescriptor>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Slice belongs to a periodic full resync.
    pub full_sync: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` until gathered.
    pub succeeded: Option<bool>,
    payload: Payload,
}

impl Collection {
    /// Create an ungathered collection for one slice of `meta`.
    pub fn new(meta: Arc<MetricDescriptor>, slice: TimeSlice) -> Self {
        let payload = match meta.format {
            DataFormat::Json => Payload::Json(None),
            DataFormat::Csv => Payload::Csv {
                path: None,
                subs: Vec::new(),
            },
        };
        Self {
            meta,
            since: slice.since,
            until: slice.until,
            full_sync: slice.full_sync,
            started_at: None,
            finished_at: None,
            succeeded: None,
            payload,
        }
    }

    pub fn key(&self) -> &str {
        &self.meta.key
    }

    pub fn version(&self) -> &str {
        &self.meta.version
    }

    pub fn format(&self) -> DataFormat {
        self.meta.format
    }

    pub fn shipping_group(&self) -> &str {
        &self.meta.shipping_group
    }

    pub fn is_config(&self) -> bool {
        self.meta.is_config
    }

    /// Archive file name, `{key}.{format}`.
    pub fn filename(&self) -> String {
        self.meta.filename()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Check whether gathering finished successfully.
    pub fn is_successful(&self) -> bool {
        self.succeeded == Some(true)
    }

    /// Invoke the handler for this slice and store its output.
    pub fn gather(&mut self, settings: &GatherSettings<'_>) {
        let started = Utc::now();
        self.started_at = Some(started);
        #[cfg(feature = "telemetry")]
        let timer = Instant::now();

        let ctx = GatherContext {
            key: &self.meta.key,
            since: self.since,
            until: self.until,
            max_data_size: settings.max_data_size,
            staging_dir: settings.staging_dir,
            collection_type: settings.collection_type,
        };
        let handler = self.meta.handler();
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.gather(&ctx)))
            .unwrap_or_else(|cause| Err(MetricError::Panicked(panic_message(cause))));

        let outcome = result.and_then(|output| self.save_output(output));
        match outcome {
            Ok(()) => {
                self.succeeded = Some(true);
                debug!(key = %self.meta.key, since = %self.since, until = %self.until, "Gathered metric");
            }
            Err(e) => {
                self.succeeded = Some(false);
                error!(filename = %self.filename(), error = %e, "Could not generate metric");
            }
        }

        self.finished_at = Some(Utc::now());
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_gather(&self.meta.key, timer.elapsed(), self.is_successful());
    }

    fn save_output(&mut self, output: MetricOutput) -> Result<(), MetricError> {
        match (&mut self.payload, output) {
            (Payload::Json(data), MetricOutput::Json(value)) => {
                *data = Some(serde_json::to_string(&value)?);
                Ok(())
            }
            (Payload::Csv { path, subs }, MetricOutput::Csv(mut files)) => {
                if files.len() > 1 {
                    let parent = (self.since, self.until, self.full_sync, self.started_at);
                    *subs = files
                        .into_iter()
                        .map(|file| sub_collection(&self.meta, parent, file))
                        .collect();
                } else {
                    *path = files.pop();
                }
                Ok(())
            }
            (_, output) => Err(MetricError::UnexpectedOutput {
                expected: self.meta.format.to_string(),
                actual: output.format().to_string(),
            }),
        }
    }

    /// Check whether there is nothing to archive.
    pub fn is_empty(&self) -> bool {
        match &self.payload {
            Payload::Json(data) => data.is_none(),
            Payload::Csv { path, subs } if subs.is_empty() => path.is_none(),
            Payload::Csv { subs, .. } => subs.iter().all(Collection::is_empty),
        }
    }

    /// Size of the payload in bytes. Sub-collections are not counted.
    pub fn payload_size(&self) -> u64 {
        match &self.payload {
            Payload::Json(data) => data.as_ref().map_or(0, |d| d.len() as u64),
            Payload::Csv { path: None, .. } => 0,
            Payload::Csv {
                path: Some(path), ..
            } => match fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Can't get size of CSV file");
                    0
                }
            },
        }
    }

    /// Collections from a custom slicer must be shipped before the next slice.
    pub fn ship_immediately(&self) -> bool {
        self.meta.has_slicer()
    }

    /// Check whether the handler split its output into several files.
    pub fn has_sub_collections(&self) -> bool {
        matches!(&self.payload, Payload::Csv { subs, .. } if !subs.is_empty())
    }

    /// Move the sub-collections out, leaving an empty container.
    pub fn take_sub_collections(&mut self) -> Vec<Collection> {
        match &mut self.payload {
            Payload::Csv { subs, .. } => std::mem::take(subs),
            Payload::Json(_) => Vec::new(),
        }
    }

    /// Write the payload as `./{filename}` with mtime `mtime`.
    pub fn append_to_archive<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        mtime: DateTime<Utc>,
    ) -> Result<(), ArchiveError> {
        let name = entry_name(&self.filename());
        debug!(filename = %self.filename(), size = self.payload_size(), "Adding collection to archive");
        match &self.payload {
            Payload::Json(Some(data)) => append_bytes(builder, &name, data.as_bytes(), mtime),
            Payload::Csv {
                path: Some(path), ..
            } => append_file(builder, &name, path, mtime),
            _ => Err(ArchiveError::InvalidState(format!(
                "{} has no payload",
                self.filename()
            ))),
        }
    }

    /// Remove on-disk payload files. Idempotent.
    pub fn cleanup(&mut self) {
        if let Payload::Csv { path, subs } = &mut self.payload {
            if let Some(path) = path {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => error!(path = %path.display(), error = %e, "Failed to remove CSV file"),
                }
            }
            for sub in subs.iter_mut() {
                sub.cleanup();
            }
        }
    }

    /// Report this collection's outcome into the run's watermark accumulator.
    pub fn update_watermark(&self, updates: &mut WatermarkUpdates) {
        match &self.payload {
            Payload::Csv { subs, .. } if !subs.is_empty() => {
                for sub in subs {
                    sub.update_watermark(updates);
                }
            }
            _ => updates.record(self.key(), self.is_successful(), self.until, self.full_sync),
        }
    }
}

type SliceState = (DateTime<Utc>, DateTime<Utc>, bool, Option<DateTime<Utc>>);

/// Sibling owning exactly one file of a split CSV output.
fn sub_collection(meta: &Arc<MetricDescriptor>, parent: SliceState, file: PathBuf) -> Collection {
    let (since, until, full_sync, started_at) = parent;
    Collection {
        meta: Arc::clone(meta),
        since,
        until,
        full_sync,
        started_at,
        finished_at: Some(Utc::now()),
        succeeded: Some(true),
        payload: Payload::Csv {
            path: Some(file),
            subs: Vec::new(),
        },
    }
}

fn panic_message(cause: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
