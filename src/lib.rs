// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Harvest - incremental usage-data harvester.
//!
//! Gathers data from registered metric handlers over a time window, packs the
//! results into size-bounded `tar.gz` archives and ships them to an ingestion
//! service. Per-metric watermarks make every run pick up where the last
//! successful one stopped.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing setup and in-process metrics
//! - [`interval`] - Resolution of the run's `(since, until)` window
//! - [`slicing`] - Cutting the window into per-metric time slices
//! - [`splitter`] - Size-bounded CSV output files
//! - [`registry`] - Metric handlers and their registration
//! - [`collection`] - One metric gathered over one slice
//! - [`watermark`] - Per-run watermark bookkeeping
//! - [`store`] - Watermark persistence, advisory lock and entitlement
//! - [`package`] - Bin-packing collections into archives
//! - [`shipping`] - Archive upload
//! - [`collector`] - The gather run itself
//! - [`builtin`] - Metrics registered by the `harvest` binary
//!
//! # Example
//!
//! ```rust,ignore
//! use harvest::{builtin, CollectionType, Collector, GatherRequest};
//!
//! let collector = Collector::new(builtin::default_registry())
//!     .with_collection_type(CollectionType::DryRun);
//! let archives = collector.gather(GatherRequest::new().destination("/tmp/out")).await?;
//! ```

pub mod builtin;
pub mod collection;
pub mod collector;
pub mod config;
pub mod error;
pub mod interval;
pub mod package;
pub mod registry;
pub mod shipping;
pub mod slicing;
pub mod splitter;
pub mod store;
pub mod telemetry;
pub mod watermark;

// Re-export commonly used types at crate root
pub use collector::{CollectionType, Collector, GatherRequest, Phase};
pub use error::{
    ArchiveError, ConfigError, GatherError, MetricError, Result, ShipError, StoreError,
};
pub use registry::{
    DataFormat, GatherContext, MetricDescriptor, MetricHandler, MetricOutput, MetricRegistry,
};
pub use shipping::{AuthMode, DisabledShipper, HttpShipper, Shipper, ShippingConfig};
pub use slicing::{DailySlicer, FullSyncSlicer, Slicer, TimeSlice, TrivialSlicer};
pub use store::{
    AdvisoryLock, Entitlement, MemoryStore, NoLock, SqliteStore, StaticEntitlement,
    WatermarkStore,
};
pub use watermark::Watermarks;

/// Harvest version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let registry = builtin::default_registry();
        let collector = Collector::new(registry);
        assert_eq!(collector.collection_type(), CollectionType::DryRun);
    }
}
