// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging and in-process metrics.
//!
//! - **Tracing**: structured logs; every run executes inside a `gather` span
//!   carrying its `run_id`
//! - **Metrics**: per-metric gather outcomes, stage timings and archive counters
//!
//! # Usage
//!
//! ```rust,ignore
//! use harvest::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::production())?;
//! ```
//!
//! Recording into [`GLOBAL_METRICS`] is compiled in with the `telemetry`
//! feature (on by default).

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    GatherMetrics, Histogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS,
};
