// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the harvest collector.
//!
//! This module provides strongly-typed errors for different parts of the gather pipeline,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation.
//!
//! Only [`GatherError`] ever aborts a run. Metric, archive and shipping failures are
//! caught where they happen, logged, and recorded as state on the collection or package.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that abort a whole gather run.
#[derive(Error, Debug)]
pub enum GatherError {
    #[error("Invalid collection interval: start {since} is not before end {until}")]
    InvalidInterval {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },

    #[error("Failed to prepare staging directory: {0}")]
    Staging(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl From<std::io::Error> for GatherError {
    fn from(err: std::io::Error) -> Self {
        Self::Staging(err.to_string())
    }
}

/// Errors raised by a metric handler while gathering.
#[derive(Error, Debug)]
pub enum MetricError {
    #[error("Gathering failed: {0}")]
    Failed(String),

    #[error("Unexpected output: expected {expected}, got {actual}")]
    UnexpectedOutput { expected: String, actual: String },

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for MetricError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for MetricError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("JSON encoding failed: {}", err))
    }
}

impl From<anyhow::Error> for MetricError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}

/// Errors that can occur while assembling an archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error writing archive: {0}")]
    IoError(String),

    #[error("JSON encoding error: {0}")]
    JsonError(String),

    #[error("Invalid archive entry name: {0:?}")]
    EntryName(String),

    #[error("Invalid archive state: {0}")]
    InvalidState(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

/// Errors that can occur while shipping an archive.
#[derive(Error, Debug)]
pub enum ShipError {
    #[error("Shipping not configured: {0}")]
    NotConfigured(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upload failed with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("IO error: {0}")]
    IoError(String),
}

impl ShipError {
    /// Create a rejection error from an HTTP status and response body.
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            body: body.into(),
        }
    }

    /// Check if the failure happened before any network I/O.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NotConfigured(_))
    }
}

impl From<std::io::Error> for ShipError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for ShipError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors that can occur in the persistent state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stored state corrupted: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
