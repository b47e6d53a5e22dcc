// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry initialization and configuration.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Whether to include span events (enter/exit).
    pub include_span_events: bool,

    /// Whether to include file/line information.
    pub include_file_line: bool,

    /// Whether to include target module path.
    pub include_target: bool,

    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,

    /// Whether to use compact log format.
    pub compact: bool,

    /// Custom filter directive (overrides default_level and RUST_LOG).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            include_span_events: false,
            include_file_line: false,
            include_target: true,
            ansi_colors: true,
            compact: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Verbose output for local debugging of metric handlers.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_span_events: true,
            include_file_line: true,
            include_target: true,
            ansi_colors: true,
            compact: false,
            filter_directive: None,
        }
    }

    /// Minimal output for scheduled runs (cron, systemd timers).
    pub fn production() -> Self {
        Self {
            default_level: Level::WARN,
            include_span_events: false,
            include_file_line: false,
            include_target: false,
            ansi_colors: false,
            compact: true,
            filter_directive: None,
        }
    }

    /// Trace-level output for tests.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            include_span_events: true,
            include_file_line: true,
            include_target: true,
            ansi_colors: false,
            compact: false,
            filter_directive: Some("harvest=trace".to_string()),
        }
    }

    /// Map a `-v` count onto a default level: 0 = info, 1 = debug, 2+ = trace.
    pub fn from_verbosity(verbose: u8) -> Self {
        let level = match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self::default().with_level(level)
    }

    /// Set the default log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Set a custom filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Keeps the subscriber installed for the lifetime of the program.
pub struct TelemetryGuard {
    _private: (),
}

/// Initialize telemetry with the given configuration.
///
/// Logs go to stderr so the archive paths printed by `harvest gather` stay
/// machine readable on stdout. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_span_events(span_events);

    if config.compact {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(TelemetryConfig::default().default_level, Level::INFO);
        assert!(TelemetryConfig::development().include_span_events);
        assert!(!TelemetryConfig::production().ansi_colors);
        assert_eq!(
            TelemetryConfig::testing().filter_directive.as_deref(),
            Some("harvest=trace")
        );
    }

    #[test]
    fn test_from_verbosity() {
        assert_eq!(TelemetryConfig::from_verbosity(0).default_level, Level::INFO);
        assert_eq!(TelemetryConfig::from_verbosity(1).default_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_verbosity(5).default_level, Level::TRACE);
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_level(Level::DEBUG)
            .with_filter("harvest::collector=trace")
            .with_ansi(false);

        assert_eq!(config.default_level, Level::DEBUG);
        assert_eq!(
            config.filter_directive,
            Some("harvest::collector=trace".to_string())
        );
        assert!(!config.ansi_colors);
    }
}
