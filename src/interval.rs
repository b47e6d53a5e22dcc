// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collection interval resolution.
//!
//! Turns the caller's optional `since`/`until` overrides and the persisted
//! last-gather timestamp into the concrete window of a run. Data is never
//! gathered from further back than [`LOOKBACK`] before the end of the window.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

use crate::error::GatherError;

/// Hard lookback ceiling for a single run.
pub const LOOKBACK: TimeDelta = TimeDelta::weeks(4);

/// Resolved time window of a gather run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherInterval {
    /// Explicit start requested by the caller (after clamping).
    ///
    /// `None` means "no explicit start": each collection then resolves its own
    /// start from its watermark, see [`GatherInterval::default_since`].
    pub since: Option<DateTime<Utc>>,

    /// End of the window.
    pub until: DateTime<Utc>,

    /// Effective last successful gather, never older than the horizon.
    pub last_gather: DateTime<Utc>,
}

impl GatherInterval {
    /// Resolve the interval of a run.
    ///
    /// Future endpoints are clamped to `now`, `until` is capped at `since + LOOKBACK`,
    /// and `since`/`last_gather` are raised to the horizon (`until - LOOKBACK`).
    pub fn calculate(
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        last_gather: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self, GatherError> {
        let mut since = since;
        let mut until = until;

        if let Some(u) = until {
            if u > now {
                warn!(%now, "End of the collection interval is in the future, setting to now");
                until = Some(now);
            }
        }
        if let Some(s) = since {
            if s > now {
                warn!(%now, "Start of the collection interval is in the future, setting to now");
                since = Some(now);
            }
        }

        let until = match (since, until) {
            (Some(s), Some(u)) => {
                let cap = s + LOOKBACK;
                if u > cap {
                    warn!(
                        until = %cap,
                        "End of the collection interval is more than 4 weeks after the start, capping"
                    );
                    cap
                } else {
                    u
                }
            }
            (Some(s), None) => (s + LOOKBACK).min(now),
            (None, u) => u.unwrap_or(now),
        };

        if let Some(s) = since {
            if s >= until {
                warn!("Start of the collection interval is later than the end, ignoring request");
                return Err(GatherError::InvalidInterval { since: s, until });
            }
        }

        let horizon = until - LOOKBACK;
        if let Some(s) = since {
            if s < horizon {
                warn!(
                    since = %horizon,
                    "Start of the collection interval is more than 4 weeks before the end, clamping"
                );
                since = Some(horizon);
            }
        }

        let last_gather = match last_gather {
            Some(last) if last < horizon => {
                warn!(
                    last_gather = %last,
                    %horizon,
                    "Last gather was more than 4 weeks before the end of the interval, using horizon"
                );
                horizon
            }
            Some(last) => last,
            None => horizon,
        };

        Ok(Self {
            since,
            until,
            last_gather,
        })
    }

    /// Horizon of the window: the floor below which no data is gathered.
    pub fn horizon(&self) -> DateTime<Utc> {
        self.until - LOOKBACK
    }

    /// Start of a single, unsliced collection for a key with the given watermark.
    ///
    /// An explicit `since` wins; otherwise the later of the key's watermark (or the
    /// run's last gather) and the horizon.
    pub fn default_since(&self, watermark: Option<DateTime<Utc>>) -> DateTime<Utc> {
        match self.since {
            Some(since) => since,
            None => watermark.unwrap_or(self.last_gather).max(self.horizon()),
        }
    }
}
