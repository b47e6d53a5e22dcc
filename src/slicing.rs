// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Time slicing strategies.
//!
//! A [`Slicer`] decomposes the window of a run into ordered `(since, until)`
//! sub-ranges for one metric key. Every emitted slice becomes its own collection,
//! gathered and shipped independently, in emission order.
//!
//! Plain functions implement [`Slicer`] directly:
//!
//! ```rust,ignore
//! use harvest::slicing::{SliceRequest, TimeSlice};
//!
//! fn whole_window(req: &SliceRequest<'_>) -> Vec<TimeSlice> {
//!     vec![TimeSlice::new(req.resolved_since(), req.until)]
//! }
//! ```

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};

use crate::interval::LOOKBACK;
use crate::watermark::Watermarks;

/// One `(since, until)` sub-range of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlice {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Slice belongs to a periodic full resync (see [`FullSyncSlicer`]).
    pub full_sync: bool,
}

impl TimeSlice {
    /// Create an incremental slice.
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since,
            until,
            full_sync: false,
        }
    }

    /// Mark this slice as part of a full resync.
    pub fn full_sync(mut self) -> Self {
        self.full_sync = true;
        self
    }
}

/// Inputs handed to a slicer for one metric key.
#[derive(Debug, Clone, Copy)]
pub struct SliceRequest<'a> {
    pub key: &'a str,
    pub last_gather: DateTime<Utc>,
    /// Explicit start requested for the run, if any.
    pub since: Option<DateTime<Utc>>,
    pub until: DateTime<Utc>,
    /// Persisted watermarks as loaded at the start of the run.
    pub watermarks: &'a Watermarks,
}

impl SliceRequest<'_> {
    /// Watermark of this request's key.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermarks.get(self.key).copied()
    }

    /// Start of the window for this key when the slicer has no opinion of its own.
    pub fn resolved_since(&self) -> DateTime<Utc> {
        match self.since {
            Some(since) => since,
            None => self
                .watermark()
                .unwrap_or(self.last_gather)
                .max(self.until - LOOKBACK),
        }
    }
}

/// Iterator of slices produced by a [`Slicer`].
pub type SliceIter<'a> = Box<dyn Iterator<Item = TimeSlice> + 'a>;

/// Strategy splitting a run window into slices.
pub trait Slicer: Send + Sync {
    /// Produce the ordered slices for `request.key`.
    fn slices<'a>(&'a self, request: &SliceRequest<'a>) -> SliceIter<'a>;
}

impl<F, I> Slicer for F
where
    F: Fn(&SliceRequest<'_>) -> I + Send + Sync,
    I: IntoIterator<Item = TimeSlice>,
    I::IntoIter: 'static,
{
    fn slices<'a>(&'a self, request: &SliceRequest<'a>) -> SliceIter<'a> {
        Box::new(self(request).into_iter())
    }
}

/// Single slice spanning the whole window.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialSlicer;

impl Slicer for TrivialSlicer {
    fn slices<'a>(&'a self, request: &SliceRequest<'a>) -> SliceIter<'a> {
        Box::new(std::iter::once(TimeSlice::new(
            request.resolved_since(),
            request.until,
        )))
    }
}

/// One slice per calendar day (UTC).
///
/// Both ends are truncated to midnight, so a partial trailing day is left for
/// the next run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DailySlicer;

impl Slicer for DailySlicer {
    fn slices<'a>(&'a self, request: &SliceRequest<'a>) -> SliceIter<'a> {
        let start = midnight(request.resolved_since());
        let until = midnight(request.until);
        Box::new(DayIter::new(start, until, false))
    }
}

/// Daily slices with a periodic full resync.
///
/// A full sync is due when the `{key}_full` bookkeeping entry is missing or older
/// than `interval`. A full sync re-sends `full_sync_days` whole days ending at the
/// window's end; otherwise slices start from the key's regular start.
#[derive(Debug, Clone, Copy)]
pub struct FullSyncSlicer {
    pub interval: TimeDelta,
    pub full_sync_days: i64,
}

impl FullSyncSlicer {
    /// Default number of days covered by a full resync.
    pub const DEFAULT_FULL_SYNC_DAYS: i64 = 10;

    /// Create a slicer resyncing every `interval_days`.
    pub fn every_days(interval_days: i64) -> Self {
        Self {
            interval: TimeDelta::days(interval_days),
            full_sync_days: Self::DEFAULT_FULL_SYNC_DAYS,
        }
    }

    /// Check whether a full resync is due for this request.
    pub fn is_due(&self, request: &SliceRequest<'_>) -> bool {
        match request.watermarks.get(&full_sync_key(request.key)) {
            Some(last) => *last < request.until - self.interval,
            None => true,
        }
    }
}

impl Slicer for FullSyncSlicer {
    fn slices<'a>(&'a self, request: &SliceRequest<'a>) -> SliceIter<'a> {
        let until = midnight(request.until);
        let full = self.is_due(request);
        let start = if full {
            until - TimeDelta::days(self.full_sync_days)
        } else {
            midnight(request.resolved_since())
        };
        Box::new(DayIter::new(start, until, full))
    }
}

/// Bookkeeping key recording the last full resync of `key`.
pub fn full_sync_key(key: &str) -> String {
    format!("{}_full", key)
}

fn midnight(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}

struct DayIter {
    next: DateTime<Utc>,
    until: DateTime<Utc>,
    full_sync: bool,
}

impl DayIter {
    fn new(start: DateTime<Utc>, until: DateTime<Utc>, full_sync: bool) -> Self {
        Self {
            next: start,
            until,
            full_sync,
        }
    }
}

impl Iterator for DayIter {
    type Item = TimeSlice;

    fn next(&mut self) -> Option<TimeSlice> {
        if self.next >= self.until {
            return None;
        }
        let start = self.next;
        let end = (start + TimeDelta::days(1)).min(self.until);
        self.next = end;
        let slice = TimeSlice::new(start, end);
        Some(if self.full_sync { slice.full_sync() } else { slice })
    }
}
