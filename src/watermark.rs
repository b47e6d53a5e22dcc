// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-key "last successfully gathered" bookkeeping.
//!
//! During a run, every shipped collection reports into a [`WatermarkUpdates`]
//! accumulator. A key that fails anywhere in the run is locked: its watermark is
//! left untouched so the next run retries the same window.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::slicing::full_sync_key;

/// Persisted watermarks, keyed by metric key.
pub type Watermarks = BTreeMap<String, DateTime<Utc>>;

/// Watermark changes accumulated over one run.
#[derive(Debug, Clone, Default)]
pub struct WatermarkUpdates {
    keys: Watermarks,
    full_syncs: Watermarks,
    locked: BTreeSet<String>,
}

impl WatermarkUpdates {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `key` failed earlier in this run.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locked.contains(key)
    }

    /// Lock `key` for the rest of the run.
    pub fn lock(&mut self, key: &str) {
        self.locked.insert(key.to_string());
    }

    /// Raise the pending watermark of `key` to at least `until`.
    pub fn advance(&mut self, key: &str, until: DateTime<Utc>) {
        raise(&mut self.keys, key, until);
    }

    /// Raise the pending full-resync marker of `key` to at least `until`.
    pub fn advance_full_sync(&mut self, key: &str, until: DateTime<Utc>) {
        raise(&mut self.full_syncs, key, until);
    }

    /// Record the outcome of one gathered slice.
    ///
    /// No-op for locked keys; a failure locks the key.
    pub fn record(&mut self, key: &str, succeeded: bool, until: DateTime<Utc>, full_sync: bool) {
        if self.is_locked(key) {
            return;
        }
        if succeeded {
            self.advance(key, until);
            if full_sync {
                self.advance_full_sync(key, until);
            }
        } else {
            self.lock(key);
        }
    }

    /// Pending watermark of `key`, if any.
    pub fn pending(&self, key: &str) -> Option<DateTime<Utc>> {
        self.keys.get(key).copied()
    }

    /// Keys locked in this run.
    pub fn locked_keys(&self) -> impl Iterator<Item = &str> {
        self.locked.iter().map(String::as_str)
    }

    /// Merge pending updates of unlocked keys into `persisted`.
    ///
    /// Watermarks never move backwards. Returns the number of entries changed.
    pub fn merge_into(&self, persisted: &mut Watermarks) -> usize {
        let mut changed = 0;
        for (key, until) in &self.keys {
            if self.is_locked(key) {
                continue;
            }
            if raise(persisted, key, *until) {
                changed += 1;
            }
        }
        for (key, until) in &self.full_syncs {
            if self.is_locked(key) {
                continue;
            }
            if raise(persisted, &full_sync_key(key), *until) {
                changed += 1;
            }
        }
        changed
    }
}

fn raise(map: &mut Watermarks, key: &str, until: DateTime<Utc>) -> bool {
    match map.get_mut(key) {
        Some(existing) if *existing >= until => false,
        Some(existing) => {
            *existing = until;
            true
        }
        None => {
            map.insert(key.to_string(), until);
            true
        }
    }
}
