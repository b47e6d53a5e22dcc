// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process store, for tests and embedding.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{AdvisoryLock, WatermarkStore};
use crate::error::StoreError;
use crate::watermark::Watermarks;

/// Watermarks, last gather and locks kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    watermarks: Mutex<Watermarks>,
    last_gather: Mutex<Option<DateTime<Utc>>>,
    locks: Mutex<HashSet<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with watermarks and a last gather timestamp.
    pub fn with_state(watermarks: Watermarks, last_gather: Option<DateTime<Utc>>) -> Self {
        Self {
            watermarks: Mutex::new(watermarks),
            last_gather: Mutex::new(last_gather),
            locks: Mutex::new(HashSet::new()),
        }
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Corrupted("memory store mutex poisoned".to_string())
}

impl WatermarkStore for MemoryStore {
    fn load(&self) -> Result<Watermarks, StoreError> {
        Ok(self.watermarks.lock().map_err(poisoned)?.clone())
    }

    fn save(&self, watermarks: &Watermarks) -> Result<(), StoreError> {
        let mut stored = self.watermarks.lock().map_err(poisoned)?;
        stored.extend(watermarks.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    fn last_gather(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.last_gather.lock().map_err(poisoned)?)
    }

    fn persist_last_gather(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        *self.last_gather.lock().map_err(poisoned)? = Some(at);
        Ok(())
    }
}

impl AdvisoryLock for MemoryStore {
    fn try_acquire(&self, key: i64) -> Result<bool, StoreError> {
        Ok(self.locks.lock().map_err(poisoned)?.insert(key))
    }

    fn release(&self, key: i64) -> Result<(), StoreError> {
        self.locks.lock().map_err(poisoned)?.remove(&key);
        Ok(())
    }
}
