// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent state and coordination collaborators.
//!
//! A run needs three things from its environment:
//!
//! - [`WatermarkStore`]: per-key watermarks and the last gather timestamp
//! - [`AdvisoryLock`]: a non-blocking mutual exclusion primitive, so only one
//!   process gathers at a time
//! - [`Entitlement`]: whether the installation may gather and ship at all
//!
//! [`SqliteStore`] provides the first two on top of a SQLite file shared by every
//! process on the host. [`MemoryStore`] does the same in-process.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SCHEMA_VERSION};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha512};
use tracing::{debug, error};

use crate::error::StoreError;
use crate::watermark::Watermarks;

/// Name of the lock guarding a gather run.
pub const GATHER_LOCK_NAME: &str = "gather_analytics_lock";

/// Persisted bookkeeping of past runs.
pub trait WatermarkStore: Send + Sync {
    /// Load all watermarks.
    fn load(&self) -> Result<Watermarks, StoreError>;

    /// Persist `watermarks`; keys absent from the map are left as they are.
    fn save(&self, watermarks: &Watermarks) -> Result<(), StoreError>;

    /// Timestamp of the last successful run, if any.
    fn last_gather(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Record a successful run ending at `at`.
    fn persist_last_gather(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Non-blocking advisory lock keyed by a 63-bit integer.
pub trait AdvisoryLock: Send + Sync {
    /// Try to take the lock. Returns `false` when someone else holds it.
    fn try_acquire(&self, key: i64) -> Result<bool, StoreError>;

    /// Release a lock taken by this holder.
    fn release(&self, key: i64) -> Result<(), StoreError>;
}

/// License and shipping checks.
pub trait Entitlement: Send + Sync {
    fn is_valid_license(&self) -> bool;

    fn is_shipping_configured(&self) -> bool;
}

/// Entitlement answers fixed at construction, typically from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticEntitlement {
    pub licensed: bool,
    pub shipping_configured: bool,
}

impl StaticEntitlement {
    pub fn new(licensed: bool, shipping_configured: bool) -> Self {
        Self {
            licensed,
            shipping_configured,
        }
    }

    /// Licensed and configured.
    pub fn allow_all() -> Self {
        Self::new(true, true)
    }
}

impl Default for StaticEntitlement {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl Entitlement for StaticEntitlement {
    fn is_valid_license(&self) -> bool {
        self.licensed
    }

    fn is_shipping_configured(&self) -> bool {
        self.shipping_configured
    }
}

/// Lock that is always available, for deployments without shared state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl AdvisoryLock for NoLock {
    fn try_acquire(&self, _key: i64) -> Result<bool, StoreError> {
        Ok(true)
    }

    fn release(&self, _key: i64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Derive a lock key from a resource name.
///
/// The SHA-512 digest is read as a big-endian integer and reduced modulo 2^63,
/// which keeps its low 63 bits.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha512::digest(name.as_bytes());
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[56..64]);
    (u64::from_be_bytes(low) & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

/// Held advisory lock; released on drop.
pub struct LockGuard<'a> {
    lock: &'a dyn AdvisoryLock,
    key: i64,
}

impl<'a> LockGuard<'a> {
    /// Try to take `lock` for `name`. `None` means the lock is held elsewhere.
    pub fn try_acquire(lock: &'a dyn AdvisoryLock, name: &str) -> Result<Option<Self>, StoreError> {
        let key = advisory_key(name);
        if lock.try_acquire(key)? {
            debug!(lock = name, key, "Acquired advisory lock");
            Ok(Some(Self { lock, key }))
        } else {
            Ok(None)
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.key) {
            error!(key = self.key, error = %e, "Failed to release advisory lock");
        }
    }
}
