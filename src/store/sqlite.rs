// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-based state store.
//!
//! Watermarks, run history and advisory locks live in one database file. Every
//! process on the host opening the same file shares the lock table, so a second
//! `harvest gather` started while one is running skips its run.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use super::{AdvisoryLock, WatermarkStore};
use crate::error::StoreError;
use crate::watermark::Watermarks;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Locks older than this are considered abandoned by a crashed process.
const DEFAULT_LOCK_TTL: TimeDelta = TimeDelta::hours(6);

/// State store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    holder: String,
    lock_ttl: TimeDelta,
}

impl SqliteStore {
    /// Open or create a state database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::IoError(format!("Failed to create state directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| {
            StoreError::Database(format!("Failed to open state database: {}", e))
        })?;

        // WAL so a reader never blocks the running gather
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| StoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
            holder: Uuid::new_v4().to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        };
        store.init_schema()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.open", start.elapsed());

        Ok(store)
    }

    /// Open an in-memory database. Locks are then private to this instance.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            holder: Uuid::new_v4().to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Override how long an unreleased lock is honored.
    pub fn with_lock_ttl(mut self, ttl: TimeDelta) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                key TEXT PRIMARY KEY,
                gathered_until INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS gather_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                gathered_until INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS advisory_locks (
                lock_key INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_gather_runs_until ON gather_runs(gathered_until DESC);
            "#,
        )
        .map_err(|e| StoreError::Database(format!("Failed to create schema: {}", e)))?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StoreError::Database(format!("Failed to get schema version: {}", e)))?;

        match current_version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![SCHEMA_VERSION],
                )
                .map_err(|e| {
                    StoreError::Database(format!("Failed to set schema version: {}", e))
                })?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StoreError::Corrupted(format!(
                    "database schema version {} is newer than supported {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupted(format!("timestamp out of range: {}", micros)))
}

impl WatermarkStore for SqliteStore {
    fn load(&self) -> Result<Watermarks, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, gathered_until FROM watermarks")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut watermarks = Watermarks::new();
        for row in rows {
            let (key, micros) = row?;
            watermarks.insert(key, from_micros(micros)?);
        }
        Ok(watermarks)
    }

    fn save(&self, watermarks: &Watermarks) -> Result<(), StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let mut conn = self.conn()?;
        let now = to_micros(Utc::now());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO watermarks (key, gathered_until, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    gathered_until = excluded.gathered_until,
                    updated_at = excluded.updated_at
                "#,
            )?;
            for (key, until) in watermarks {
                stmt.execute(params![key, to_micros(*until), now])?;
            }
        }
        tx.commit()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.save_watermarks", start.elapsed());

        Ok(())
    }

    fn last_gather(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn()?;
        let micros: Option<i64> = conn.query_row(
            "SELECT MAX(gathered_until) FROM gather_runs",
            [],
            |row| row.get(0),
        )?;
        micros.map(from_micros).transpose()
    }

    fn persist_last_gather(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO gather_runs (gathered_until, recorded_at) VALUES (?1, ?2)",
            params![to_micros(at), to_micros(Utc::now())],
        )?;
        Ok(())
    }
}

impl AdvisoryLock for SqliteStore {
    fn try_acquire(&self, key: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let now = Utc::now();

        let stale = conn.execute(
            "DELETE FROM advisory_locks WHERE lock_key = ?1 AND acquired_at < ?2",
            params![key, to_micros(now - self.lock_ttl)],
        )?;
        if stale > 0 {
            warn!(key, "Removed abandoned advisory lock");
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO advisory_locks (lock_key, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![key, self.holder, to_micros(now)],
        )?;
        Ok(inserted == 1)
    }

    fn release(&self, key: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM advisory_locks WHERE lock_key = ?1 AND holder = ?2",
            params![key, self.holder],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_watermarks_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_empty());

        let mut watermarks = Watermarks::new();
        watermarks.insert("jobs".to_string(), ts(1));
        watermarks.insert("jobs_full".to_string(), ts(2));
        store.save(&watermarks).unwrap();

        watermarks.insert("jobs".to_string(), ts(3));
        store.save(&watermarks).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["jobs"], ts(3));
        assert_eq!(loaded["jobs_full"], ts(2));
    }

    #[test]
    fn test_last_gather_is_latest_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.last_gather().unwrap(), None);

        store.persist_last_gather(ts(5)).unwrap();
        store.persist_last_gather(ts(4)).unwrap();
        assert_eq!(store.last_gather().unwrap(), Some(ts(5)));
    }

    #[test]
    fn test_lock_shared_between_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        assert!(first.try_acquire(42).unwrap());
        assert!(!second.try_acquire(42).unwrap());

        // Only the holder releases
        second.release(42).unwrap();
        assert!(!second.try_acquire(42).unwrap());

        first.release(42).unwrap();
        assert!(second.try_acquire(42).unwrap());
    }

    #[test]
    fn test_abandoned_lock_expires() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path)
            .unwrap()
            .with_lock_ttl(TimeDelta::zero());

        assert!(first.try_acquire(7).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(second.try_acquire(7).unwrap());
    }

    #[test]
    fn test_reopen_keeps_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save(&Watermarks::from([("hosts".to_string(), ts(9))]))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert_eq!(store.load().unwrap()["hosts"], ts(9));
    }
}
