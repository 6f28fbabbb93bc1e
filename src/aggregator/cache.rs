//! Durable aggregate cache
//! Keyed rusqlite store for merged match statistics, so a restart does not
//! re-spend source quota on data that is still fresh.
//!
//! Writes are idempotent upserts keyed by (cache_key, source_set), which
//! makes concurrent refreshes of the same key safe without extra locking.

use crate::models::{AggregateKey, AggregatedMatchData};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex; // Faster than std::sync::Mutex
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for better concurrent access
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS aggregates (
    cache_key TEXT NOT NULL,
    source_set TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    refreshed_at INTEGER NOT NULL,
    PRIMARY KEY (cache_key, source_set)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_aggregates_refreshed
    ON aggregates(refreshed_at);
"#;

/// What a cache lookup found.
pub struct CacheLookup {
    pub data: AggregatedMatchData,
    /// False once the entry has outlived its TTL.
    pub fresh: bool,
}

pub struct AggregateCache {
    conn: Arc<Mutex<Connection>>,
}

impl AggregateCache {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open aggregate cache at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize aggregate cache schema")?;

        info!("💾 Aggregate cache ready at: {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-process cache, used by tests and local tooling.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cache")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize aggregate cache schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotent upsert of a merged aggregate.
    pub fn put(&self, source_set: &str, data: &AggregatedMatchData) -> Result<()> {
        let payload = serde_json::to_string(data).context("Failed to serialize aggregate")?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO aggregates (cache_key, source_set, payload_json, refreshed_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(cache_key, source_set) DO UPDATE SET
                payload_json = excluded.payload_json,
                refreshed_at = excluded.refreshed_at
            "#,
            params![
                data.key.cache_key(),
                source_set,
                payload,
                data.refreshed_at.timestamp()
            ],
        )
        .context("Failed to upsert aggregate")?;
        Ok(())
    }

    /// Look up a key, reporting whether the entry is still inside its TTL.
    pub fn get(
        &self,
        source_set: &str,
        key: &AggregateKey,
        ttl_secs: i64,
    ) -> Result<Option<CacheLookup>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload_json, refreshed_at FROM aggregates
                 WHERE cache_key = ?1 AND source_set = ?2",
                params![key.cache_key(), source_set],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to query aggregate cache")?;

        let Some((payload, refreshed_at)) = row else {
            return Ok(None);
        };

        let data: AggregatedMatchData =
            serde_json::from_str(&payload).context("Corrupt aggregate cache row")?;
        let fresh = Utc::now().timestamp() - refreshed_at < ttl_secs;

        debug!(
            key = %key.cache_key(),
            fresh,
            "aggregate cache {}",
            if fresh { "hit" } else { "stale hit" }
        );
        Ok(Some(CacheLookup { data, fresh }))
    }

    /// Drop rows not refreshed since the cutoff. Returns rows deleted.
    pub fn prune_older_than(&self, cutoff_epoch: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM aggregates WHERE refreshed_at < ?1",
                params![cutoff_epoch],
            )
            .context("Failed to prune aggregate cache")?;
        Ok(deleted)
    }
}
