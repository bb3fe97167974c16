//! Durable store-and-forward queue for outbound events.
//!
//! A single SQLite table keyed by a monotonic integer. The ingestor is the
//! only writer and the drainer the only reader; both go through the same
//! connection lock. Keys are seeded from the current Unix time at open so
//! they stay monotonic across restarts on one host clock.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::events::unix_now;

pub struct EventSpool {
    inner: Mutex<SpoolInner>,
    limit: u64,
}

struct SpoolInner {
    db: Connection,
    next_key: u64,
    count: u64,
}

impl EventSpool {
    /// Open (or create) the spool database. `limit` is the retention cap:
    /// once exceeded, the oldest records are dropped to make room.
    pub fn open(path: &Path, limit: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("cannot open spool {}", path.display()))?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS events (
                key INTEGER PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;

        let max_key: Option<i64> =
            db.query_row("SELECT MAX(key) FROM events", [], |row| row.get(0))?;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        let next_key = max_key
            .map(|k| k as u64 + 1)
            .unwrap_or(0)
            .max(unix_now());

        Ok(Self {
            inner: Mutex::new(SpoolInner {
                db,
                next_key,
                count: count as u64,
            }),
            limit,
        })
    }

    /// Append one serialized event under the next key. Never waits on the
    /// master; local disk failure is the only error path.
    pub async fn append(&self, value: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let key = inner.next_key;
        inner.db.execute(
            "INSERT INTO events (key, value) VALUES (?1, ?2)",
            params![key as i64, value],
        )?;
        inner.next_key = key + 1;
        inner.count += 1;

        if inner.count > self.limit {
            let excess = inner.count - self.limit;
            let dropped = inner.db.execute(
                "DELETE FROM events WHERE key IN
                    (SELECT key FROM events ORDER BY key ASC LIMIT ?1)",
                params![excess as i64],
            )?;
            inner.count -= dropped as u64;
            warn!("spool over retention limit, dropped {dropped} oldest event(s)");
        }
        Ok(key)
    }

    /// First record with a key strictly greater than `key`, in key order.
    pub async fn next_after(&self, key: u64) -> Result<Option<(u64, Vec<u8>)>> {
        let inner = self.inner.lock().await;
        let row = inner
            .db
            .query_row(
                "SELECT key, value FROM events WHERE key > ?1 ORDER BY key ASC LIMIT 1",
                params![key as i64],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Drop a delivered record. Only called after the master acknowledged
    /// it with a 200 envelope.
    pub async fn remove(&self, key: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let deleted = inner
            .db
            .execute("DELETE FROM events WHERE key = ?1", params![key as i64])?;
        inner.count = inner.count.saturating_sub(deleted as u64);
        Ok(())
    }

    pub async fn len(&self) -> u64 {
        self.inner.lock().await.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_with_strictly_increasing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let spool = EventSpool::open(&dir.path().join("spool.db"), 100).unwrap();

        let k1 = spool.append(b"one").await.unwrap();
        let k2 = spool.append(b"two").await.unwrap();
        let k3 = spool.append(b"three").await.unwrap();
        assert!(k1 < k2 && k2 < k3);
        assert!(k1 >= unix_now() - 5);
        assert_eq!(spool.len().await, 3);
    }

    #[tokio::test]
    async fn drains_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = EventSpool::open(&dir.path().join("spool.db"), 100).unwrap();
        spool.append(b"one").await.unwrap();
        spool.append(b"two").await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = 0;
        while let Some((key, value)) = spool.next_after(cursor).await.unwrap() {
            cursor = key;
            seen.push(value);
            spool.remove(key).await.unwrap();
        }
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(spool.len().await, 0);
    }

    #[tokio::test]
    async fn keys_stay_monotonic_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.db");

        let spool = EventSpool::open(&path, 100).unwrap();
        let last = spool.append(b"one").await.unwrap();
        drop(spool);

        let spool = EventSpool::open(&path, 100).unwrap();
        let next = spool.append(b"two").await.unwrap();
        assert!(next > last);
        // Undelivered records survive the restart.
        assert_eq!(spool.len().await, 2);
        assert_eq!(spool.next_after(0).await.unwrap().unwrap().1, b"one");
    }

    #[tokio::test]
    async fn retention_cap_drops_oldest_records() {
        let dir = tempfile::tempdir().unwrap();
        let spool = EventSpool::open(&dir.path().join("spool.db"), 2).unwrap();

        spool.append(b"one").await.unwrap();
        spool.append(b"two").await.unwrap();
        spool.append(b"three").await.unwrap();

        assert_eq!(spool.len().await, 2);
        let (first_key, first) = spool.next_after(0).await.unwrap().unwrap();
        assert_eq!(first, b"two");
        let (_, second) = spool.next_after(first_key).await.unwrap().unwrap();
        assert_eq!(second, b"three");
    }
}
