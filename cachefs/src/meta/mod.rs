//! Metadata store and schema
//!
//! Responsibilities:
//! - Persist object and directory records (size, times, hashes, cache
//!   timestamp, cache type, last listing) in SQLite via SQLx, so the cache
//!   survives restarts.
//! - Own the connection pool; the upload ledger shares it.
//!
//! Every write is a single upsert or delete. Callers serialise writes per
//! path with [`crate::locks::PathLocks`].
//!
//! Submodules:
//! - `model`: records and their row forms
pub mod model;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

pub use model::{CacheType, DirectoryRecord, ObjectRecord, expired_ts};
use model::{DirectoryRow, ObjectRow};

use crate::clock::to_nanos;
use crate::error::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS objects (
        path       TEXT PRIMARY KEY NOT NULL,
        dir        TEXT NOT NULL,
        name       TEXT NOT NULL,
        mod_time   INTEGER NOT NULL,
        size       INTEGER NOT NULL,
        storable   BOOLEAN NOT NULL,
        cache_type TEXT NOT NULL,
        cache_ts   INTEGER NOT NULL,
        hashes     TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS objects_dir ON objects (dir)",
    "CREATE TABLE IF NOT EXISTS directories (
        path     TEXT PRIMARY KEY NOT NULL,
        dir      TEXT NOT NULL,
        name     TEXT NOT NULL,
        mod_time INTEGER NOT NULL,
        size     INTEGER NOT NULL,
        cache_ts INTEGER NOT NULL,
        entries  TEXT
    )",
    "CREATE TABLE IF NOT EXISTS pending_uploads (
        path      TEXT PRIMARY KEY NOT NULL,
        started   BOOLEAN NOT NULL DEFAULT 0,
        attempts  INTEGER NOT NULL DEFAULT 0,
        staged_at INTEGER NOT NULL
    )",
];

#[derive(Debug, Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    /// Open the database at `db_path`, creating it and its schema if needed.
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(dir) = db_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        debug!(db = %db_path.display(), "metadata store opened");
        Ok(store)
    }

    /// Throwaway in-memory database, mostly for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection: every new in-memory connection is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_object(&self, path: &str) -> Result<Option<ObjectRecord>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT dir, name, mod_time, size, storable, cache_type, cache_ts, hashes
             FROM objects WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ObjectRecord::try_from).transpose()
    }

    pub async fn put_object(&self, rec: &ObjectRecord) -> Result<()> {
        let hashes = serde_json::to_string(&rec.hashes)?;
        sqlx::query(
            "INSERT INTO objects (path, dir, name, mod_time, size, storable, cache_type, cache_ts, hashes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT(path) DO UPDATE SET
                dir = excluded.dir,
                name = excluded.name,
                mod_time = excluded.mod_time,
                size = excluded.size,
                storable = excluded.storable,
                cache_type = excluded.cache_type,
                cache_ts = excluded.cache_ts,
                hashes = excluded.hashes",
        )
        .bind(rec.path())
        .bind(&rec.dir)
        .bind(&rec.name)
        .bind(rec.mod_time)
        .bind(rec.size)
        .bind(rec.storable)
        .bind(rec.cache_type.as_str())
        .bind(to_nanos(rec.cache_ts))
        .bind(hashes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns whether a record existed.
    pub async fn remove_object(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE path = $1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Object records directly inside `dir`.
    pub async fn objects_in(&self, dir: &str) -> Result<Vec<ObjectRecord>> {
        let rows = sqlx::query_as::<_, ObjectRow>(
            "SELECT dir, name, mod_time, size, storable, cache_type, cache_ts, hashes
             FROM objects WHERE dir = $1 ORDER BY name",
        )
        .bind(dir)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ObjectRecord::try_from).collect()
    }

    pub async fn get_dir(&self, path: &str) -> Result<Option<DirectoryRecord>> {
        let row = sqlx::query_as::<_, DirectoryRow>(
            "SELECT dir, name, mod_time, size, cache_ts, entries
             FROM directories WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DirectoryRecord::try_from).transpose()
    }

    pub async fn put_dir(&self, rec: &DirectoryRecord) -> Result<()> {
        let entries = rec
            .entries
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO directories (path, dir, name, mod_time, size, cache_ts, entries)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT(path) DO UPDATE SET
                dir = excluded.dir,
                name = excluded.name,
                mod_time = excluded.mod_time,
                size = excluded.size,
                cache_ts = excluded.cache_ts,
                entries = excluded.entries",
        )
        .bind(rec.path())
        .bind(&rec.dir)
        .bind(&rec.name)
        .bind(rec.mod_time)
        .bind(rec.size)
        .bind(to_nanos(rec.cache_ts))
        .bind(entries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the directory record stale so the next access refreshes it.
    /// Missing records are left missing.
    pub async fn expire_dir(&self, path: &str) -> Result<()> {
        sqlx::query("UPDATE directories SET cache_ts = $1 WHERE path = $2")
            .bind(to_nanos(expired_ts()))
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop the record of `path` and every object and directory record below it.
    pub async fn remove_dir(&self, path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if path == "/" {
            sqlx::query("DELETE FROM directories").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM objects").execute(&mut *tx).await?;
        } else {
            let prefix = format!("{path}/");
            sqlx::query(
                "DELETE FROM directories
                 WHERE path = $1 OR substr(path, 1, length($2)) = $2",
            )
            .bind(path)
            .bind(&prefix)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM objects WHERE substr(path, 1, length($1)) = $1")
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EntryInfo, EntryKind, HashKind};
    use chrono::{DateTime, Utc};

    fn file(path: &str, size: i64) -> EntryInfo {
        EntryInfo {
            path: path.into(),
            kind: EntryKind::File,
            size,
            mod_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            storable: true,
        }
    }

    #[tokio::test]
    async fn test_object_round_trip_and_upsert() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let mut rec = ObjectRecord::from_entry(&file("/d/a", 3), CacheType::PendingUpload, now);
        rec.hashes.insert(HashKind::Sha256, "beef".into());
        store.put_object(&rec).await.unwrap();

        let got = store.get_object("/d/a").await.unwrap().unwrap();
        assert_eq!(got.cache_type, CacheType::PendingUpload);
        assert_eq!(got.hashes.get(&HashKind::Sha256).unwrap(), "beef");
        assert_eq!(got.size, 3);

        rec.size = 9;
        rec.cache_type = CacheType::InCache;
        store.put_object(&rec).await.unwrap();
        let got = store.get_object("/d/a").await.unwrap().unwrap();
        assert_eq!(got.size, 9);
        assert_eq!(got.cache_type, CacheType::InCache);
        assert_eq!(store.objects_in("/d").await.unwrap().len(), 1);

        assert!(store.remove_object("/d/a").await.unwrap());
        assert!(!store.remove_object("/d/a").await.unwrap());
        assert!(store.get_object("/d/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dir_expire_and_recursive_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetaStore::open(tmp.path().join("meta.db")).await.unwrap();
        let now = Utc::now();

        let mut dir = DirectoryRecord::new("/d", now, 0, now);
        dir.entries = Some(vec![file("/d/a", 1)]);
        store.put_dir(&dir).await.unwrap();
        store
            .put_dir(&DirectoryRecord::new("/d/sub", now, 0, now))
            .await
            .unwrap();
        store
            .put_dir(&DirectoryRecord::new("/dx", now, 0, now))
            .await
            .unwrap();
        for p in ["/d/a", "/d/sub/b", "/dx/c"] {
            store
                .put_object(&ObjectRecord::from_entry(&file(p, 1), CacheType::InCache, now))
                .await
                .unwrap();
        }

        store.expire_dir("/d").await.unwrap();
        let got = store.get_dir("/d").await.unwrap().unwrap();
        assert!(got.is_expired(now, std::time::Duration::from_secs(3600)));
        assert_eq!(got.entries.unwrap().len(), 1);

        store.remove_dir("/d").await.unwrap();
        assert!(store.get_dir("/d").await.unwrap().is_none());
        assert!(store.get_dir("/d/sub").await.unwrap().is_none());
        assert!(store.get_object("/d/a").await.unwrap().is_none());
        assert!(store.get_object("/d/sub/b").await.unwrap().is_none());
        assert!(store.get_dir("/dx").await.unwrap().is_some());
        assert!(store.get_object("/dx/c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("meta.db");
        {
            let store = MetaStore::open(&db).await.unwrap();
            store
                .put_object(&ObjectRecord::from_entry(
                    &file("/x", 5),
                    CacheType::InCache,
                    Utc::now(),
                ))
                .await
                .unwrap();
            store.pool().close().await;
        }
        let store = MetaStore::open(&db).await.unwrap();
        assert_eq!(store.get_object("/x").await.unwrap().unwrap().size, 5);
    }
}
