//! Durable record of staged paths not yet delivered to the origin.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::clock::{from_nanos, to_nanos};
use crate::error::Result;
use crate::meta::MetaStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub path: String,
    /// A transfer is in flight; update and remove are refused meanwhile.
    pub started: bool,
    /// Failed transfers so far.
    pub attempts: u32,
    pub staged_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PendingRow {
    path: String,
    started: bool,
    attempts: i64,
    staged_at: i64,
}

impl From<PendingRow> for PendingUpload {
    fn from(row: PendingRow) -> Self {
        Self {
            path: row.path,
            started: row.started,
            attempts: row.attempts.clamp(0, u32::MAX as i64) as u32,
            staged_at: from_nanos(row.staged_at),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadLedger {
    pool: SqlitePool,
}

impl UploadLedger {
    pub fn new(store: &MetaStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Record `path` as staged. Re-staging an entry keeps its attempt count
    /// and restarts its wait.
    pub async fn add(&self, path: &str, staged_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_uploads (path, started, attempts, staged_at)
             VALUES ($1, 0, 0, $2)
             ON CONFLICT(path) DO UPDATE SET started = 0, staged_at = excluded.staged_at",
        )
        .bind(path)
        .bind(to_nanos(staged_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Option<PendingUpload>> {
        let row = sqlx::query_as::<_, PendingRow>(
            "SELECT path, started, attempts, staged_at FROM pending_uploads WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PendingUpload::from))
    }

    pub async fn contains(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).await?.is_some())
    }

    /// Every entry, oldest first.
    pub async fn list(&self) -> Result<Vec<PendingUpload>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            "SELECT path, started, attempts, staged_at FROM pending_uploads
             ORDER BY staged_at, path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PendingUpload::from).collect())
    }

    /// Entries not in flight and staged no later than `ready_before`,
    /// oldest first.
    pub async fn ready(&self, ready_before: DateTime<Utc>) -> Result<Vec<PendingUpload>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            "SELECT path, started, attempts, staged_at FROM pending_uploads
             WHERE started = 0 AND staged_at <= $1
             ORDER BY staged_at, path",
        )
        .bind(to_nanos(ready_before))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PendingUpload::from).collect())
    }

    /// Flip `started` on. False if the entry is gone or already started.
    pub async fn mark_started(&self, path: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE pending_uploads SET started = 1 WHERE path = $1 AND started = 0")
                .bind(path)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Back to staged after a failed transfer. Returns the new attempt count,
    /// or `None` if the entry vanished meanwhile.
    pub async fn mark_failed(&self, path: &str) -> Result<Option<u32>> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE pending_uploads SET started = 0, attempts = attempts + 1
             WHERE path = $1 RETURNING attempts",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.map(|n| n.clamp(0, u32::MAX as i64) as u32))
    }

    pub async fn remove(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_uploads WHERE path = $1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear every `started` flag; used at startup, when nothing can be in
    /// flight. Returns how many entries were reset.
    pub async fn reset_all_started(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE pending_uploads SET started = 0 WHERE started = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn len(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_uploads")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
