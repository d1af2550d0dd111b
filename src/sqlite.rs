use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::queue::QueueStore;
use crate::types::{EventKind, ItemStatus, MarkOutcome, NewItem, Payload, QueueItem, TxHash, UnixTimeMs};

const COLUMNS: &str =
    "id, entity_id, x, y, energy, status, hash, timestamp, retries, type, leased_by, lease_expires_at";

/// `transaction_queue` table in SQLite
pub struct SqliteQueue {
    pool: SqlitePool,
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Epoch-ms column value for a timestamp that is written to a row.
fn time_column(t: UnixTimeMs) -> Result<i64, StoreError> {
    i64::try_from(t.0).map_err(|_| StoreError::InvalidTimestamp(t.0))
}

/// Epoch-ms bound for a comparison; past the column range every row matches.
fn time_bound(t: UnixTimeMs) -> i64 {
    i64::try_from(t.0).unwrap_or(i64::MAX)
}

impl SqliteQueue {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(unavailable)?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database. One connection that never recycles,
    /// otherwise every new connection would see an empty database.
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(unavailable)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT,
                x INTEGER NOT NULL DEFAULT 0,
                y INTEGER NOT NULL DEFAULT 0,
                energy INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                hash TEXT,
                timestamp INTEGER NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL,
                leased_by TEXT,
                lease_expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_queue_status_timestamp ON transaction_queue(status, timestamp);
            "#,
        )
        .execute(&pool)
        .await
        .map_err(unavailable)?;

        Ok(Self { pool })
    }

    fn row_to_item(row: &SqliteRow) -> Result<QueueItem, StoreError> {
        let id: i64 = row.try_get("id").map_err(unavailable)?;
        let corrupted = |reason: String| StoreError::Corrupted { id, reason };

        let status: String = row.try_get("status").map_err(unavailable)?;
        let kind: String = row.try_get("type").map_err(unavailable)?;
        let hash: Option<String> = row.try_get("hash").map_err(unavailable)?;
        let coordinate = |column: &str| -> Result<u32, StoreError> {
            let raw: i64 = row.try_get(column).map_err(unavailable)?;
            u32::try_from(raw).map_err(|_| corrupted(format!("{column} out of range: {raw}")))
        };
        let epoch_ms = |column: &str| -> Result<Option<UnixTimeMs>, StoreError> {
            let raw: Option<i64> = row.try_get(column).map_err(unavailable)?;
            raw.map(|t| {
                u64::try_from(t)
                    .map(UnixTimeMs)
                    .map_err(|_| corrupted(format!("negative {column}: {t}")))
            })
            .transpose()
        };
        let retries: i64 = row.try_get("retries").map_err(unavailable)?;

        Ok(QueueItem {
            id: id as u64,
            entity_id: row.try_get("entity_id").map_err(unavailable)?,
            payload: Payload {
                x: coordinate("x")?,
                y: coordinate("y")?,
                energy: coordinate("energy")?,
            },
            kind: kind.parse::<EventKind>().map_err(corrupted)?,
            status: status.parse::<ItemStatus>().map_err(corrupted)?,
            hash: hash
                .map(|h| h.parse::<TxHash>().map_err(|e| corrupted(format!("bad hash `{h}`: {e}"))))
                .transpose()?,
            enqueued_at: epoch_ms("timestamp")?
                .ok_or_else(|| corrupted("missing timestamp".into()))?,
            attempts: u32::try_from(retries).map_err(|_| corrupted(format!("retries out of range: {retries}")))?,
            leased_by: row.try_get("leased_by").map_err(unavailable)?,
            lease_expires_at: epoch_ms("lease_expires_at")?,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteQueue {
    async fn enqueue_at(&self, item: NewItem, enqueued_at: UnixTimeMs) -> Result<u64, StoreError> {
        let timestamp = time_column(enqueued_at)?;
        let result = sqlx::query(
            "INSERT INTO transaction_queue (entity_id, x, y, energy, status, timestamp, type)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(item.entity_id.as_deref())
        .bind(item.payload.x as i64)
        .bind(item.payload.y as i64)
        .bind(item.payload.energy as i64)
        .bind(timestamp)
        .bind(item.kind.as_str())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.last_insert_rowid() as u64)
    }

    async fn dequeue_next_pending(&self) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM transaction_queue
             WHERE status = 'pending' ORDER BY timestamp ASC, id ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn claim_next_pending(
        &self,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<QueueItem>, StoreError> {
        let expires = time_column(UnixTimeMs::now().saturating_add(lease))?;
        // Single statement: SQLite serializes writers, so the subselect and
        // the update cannot interleave with another claim.
        let row = sqlx::query(&format!(
            "UPDATE transaction_queue
             SET status = 'leased', leased_by = ?, lease_expires_at = ?
             WHERE id = (
                 SELECT id FROM transaction_queue
                 WHERE status = 'pending' ORDER BY timestamp ASC, id ASC LIMIT 1
             ) AND status = 'pending'
             RETURNING {COLUMNS}"
        ))
        .bind(worker)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn mark(&self, id: u64, outcome: MarkOutcome) -> Result<bool, StoreError> {
        let hash = outcome.hash().map(|h| format!("{h:#x}"));
        let result = sqlx::query(
            "UPDATE transaction_queue
             SET status = ?, hash = ?, retries = retries + 1, leased_by = NULL, lease_expires_at = NULL
             WHERE id = ? AND status IN ('pending', 'leased')",
        )
        .bind(outcome.status().as_str())
        .bind(hash)
        .bind(id as i64)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(item) => {
                debug!("Item {} already {}, mark ignored", id, item.status);
                Ok(false)
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn mark_leased(&self, id: u64, worker: &str, outcome: MarkOutcome) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE transaction_queue
             SET status = ?, hash = ?, retries = retries + 1, leased_by = NULL, lease_expires_at = NULL
             WHERE id = ? AND status = 'leased' AND leased_by = ?",
        )
        .bind(outcome.status().as_str())
        .bind(outcome.hash().map(|h| format!("{h:#x}")))
        .bind(id as i64)
        .bind(worker)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(item) => {
                debug!(
                    "Item {} is {} (leased by {:?}), mark from {} ignored",
                    id, item.status, item.leased_by, worker
                );
                Ok(false)
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn mark_batch(&self, updates: &[(u64, MarkOutcome)]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut changed = 0;

        for (id, outcome) in updates {
            let exists = sqlx::query("SELECT 1 FROM transaction_queue WHERE id = ?")
                .bind(*id as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
            if exists.is_none() {
                // Dropping the transaction rolls back earlier updates.
                return Err(StoreError::NotFound(*id));
            }

            let result = sqlx::query(
                "UPDATE transaction_queue
                 SET status = ?, hash = ?, retries = retries + 1, leased_by = NULL, lease_expires_at = NULL
                 WHERE id = ? AND status IN ('pending', 'leased')",
            )
            .bind(outcome.status().as_str())
            .bind(outcome.hash().map(|h| format!("{h:#x}")))
            .bind(*id as i64)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            changed += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(changed)
    }

    async fn get(&self, id: u64) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM transaction_queue WHERE id = ?"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn count(&self, status: ItemStatus) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transaction_queue WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(count as u64)
    }

    async fn release_expired_leases(&self, now: UnixTimeMs) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE transaction_queue
             SET status = 'pending', leased_by = NULL, lease_expires_at = NULL
             WHERE status = 'leased' AND lease_expires_at <= ?",
        )
        .bind(time_bound(now))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(result.rows_affected())
    }

    async fn purge(&self, older_than: UnixTimeMs) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM transaction_queue WHERE status IN ('sent', 'failed') AND timestamp < ?",
        )
        .bind(time_bound(older_than))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}
