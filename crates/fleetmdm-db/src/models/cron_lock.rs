//! Named leases for scheduled jobs.
//!
//! A lease is held by one owner until it expires or is released. Acquiring
//! succeeds when nobody holds the lease, the previous holder's lease has
//! expired, or the caller already holds it (which extends it).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CronLock {
    pub name: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl CronLock {
    /// Try to take or extend the lease. Returns `true` when `owner` holds it
    /// afterwards.
    pub async fn try_acquire(
        pool: &sqlx::PgPool,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            INSERT INTO cron_locks (name, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE cron_locks.expires_at < NOW() OR cron_locks.owner = EXCLUDED.owner
            ",
        )
        .bind(name)
        .bind(owner)
        .bind(expires_at)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Release the lease if `owner` holds it.
    pub async fn release(pool: &sqlx::PgPool, name: &str, owner: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM cron_locks
            WHERE name = $1 AND owner = $2
            ",
        )
        .bind(name)
        .bind(owner)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(pool: &sqlx::PgPool, name: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM cron_locks
            WHERE name = $1
            ",
        )
        .bind(name)
        .fetch_optional(pool)
        .await
    }
}
