//! Activity (audit) log model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub activity_type: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub async fn insert(
        pool: &sqlx::PgPool,
        activity_type: &str,
        details: &serde_json::Value,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO activities (activity_type, details)
            VALUES ($1, $2)
            RETURNING *
            ",
        )
        .bind(activity_type)
        .bind(details)
        .fetch_one(pool)
        .await
    }

    /// Most recent activities of a type, newest first.
    pub async fn list_by_type(
        pool: &sqlx::PgPool,
        activity_type: &str,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM activities
            WHERE activity_type = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            ",
        )
        .bind(activity_type)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
