//! Automatic-enrollment setup assistant model (one per scope).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MdmAppleSetupAssistant {
    pub id: i64,
    pub scope_key: i64,
    pub name: String,
    pub profile: serde_json::Value,
    /// Profile UUID assigned by the enrollment service once registered.
    pub profile_uuid: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl MdmAppleSetupAssistant {
    pub async fn find_by_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM mdm_apple_setup_assistants
            WHERE scope_key = $1
            ",
        )
        .bind(scope_key)
        .fetch_optional(pool)
        .await
    }

    /// Insert or update the scope's setup assistant.
    ///
    /// `uploaded_at` and `profile_uuid` survive only when both name and
    /// profile are unchanged.
    pub async fn upsert(
        pool: &sqlx::PgPool,
        scope_key: i64,
        name: &str,
        profile: &serde_json::Value,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO mdm_apple_setup_assistants (scope_key, name, profile)
            VALUES ($1, $2, $3)
            ON CONFLICT (scope_key) DO UPDATE SET
                profile_uuid = CASE
                    WHEN mdm_apple_setup_assistants.profile = EXCLUDED.profile
                        AND mdm_apple_setup_assistants.name = EXCLUDED.name
                    THEN mdm_apple_setup_assistants.profile_uuid
                    ELSE NULL
                END,
                uploaded_at = CASE
                    WHEN mdm_apple_setup_assistants.profile = EXCLUDED.profile
                        AND mdm_apple_setup_assistants.name = EXCLUDED.name
                    THEN mdm_apple_setup_assistants.uploaded_at
                    ELSE NOW()
                END,
                name = EXCLUDED.name,
                profile = EXCLUDED.profile
            RETURNING *
            ",
        )
        .bind(scope_key)
        .bind(name)
        .bind(profile)
        .fetch_one(pool)
        .await
    }

    pub async fn set_profile_uuid(
        pool: &sqlx::PgPool,
        scope_key: i64,
        profile_uuid: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE mdm_apple_setup_assistants
            SET profile_uuid = $2
            WHERE scope_key = $1
            ",
        )
        .bind(scope_key)
        .bind(profile_uuid)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_by_scope(pool: &sqlx::PgPool, scope_key: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM mdm_apple_setup_assistants
            WHERE scope_key = $1
            ",
        )
        .bind(scope_key)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
