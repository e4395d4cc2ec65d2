//! MDM Apple configuration profile model.
//!
//! Desired state: the profiles assigned to each scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};

/// A stored configuration profile.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MdmAppleConfigProfile {
    pub id: i64,

    /// 0 for the global scope, otherwise the team id.
    pub scope_key: i64,

    /// `PayloadIdentifier` of the profile, unique within the scope.
    pub identifier: String,

    /// `PayloadDisplayName` of the profile, unique within the scope.
    pub name: String,

    /// Raw mobileconfig bytes.
    #[serde(skip)]
    pub mobileconfig: Vec<u8>,

    /// Hex SHA-256 of `mobileconfig`.
    pub checksum: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for inserting or replacing a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertMdmAppleConfigProfile {
    pub identifier: String,
    pub name: String,
    pub mobileconfig: Vec<u8>,
    pub checksum: String,
}

/// Profile id and payload, used to build install commands.
#[derive(Debug, Clone, FromRow)]
pub struct MdmAppleProfileContents {
    pub id: i64,
    pub mobileconfig: Vec<u8>,
}

impl MdmAppleConfigProfile {
    /// Find a profile by id.
    pub async fn find_by_id(pool: &sqlx::PgPool, id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM mdm_apple_configuration_profiles
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Find a profile by its identifier within a scope.
    pub async fn find_by_identifier(
        pool: &sqlx::PgPool,
        scope_key: i64,
        identifier: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM mdm_apple_configuration_profiles
            WHERE scope_key = $1 AND identifier = $2
            ",
        )
        .bind(scope_key)
        .bind(identifier)
        .fetch_optional(pool)
        .await
    }

    /// List the profiles of a scope, ordered by name.
    ///
    /// Identifiers in `exclude` are left out (product-owned profiles).
    pub async fn list_by_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
        exclude: &[String],
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM mdm_apple_configuration_profiles
            WHERE scope_key = $1 AND NOT (identifier = ANY($2))
            ORDER BY name ASC
            ",
        )
        .bind(scope_key)
        .bind(exclude)
        .fetch_all(pool)
        .await
    }

    /// Whether a scope has a profile with the given identifier.
    pub async fn exists_in_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
        identifier: &str,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM mdm_apple_configuration_profiles
                WHERE scope_key = $1 AND identifier = $2
            )
            ",
        )
        .bind(scope_key)
        .bind(identifier)
        .fetch_one(pool)
        .await
    }

    /// Fetch payloads for a set of profile ids.
    pub async fn contents(
        pool: &sqlx::PgPool,
        ids: &[i64],
    ) -> Result<Vec<MdmAppleProfileContents>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT id, mobileconfig FROM mdm_apple_configuration_profiles
            WHERE id = ANY($1)
            ",
        )
        .bind(ids)
        .fetch_all(pool)
        .await
    }

    /// Insert a new profile. Fails with a unique violation on a duplicate
    /// identifier or name within the scope.
    pub async fn insert(
        conn: &mut PgConnection,
        scope_key: i64,
        input: &UpsertMdmAppleConfigProfile,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO mdm_apple_configuration_profiles (
                scope_key, identifier, name, mobileconfig, checksum
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            ",
        )
        .bind(scope_key)
        .bind(&input.identifier)
        .bind(&input.name)
        .bind(&input.mobileconfig)
        .bind(&input.checksum)
        .fetch_one(conn)
        .await
    }

    /// Insert a profile, or replace name and payload of the profile with the
    /// same identifier in the scope. The id of an existing profile is kept.
    pub async fn upsert(
        conn: &mut PgConnection,
        scope_key: i64,
        input: &UpsertMdmAppleConfigProfile,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO mdm_apple_configuration_profiles (
                scope_key, identifier, name, mobileconfig, checksum
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (scope_key, identifier) DO UPDATE SET
                name = EXCLUDED.name,
                mobileconfig = EXCLUDED.mobileconfig,
                checksum = EXCLUDED.checksum,
                updated_at = CASE
                    WHEN mdm_apple_configuration_profiles.checksum = EXCLUDED.checksum
                        AND mdm_apple_configuration_profiles.name = EXCLUDED.name
                    THEN mdm_apple_configuration_profiles.updated_at
                    ELSE NOW()
                END
            RETURNING *
            ",
        )
        .bind(scope_key)
        .bind(&input.identifier)
        .bind(&input.name)
        .bind(&input.mobileconfig)
        .bind(&input.checksum)
        .fetch_one(conn)
        .await
    }

    /// Identifiers currently stored for a scope (locks the rows).
    pub async fn identifiers_for_update(
        conn: &mut PgConnection,
        scope_key: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r"
            SELECT identifier FROM mdm_apple_configuration_profiles
            WHERE scope_key = $1
            FOR UPDATE
            ",
        )
        .bind(scope_key)
        .fetch_all(conn)
        .await
    }

    /// Delete every profile of a scope whose identifier is not in `keep`.
    pub async fn delete_in_scope_except(
        conn: &mut PgConnection,
        scope_key: i64,
        keep: &[String],
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM mdm_apple_configuration_profiles
            WHERE scope_key = $1 AND NOT (identifier = ANY($2))
            ",
        )
        .bind(scope_key)
        .bind(keep)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete a profile by id.
    pub async fn delete_by_id(pool: &sqlx::PgPool, id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM mdm_apple_configuration_profiles
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete a profile by identifier within a scope.
    pub async fn delete_by_identifier(
        pool: &sqlx::PgPool,
        scope_key: i64,
        identifier: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM mdm_apple_configuration_profiles
            WHERE scope_key = $1 AND identifier = $2
            ",
        )
        .bind(scope_key)
        .bind(identifier)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
