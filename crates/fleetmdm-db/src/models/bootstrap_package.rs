//! Bootstrap package model and its per-host install ledger.
//!
//! A scope has at most one bootstrap package. Each host gets a single
//! install command; its outcome is recorded here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Outcome of a host's bootstrap package install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BootstrapPackageStatus {
    Installed,
    Failed,
}

/// Package metadata (without the bytes).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MdmAppleBootstrapPackageMeta {
    pub scope_key: i64,
    pub name: String,
    pub sha256: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// Input for storing a package.
#[derive(Debug, Clone)]
pub struct CreateMdmAppleBootstrapPackage {
    pub name: String,
    pub sha256: String,
    pub bytes: Vec<u8>,
    pub token: String,
}

/// A host's bootstrap install record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HostMdmAppleBootstrapPackage {
    pub host_uuid: String,
    pub command_uuid: Uuid,
    pub status: Option<BootstrapPackageStatus>,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-scope install counts.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct BootstrapPackageCounts {
    pub installed: i64,
    pub failed: i64,
    pub pending: i64,
}

impl MdmAppleBootstrapPackageMeta {
    pub async fn insert(
        pool: &sqlx::PgPool,
        scope_key: i64,
        input: &CreateMdmAppleBootstrapPackage,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO mdm_apple_bootstrap_packages (scope_key, name, sha256, bytes, token)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING scope_key, name, sha256, token, created_at
            ",
        )
        .bind(scope_key)
        .bind(&input.name)
        .bind(&input.sha256)
        .bind(&input.bytes)
        .bind(&input.token)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT scope_key, name, sha256, token, created_at
            FROM mdm_apple_bootstrap_packages
            WHERE scope_key = $1
            ",
        )
        .bind(scope_key)
        .fetch_optional(pool)
        .await
    }

    /// Package name and bytes by download token.
    pub async fn bytes_by_token(
        pool: &sqlx::PgPool,
        token: &str,
    ) -> Result<Option<(String, Vec<u8>)>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT name, bytes FROM mdm_apple_bootstrap_packages
            WHERE token = $1
            ",
        )
        .bind(token)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete_by_scope(pool: &sqlx::PgPool, scope_key: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM mdm_apple_bootstrap_packages
            WHERE scope_key = $1
            ",
        )
        .bind(scope_key)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl HostMdmAppleBootstrapPackage {
    /// Record the install command sent to a host. A host that already has a
    /// record keeps it.
    pub async fn record(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        command_uuid: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO host_mdm_apple_bootstrap_packages (host_uuid, command_uuid)
            VALUES ($1, $2)
            ON CONFLICT (host_uuid) DO NOTHING
            ",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Set the outcome of a bootstrap command. Returns the number of rows
    /// updated (0 when the command is not a bootstrap install).
    pub async fn set_result(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        command_uuid: Uuid,
        status: BootstrapPackageStatus,
        detail: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE host_mdm_apple_bootstrap_packages
            SET status = $3, detail = $4, updated_at = NOW()
            WHERE host_uuid = $1 AND command_uuid = $2
            ",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .bind(status)
        .bind(detail)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn find_by_host(
        pool: &sqlx::PgPool,
        host_uuid: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM host_mdm_apple_bootstrap_packages
            WHERE host_uuid = $1
            ",
        )
        .bind(host_uuid)
        .fetch_optional(pool)
        .await
    }

    /// Install counts for hosts in a scope.
    pub async fn counts_for_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
    ) -> Result<BootstrapPackageCounts, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (WHERE hbp.status = 'installed') AS installed,
                COUNT(*) FILTER (WHERE hbp.status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE hbp.status IS NULL) AS pending
            FROM host_mdm_apple_bootstrap_packages hbp
            JOIN hosts h ON h.uuid = hbp.host_uuid
            WHERE COALESCE(h.team_id, 0) = $1
            ",
        )
        .bind(scope_key)
        .fetch_one(pool)
        .await
    }
}
