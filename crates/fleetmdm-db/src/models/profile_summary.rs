//! Aggregate delivery counts per scope.
//!
//! Each host in the scope lands in at most one bucket. The disk-encryption
//! profile (passed in by identifier) is only "verifying" once the escrowed
//! key is confirmed decryptable; until then it holds its host in "pending".

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Hosts per aggregate profile state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ProfileStatusCounts {
    pub failed: i64,
    pub pending: i64,
    pub verifying: i64,
}

/// Hosts per disk-encryption state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DiskEncryptionCounts {
    pub verifying: i64,
    pub action_required: i64,
    pub enforcing: i64,
    pub failed: i64,
    pub removing_enforcement: i64,
}

impl ProfileStatusCounts {
    pub async fn for_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
        disk_encryption_identifier: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            WITH per_host AS (
                SELECT hmap.host_uuid,
                    COALESCE(BOOL_OR(hmap.status = 'failed'), FALSE) AS any_failed,
                    COALESCE(BOOL_OR(
                        hmap.status IS NULL
                        OR hmap.status = 'pending'
                        OR (
                            hmap.profile_identifier = $2
                            AND hmap.operation_type = 'install'
                            AND hmap.status = 'verifying'
                            AND dek.decryptable IS DISTINCT FROM TRUE
                        )
                    ), FALSE) AS any_pending,
                    COALESCE(BOOL_OR(hmap.status = 'verifying'), FALSE) AS any_verifying
                FROM host_mdm_apple_profiles hmap
                JOIN hosts h ON h.uuid = hmap.host_uuid
                LEFT JOIN host_disk_encryption_keys dek ON dek.host_uuid = hmap.host_uuid
                WHERE COALESCE(h.team_id, 0) = $1
                GROUP BY hmap.host_uuid
            )
            SELECT
                COUNT(*) FILTER (WHERE any_failed) AS failed,
                COUNT(*) FILTER (WHERE NOT any_failed AND any_pending) AS pending,
                COUNT(*) FILTER (WHERE NOT any_failed AND NOT any_pending AND any_verifying)
                    AS verifying
            FROM per_host
            ",
        )
        .bind(scope_key)
        .bind(disk_encryption_identifier)
        .fetch_one(pool)
        .await
    }
}

impl DiskEncryptionCounts {
    pub async fn for_scope(
        pool: &sqlx::PgPool,
        scope_key: i64,
        disk_encryption_identifier: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (
                    WHERE hmap.operation_type = 'install'
                        AND hmap.status = 'verifying'
                        AND dek.decryptable IS TRUE
                ) AS verifying,
                COUNT(*) FILTER (
                    WHERE hmap.operation_type = 'install'
                        AND hmap.status = 'verifying'
                        AND (dek.host_uuid IS NULL OR dek.decryptable IS FALSE)
                ) AS action_required,
                COUNT(*) FILTER (
                    WHERE hmap.operation_type = 'install'
                        AND (
                            hmap.status IS NULL
                            OR hmap.status = 'pending'
                            OR (
                                hmap.status = 'verifying'
                                AND dek.host_uuid IS NOT NULL
                                AND dek.decryptable IS NULL
                            )
                        )
                ) AS enforcing,
                COUNT(*) FILTER (WHERE hmap.status = 'failed') AS failed,
                COUNT(*) FILTER (
                    WHERE hmap.operation_type = 'remove'
                        AND (hmap.status IS NULL OR hmap.status = 'pending')
                ) AS removing_enforcement
            FROM host_mdm_apple_profiles hmap
            JOIN hosts h ON h.uuid = hmap.host_uuid
            LEFT JOIN host_disk_encryption_keys dek ON dek.host_uuid = hmap.host_uuid
            WHERE COALESCE(h.team_id, 0) = $1 AND hmap.profile_identifier = $2
            ",
        )
        .bind(scope_key)
        .bind(disk_encryption_identifier)
        .fetch_one(pool)
        .await
    }
}
