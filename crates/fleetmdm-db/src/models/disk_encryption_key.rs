//! Escrowed disk-encryption (FileVault) recovery keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};

/// A host's escrowed recovery key.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HostDiskEncryptionKey {
    pub host_uuid: String,
    #[serde(skip)]
    pub encrypted_key: String,
    /// NULL until the key-escrow checker has tried to decrypt it.
    pub decryptable: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostDiskEncryptionKey {
    pub async fn find_by_host(
        pool: &sqlx::PgPool,
        host_uuid: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM host_disk_encryption_keys
            WHERE host_uuid = $1
            ",
        )
        .bind(host_uuid)
        .fetch_optional(pool)
        .await
    }

    /// Store a new key for a host. Decryptability goes back to unknown.
    pub async fn set_or_update(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        encrypted_key: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO host_disk_encryption_keys (host_uuid, encrypted_key)
            VALUES ($1, $2)
            ON CONFLICT (host_uuid) DO UPDATE SET
                encrypted_key = EXCLUDED.encrypted_key,
                decryptable = NULL,
                updated_at = NOW()
            ",
        )
        .bind(host_uuid)
        .bind(encrypted_key)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Record the decryptability check result for keys not rotated after
    /// `threshold`.
    pub async fn set_decryptable(
        pool: &sqlx::PgPool,
        host_uuids: &[String],
        decryptable: bool,
        threshold: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE host_disk_encryption_keys
            SET decryptable = $1
            WHERE host_uuid = ANY($2) AND updated_at <= $3
            ",
        )
        .bind(decryptable)
        .bind(host_uuids)
        .bind(threshold)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_for_hosts(
        conn: &mut PgConnection,
        host_uuids: &[String],
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM host_disk_encryption_keys
            WHERE host_uuid = ANY($1)
            ",
        )
        .bind(host_uuids)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }
}
