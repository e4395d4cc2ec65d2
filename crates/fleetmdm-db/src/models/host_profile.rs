//! Host MDM Apple profile model.
//!
//! Observed state: one row per (host, profile) that the reconciler is
//! tracking, with the operation being delivered and its delivery status.
//!
//! The two candidate queries encode the desired/observed difference. A host
//! is eligible when it is a macOS host with an enabled device enrollment, and
//! its desired profiles are those whose scope key equals
//! `COALESCE(team_id, 0)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use super::host::{ENROLLMENT_TYPE_DEVICE, PLATFORM_DARWIN};

/// Operation being delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Install (or reinstall) the profile.
    Install,
    /// Remove the profile from the device.
    Remove,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Install => write!(f, "install"),
            OperationType::Remove => write!(f, "remove"),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "install" => Ok(OperationType::Install),
            "remove" => Ok(OperationType::Remove),
            _ => Err(format!("Unknown operation type: {s}")),
        }
    }
}

/// Delivery status of a tracked operation.
///
/// A row whose status is NULL (`None`) has been queued but not yet sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Command enqueued, waiting for the device.
    Pending,
    /// Device acknowledged; may still need external confirmation.
    Verifying,
    /// Device reported an error.
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Verifying => write!(f, "verifying"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "verifying" => Ok(DeliveryStatus::Verifying),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(format!("Unknown delivery status: {s}")),
        }
    }
}

/// A ledger row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HostMdmAppleProfile {
    pub host_uuid: String,
    pub profile_id: i64,
    pub profile_identifier: String,
    pub profile_name: String,
    pub checksum: String,
    pub operation_type: OperationType,
    pub status: Option<DeliveryStatus>,
    pub command_uuid: Option<Uuid>,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A (host, profile) pair returned by the candidate queries.
///
/// `current_*` describe the existing ledger row, if any.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HostProfileCandidate {
    pub host_uuid: String,
    pub profile_id: i64,
    pub profile_identifier: String,
    pub profile_name: String,
    pub checksum: String,
    pub current_operation: Option<OperationType>,
    pub current_status: Option<DeliveryStatus>,
}

/// Write payload for [`HostMdmAppleProfile::upsert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertHostMdmAppleProfile {
    pub host_uuid: String,
    pub profile_id: i64,
    pub profile_identifier: String,
    pub profile_name: String,
    pub checksum: String,
    pub operation_type: OperationType,
    pub status: Option<DeliveryStatus>,
    pub command_uuid: Option<Uuid>,
    pub detail: String,
}

impl HostMdmAppleProfile {
    /// Profiles to install, optionally restricted to the given hosts.
    ///
    /// A desired (host, profile) pair is a candidate when there is no row,
    /// the checksum changed, the row is a removal, or the row is an install
    /// that was never dispatched.
    pub async fn list_to_install(
        conn: &mut PgConnection,
        host_uuids: Option<&[String]>,
    ) -> Result<Vec<HostProfileCandidate>, sqlx::Error> {
        sqlx::query_as(
            r"
            WITH desired AS (
                SELECT p.id AS profile_id, p.identifier AS profile_identifier,
                    p.name AS profile_name, p.checksum, h.uuid AS host_uuid
                FROM mdm_apple_configuration_profiles p
                JOIN hosts h ON p.scope_key = COALESCE(h.team_id, 0)
                JOIN mdm_apple_enrollments e ON e.host_uuid = h.uuid
                WHERE h.platform = $1
                    AND e.enabled
                    AND e.enrollment_type = $2
                    AND ($3::varchar[] IS NULL OR h.uuid = ANY($3))
            )
            SELECT d.host_uuid, d.profile_id, d.profile_identifier, d.profile_name, d.checksum,
                hmap.operation_type AS current_operation, hmap.status AS current_status
            FROM desired d
            LEFT JOIN host_mdm_apple_profiles hmap
                ON hmap.host_uuid = d.host_uuid AND hmap.profile_id = d.profile_id
            WHERE hmap.host_uuid IS NULL
                OR hmap.checksum <> d.checksum
                OR hmap.operation_type = 'remove'
                OR (hmap.operation_type = 'install' AND hmap.status IS NULL)
            ORDER BY d.host_uuid, d.profile_id
            ",
        )
        .bind(PLATFORM_DARWIN)
        .bind(ENROLLMENT_TYPE_DEVICE)
        .bind(host_uuids)
        .fetch_all(conn)
        .await
    }

    /// Profiles to remove, optionally restricted to the given hosts.
    ///
    /// A row of an eligible host is a candidate when its profile is no longer
    /// desired for the host's current scope, unless it is already a removal
    /// that has been dispatched.
    pub async fn list_to_remove(
        conn: &mut PgConnection,
        host_uuids: Option<&[String]>,
    ) -> Result<Vec<HostProfileCandidate>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT hmap.host_uuid, hmap.profile_id, hmap.profile_identifier,
                hmap.profile_name, hmap.checksum,
                hmap.operation_type AS current_operation, hmap.status AS current_status
            FROM host_mdm_apple_profiles hmap
            JOIN hosts h ON h.uuid = hmap.host_uuid
            JOIN mdm_apple_enrollments e ON e.host_uuid = h.uuid
            WHERE h.platform = $1
                AND e.enabled
                AND e.enrollment_type = $2
                AND ($3::varchar[] IS NULL OR h.uuid = ANY($3))
                AND NOT EXISTS (
                    SELECT 1 FROM mdm_apple_configuration_profiles p
                    WHERE p.id = hmap.profile_id
                        AND p.scope_key = COALESCE(h.team_id, 0)
                )
                AND (hmap.operation_type <> 'remove' OR hmap.status IS NULL)
            ORDER BY hmap.host_uuid, hmap.profile_id
            ",
        )
        .bind(PLATFORM_DARWIN)
        .bind(ENROLLMENT_TYPE_DEVICE)
        .bind(host_uuids)
        .fetch_all(conn)
        .await
    }

    /// Insert or overwrite a row keyed by (host, profile). Clears `detail`
    /// unless one is supplied.
    pub async fn upsert(
        conn: &mut PgConnection,
        input: &UpsertHostMdmAppleProfile,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO host_mdm_apple_profiles (
                host_uuid, profile_id, profile_identifier, profile_name, checksum,
                operation_type, status, command_uuid, detail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (host_uuid, profile_id) DO UPDATE SET
                profile_identifier = EXCLUDED.profile_identifier,
                profile_name = EXCLUDED.profile_name,
                checksum = EXCLUDED.checksum,
                operation_type = EXCLUDED.operation_type,
                status = EXCLUDED.status,
                command_uuid = EXCLUDED.command_uuid,
                detail = EXCLUDED.detail,
                updated_at = NOW()
            ",
        )
        .bind(&input.host_uuid)
        .bind(input.profile_id)
        .bind(&input.profile_identifier)
        .bind(&input.profile_name)
        .bind(&input.checksum)
        .bind(input.operation_type)
        .bind(input.status)
        .bind(input.command_uuid)
        .bind(&input.detail)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Delete every row of a host with the given profile identifier,
    /// whatever its profile id.
    pub async fn delete_by_host_and_identifier(
        conn: &mut PgConnection,
        host_uuid: &str,
        profile_identifier: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM host_mdm_apple_profiles
            WHERE host_uuid = $1 AND profile_identifier = $2
            ",
        )
        .bind(host_uuid)
        .bind(profile_identifier)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Find the row a command was sent for.
    pub async fn find_by_command(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        command_uuid: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM host_mdm_apple_profiles
            WHERE host_uuid = $1 AND command_uuid = $2
            ",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .fetch_optional(pool)
        .await
    }

    /// Update status, operation and detail of the row a command was sent for.
    pub async fn update_by_command(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        command_uuid: Uuid,
        operation_type: OperationType,
        status: Option<DeliveryStatus>,
        detail: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE host_mdm_apple_profiles
            SET status = $3, operation_type = $4, detail = $5, updated_at = NOW()
            WHERE host_uuid = $1 AND command_uuid = $2
            ",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .bind(status)
        .bind(operation_type)
        .bind(detail)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete the row a command was sent for.
    pub async fn delete_by_command(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        command_uuid: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM host_mdm_apple_profiles
            WHERE host_uuid = $1 AND command_uuid = $2
            ",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// All rows of a host, ordered by profile name.
    pub async fn list_for_host(
        pool: &sqlx::PgPool,
        host_uuid: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM host_mdm_apple_profiles
            WHERE host_uuid = $1
            ORDER BY profile_name ASC, profile_id ASC
            ",
        )
        .bind(host_uuid)
        .fetch_all(pool)
        .await
    }

    /// Delete all rows of a host.
    pub async fn delete_for_host(
        conn: &mut PgConnection,
        host_uuid: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            DELETE FROM host_mdm_apple_profiles
            WHERE host_uuid = $1
            ",
        )
        .bind(host_uuid)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }
}
