//! Host and MDM enrollment facts.
//!
//! These rows are owned by the inventory and enrollment subsystems; the
//! reconciler only reads them. The write helpers exist for those
//! subsystems and for test setup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Platform string of macOS hosts.
pub const PLATFORM_DARWIN: &str = "darwin";

/// Enrollment type of a device-channel MDM enrollment.
pub const ENROLLMENT_TYPE_DEVICE: &str = "device";

/// A host row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Host {
    pub uuid: String,
    pub hostname: String,
    pub platform: String,
    /// NULL when the host is not on a team.
    pub team_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An MDM enrollment row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MdmAppleEnrollment {
    pub host_uuid: String,
    pub enrollment_type: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    /// Find a host by UUID.
    pub async fn find_by_uuid(pool: &sqlx::PgPool, uuid: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM hosts
            WHERE uuid = $1
            ",
        )
        .bind(uuid)
        .fetch_optional(pool)
        .await
    }

    /// Insert a host or update its platform and team.
    pub async fn upsert(
        pool: &sqlx::PgPool,
        uuid: &str,
        hostname: &str,
        platform: &str,
        team_id: Option<i64>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO hosts (uuid, hostname, platform, team_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uuid) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                platform = EXCLUDED.platform,
                team_id = EXCLUDED.team_id,
                updated_at = NOW()
            RETURNING *
            ",
        )
        .bind(uuid)
        .bind(hostname)
        .bind(platform)
        .bind(team_id)
        .fetch_one(pool)
        .await
    }

    /// Move hosts to a team (or to no team).
    pub async fn set_team(
        pool: &sqlx::PgPool,
        uuids: &[String],
        team_id: Option<i64>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE hosts SET team_id = $1, updated_at = NOW()
            WHERE uuid = ANY($2)
            ",
        )
        .bind(team_id)
        .bind(uuids)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// UUIDs of hosts whose scope key is in `scope_keys`.
    pub async fn uuids_in_scopes(
        pool: &sqlx::PgPool,
        scope_keys: &[i64],
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r"
            SELECT uuid FROM hosts
            WHERE COALESCE(team_id, 0) = ANY($1)
            ",
        )
        .bind(scope_keys)
        .fetch_all(pool)
        .await
    }

    /// UUIDs of hosts affected by a change to the given profiles: hosts in
    /// the profiles' scopes plus hosts that still track them.
    pub async fn uuids_for_profiles(
        pool: &sqlx::PgPool,
        profile_ids: &[i64],
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r"
            SELECT h.uuid FROM hosts h
            JOIN mdm_apple_configuration_profiles p
                ON p.scope_key = COALESCE(h.team_id, 0)
            WHERE p.id = ANY($1)
            UNION
            SELECT host_uuid FROM host_mdm_apple_profiles
            WHERE profile_id = ANY($1)
            ",
        )
        .bind(profile_ids)
        .fetch_all(pool)
        .await
    }
}

impl MdmAppleEnrollment {
    /// Record an enabled device enrollment.
    pub async fn enroll(pool: &sqlx::PgPool, host_uuid: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO mdm_apple_enrollments (host_uuid, enrollment_type, enabled)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (host_uuid) DO UPDATE SET
                enabled = TRUE,
                enrollment_type = EXCLUDED.enrollment_type,
                updated_at = NOW()
            ",
        )
        .bind(host_uuid)
        .bind(ENROLLMENT_TYPE_DEVICE)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Mark an enrollment disabled.
    pub async fn disable(pool: &sqlx::PgPool, host_uuid: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE mdm_apple_enrollments SET enabled = FALSE, updated_at = NOW()
            WHERE host_uuid = $1
            ",
        )
        .bind(host_uuid)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
