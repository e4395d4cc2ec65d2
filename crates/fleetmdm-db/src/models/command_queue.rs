//! Device command queue.
//!
//! Commands are written once and linked to the host that should run them.
//! The protocol layer serves active queue entries when the device checks in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MdmCommand {
    pub command_uuid: Uuid,
    pub request_type: String,
    #[serde(skip)]
    pub command: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl MdmCommand {
    /// Store a command and queue it for a host, atomically.
    pub async fn enqueue(
        pool: &sqlx::PgPool,
        host_uuid: &str,
        command_uuid: Uuid,
        request_type: &str,
        command: &[u8],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO mdm_commands (command_uuid, request_type, command)
            VALUES ($1, $2, $3)
            ",
        )
        .bind(command_uuid)
        .bind(request_type)
        .bind(command)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO mdm_command_queue (host_uuid, command_uuid)
            VALUES ($1, $2)
            ",
        )
        .bind(host_uuid)
        .bind(command_uuid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Active commands queued for a host, oldest first.
    pub async fn list_active_for_host(
        pool: &sqlx::PgPool,
        host_uuid: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT c.* FROM mdm_commands c
            JOIN mdm_command_queue q ON q.command_uuid = c.command_uuid
            WHERE q.host_uuid = $1 AND q.active
            ORDER BY q.created_at ASC
            ",
        )
        .bind(host_uuid)
        .fetch_all(pool)
        .await
    }
}
