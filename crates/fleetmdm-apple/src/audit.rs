//! Activity (audit) records for profile and disk-encryption changes.
//!
//! Recording is fire-and-forget: a sink that fails logs the failure and the
//! calling operation still succeeds.

use std::sync::RwLock;

use async_trait::async_trait;
use fleetmdm_core::Scope;
use fleetmdm_db::models::ActivityRecord;
use fleetmdm_db::DbPool;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A meaningful state change worth an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "activity_type", rename_all = "snake_case")]
pub enum Activity {
    /// The profile set of a scope was replaced.
    EditedMacosProfile { team_id: Scope },
    CreatedMacosProfile {
        team_id: Scope,
        profile_identifier: String,
        profile_name: String,
    },
    DeletedMacosProfile {
        team_id: Scope,
        profile_identifier: String,
        profile_name: String,
    },
    EnabledMacosDiskEncryption { team_id: Scope },
    DisabledMacosDiskEncryption { team_id: Scope },
}

impl Activity {
    #[must_use]
    pub fn activity_type(&self) -> &'static str {
        match self {
            Activity::EditedMacosProfile { .. } => "edited_macos_profile",
            Activity::CreatedMacosProfile { .. } => "created_macos_profile",
            Activity::DeletedMacosProfile { .. } => "deleted_macos_profile",
            Activity::EnabledMacosDiskEncryption { .. } => "enabled_macos_disk_encryption",
            Activity::DisabledMacosDiskEncryption { .. } => "disabled_macos_disk_encryption",
        }
    }

    /// Details stored alongside the type: every field except the tag.
    #[must_use]
    pub fn details(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("activity_type");
        }
        value
    }
}

#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Record an activity. Never fails; implementations log their own
    /// errors.
    async fn record(&self, activity: Activity);
}

/// Emits activities as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActivitySink;

#[async_trait]
impl ActivitySink for TracingActivitySink {
    async fn record(&self, activity: Activity) {
        info!(
            activity_type = activity.activity_type(),
            details = %activity.details(),
            "Activity recorded"
        );
    }
}

/// Keeps activities in memory.
#[derive(Debug, Default)]
pub struct InMemoryActivitySink {
    activities: RwLock<Vec<Activity>>,
}

impl InMemoryActivitySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.activities.read().expect("lock poisoned").clone()
    }

    pub fn count_of(&self, activity_type: &str) -> usize {
        self.activities
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|a| a.activity_type() == activity_type)
            .count()
    }

    pub fn clear(&self) {
        self.activities.write().expect("lock poisoned").clear();
    }
}

#[async_trait]
impl ActivitySink for InMemoryActivitySink {
    async fn record(&self, activity: Activity) {
        self.activities.write().expect("lock poisoned").push(activity);
    }
}

/// Writes activities to the `activities` table.
#[derive(Debug, Clone)]
pub struct PgActivitySink {
    pool: DbPool,
}

impl PgActivitySink {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivitySink for PgActivitySink {
    async fn record(&self, activity: Activity) {
        let activity_type = activity.activity_type();
        if let Err(e) =
            ActivityRecord::insert(self.pool.inner(), activity_type, &activity.details()).await
        {
            warn!(activity_type, error = %e, "Failed to record activity");
        }
    }
}
