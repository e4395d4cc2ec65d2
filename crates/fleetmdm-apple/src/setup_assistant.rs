//! Automatic-enrollment setup assistant, one per scope.
//!
//! The enrollment service assigns a profile UUID once the assistant is
//! registered. Re-uploading identical content keeps that UUID; any change
//! clears it so the assistant is registered again.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmdm_core::Scope;
use fleetmdm_db::models::MdmAppleSetupAssistant;
use fleetmdm_db::DbPool;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const RESOURCE: &str = "MDMAppleSetupAssistant";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupAssistant {
    pub scope: Scope,
    pub name: String,
    pub profile: serde_json::Value,
    pub profile_uuid: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait SetupAssistantStore: Send + Sync {
    async fn set_or_update(
        &self,
        scope: Scope,
        name: &str,
        profile: serde_json::Value,
    ) -> Result<SetupAssistant, StoreError>;

    /// `NotFound` if the scope has no setup assistant.
    async fn set_profile_uuid(&self, scope: Scope, profile_uuid: &str) -> Result<(), StoreError>;

    async fn get(&self, scope: Scope) -> Result<SetupAssistant, StoreError>;

    /// Deleting a missing assistant is not an error.
    async fn delete(&self, scope: Scope) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySetupAssistantStore {
    assistants: RwLock<HashMap<Scope, SetupAssistant>>,
}

impl InMemorySetupAssistantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SetupAssistantStore for InMemorySetupAssistantStore {
    async fn set_or_update(
        &self,
        scope: Scope,
        name: &str,
        profile: serde_json::Value,
    ) -> Result<SetupAssistant, StoreError> {
        let mut assistants = self.assistants.write().expect("lock poisoned");
        let assistant = match assistants.get(&scope) {
            Some(existing) if existing.name == name && existing.profile == profile => {
                existing.clone()
            }
            _ => SetupAssistant {
                scope,
                name: name.to_string(),
                profile,
                profile_uuid: None,
                uploaded_at: Utc::now(),
            },
        };
        assistants.insert(scope, assistant.clone());
        Ok(assistant)
    }

    async fn set_profile_uuid(&self, scope: Scope, profile_uuid: &str) -> Result<(), StoreError> {
        let mut assistants = self.assistants.write().expect("lock poisoned");
        let assistant = assistants
            .get_mut(&scope)
            .ok_or_else(|| StoreError::not_found(RESOURCE, scope))?;
        assistant.profile_uuid = Some(profile_uuid.to_string());
        Ok(())
    }

    async fn get(&self, scope: Scope) -> Result<SetupAssistant, StoreError> {
        self.assistants
            .read()
            .expect("lock poisoned")
            .get(&scope)
            .cloned()
            .ok_or_else(|| StoreError::not_found(RESOURCE, scope))
    }

    async fn delete(&self, scope: Scope) -> Result<(), StoreError> {
        self.assistants.write().expect("lock poisoned").remove(&scope);
        Ok(())
    }
}

/// Setup assistants in `mdm_apple_setup_assistants`.
#[derive(Debug, Clone)]
pub struct PgSetupAssistantStore {
    pool: DbPool,
}

impl PgSetupAssistantStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: MdmAppleSetupAssistant) -> Result<SetupAssistant, StoreError> {
    let scope = Scope::from_storage_key(row.scope_key)
        .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(SetupAssistant {
        scope,
        name: row.name,
        profile: row.profile,
        profile_uuid: row.profile_uuid,
        uploaded_at: row.uploaded_at,
    })
}

#[async_trait]
impl SetupAssistantStore for PgSetupAssistantStore {
    async fn set_or_update(
        &self,
        scope: Scope,
        name: &str,
        profile: serde_json::Value,
    ) -> Result<SetupAssistant, StoreError> {
        let row = MdmAppleSetupAssistant::upsert(
            self.pool.inner(),
            scope.storage_key(),
            name,
            &profile,
        )
        .await?;
        from_row(row)
    }

    async fn set_profile_uuid(&self, scope: Scope, profile_uuid: &str) -> Result<(), StoreError> {
        let updated =
            MdmAppleSetupAssistant::set_profile_uuid(self.pool.inner(), scope.storage_key(), profile_uuid)
                .await?;
        if updated == 0 {
            return Err(StoreError::not_found(RESOURCE, scope));
        }
        Ok(())
    }

    async fn get(&self, scope: Scope) -> Result<SetupAssistant, StoreError> {
        MdmAppleSetupAssistant::find_by_scope(self.pool.inner(), scope.storage_key())
            .await?
            .ok_or_else(|| StoreError::not_found(RESOURCE, scope))
            .and_then(from_row)
    }

    async fn delete(&self, scope: Scope) -> Result<(), StoreError> {
        MdmAppleSetupAssistant::delete_by_scope(self.pool.inner(), scope.storage_key()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetmdm_core::TeamId;
    use serde_json::json;

    #[tokio::test]
    async fn test_same_content_keeps_profile_uuid() {
        let store = InMemorySetupAssistantStore::new();
        let scope = Scope::Team(TeamId::new(1).unwrap());
        let first = store
            .set_or_update(scope, "Default", json!({"skip_setup_items": ["Siri"]}))
            .await
            .unwrap();
        store.set_profile_uuid(scope, "ABC").await.unwrap();

        let again = store
            .set_or_update(scope, "Default", json!({"skip_setup_items": ["Siri"]}))
            .await
            .unwrap();

        assert_eq!(again.profile_uuid.as_deref(), Some("ABC"));
        assert_eq!(again.uploaded_at, first.uploaded_at);
    }

    #[tokio::test]
    async fn test_changed_content_clears_profile_uuid() {
        let store = InMemorySetupAssistantStore::new();
        store
            .set_or_update(Scope::Global, "Default", json!({}))
            .await
            .unwrap();
        store.set_profile_uuid(Scope::Global, "ABC").await.unwrap();

        let renamed = store
            .set_or_update(Scope::Global, "Renamed", json!({}))
            .await
            .unwrap();

        assert_eq!(renamed.profile_uuid, None);
        assert_eq!(store.get(Scope::Global).await.unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn test_set_profile_uuid_requires_assistant() {
        let store = InMemorySetupAssistantStore::new();
        let err = store
            .set_profile_uuid(Scope::Global, "ABC")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store.delete(Scope::Global).await.unwrap();
        assert!(store.get(Scope::Global).await.unwrap_err().is_not_found());
    }
}
