//! PostgreSQL [`ProfileStore`].
//!
//! Multi-statement writes run through [`with_retry_tx`], so each bulk
//! operation commits as a unit and transient conflicts are retried.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmdm_core::{CommandUuid, HostUuid, Scope};
use fleetmdm_db::models::{
    DiskEncryptionCounts, Host, HostDiskEncryptionKey, HostMdmAppleProfile, HostProfileCandidate,
    MdmAppleConfigProfile, ProfileStatusCounts, UpsertHostMdmAppleProfile,
    UpsertMdmAppleConfigProfile,
};
use fleetmdm_db::{with_retry_tx, DbError, DbPool, RetryPolicy};
use tracing::{debug, instrument};

use super::ProfileStore;
use crate::diff::{self, PendingPlan};
use crate::error::StoreError;
use crate::mobileconfig::{reserved_identifiers, DISK_ENCRYPTION_PROFILE_IDENTIFIER};
use crate::types::{
    ConfigProfile, DiskEncryptionKey, DiskEncryptionSummary, HostProfile, HostProfileUpdate,
    HostSelector, ProfileCandidate, ProfileContent, ProfileId, ProfilesSummary,
};

const PROFILE_RESOURCE: &str = "ConfigurationProfile";

/// [`ProfileStore`] backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgProfileStore {
    pool: DbPool,
    retry: RetryPolicy,
}

impl PgProfileStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn candidates(&self, remove: bool) -> Result<Vec<ProfileCandidate>, StoreError> {
        let mut conn = self.pool.inner().acquire().await?;
        let rows = if remove {
            HostMdmAppleProfile::list_to_remove(&mut *conn, None).await?
        } else {
            HostMdmAppleProfile::list_to_install(&mut *conn, None).await?
        };
        Ok(rows.into_iter().map(candidate_from_row).collect())
    }

    /// Hosts named by a selector, as stored UUID strings.
    async fn resolve_selector(&self, selector: &HostSelector) -> Result<Vec<String>, StoreError> {
        let pool = self.pool.inner();
        let uuids = match selector {
            HostSelector::Hosts(hosts) => hosts.iter().map(|h| h.as_str().to_string()).collect(),
            HostSelector::Scopes(scopes) => {
                let keys: Vec<i64> = scopes.iter().map(|s| s.storage_key()).collect();
                Host::uuids_in_scopes(pool, &keys).await?
            }
            HostSelector::Profiles(ids) => Host::uuids_for_profiles(pool, ids).await?,
        };
        Ok(uuids)
    }
}

fn scope_of(key: i64) -> Result<Scope, StoreError> {
    Scope::from_storage_key(key).map_err(|e| StoreError::Database(e.to_string()))
}

fn profile_from_row(row: MdmAppleConfigProfile) -> Result<ConfigProfile, StoreError> {
    Ok(ConfigProfile {
        id: row.id,
        scope: scope_of(row.scope_key)?,
        identifier: row.identifier,
        name: row.name,
        mobileconfig: row.mobileconfig,
        checksum: row.checksum,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn host_profile_from_row(row: HostMdmAppleProfile) -> HostProfile {
    HostProfile {
        host_uuid: HostUuid::new(row.host_uuid),
        profile_id: row.profile_id,
        profile_identifier: row.profile_identifier,
        profile_name: row.profile_name,
        checksum: row.checksum,
        operation: row.operation_type,
        status: row.status,
        command_uuid: row.command_uuid.map(CommandUuid::from_uuid),
        detail: row.detail,
    }
}

fn candidate_from_row(row: HostProfileCandidate) -> ProfileCandidate {
    ProfileCandidate {
        host_uuid: HostUuid::new(row.host_uuid),
        profile_id: row.profile_id,
        profile_identifier: row.profile_identifier,
        profile_name: row.profile_name,
        checksum: row.checksum,
        current_operation: row.current_operation,
        current_status: row.current_status,
    }
}

fn upsert_input(row: &HostProfile) -> UpsertHostMdmAppleProfile {
    UpsertHostMdmAppleProfile {
        host_uuid: row.host_uuid.as_str().to_string(),
        profile_id: row.profile_id,
        profile_identifier: row.profile_identifier.clone(),
        profile_name: row.profile_name.clone(),
        checksum: row.checksum.clone(),
        operation_type: row.operation,
        status: row.status,
        command_uuid: row.command_uuid.map(|c| *c.as_uuid()),
        detail: row.detail.clone(),
    }
}

fn profile_input(content: &ProfileContent) -> UpsertMdmAppleConfigProfile {
    UpsertMdmAppleConfigProfile {
        identifier: content.identifier.clone(),
        name: content.name.clone(),
        mobileconfig: content.mobileconfig.clone(),
        checksum: content.checksum.clone(),
    }
}

/// Unique violations on the profile table name the profile resource.
fn profile_write_error(err: DbError) -> StoreError {
    match StoreError::from(err) {
        StoreError::AlreadyExists { key, .. } => StoreError::already_exists(PROFILE_RESOURCE, key),
        other => other,
    }
}

fn host_strings(hosts: &[HostUuid]) -> Vec<String> {
    hosts.iter().map(|h| h.as_str().to_string()).collect()
}

fn key_from_row(row: HostDiskEncryptionKey) -> DiskEncryptionKey {
    DiskEncryptionKey {
        host_uuid: HostUuid::new(row.host_uuid),
        decryptable: row.decryptable,
        updated_at: row.updated_at,
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    #[instrument(skip(self, profiles), fields(scope = %scope, count = profiles.len()))]
    async fn set_profiles_for_scope(
        &self,
        scope: Scope,
        profiles: Vec<ProfileContent>,
    ) -> Result<Vec<ConfigProfile>, StoreError> {
        let scope_key = scope.storage_key();
        let inputs: Vec<UpsertMdmAppleConfigProfile> = profiles.iter().map(profile_input).collect();
        let reserved = reserved_identifiers();

        let rows = with_retry_tx(&self.pool, &self.retry, |tx| {
            let inputs = inputs.clone();
            let reserved = reserved.clone();
            Box::pin(async move {
                let existing: HashSet<String> =
                    MdmAppleConfigProfile::identifiers_for_update(&mut **tx, scope_key)
                        .await?
                        .into_iter()
                        .collect();

                let mut keep: Vec<String> = inputs
                    .iter()
                    .filter(|p| existing.contains(&p.identifier))
                    .map(|p| p.identifier.clone())
                    .collect();
                keep.extend(reserved);

                let deleted =
                    MdmAppleConfigProfile::delete_in_scope_except(&mut **tx, scope_key, &keep)
                        .await?;
                debug!(deleted, "Removed profiles absent from the new set");

                let mut stored = Vec::with_capacity(inputs.len());
                for input in &inputs {
                    stored.push(MdmAppleConfigProfile::upsert(&mut **tx, scope_key, input).await?);
                }
                Ok(stored)
            })
        })
        .await
        .map_err(profile_write_error)?;

        rows.into_iter().map(profile_from_row).collect()
    }

    async fn new_profile(
        &self,
        scope: Scope,
        profile: ProfileContent,
    ) -> Result<ConfigProfile, StoreError> {
        let scope_key = scope.storage_key();
        let input = profile_input(&profile);

        let row = with_retry_tx(&self.pool, &self.retry, |tx| {
            let input = input.clone();
            Box::pin(async move {
                Ok(MdmAppleConfigProfile::insert(&mut **tx, scope_key, &input).await?)
            })
        })
        .await
        .map_err(profile_write_error)?;

        profile_from_row(row)
    }

    async fn list_profiles(&self, scope: Scope) -> Result<Vec<ConfigProfile>, StoreError> {
        MdmAppleConfigProfile::list_by_scope(
            self.pool.inner(),
            scope.storage_key(),
            &reserved_identifiers(),
        )
        .await?
        .into_iter()
        .map(profile_from_row)
        .collect()
    }

    async fn get_profile(&self, id: ProfileId) -> Result<ConfigProfile, StoreError> {
        let row = MdmAppleConfigProfile::find_by_id(self.pool.inner(), id)
            .await?
            .ok_or_else(|| StoreError::not_found(PROFILE_RESOURCE, id))?;
        profile_from_row(row)
    }

    async fn get_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<ConfigProfile, StoreError> {
        let row = MdmAppleConfigProfile::find_by_identifier(
            self.pool.inner(),
            scope.storage_key(),
            identifier,
        )
        .await?
        .ok_or_else(|| StoreError::not_found(PROFILE_RESOURCE, identifier))?;
        profile_from_row(row)
    }

    async fn delete_profile(&self, id: ProfileId) -> Result<(), StoreError> {
        match MdmAppleConfigProfile::delete_by_id(self.pool.inner(), id).await? {
            0 => Err(StoreError::not_found(PROFILE_RESOURCE, id)),
            _ => Ok(()),
        }
    }

    async fn delete_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<(), StoreError> {
        let deleted = MdmAppleConfigProfile::delete_by_identifier(
            self.pool.inner(),
            scope.storage_key(),
            identifier,
        )
        .await?;
        if deleted == 0 {
            return Err(StoreError::not_found(PROFILE_RESOURCE, identifier));
        }
        Ok(())
    }

    async fn profile_contents(
        &self,
        ids: &[ProfileId],
    ) -> Result<HashMap<ProfileId, Vec<u8>>, StoreError> {
        Ok(MdmAppleConfigProfile::contents(self.pool.inner(), ids)
            .await?
            .into_iter()
            .map(|c| (c.id, c.mobileconfig))
            .collect())
    }

    async fn scope_has_profile(&self, scope: Scope, identifier: &str) -> Result<bool, StoreError> {
        Ok(
            MdmAppleConfigProfile::exists_in_scope(
                self.pool.inner(),
                scope.storage_key(),
                identifier,
            )
            .await?,
        )
    }

    async fn list_profiles_to_install(&self) -> Result<Vec<ProfileCandidate>, StoreError> {
        self.candidates(false).await
    }

    async fn list_profiles_to_remove(&self) -> Result<Vec<ProfileCandidate>, StoreError> {
        self.candidates(true).await
    }

    async fn delete_host_profiles_by_identifier(
        &self,
        pairs: &[(HostUuid, String)],
    ) -> Result<u64, StoreError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(h, i)| (h.as_str().to_string(), i.clone()))
            .collect();

        Ok(with_retry_tx(&self.pool, &self.retry, |tx| {
            let pairs = pairs.clone();
            Box::pin(async move {
                let mut deleted = 0;
                for (host, identifier) in &pairs {
                    deleted += HostMdmAppleProfile::delete_by_host_and_identifier(
                        &mut **tx, host, identifier,
                    )
                    .await?;
                }
                Ok(deleted)
            })
        })
        .await?)
    }

    async fn bulk_upsert_host_profiles(&self, rows: &[HostProfile]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let inputs: Vec<UpsertHostMdmAppleProfile> = rows.iter().map(upsert_input).collect();

        with_retry_tx(&self.pool, &self.retry, |tx| {
            let inputs = inputs.clone();
            Box::pin(async move {
                for input in &inputs {
                    HostMdmAppleProfile::upsert(&mut **tx, input).await?;
                }
                Ok(())
            })
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self, plan), fields(superseded = plan.superseded.len(), rows = plan.rows.len()))]
    async fn apply_pending_plan(&self, plan: &PendingPlan) -> Result<u64, StoreError> {
        if plan.superseded.is_empty() && plan.rows.is_empty() {
            return Ok(0);
        }
        let superseded: Vec<(String, String)> = plan
            .superseded
            .iter()
            .map(|(h, i)| (h.as_str().to_string(), i.clone()))
            .collect();
        let inputs: Vec<UpsertHostMdmAppleProfile> = plan.rows.iter().map(upsert_input).collect();

        Ok(with_retry_tx(&self.pool, &self.retry, |tx| {
            let superseded = superseded.clone();
            let inputs = inputs.clone();
            Box::pin(async move {
                let mut deleted = 0;
                for (host, identifier) in &superseded {
                    deleted += HostMdmAppleProfile::delete_by_host_and_identifier(
                        &mut **tx, host, identifier,
                    )
                    .await?;
                }
                for input in &inputs {
                    HostMdmAppleProfile::upsert(&mut **tx, input).await?;
                }
                Ok(deleted)
            })
        })
        .await?)
    }

    #[instrument(skip(self))]
    async fn bulk_set_pending_host_profiles(
        &self,
        selector: &HostSelector,
    ) -> Result<u64, StoreError> {
        if selector.is_empty() {
            return Ok(0);
        }
        let hosts = self.resolve_selector(selector).await?;
        if hosts.is_empty() {
            return Ok(0);
        }

        let queued = with_retry_tx(&self.pool, &self.retry, |tx| {
            let hosts = hosts.clone();
            Box::pin(async move {
                let install: Vec<ProfileCandidate> =
                    HostMdmAppleProfile::list_to_install(&mut **tx, Some(hosts.as_slice()))
                        .await?
                        .into_iter()
                        .map(candidate_from_row)
                        .collect();
                let remove: Vec<ProfileCandidate> =
                    HostMdmAppleProfile::list_to_remove(&mut **tx, Some(hosts.as_slice()))
                        .await?
                        .into_iter()
                        .map(candidate_from_row)
                        .collect();

                let plan = diff::plan_pending(&install, &remove);
                for (host, identifier) in &plan.superseded {
                    HostMdmAppleProfile::delete_by_host_and_identifier(
                        &mut **tx,
                        host.as_str(),
                        identifier,
                    )
                    .await?;
                }
                for row in &plan.rows {
                    HostMdmAppleProfile::upsert(&mut **tx, &upsert_input(row)).await?;
                }
                Ok(plan.rows.len() as u64)
            })
        })
        .await?;

        debug!(hosts = hosts.len(), queued, "Queued pending host profiles");
        Ok(queued)
    }

    async fn get_host_profile_by_command(
        &self,
        host: &HostUuid,
        command: CommandUuid,
    ) -> Result<Option<HostProfile>, StoreError> {
        Ok(
            HostMdmAppleProfile::find_by_command(self.pool.inner(), host.as_str(), *command.as_uuid())
                .await?
                .map(host_profile_from_row),
        )
    }

    async fn update_or_delete_host_profile(
        &self,
        update: &HostProfileUpdate,
    ) -> Result<(), StoreError> {
        let pool = self.pool.inner();
        let host = update.host_uuid.as_str();
        let command = *update.command_uuid.as_uuid();

        let affected = if update.deletes_row() {
            HostMdmAppleProfile::delete_by_command(pool, host, command).await?
        } else {
            HostMdmAppleProfile::update_by_command(
                pool,
                host,
                command,
                update.operation,
                update.status,
                &update.detail,
            )
            .await?
        };

        if affected == 0 {
            return Err(StoreError::not_found("HostProfile", update.command_uuid));
        }
        Ok(())
    }

    async fn list_host_profiles(&self, host: &HostUuid) -> Result<Vec<HostProfile>, StoreError> {
        Ok(HostMdmAppleProfile::list_for_host(self.pool.inner(), host.as_str())
            .await?
            .into_iter()
            .map(host_profile_from_row)
            .filter(|row| !row.removal_confirmed())
            .collect())
    }

    async fn clear_host_mdm_state(&self, host: &HostUuid) -> Result<(), StoreError> {
        let host = host.as_str().to_string();
        with_retry_tx(&self.pool, &self.retry, |tx| {
            let host = host.clone();
            Box::pin(async move {
                HostMdmAppleProfile::delete_for_host(&mut **tx, &host).await?;
                HostDiskEncryptionKey::delete_for_hosts(&mut **tx, std::slice::from_ref(&host))
                    .await?;
                Ok(())
            })
        })
        .await?;
        Ok(())
    }

    async fn set_or_update_disk_encryption_key(
        &self,
        host: &HostUuid,
        encrypted_key: &str,
    ) -> Result<(), StoreError> {
        HostDiskEncryptionKey::set_or_update(self.pool.inner(), host.as_str(), encrypted_key)
            .await?;
        Ok(())
    }

    async fn set_disk_encryption_key_status(
        &self,
        hosts: &[HostUuid],
        decryptable: bool,
        threshold: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if hosts.is_empty() {
            return Ok(0);
        }
        Ok(HostDiskEncryptionKey::set_decryptable(
            self.pool.inner(),
            &host_strings(hosts),
            decryptable,
            threshold,
        )
        .await?)
    }

    async fn get_disk_encryption_key(
        &self,
        host: &HostUuid,
    ) -> Result<Option<DiskEncryptionKey>, StoreError> {
        Ok(HostDiskEncryptionKey::find_by_host(self.pool.inner(), host.as_str())
            .await?
            .map(key_from_row))
    }

    async fn delete_disk_encryption_keys(&self, hosts: &[HostUuid]) -> Result<u64, StoreError> {
        if hosts.is_empty() {
            return Ok(0);
        }
        let hosts = host_strings(hosts);
        Ok(with_retry_tx(&self.pool, &self.retry, |tx| {
            let hosts = hosts.clone();
            Box::pin(async move { Ok(HostDiskEncryptionKey::delete_for_hosts(&mut **tx, &hosts).await?) })
        })
        .await?)
    }

    async fn profiles_summary(&self, scope: Scope) -> Result<ProfilesSummary, StoreError> {
        let counts = ProfileStatusCounts::for_scope(
            self.pool.inner(),
            scope.storage_key(),
            DISK_ENCRYPTION_PROFILE_IDENTIFIER,
        )
        .await?;
        Ok(ProfilesSummary {
            failed: count(counts.failed),
            pending: count(counts.pending),
            verifying: count(counts.verifying),
        })
    }

    async fn disk_encryption_summary(
        &self,
        scope: Scope,
    ) -> Result<DiskEncryptionSummary, StoreError> {
        let counts = DiskEncryptionCounts::for_scope(
            self.pool.inner(),
            scope.storage_key(),
            DISK_ENCRYPTION_PROFILE_IDENTIFIER,
        )
        .await?;
        Ok(DiskEncryptionSummary {
            verifying: count(counts.verifying),
            action_required: count(counts.action_required),
            enforcing: count(counts.enforcing),
            failed: count(counts.failed),
            removing_enforcement: count(counts.removing_enforcement),
        })
    }
}
