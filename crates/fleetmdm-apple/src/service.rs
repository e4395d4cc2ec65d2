//! Profile service: the operator-facing entry points.
//!
//! Validates uploads before any store write, protects product-reserved
//! profiles from user edits, records activities and runs the lifecycle hooks
//! that follow a profile change.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetmdm_core::{HostUuid, Scope};
use tracing::{info, instrument, warn};

use crate::audit::{Activity, ActivitySink};
use crate::error::MdmError;
use crate::hooks::LifecycleHooks;
use crate::mobileconfig::{
    disk_encryption_profile, is_reserved_identifier, validate_batch, ValidationError,
    DISK_ENCRYPTION_PROFILE_IDENTIFIER,
};
use crate::store::ProfileStore;
use crate::types::{
    ConfigProfile, DiskEncryptionSummary, HostProfileView, ProfileId, ProfilesSummary,
};

/// Default wait after a decryptability check before its verdict applies.
pub const DEFAULT_DISK_ENCRYPTION_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn ProfileStore>,
    activities: Arc<dyn ActivitySink>,
    hooks: LifecycleHooks,
    disk_encryption_grace: Duration,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        activities: Arc<dyn ActivitySink>,
        hooks: LifecycleHooks,
    ) -> Self {
        Self {
            store,
            activities,
            hooks,
            disk_encryption_grace: DEFAULT_DISK_ENCRYPTION_GRACE,
        }
    }

    #[must_use]
    pub fn with_disk_encryption_grace(mut self, grace: Duration) -> Self {
        self.disk_encryption_grace = grace;
        self
    }

    /// Queue status rows for a changed scope when eager pending is on. The
    /// change itself is already committed, so failures are only logged.
    async fn after_change(&self, scope: Scope) {
        if let Err(e) = self.hooks.profiles_changed(scope).await {
            warn!(scope = %scope, error = %e, "Failed to queue rows for changed scope");
        }
    }

    /// Replace the profile set of a scope with the given raw payloads.
    ///
    /// # Errors
    ///
    /// `Validation` listing every problem in the batch, before anything is
    /// written. Store failures otherwise.
    #[instrument(skip(self, payloads), fields(scope = %scope, count = payloads.len()))]
    pub async fn batch_set_profiles(
        &self,
        scope: Scope,
        payloads: Vec<Vec<u8>>,
    ) -> Result<Vec<ConfigProfile>, MdmError> {
        let contents = validate_batch(&payloads)?;
        let stored = self.store.set_profiles_for_scope(scope, contents).await?;

        info!(count = stored.len(), "Scope profiles replaced");
        self.activities
            .record(Activity::EditedMacosProfile { team_id: scope })
            .await;
        self.after_change(scope).await;
        Ok(stored)
    }

    /// Upload one profile.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad payload, `AlreadyExists` for a duplicate
    /// identifier or name in the scope.
    #[instrument(skip(self, payload), fields(scope = %scope))]
    pub async fn new_profile(
        &self,
        scope: Scope,
        payload: Vec<u8>,
    ) -> Result<ConfigProfile, MdmError> {
        let content = validate_batch(std::slice::from_ref(&payload))?
            .into_iter()
            .next()
            .ok_or_else(|| ValidationError::single("empty profile"))?;
        let profile = self.store.new_profile(scope, content).await?;

        info!(identifier = %profile.identifier, id = profile.id, "Profile created");
        self.activities
            .record(Activity::CreatedMacosProfile {
                team_id: scope,
                profile_identifier: profile.identifier.clone(),
                profile_name: profile.name.clone(),
            })
            .await;
        self.after_change(scope).await;
        Ok(profile)
    }

    /// # Errors
    ///
    /// Store failures.
    pub async fn list_profiles(&self, scope: Scope) -> Result<Vec<ConfigProfile>, MdmError> {
        Ok(self.store.list_profiles(scope).await?)
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn get_profile(&self, id: ProfileId) -> Result<ConfigProfile, MdmError> {
        Ok(self.store.get_profile(id).await?)
    }

    /// Delete a user profile.
    ///
    /// # Errors
    ///
    /// `ReservedProfile` for product-managed profiles, `NotFound` for an
    /// unknown id.
    #[instrument(skip(self))]
    pub async fn delete_profile(&self, id: ProfileId) -> Result<(), MdmError> {
        let profile = self.store.get_profile(id).await?;
        if is_reserved_identifier(&profile.identifier) {
            return Err(MdmError::ReservedProfile {
                identifier: profile.identifier,
            });
        }
        self.store.delete_profile(id).await?;
        self.record_deleted(profile).await;
        Ok(())
    }

    /// Delete a user profile by identifier.
    ///
    /// # Errors
    ///
    /// Same as [`ProfileService::delete_profile`].
    pub async fn delete_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<(), MdmError> {
        if is_reserved_identifier(identifier) {
            return Err(MdmError::ReservedProfile {
                identifier: identifier.to_string(),
            });
        }
        let profile = self.store.get_profile_by_identifier(scope, identifier).await?;
        self.store
            .delete_profile_by_identifier(scope, identifier)
            .await?;
        self.record_deleted(profile).await;
        Ok(())
    }

    async fn record_deleted(&self, profile: ConfigProfile) {
        info!(identifier = %profile.identifier, id = profile.id, "Profile deleted");
        let scope = profile.scope;
        self.activities
            .record(Activity::DeletedMacosProfile {
                team_id: scope,
                profile_identifier: profile.identifier,
                profile_name: profile.name,
            })
            .await;
        self.after_change(scope).await;
    }

    /// A host's profiles for display.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn host_profiles(&self, host: &HostUuid) -> Result<Vec<HostProfileView>, MdmError> {
        Ok(self
            .store
            .list_host_profiles(host)
            .await?
            .into_iter()
            .map(HostProfileView::from)
            .collect())
    }

    /// # Errors
    ///
    /// Store failures.
    pub async fn profiles_summary(&self, scope: Scope) -> Result<ProfilesSummary, MdmError> {
        Ok(self.store.profiles_summary(scope).await?)
    }

    /// # Errors
    ///
    /// Store failures.
    pub async fn disk_encryption_summary(
        &self,
        scope: Scope,
    ) -> Result<DiskEncryptionSummary, MdmError> {
        Ok(self.store.disk_encryption_summary(scope).await?)
    }

    /// Start enforcing disk encryption in a scope. Returns `false` when it
    /// was already enforced.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[instrument(skip(self))]
    pub async fn enable_disk_encryption(&self, scope: Scope) -> Result<bool, MdmError> {
        if self
            .store
            .scope_has_profile(scope, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await?
        {
            return Ok(false);
        }

        match self.store.new_profile(scope, disk_encryption_profile()).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        info!(scope = %scope, "Disk encryption enabled");
        self.activities
            .record(Activity::EnabledMacosDiskEncryption { team_id: scope })
            .await;
        self.after_change(scope).await;
        Ok(true)
    }

    /// Stop enforcing disk encryption in a scope. Returns `false` when it
    /// was not enforced.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[instrument(skip(self))]
    pub async fn disable_disk_encryption(&self, scope: Scope) -> Result<bool, MdmError> {
        match self
            .store
            .delete_profile_by_identifier(scope, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        info!(scope = %scope, "Disk encryption disabled");
        self.activities
            .record(Activity::DisabledMacosDiskEncryption { team_id: scope })
            .await;
        self.after_change(scope).await;
        Ok(true)
    }

    /// Store the key a host escrowed. Its decryptability becomes unknown.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn record_disk_encryption_key(
        &self,
        host: &HostUuid,
        encrypted_key: &str,
    ) -> Result<(), MdmError> {
        self.store
            .set_or_update_disk_encryption_key(host, encrypted_key)
            .await?;
        Ok(())
    }

    /// Record the escrow checker's verdict for keys it started checking at
    /// `checked_at`. Keys rotated after `checked_at` plus the grace period
    /// are left alone.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn set_disk_encryption_key_status(
        &self,
        hosts: &[HostUuid],
        decryptable: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<u64, MdmError> {
        let grace = chrono::Duration::from_std(self.disk_encryption_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let updated = self
            .store
            .set_disk_encryption_key_status(hosts, decryptable, checked_at + grace)
            .await?;
        info!(hosts = hosts.len(), updated, decryptable, "Disk encryption key status recorded");
        Ok(updated)
    }
}
