//! Profile store: desired profiles per scope and the per-host delivery
//! ledger.
//!
//! Pure data access. Every bulk write is all-or-nothing.

mod memory;
mod postgres;

pub use memory::{HostRecord, InMemoryProfileStore};
pub use postgres::PgProfileStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmdm_core::{CommandUuid, HostUuid, Scope};

use crate::diff::PendingPlan;
use crate::error::StoreError;
use crate::types::{
    ConfigProfile, DiskEncryptionKey, DiskEncryptionSummary, HostProfile, HostProfileUpdate,
    HostSelector, ProfileCandidate, ProfileContent, ProfileId, ProfilesSummary,
};

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Replace the complete profile set of a scope.
    ///
    /// Profiles whose identifier is absent from `profiles` are deleted,
    /// except product-reserved ones. Incoming profiles are inserted, or
    /// updated in place (keeping their id) when the identifier exists.
    async fn set_profiles_for_scope(
        &self,
        scope: Scope,
        profiles: Vec<ProfileContent>,
    ) -> Result<Vec<ConfigProfile>, StoreError>;

    /// Create one profile. Duplicate identifier or name in the scope is
    /// `AlreadyExists`.
    async fn new_profile(
        &self,
        scope: Scope,
        profile: ProfileContent,
    ) -> Result<ConfigProfile, StoreError>;

    /// User-visible profiles of a scope, ordered by name. Reserved profiles
    /// are excluded.
    async fn list_profiles(&self, scope: Scope) -> Result<Vec<ConfigProfile>, StoreError>;

    async fn get_profile(&self, id: ProfileId) -> Result<ConfigProfile, StoreError>;

    async fn get_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<ConfigProfile, StoreError>;

    async fn delete_profile(&self, id: ProfileId) -> Result<(), StoreError>;

    async fn delete_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<(), StoreError>;

    /// Payloads by profile id. Missing ids are absent from the map.
    async fn profile_contents(
        &self,
        ids: &[ProfileId],
    ) -> Result<HashMap<ProfileId, Vec<u8>>, StoreError>;

    async fn scope_has_profile(&self, scope: Scope, identifier: &str) -> Result<bool, StoreError>;

    /// Desired pairs that diverge from the ledger.
    async fn list_profiles_to_install(&self) -> Result<Vec<ProfileCandidate>, StoreError>;

    /// Ledger rows no longer desired for their host's current scope.
    async fn list_profiles_to_remove(&self) -> Result<Vec<ProfileCandidate>, StoreError>;

    /// Delete rows by (host, profile identifier), whatever their profile id.
    async fn delete_host_profiles_by_identifier(
        &self,
        pairs: &[(HostUuid, String)],
    ) -> Result<u64, StoreError>;

    /// Insert or overwrite rows keyed by (host, profile id).
    async fn bulk_upsert_host_profiles(&self, rows: &[HostProfile]) -> Result<(), StoreError>;

    /// Delete the superseded rows and queue the planned ones in one
    /// transaction. Returns the number of rows deleted.
    async fn apply_pending_plan(&self, plan: &PendingPlan) -> Result<u64, StoreError>;

    /// Compute and queue (status NULL) the pending rows of the selected
    /// hosts in one transaction. Returns the number of rows queued.
    async fn bulk_set_pending_host_profiles(
        &self,
        selector: &HostSelector,
    ) -> Result<u64, StoreError>;

    async fn get_host_profile_by_command(
        &self,
        host: &HostUuid,
        command: CommandUuid,
    ) -> Result<Option<HostProfile>, StoreError>;

    /// Result-processor write: deletes the row when
    /// [`HostProfileUpdate::deletes_row`], otherwise updates it in place.
    /// Unknown (host, command) is `NotFound`.
    async fn update_or_delete_host_profile(
        &self,
        update: &HostProfileUpdate,
    ) -> Result<(), StoreError>;

    /// A host's ledger for display. Acknowledged removals are hidden.
    async fn list_host_profiles(&self, host: &HostUuid) -> Result<Vec<HostProfile>, StoreError>;

    /// Drop every ledger row and the escrowed key of an unenrolled host.
    async fn clear_host_mdm_state(&self, host: &HostUuid) -> Result<(), StoreError>;

    async fn set_or_update_disk_encryption_key(
        &self,
        host: &HostUuid,
        encrypted_key: &str,
    ) -> Result<(), StoreError>;

    /// Record decryptability for keys last updated at or before `threshold`.
    async fn set_disk_encryption_key_status(
        &self,
        hosts: &[HostUuid],
        decryptable: bool,
        threshold: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn get_disk_encryption_key(
        &self,
        host: &HostUuid,
    ) -> Result<Option<DiskEncryptionKey>, StoreError>;

    async fn delete_disk_encryption_keys(&self, hosts: &[HostUuid]) -> Result<u64, StoreError>;

    async fn profiles_summary(&self, scope: Scope) -> Result<ProfilesSummary, StoreError>;

    async fn disk_encryption_summary(
        &self,
        scope: Scope,
    ) -> Result<DiskEncryptionSummary, StoreError>;
}
