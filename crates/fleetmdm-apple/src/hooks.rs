//! Lifecycle hooks run by the host and profile management paths.
//!
//! Team changes and profile edits need no ledger writes: the next
//! reconciliation pass sees the new scope join. With eager pending enabled
//! the affected hosts are queued right away so their status shows up before
//! the next tick.

use std::sync::Arc;

use fleetmdm_core::{HostUuid, Scope};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::MdmError;
use crate::mobileconfig::DISK_ENCRYPTION_PROFILE_IDENTIFIER;
use crate::store::ProfileStore;
use crate::types::HostSelector;

/// What a team transfer changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeamChangeReport {
    pub keys_deleted: u64,
    pub rows_queued: u64,
}

#[derive(Clone)]
pub struct LifecycleHooks {
    store: Arc<dyn ProfileStore>,
    eager_pending: bool,
}

impl LifecycleHooks {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            eager_pending: false,
        }
    }

    /// Queue affected rows immediately instead of waiting for the next pass.
    #[must_use]
    pub fn with_eager_pending(mut self, eager: bool) -> Self {
        self.eager_pending = eager;
        self
    }

    #[must_use]
    pub fn eager_pending(&self) -> bool {
        self.eager_pending
    }

    /// Hosts moved to `scope`. Their escrowed keys are dropped when the new
    /// scope does not enforce disk encryption.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[instrument(skip(self, hosts), fields(hosts = hosts.len(), scope = %scope))]
    pub async fn host_team_changed(
        &self,
        hosts: &[HostUuid],
        scope: Scope,
    ) -> Result<TeamChangeReport, MdmError> {
        let mut report = TeamChangeReport::default();
        if hosts.is_empty() {
            return Ok(report);
        }

        if !self
            .store
            .scope_has_profile(scope, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
            .await?
        {
            report.keys_deleted = self.store.delete_disk_encryption_keys(hosts).await?;
        }

        if self.eager_pending {
            report.rows_queued = self
                .store
                .bulk_set_pending_host_profiles(&HostSelector::Hosts(hosts.to_vec()))
                .await?;
        }

        info!(
            keys_deleted = report.keys_deleted,
            rows_queued = report.rows_queued,
            "Hosts transferred"
        );
        Ok(report)
    }

    /// Drop the ledger and escrowed key of a host that left MDM.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[instrument(skip(self), fields(host_uuid = %host))]
    pub async fn host_unenrolled(&self, host: &HostUuid) -> Result<(), MdmError> {
        self.store.clear_host_mdm_state(host).await?;
        info!("Host MDM state cleared");
        Ok(())
    }

    /// The profile set of `scope` changed. Returns the number of rows queued.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn profiles_changed(&self, scope: Scope) -> Result<u64, MdmError> {
        if !self.eager_pending {
            return Ok(0);
        }
        let queued = self
            .store
            .bulk_set_pending_host_profiles(&HostSelector::Scopes(vec![scope]))
            .await?;
        debug!(scope = %scope, queued, "Queued rows for changed scope");
        Ok(queued)
    }
}
