//! Bootstrap package: one installer package per scope, sent once to each
//! newly enrolled host through an `InstallEnterpriseApplication` command.
//!
//! Results of those commands reach [`BootstrapPackageStore::set_host_result`]
//! through the result processor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmdm_core::{CommandUuid, HostUuid, Scope};
use fleetmdm_db::models::{
    CreateMdmAppleBootstrapPackage, HostMdmAppleBootstrapPackage, MdmAppleBootstrapPackageMeta,
};
use fleetmdm_db::DbPool;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

pub use fleetmdm_db::models::BootstrapPackageStatus;

use crate::commander::{Command, CommandQueue};
use crate::error::{MdmError, StoreError};

const PACKAGE_RESOURCE: &str = "BootstrapPackage";

/// Package metadata; the bytes are fetched by token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPackage {
    pub scope: Scope,
    pub name: String,
    pub sha256: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// A package ready to be stored: digest computed, download token drawn.
#[derive(Debug, Clone)]
pub struct NewBootstrapPackage {
    pub name: String,
    pub sha256: String,
    pub token: String,
    pub bytes: Vec<u8>,
}

impl NewBootstrapPackage {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let token = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        Self {
            name: name.into(),
            sha256,
            token,
            bytes,
        }
    }
}

/// A host's bootstrap install outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBootstrapPackage {
    pub host_uuid: HostUuid,
    pub command_uuid: CommandUuid,
    /// `None` until the device reports.
    pub status: Option<BootstrapPackageStatus>,
    pub detail: String,
}

/// Hosts of a scope per bootstrap install outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub installed: u64,
    pub failed: u64,
    pub pending: u64,
}

#[async_trait]
pub trait BootstrapPackageStore: Send + Sync {
    /// Store the scope's package. `AlreadyExists` if it has one.
    async fn insert_package(
        &self,
        scope: Scope,
        package: NewBootstrapPackage,
    ) -> Result<BootstrapPackage, StoreError>;

    async fn delete_package(&self, scope: Scope) -> Result<(), StoreError>;

    async fn package_meta(&self, scope: Scope) -> Result<BootstrapPackage, StoreError>;

    /// Package name and bytes by download token.
    async fn package_bytes(&self, token: &str) -> Result<(String, Vec<u8>), StoreError>;

    /// Remember the install command sent to a host. Idempotent per host.
    async fn record_host_package(
        &self,
        host: &HostUuid,
        command: CommandUuid,
    ) -> Result<(), StoreError>;

    /// Record a command outcome. Returns `false` when the command is not a
    /// bootstrap install for that host.
    async fn set_host_result(
        &self,
        host: &HostUuid,
        command: CommandUuid,
        status: BootstrapPackageStatus,
        detail: &str,
    ) -> Result<bool, StoreError>;

    async fn host_package(&self, host: &HostUuid)
        -> Result<Option<HostBootstrapPackage>, StoreError>;

    async fn summary(&self, scope: Scope) -> Result<BootstrapSummary, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    packages: HashMap<Scope, (BootstrapPackage, Vec<u8>)>,
    host_records: HashMap<HostUuid, HostBootstrapPackage>,
    host_scopes: HashMap<HostUuid, Scope>,
}

/// In-memory bootstrap store for tests.
#[derive(Debug, Default)]
pub struct InMemoryBootstrapPackageStore {
    state: RwLock<MemoryState>,
}

impl InMemoryBootstrapPackageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a host in a scope for summaries (for testing).
    pub fn set_host_scope(&self, host: &HostUuid, scope: Scope) {
        self.state
            .write()
            .expect("lock poisoned")
            .host_scopes
            .insert(host.clone(), scope);
    }
}

#[async_trait]
impl BootstrapPackageStore for InMemoryBootstrapPackageStore {
    async fn insert_package(
        &self,
        scope: Scope,
        package: NewBootstrapPackage,
    ) -> Result<BootstrapPackage, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.packages.contains_key(&scope) {
            return Err(StoreError::already_exists(PACKAGE_RESOURCE, scope));
        }
        let meta = BootstrapPackage {
            scope,
            name: package.name,
            sha256: package.sha256,
            token: package.token,
            created_at: Utc::now(),
        };
        state.packages.insert(scope, (meta.clone(), package.bytes));
        Ok(meta)
    }

    async fn delete_package(&self, scope: Scope) -> Result<(), StoreError> {
        self.state
            .write()
            .expect("lock poisoned")
            .packages
            .remove(&scope)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(PACKAGE_RESOURCE, scope))
    }

    async fn package_meta(&self, scope: Scope) -> Result<BootstrapPackage, StoreError> {
        self.state
            .read()
            .expect("lock poisoned")
            .packages
            .get(&scope)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| StoreError::not_found(PACKAGE_RESOURCE, scope))
    }

    async fn package_bytes(&self, token: &str) -> Result<(String, Vec<u8>), StoreError> {
        self.state
            .read()
            .expect("lock poisoned")
            .packages
            .values()
            .find(|(meta, _)| meta.token == token)
            .map(|(meta, bytes)| (meta.name.clone(), bytes.clone()))
            .ok_or_else(|| StoreError::not_found(PACKAGE_RESOURCE, token))
    }

    async fn record_host_package(
        &self,
        host: &HostUuid,
        command: CommandUuid,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .expect("lock poisoned")
            .host_records
            .entry(host.clone())
            .or_insert_with(|| HostBootstrapPackage {
                host_uuid: host.clone(),
                command_uuid: command,
                status: None,
                detail: String::new(),
            });
        Ok(())
    }

    async fn set_host_result(
        &self,
        host: &HostUuid,
        command: CommandUuid,
        status: BootstrapPackageStatus,
        detail: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        match state.host_records.get_mut(host) {
            Some(record) if record.command_uuid == command => {
                record.status = Some(status);
                record.detail = detail.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn host_package(
        &self,
        host: &HostUuid,
    ) -> Result<Option<HostBootstrapPackage>, StoreError> {
        Ok(self
            .state
            .read()
            .expect("lock poisoned")
            .host_records
            .get(host)
            .cloned())
    }

    async fn summary(&self, scope: Scope) -> Result<BootstrapSummary, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        let mut summary = BootstrapSummary::default();
        for record in state.host_records.values() {
            if state.host_scopes.get(&record.host_uuid).copied().unwrap_or_default() != scope {
                continue;
            }
            match record.status {
                Some(BootstrapPackageStatus::Installed) => summary.installed += 1,
                Some(BootstrapPackageStatus::Failed) => summary.failed += 1,
                None => summary.pending += 1,
            }
        }
        Ok(summary)
    }
}

/// Bootstrap store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgBootstrapPackageStore {
    pool: DbPool,
}

impl PgBootstrapPackageStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn meta_from_row(row: MdmAppleBootstrapPackageMeta) -> Result<BootstrapPackage, StoreError> {
    Ok(BootstrapPackage {
        scope: Scope::from_storage_key(row.scope_key)
            .map_err(|e| StoreError::Database(e.to_string()))?,
        name: row.name,
        sha256: row.sha256,
        token: row.token,
        created_at: row.created_at,
    })
}

#[async_trait]
impl BootstrapPackageStore for PgBootstrapPackageStore {
    async fn insert_package(
        &self,
        scope: Scope,
        package: NewBootstrapPackage,
    ) -> Result<BootstrapPackage, StoreError> {
        let input = CreateMdmAppleBootstrapPackage {
            name: package.name,
            sha256: package.sha256,
            bytes: package.bytes,
            token: package.token,
        };
        let row = MdmAppleBootstrapPackageMeta::insert(self.pool.inner(), scope.storage_key(), &input)
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::AlreadyExists { .. } => StoreError::already_exists(PACKAGE_RESOURCE, scope),
                other => other,
            })?;
        meta_from_row(row)
    }

    async fn delete_package(&self, scope: Scope) -> Result<(), StoreError> {
        match MdmAppleBootstrapPackageMeta::delete_by_scope(self.pool.inner(), scope.storage_key())
            .await?
        {
            0 => Err(StoreError::not_found(PACKAGE_RESOURCE, scope)),
            _ => Ok(()),
        }
    }

    async fn package_meta(&self, scope: Scope) -> Result<BootstrapPackage, StoreError> {
        let row = MdmAppleBootstrapPackageMeta::find_by_scope(self.pool.inner(), scope.storage_key())
            .await?
            .ok_or_else(|| StoreError::not_found(PACKAGE_RESOURCE, scope))?;
        meta_from_row(row)
    }

    async fn package_bytes(&self, token: &str) -> Result<(String, Vec<u8>), StoreError> {
        MdmAppleBootstrapPackageMeta::bytes_by_token(self.pool.inner(), token)
            .await?
            .ok_or_else(|| StoreError::not_found(PACKAGE_RESOURCE, token))
    }

    async fn record_host_package(
        &self,
        host: &HostUuid,
        command: CommandUuid,
    ) -> Result<(), StoreError> {
        HostMdmAppleBootstrapPackage::record(self.pool.inner(), host.as_str(), *command.as_uuid())
            .await?;
        Ok(())
    }

    async fn set_host_result(
        &self,
        host: &HostUuid,
        command: CommandUuid,
        status: BootstrapPackageStatus,
        detail: &str,
    ) -> Result<bool, StoreError> {
        let updated = HostMdmAppleBootstrapPackage::set_result(
            self.pool.inner(),
            host.as_str(),
            *command.as_uuid(),
            status,
            detail,
        )
        .await?;
        Ok(updated > 0)
    }

    async fn host_package(
        &self,
        host: &HostUuid,
    ) -> Result<Option<HostBootstrapPackage>, StoreError> {
        Ok(
            HostMdmAppleBootstrapPackage::find_by_host(self.pool.inner(), host.as_str())
                .await?
                .map(|row| HostBootstrapPackage {
                    host_uuid: HostUuid::new(row.host_uuid),
                    command_uuid: CommandUuid::from_uuid(row.command_uuid),
                    status: row.status,
                    detail: row.detail,
                }),
        )
    }

    async fn summary(&self, scope: Scope) -> Result<BootstrapSummary, StoreError> {
        let counts =
            HostMdmAppleBootstrapPackage::counts_for_scope(self.pool.inner(), scope.storage_key())
                .await?;
        Ok(BootstrapSummary {
            installed: u64::try_from(counts.installed).unwrap_or(0),
            failed: u64::try_from(counts.failed).unwrap_or(0),
            pending: u64::try_from(counts.pending).unwrap_or(0),
        })
    }
}

/// Sends the scope's bootstrap package to enrolling hosts.
#[derive(Clone)]
pub struct BootstrapService {
    store: Arc<dyn BootstrapPackageStore>,
    queue: Arc<dyn CommandQueue>,
    /// Base URL the device downloads the manifest from.
    manifest_base_url: String,
}

impl BootstrapService {
    pub fn new(
        store: Arc<dyn BootstrapPackageStore>,
        queue: Arc<dyn CommandQueue>,
        manifest_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            manifest_base_url: manifest_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Upload the scope's package.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the scope has a package.
    pub async fn upload(
        &self,
        scope: Scope,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<BootstrapPackage, MdmError> {
        let package = self
            .store
            .insert_package(scope, NewBootstrapPackage::new(name, bytes))
            .await?;
        info!(scope = %scope, name = %package.name, "Bootstrap package uploaded");
        Ok(package)
    }

    /// Enqueue the install command for a host that just enrolled. Returns
    /// `None` when the scope has no package.
    ///
    /// # Errors
    ///
    /// Store and enqueue failures.
    pub async fn enqueue_for_host(
        &self,
        host: &HostUuid,
        scope: Scope,
    ) -> Result<Option<CommandUuid>, MdmError> {
        let package = match self.store.package_meta(scope).await {
            Ok(package) => package,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let command_uuid = CommandUuid::new();
        let command = Command::InstallEnterpriseApplication {
            manifest_url: format!(
                "{}/api/mdm/apple/bootstrap?token={}",
                self.manifest_base_url, package.token
            ),
        };
        self.queue.enqueue(host, command_uuid, &command).await?;
        self.store.record_host_package(host, command_uuid).await?;

        info!(host_uuid = %host, command_uuid = %command_uuid, "Bootstrap package enqueued");
        Ok(Some(command_uuid))
    }
}
