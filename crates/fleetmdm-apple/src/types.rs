//! Domain types shared by the store, differencer, scheduler and processors.

use chrono::{DateTime, Utc};
use fleetmdm_core::{CommandUuid, HostUuid, Scope};
use serde::{Deserialize, Serialize};

pub use fleetmdm_db::models::{DeliveryStatus, OperationType};

/// Numeric id of a stored configuration profile.
pub type ProfileId = i64;

/// A configuration profile assigned to a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigProfile {
    pub id: ProfileId,
    pub scope: Scope,
    pub identifier: String,
    pub name: String,
    #[serde(skip)]
    pub mobileconfig: Vec<u8>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated content of a profile, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileContent {
    pub identifier: String,
    pub name: String,
    pub mobileconfig: Vec<u8>,
    pub checksum: String,
}

/// One observed-state ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub host_uuid: HostUuid,
    pub profile_id: ProfileId,
    pub profile_identifier: String,
    pub profile_name: String,
    pub checksum: String,
    pub operation: OperationType,
    /// `None` while queued but not yet dispatched.
    pub status: Option<DeliveryStatus>,
    pub command_uuid: Option<CommandUuid>,
    pub detail: String,
}

impl HostProfile {
    /// Same row with a new status and correlation token.
    #[must_use]
    pub fn with_delivery(
        &self,
        status: Option<DeliveryStatus>,
        command_uuid: Option<CommandUuid>,
    ) -> Self {
        Self {
            status,
            command_uuid,
            ..self.clone()
        }
    }

    /// A removal the device has already acknowledged.
    #[must_use]
    pub fn removal_confirmed(&self) -> bool {
        self.operation == OperationType::Remove && self.status == Some(DeliveryStatus::Verifying)
    }
}

/// A (host, profile) pair produced by the differencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCandidate {
    pub host_uuid: HostUuid,
    pub profile_id: ProfileId,
    pub profile_identifier: String,
    pub profile_name: String,
    pub checksum: String,
    pub current_operation: Option<OperationType>,
    pub current_status: Option<DeliveryStatus>,
}

impl ProfileCandidate {
    /// Ledger row that queues `operation` for this pair.
    #[must_use]
    pub fn queued(&self, operation: OperationType) -> HostProfile {
        HostProfile {
            host_uuid: self.host_uuid.clone(),
            profile_id: self.profile_id,
            profile_identifier: self.profile_identifier.clone(),
            profile_name: self.profile_name.clone(),
            checksum: self.checksum.clone(),
            operation,
            status: None,
            command_uuid: None,
            detail: String::new(),
        }
    }
}

/// Result-processor write to a ledger row, keyed by (host, command).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfileUpdate {
    pub host_uuid: HostUuid,
    pub command_uuid: CommandUuid,
    pub operation: OperationType,
    pub status: Option<DeliveryStatus>,
    pub detail: String,
    /// The device error means the removal already happened.
    pub ignorable_error: bool,
}

impl HostProfileUpdate {
    /// Whether the update resolves the row by deleting it.
    #[must_use]
    pub fn deletes_row(&self) -> bool {
        self.operation == OperationType::Remove
            && (self.status == Some(DeliveryStatus::Verifying) || self.ignorable_error)
    }
}

/// Selects the hosts whose pending rows should be recomputed eagerly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSelector {
    Hosts(Vec<HostUuid>),
    Scopes(Vec<Scope>),
    Profiles(Vec<ProfileId>),
}

impl HostSelector {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            HostSelector::Hosts(v) => v.is_empty(),
            HostSelector::Scopes(v) => v.is_empty(),
            HostSelector::Profiles(v) => v.is_empty(),
        }
    }
}

/// Escrowed disk-encryption key facts (the key itself is not exposed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEncryptionKey {
    pub host_uuid: HostUuid,
    /// `None` until the escrow checker has tried to decrypt it.
    pub decryptable: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

/// Hosts of a scope per aggregate profile state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilesSummary {
    pub failed: u64,
    pub pending: u64,
    pub verifying: u64,
}

/// Hosts of a scope per disk-encryption state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEncryptionSummary {
    pub verifying: u64,
    pub action_required: u64,
    pub enforcing: u64,
    pub failed: u64,
    pub removing_enforcement: u64,
}

/// Display form of a host's ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfileView {
    pub profile_id: ProfileId,
    pub identifier: String,
    pub name: String,
    pub operation: OperationType,
    /// Queued-but-undispatched rows are reported as pending.
    pub status: DeliveryStatus,
    pub detail: String,
}

impl From<HostProfile> for HostProfileView {
    fn from(row: HostProfile) -> Self {
        Self {
            profile_id: row.profile_id,
            identifier: row.profile_identifier,
            name: row.profile_name,
            operation: row.operation,
            status: row.status.unwrap_or(DeliveryStatus::Pending),
            detail: row.detail,
        }
    }
}
