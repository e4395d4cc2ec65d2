//! Error types for the reconciliation engine.

use fleetmdm_core::FleetError;
use fleetmdm_db::DbError;
use thiserror::Error;

use crate::mobileconfig::ValidationError;

/// Errors returned by [`crate::store::ProfileStore`] and the other store
/// seams.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{resource} not found: {key}")]
    NotFound { resource: &'static str, key: String },

    #[error("{resource} already exists: {key}")]
    AlreadyExists { resource: &'static str, key: String },

    /// Connection problems or transient conflicts that outlived the retry
    /// budget.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Database(String),
}

impl StoreError {
    pub(crate) fn not_found(resource: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            resource,
            key: key.to_string(),
        }
    }

    pub(crate) fn already_exists(resource: &'static str, key: impl ToString) -> Self {
        Self::AlreadyExists {
            resource,
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        if err.is_transient() || err.is_connection_error() {
            return StoreError::Unavailable(err.to_string());
        }
        match err {
            DbError::NotFound(key) => StoreError::NotFound {
                resource: "row",
                key,
            },
            DbError::AlreadyExists(constraint) => StoreError::AlreadyExists {
                resource: "row",
                key: constraint,
            },
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from(DbError::from(err))
    }
}

/// Failure to enqueue a device command.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("failed to enqueue command {command_uuid} for host {host_uuid}: {message}")]
    EnqueueFailed {
        host_uuid: String,
        command_uuid: String,
        message: String,
    },

    #[error("profile {0} has no payload to install")]
    MissingPayload(i64),
}

/// Failure to deliver a push notification. Never fatal to reconciliation.
#[derive(Debug, Clone, Error)]
pub enum PushError {
    #[error("push gateway rejected host {host_uuid}: HTTP {status}")]
    Rejected { host_uuid: String, status: u16 },

    #[error("push transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the engine's services, scheduler and processors.
#[derive(Debug, Error)]
pub enum MdmError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),

    /// Attempted to modify a profile owned by the product.
    #[error("profile {identifier} is managed by fleet and cannot be modified")]
    ReservedProfile { identifier: String },
}

impl MdmError {
    /// Whether the operation may succeed if retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, MdmError::Store(e) if e.is_unavailable())
    }
}

impl From<MdmError> for FleetError {
    fn from(err: MdmError) -> Self {
        match err {
            MdmError::Validation(v) => FleetError::Validation {
                message: v.to_string(),
                details: v.problems,
            },
            MdmError::ReservedProfile { identifier } => FleetError::Validation {
                message: format!("profile {identifier} is managed by fleet and cannot be modified"),
                details: Vec::new(),
            },
            MdmError::Store(StoreError::NotFound { resource, key }) => FleetError::NotFound {
                resource: resource.to_string(),
                id: Some(key),
            },
            MdmError::Store(StoreError::AlreadyExists { resource, key }) => {
                FleetError::AlreadyExists {
                    resource: resource.to_string(),
                    key,
                }
            }
            MdmError::Store(StoreError::Unavailable(message)) => FleetError::Unavailable { message },
            other => FleetError::Internal {
                message: other.to_string(),
            },
        }
    }
}
