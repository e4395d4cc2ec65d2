//! Error Types
//!
//! Errors shared by every fleetmdm crate. Crate-specific error enums convert
//! into [`FleetError`] at service boundaries.
//!
//! # Example
//!
//! ```
//! use fleetmdm_core::{FleetError, Result};
//!
//! fn find_profile(identifier: &str) -> Result<String> {
//!     if identifier.is_empty() {
//!         return Err(FleetError::NotFound {
//!             resource: "ConfigurationProfile".to_string(),
//!             id: None,
//!         });
//!     }
//!     Ok(identifier.to_string())
//! }
//! ```

use serde::Serialize;
use thiserror::Error;

/// Standardized error type for fleetmdm.
///
/// # Variants
///
/// - `NotFound` - referenced profile, host or package does not exist
/// - `AlreadyExists` - uniqueness constraint violated
/// - `Validation` - rejected input, nothing was mutated
/// - `Unavailable` - store unreachable or retries exhausted
/// - `Internal` - anything else
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetError {
    /// Requested resource was not found.
    #[error("{resource} not found{}", id.as_ref().map(|i| format!(": {i}")).unwrap_or_default())]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// A resource with the same unique key already exists.
    #[error("{resource} already exists: {key}")]
    AlreadyExists { resource: String, key: String },

    /// Input failed validation.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        details: Vec<String>,
    },

    /// The backing store could not complete the operation.
    ///
    /// Callers may retry later; the next scheduled pass does so naturally.
    #[error("Service unavailable: {message}")]
    Unavailable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FleetError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, FleetError::AlreadyExists { .. })
    }

    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, FleetError::Validation { .. })
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Unavailable { .. })
    }
}

/// Result type alias using [`FleetError`].
pub type Result<T> = std::result::Result<T, FleetError>;
