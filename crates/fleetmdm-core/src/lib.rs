//! fleetmdm Core Library
//!
//! Shared types for the fleet MDM reconciler.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (HostUuid, TeamId, CommandUuid)
//! - [`scope`] - The global-or-team scope profiles are assigned to
//! - [`error`] - Standardized error types (FleetError)
//!
//! # Example
//!
//! ```
//! use fleetmdm_core::{Scope, TeamId};
//!
//! let scope = Scope::from_team(TeamId::new(3));
//! assert_eq!(scope.storage_key(), 3);
//! assert_eq!(Scope::from_team(None), Scope::Global);
//! ```

pub mod error;
pub mod ids;
pub mod scope;

pub use error::{FleetError, Result};
pub use ids::{CommandUuid, HostUuid, ParseIdError, TeamId};
pub use scope::{InvalidScopeKey, Scope};
