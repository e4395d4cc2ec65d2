//! Strongly Typed Identifiers
//!
//! Newtypes for the identifiers the reconciler passes around. Hosts are
//! keyed by the device UUID string reported at enrollment, teams by their
//! numeric id, and device commands by a UUID correlation token.
//!
//! # Example
//!
//! ```
//! use fleetmdm_core::{CommandUuid, HostUuid, TeamId};
//!
//! let host = HostUuid::new("A1B2C3D4-0000-0000-0000-000000000001");
//! let team = TeamId::new(7).unwrap();
//! assert!(TeamId::new(0).is_none());
//! let command = CommandUuid::new();
//!
//! fn requires_host(id: &HostUuid) -> &str {
//!     id.as_str()
//! }
//!
//! assert_eq!(requires_host(&host), "A1B2C3D4-0000-0000-0000-000000000001");
//! assert_eq!(team.get(), 7);
//! assert_ne!(command, CommandUuid::new());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;
use uuid::Uuid;

/// Error type for ID parsing failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse
    pub id_type: &'static str,
    /// The underlying parse error message
    pub message: String,
}

impl Display for ParseIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse {}: {}", self.id_type, self.message)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to define a UUID-backed identifier type
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random ID using UUID v4.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an ID from an existing UUID.
            #[must_use]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns a reference to the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        message: e.to_string(),
                    })
            }
        }
    };
}

define_id!(
    /// Correlation token assigned to a device command when it is enqueued.
    ///
    /// The device echoes it back in its acknowledgment, which is how the
    /// result processor finds the ledger row to resolve.
    CommandUuid
);

/// Device UUID of an enrolled host.
///
/// Apple devices report their hardware UUID as an uppercase string; it is
/// kept verbatim because it is the join key to enrollment records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostUuid(String);

impl HostUuid {
    /// Wraps a device UUID string.
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for HostUuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HostUuid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for HostUuid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for HostUuid {
    type Err = ParseIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseIdError {
                id_type: "HostUuid",
                message: "host uuid must not be empty".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Identifier of a team.
///
/// Team ids are always positive. The "no team" case is not a team id; it is
/// represented by [`crate::Scope::Global`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TeamId(NonZeroU32);

impl TeamId {
    /// `None` for zero.
    #[must_use]
    pub const fn new(id: u32) -> Option<Self> {
        match NonZeroU32::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl Display for TeamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for TeamId {
    type Error = ParseIdError;

    fn try_from(id: u32) -> std::result::Result<Self, Self::Error> {
        Self::new(id).ok_or_else(|| ParseIdError {
            id_type: "TeamId",
            message: "team id must be positive".to_string(),
        })
    }
}

impl From<TeamId> for u32 {
    fn from(id: TeamId) -> Self {
        id.get()
    }
}

impl FromStr for TeamId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = s.parse::<u32>().map_err(|e| ParseIdError {
            id_type: "TeamId",
            message: e.to_string(),
        })?;
        Self::try_from(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_uuid_roundtrip_through_string() {
        let id = CommandUuid::new();
        let parsed: CommandUuid = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_command_uuid_parse_error_names_type() {
        let err = "not-a-uuid".parse::<CommandUuid>().unwrap_err();
        assert_eq!(err.id_type, "CommandUuid");
        assert!(err.to_string().starts_with("Failed to parse CommandUuid"));
    }

    #[test]
    fn test_host_uuid_rejects_blank() {
        assert!("  ".parse::<HostUuid>().is_err());
        let host: HostUuid = " ABC ".parse().unwrap();
        assert_eq!(host.as_str(), "ABC");
    }

    #[test]
    fn test_team_id_rejects_zero() {
        assert!("0".parse::<TeamId>().is_err());
        assert_eq!("12".parse::<TeamId>().unwrap(), TeamId::new(12).unwrap());
    }

    #[test]
    fn test_team_id_deserialize_rejects_zero() {
        assert!(serde_json::from_str::<TeamId>("0").is_err());
        assert_eq!(serde_json::from_str::<TeamId>("4").unwrap().get(), 4);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let host = HostUuid::new("H1");
        assert_eq!(serde_json::to_string(&host).unwrap(), "\"H1\"");
        assert_eq!(serde_json::to_string(&TeamId::new(3).unwrap()).unwrap(), "3");
    }
}
