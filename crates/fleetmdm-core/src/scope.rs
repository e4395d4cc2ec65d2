//! Profile scope.
//!
//! Every configuration profile, setup assistant and bootstrap package belongs
//! to exactly one scope: the global "no team" scope or a single team. Hosts
//! without a team are governed by the global scope.
//!
//! Storage uses a non-nullable integer column where `0` is the global scope.
//! That encoding lives only in [`Scope::storage_key`] and
//! [`Scope::from_storage_key`]; nothing else should compare against `0`.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::ids::TeamId;

/// Error returned when a stored scope key is not a valid scope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid scope key: {0}")]
pub struct InvalidScopeKey(pub i64);

/// The set of hosts a profile applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<TeamId>", into = "Option<TeamId>")]
pub enum Scope {
    /// Hosts that are not assigned to any team.
    #[default]
    Global,
    /// Hosts assigned to the given team.
    Team(TeamId),
}

impl Scope {
    /// Scope of a host given its (optional) team assignment.
    #[must_use]
    pub fn from_team(team: Option<TeamId>) -> Self {
        team.map_or(Self::Global, Self::Team)
    }

    #[must_use]
    pub fn team_id(self) -> Option<TeamId> {
        match self {
            Self::Global => None,
            Self::Team(id) => Some(id),
        }
    }

    #[must_use]
    pub fn is_global(self) -> bool {
        matches!(self, Self::Global)
    }

    /// Integer key used by the persistence layer.
    #[must_use]
    pub fn storage_key(self) -> i64 {
        match self {
            Self::Global => 0,
            Self::Team(id) => i64::from(id.get()),
        }
    }

    /// Inverse of [`Scope::storage_key`].
    pub fn from_storage_key(key: i64) -> Result<Self, InvalidScopeKey> {
        if key == 0 {
            return Ok(Self::Global);
        }
        u32::try_from(key)
            .ok()
            .and_then(TeamId::new)
            .map(Self::Team)
            .ok_or(InvalidScopeKey(key))
    }
}

impl From<Option<TeamId>> for Scope {
    fn from(team: Option<TeamId>) -> Self {
        Self::from_team(team)
    }
}

impl From<Scope> for Option<TeamId> {
    fn from(scope: Scope) -> Self {
        scope.team_id()
    }
}

impl TryFrom<i64> for Scope {
    type Error = InvalidScopeKey;

    fn try_from(key: i64) -> Result<Self, Self::Error> {
        Self::from_storage_key(key)
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "no team"),
            Self::Team(id) => write!(f, "team {id}"),
        }
    }
}
