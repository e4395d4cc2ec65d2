//! Desired/observed state differencer.
//!
//! Pure functions over snapshots. The PostgreSQL store evaluates the same
//! rules in SQL; the in-memory store and the tests use these directly.
//!
//! Matching rule: a profile is desired for a host when the profile's scope is
//! the host's current scope and the host is eligible (macOS, MDM enrolled).

use std::collections::{BTreeMap, HashMap, HashSet};

use fleetmdm_core::{HostUuid, Scope};

use crate::mobileconfig::DISK_ENCRYPTION_PROFILE_IDENTIFIER;
use crate::types::{
    ConfigProfile, DeliveryStatus, DiskEncryptionKey, DiskEncryptionSummary, HostProfile,
    OperationType, ProfileCandidate, ProfileId, ProfilesSummary,
};

/// Host facts relevant to the differencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub host_uuid: HostUuid,
    pub scope: Scope,
    /// macOS host with an enabled device enrollment.
    pub eligible: bool,
}

/// Whether a desired pair needs an install given its observed row.
#[must_use]
pub fn needs_install(observed: Option<&HostProfile>, desired_checksum: &str) -> bool {
    match observed {
        None => true,
        Some(row) => {
            row.checksum != desired_checksum
                || row.operation == OperationType::Remove
                || (row.operation == OperationType::Install && row.status.is_none())
        }
    }
}

/// Whether an undesired observed row needs a removal.
///
/// A removal that has already been dispatched is left alone; one that was
/// queued but never sent is offered again.
#[must_use]
pub fn needs_remove(row: &HostProfile) -> bool {
    row.operation != OperationType::Remove || row.status.is_none()
}

fn candidate_from_profile(
    host: &HostUuid,
    profile: &ConfigProfile,
    observed: Option<&HostProfile>,
) -> ProfileCandidate {
    ProfileCandidate {
        host_uuid: host.clone(),
        profile_id: profile.id,
        profile_identifier: profile.identifier.clone(),
        profile_name: profile.name.clone(),
        checksum: profile.checksum.clone(),
        current_operation: observed.map(|r| r.operation),
        current_status: observed.and_then(|r| r.status),
    }
}

fn candidate_from_row(row: &HostProfile) -> ProfileCandidate {
    ProfileCandidate {
        host_uuid: row.host_uuid.clone(),
        profile_id: row.profile_id,
        profile_identifier: row.profile_identifier.clone(),
        profile_name: row.profile_name.clone(),
        checksum: row.checksum.clone(),
        current_operation: Some(row.operation),
        current_status: row.status,
    }
}

/// Desired (host, profile) pairs that diverge from the observed state.
///
/// Ordered by host, then profile id.
#[must_use]
pub fn profiles_to_install(
    hosts: &[HostSnapshot],
    profiles: &[ConfigProfile],
    observed: &[HostProfile],
) -> Vec<ProfileCandidate> {
    let observed_by_key: HashMap<(&HostUuid, ProfileId), &HostProfile> = observed
        .iter()
        .map(|row| ((&row.host_uuid, row.profile_id), row))
        .collect();

    let mut by_scope: HashMap<Scope, Vec<&ConfigProfile>> = HashMap::new();
    for profile in profiles {
        by_scope.entry(profile.scope).or_default().push(profile);
    }

    let mut candidates = Vec::new();
    for host in hosts.iter().filter(|h| h.eligible) {
        let Some(desired) = by_scope.get(&host.scope) else {
            continue;
        };
        for profile in desired {
            let row = observed_by_key.get(&(&host.host_uuid, profile.id)).copied();
            if needs_install(row, &profile.checksum) {
                candidates.push(candidate_from_profile(&host.host_uuid, profile, row));
            }
        }
    }

    candidates.sort_by(|a, b| {
        (&a.host_uuid, a.profile_id).cmp(&(&b.host_uuid, b.profile_id))
    });
    candidates
}

/// Observed rows of eligible hosts whose profile is no longer desired.
///
/// Ordered by host, then profile id.
#[must_use]
pub fn profiles_to_remove(
    hosts: &[HostSnapshot],
    profiles: &[ConfigProfile],
    observed: &[HostProfile],
) -> Vec<ProfileCandidate> {
    let eligible: HashMap<&HostUuid, Scope> = hosts
        .iter()
        .filter(|h| h.eligible)
        .map(|h| (&h.host_uuid, h.scope))
        .collect();
    let desired: HashSet<(Scope, ProfileId)> = profiles.iter().map(|p| (p.scope, p.id)).collect();

    let mut candidates: Vec<ProfileCandidate> = observed
        .iter()
        .filter(|row| {
            eligible.get(&row.host_uuid).is_some_and(|scope| {
                !desired.contains(&(*scope, row.profile_id)) && needs_remove(row)
            })
        })
        .map(candidate_from_row)
        .collect();

    candidates.sort_by(|a, b| {
        (&a.host_uuid, a.profile_id).cmp(&(&b.host_uuid, b.profile_id))
    });
    candidates
}

/// Ledger writes for one reconciliation step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingPlan {
    /// (host, identifier) pairs whose existing rows must be deleted first.
    pub superseded: Vec<(HostUuid, String)>,
    /// Rows to upsert with status NULL, installs first.
    pub rows: Vec<HostProfile>,
    pub install_count: usize,
    pub remove_count: usize,
}

impl PendingPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Turn candidates into ledger writes.
///
/// A removal is dropped when an install for the same (host, identifier) is
/// planned: the install's delete-then-insert supersedes it, so the host never
/// has two contradictory commands in flight for one identifier.
#[must_use]
pub fn plan_pending(install: &[ProfileCandidate], remove: &[ProfileCandidate]) -> PendingPlan {
    let installing: HashSet<(&HostUuid, &str)> = install
        .iter()
        .map(|c| (&c.host_uuid, c.profile_identifier.as_str()))
        .collect();

    let mut superseded: Vec<(HostUuid, String)> = installing
        .iter()
        .map(|(host, identifier)| ((*host).clone(), (*identifier).to_string()))
        .collect();
    superseded.sort();

    let mut rows: Vec<HostProfile> = install
        .iter()
        .map(|c| c.queued(OperationType::Install))
        .collect();
    let install_count = rows.len();

    rows.extend(
        remove
            .iter()
            .filter(|c| !installing.contains(&(&c.host_uuid, c.profile_identifier.as_str())))
            .map(|c| c.queued(OperationType::Remove)),
    );
    let remove_count = rows.len() - install_count;

    PendingPlan {
        superseded,
        rows,
        install_count,
        remove_count,
    }
}

/// Group ledger rows by host, preserving order within each host.
#[must_use]
pub fn group_by_host(rows: Vec<HostProfile>) -> BTreeMap<HostUuid, Vec<HostProfile>> {
    let mut grouped: BTreeMap<HostUuid, Vec<HostProfile>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.host_uuid.clone()).or_default().push(row);
    }
    grouped
}

/// Aggregate profile state of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileBucket {
    Failed,
    Pending,
    Verifying,
}

fn key_confirmed(key: Option<&DiskEncryptionKey>) -> bool {
    key.and_then(|k| k.decryptable) == Some(true)
}

/// Classify a host by its ledger rows.
///
/// Failed wins over pending, pending over verifying. The disk-encryption
/// install counts as pending while verifying until its key is confirmed
/// decryptable.
#[must_use]
pub fn classify_host_profiles(
    rows: &[HostProfile],
    key: Option<&DiskEncryptionKey>,
) -> Option<ProfileBucket> {
    if rows.iter().any(|r| r.status == Some(DeliveryStatus::Failed)) {
        return Some(ProfileBucket::Failed);
    }

    let pending = rows.iter().any(|r| match r.status {
        None | Some(DeliveryStatus::Pending) => true,
        Some(DeliveryStatus::Verifying) => {
            r.profile_identifier == DISK_ENCRYPTION_PROFILE_IDENTIFIER
                && r.operation == OperationType::Install
                && !key_confirmed(key)
        }
        Some(DeliveryStatus::Failed) => false,
    });
    if pending {
        return Some(ProfileBucket::Pending);
    }

    if rows.iter().any(|r| r.status == Some(DeliveryStatus::Verifying)) {
        return Some(ProfileBucket::Verifying);
    }
    None
}

/// Disk-encryption state of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskEncryptionBucket {
    Verifying,
    ActionRequired,
    Enforcing,
    Failed,
    RemovingEnforcement,
}

/// Classify a host's disk-encryption ledger row.
#[must_use]
pub fn classify_disk_encryption(
    row: &HostProfile,
    key: Option<&DiskEncryptionKey>,
) -> Option<DiskEncryptionBucket> {
    match (row.operation, row.status) {
        (_, Some(DeliveryStatus::Failed)) => Some(DiskEncryptionBucket::Failed),
        (OperationType::Install, None | Some(DeliveryStatus::Pending)) => {
            Some(DiskEncryptionBucket::Enforcing)
        }
        (OperationType::Install, Some(DeliveryStatus::Verifying)) => match key {
            Some(k) => match k.decryptable {
                Some(true) => Some(DiskEncryptionBucket::Verifying),
                Some(false) => Some(DiskEncryptionBucket::ActionRequired),
                None => Some(DiskEncryptionBucket::Enforcing),
            },
            None => Some(DiskEncryptionBucket::ActionRequired),
        },
        (OperationType::Remove, None | Some(DeliveryStatus::Pending)) => {
            Some(DiskEncryptionBucket::RemovingEnforcement)
        }
        (OperationType::Remove, Some(DeliveryStatus::Verifying)) => None,
    }
}

/// Summarize ledger rows of the hosts in one scope.
pub fn summarize_profiles<'a, I, K>(hosts: I, key_of: K) -> ProfilesSummary
where
    I: IntoIterator<Item = &'a [HostProfile]>,
    K: Fn(&HostUuid) -> Option<&'a DiskEncryptionKey>,
{
    let mut summary = ProfilesSummary::default();
    for rows in hosts {
        let Some(first) = rows.first() else { continue };
        match classify_host_profiles(rows, key_of(&first.host_uuid)) {
            Some(ProfileBucket::Failed) => summary.failed += 1,
            Some(ProfileBucket::Pending) => summary.pending += 1,
            Some(ProfileBucket::Verifying) => summary.verifying += 1,
            None => {}
        }
    }
    summary
}

/// Summarize the disk-encryption rows of the hosts in one scope.
pub fn summarize_disk_encryption<'a, I, K>(rows: I, key_of: K) -> DiskEncryptionSummary
where
    I: IntoIterator<Item = &'a HostProfile>,
    K: Fn(&HostUuid) -> Option<&'a DiskEncryptionKey>,
{
    let mut summary = DiskEncryptionSummary::default();
    for row in rows
        .into_iter()
        .filter(|r| r.profile_identifier == DISK_ENCRYPTION_PROFILE_IDENTIFIER)
    {
        match classify_disk_encryption(row, key_of(&row.host_uuid)) {
            Some(DiskEncryptionBucket::Verifying) => summary.verifying += 1,
            Some(DiskEncryptionBucket::ActionRequired) => summary.action_required += 1,
            Some(DiskEncryptionBucket::Enforcing) => summary.enforcing += 1,
            Some(DiskEncryptionBucket::Failed) => summary.failed += 1,
            Some(DiskEncryptionBucket::RemovingEnforcement) => summary.removing_enforcement += 1,
            None => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetmdm_core::TeamId;

    fn profile(id: ProfileId, scope: Scope, identifier: &str, checksum: &str) -> ConfigProfile {
        ConfigProfile {
            id,
            scope,
            identifier: identifier.to_string(),
            name: format!("name-{identifier}"),
            mobileconfig: Vec::new(),
            checksum: checksum.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn host(uuid: &str, scope: Scope) -> HostSnapshot {
        HostSnapshot {
            host_uuid: HostUuid::new(uuid),
            scope,
            eligible: true,
        }
    }

    fn row(
        host: &str,
        profile: &ConfigProfile,
        operation: OperationType,
        status: Option<DeliveryStatus>,
    ) -> HostProfile {
        HostProfile {
            host_uuid: HostUuid::new(host),
            profile_id: profile.id,
            profile_identifier: profile.identifier.clone(),
            profile_name: profile.name.clone(),
            checksum: profile.checksum.clone(),
            operation,
            status,
            command_uuid: None,
            detail: String::new(),
        }
    }

    #[test]
    fn test_needs_install_rules() {
        let p = profile(1, Scope::Global, "I1", "c1");
        let install = |status| row("H", &p, OperationType::Install, status);

        assert!(needs_install(None, "c1"));
        assert!(needs_install(Some(&install(None)), "c1"));
        assert!(!needs_install(Some(&install(Some(DeliveryStatus::Pending))), "c1"));
        assert!(!needs_install(Some(&install(Some(DeliveryStatus::Verifying))), "c1"));
        assert!(!needs_install(Some(&install(Some(DeliveryStatus::Failed))), "c1"));
        assert!(needs_install(Some(&install(Some(DeliveryStatus::Failed))), "c2"));
        assert!(needs_install(
            Some(&row("H", &p, OperationType::Remove, Some(DeliveryStatus::Pending))),
            "c1"
        ));
    }

    #[test]
    fn test_needs_remove_rules() {
        let p = profile(1, Scope::Global, "I1", "c1");
        assert!(needs_remove(&row("H", &p, OperationType::Install, Some(DeliveryStatus::Verifying))));
        assert!(needs_remove(&row("H", &p, OperationType::Remove, None)));
        assert!(!needs_remove(&row("H", &p, OperationType::Remove, Some(DeliveryStatus::Pending))));
        assert!(!needs_remove(&row("H", &p, OperationType::Remove, Some(DeliveryStatus::Failed))));
    }

    #[test]
    fn test_ineligible_hosts_are_skipped() {
        let profiles = vec![profile(1, Scope::Global, "I1", "c1")];
        let mut h = host("H", Scope::Global);
        h.eligible = false;
        let observed = vec![row("H", &profiles[0], OperationType::Install, None)];

        assert!(profiles_to_install(&[h.clone()], &profiles, &[]).is_empty());
        assert!(profiles_to_remove(&[h], &[], &observed).is_empty());
    }

    #[test]
    fn test_scope_transfer_swaps_install_and_remove() {
        let team = Scope::Team(TeamId::new(1).unwrap());
        let g1 = profile(1, Scope::Global, "G1", "g1");
        let g2 = profile(2, Scope::Global, "G2", "g2");
        let t1 = profile(3, team, "T1", "t1");
        let profiles = vec![g1.clone(), g2.clone(), t1.clone()];
        let observed = vec![
            row("H", &g1, OperationType::Install, Some(DeliveryStatus::Verifying)),
            row("H", &g2, OperationType::Install, Some(DeliveryStatus::Verifying)),
        ];

        let moved = [host("H", team)];
        let install = profiles_to_install(&moved, &profiles, &observed);
        let remove = profiles_to_remove(&moved, &profiles, &observed);
        assert_eq!(install.iter().map(|c| c.profile_id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(remove.iter().map(|c| c.profile_id).collect::<Vec<_>>(), vec![1, 2]);

        // Back in the global scope with a verified team profile.
        let observed_after = vec![
            row("H", &g1, OperationType::Remove, Some(DeliveryStatus::Pending)),
            row("H", &g2, OperationType::Remove, Some(DeliveryStatus::Pending)),
            row("H", &t1, OperationType::Install, Some(DeliveryStatus::Verifying)),
        ];
        let back = [host("H", Scope::Global)];
        let install = profiles_to_install(&back, &profiles, &observed_after);
        let remove = profiles_to_remove(&back, &profiles, &observed_after);
        assert_eq!(install.iter().map(|c| c.profile_id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(remove.iter().map(|c| c.profile_id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_plan_pending_drops_remove_superseded_by_install() {
        let old = profile(1, Scope::Global, "X", "old");
        let new = profile(2, Scope::Team(TeamId::new(1).unwrap()), "X", "new");
        let install = vec![candidate_from_profile(&HostUuid::new("H"), &new, None)];
        let remove = vec![candidate_from_row(&row(
            "H",
            &old,
            OperationType::Install,
            Some(DeliveryStatus::Verifying),
        ))];

        let plan = plan_pending(&install, &remove);
        assert_eq!(plan.install_count, 1);
        assert_eq!(plan.remove_count, 0);
        assert_eq!(plan.superseded, vec![(HostUuid::new("H"), "X".to_string())]);
        assert_eq!(plan.rows[0].operation, OperationType::Install);
        assert!(plan.rows[0].status.is_none());
    }

    #[test]
    fn test_group_by_host() {
        let p = profile(1, Scope::Global, "I1", "c1");
        let grouped = group_by_host(vec![
            row("B", &p, OperationType::Install, None),
            row("A", &p, OperationType::Install, None),
            row("B", &p, OperationType::Remove, None),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&HostUuid::new("B")].len(), 2);
    }

    #[test]
    fn test_classify_host_profiles() {
        let p = profile(1, Scope::Global, "I1", "c1");
        let fv = profile(2, Scope::Global, DISK_ENCRYPTION_PROFILE_IDENTIFIER, "fv");
        let verifying = row("H", &p, OperationType::Install, Some(DeliveryStatus::Verifying));
        let failed = row("H", &p, OperationType::Install, Some(DeliveryStatus::Failed));
        let fv_verifying = row("H", &fv, OperationType::Install, Some(DeliveryStatus::Verifying));
        let key = |decryptable| DiskEncryptionKey {
            host_uuid: HostUuid::new("H"),
            decryptable,
            updated_at: Utc::now(),
        };

        assert_eq!(classify_host_profiles(&[], None), None);
        assert_eq!(
            classify_host_profiles(&[verifying.clone(), failed], None),
            Some(ProfileBucket::Failed)
        );
        assert_eq!(
            classify_host_profiles(&[verifying.clone(), fv_verifying.clone()], None),
            Some(ProfileBucket::Pending)
        );
        assert_eq!(
            classify_host_profiles(&[verifying, fv_verifying], Some(&key(Some(true)))),
            Some(ProfileBucket::Verifying)
        );
    }

    #[test]
    fn test_classify_disk_encryption() {
        let fv = profile(2, Scope::Global, DISK_ENCRYPTION_PROFILE_IDENTIFIER, "fv");
        let key = |decryptable| DiskEncryptionKey {
            host_uuid: HostUuid::new("H"),
            decryptable,
            updated_at: Utc::now(),
        };
        let verifying = row("H", &fv, OperationType::Install, Some(DeliveryStatus::Verifying));

        assert_eq!(
            classify_disk_encryption(&verifying, Some(&key(Some(true)))),
            Some(DiskEncryptionBucket::Verifying)
        );
        assert_eq!(
            classify_disk_encryption(&verifying, Some(&key(Some(false)))),
            Some(DiskEncryptionBucket::ActionRequired)
        );
        assert_eq!(
            classify_disk_encryption(&verifying, None),
            Some(DiskEncryptionBucket::ActionRequired)
        );
        assert_eq!(
            classify_disk_encryption(&verifying, Some(&key(None))),
            Some(DiskEncryptionBucket::Enforcing)
        );
        assert_eq!(
            classify_disk_encryption(&row("H", &fv, OperationType::Install, None), None),
            Some(DiskEncryptionBucket::Enforcing)
        );
        assert_eq!(
            classify_disk_encryption(&row("H", &fv, OperationType::Remove, None), None),
            Some(DiskEncryptionBucket::RemovingEnforcement)
        );
        assert_eq!(
            classify_disk_encryption(
                &row("H", &fv, OperationType::Remove, Some(DeliveryStatus::Failed)),
                None
            ),
            Some(DiskEncryptionBucket::Failed)
        );
    }
}
