//! In-memory [`ProfileStore`] for tests and local runs.
//!
//! All state sits behind one lock so multi-table writes are atomic, matching
//! the transactional PostgreSQL store. Candidate queries delegate to
//! [`crate::diff`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmdm_core::{CommandUuid, HostUuid, Scope};

use super::ProfileStore;
use crate::diff::{self, HostSnapshot, PendingPlan};
use crate::error::StoreError;
use crate::mobileconfig::{is_reserved_identifier, DISK_ENCRYPTION_PROFILE_IDENTIFIER};
use crate::types::{
    ConfigProfile, DiskEncryptionKey, DiskEncryptionSummary, HostProfile, HostProfileUpdate,
    HostSelector, ProfileCandidate, ProfileContent, ProfileId, ProfilesSummary,
};

const PLATFORM_DARWIN: &str = "darwin";

/// Host facts as the inventory and enrollment subsystems report them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub scope: Scope,
    pub platform: String,
    pub enrolled: bool,
}

impl HostRecord {
    /// An enrolled macOS host in `scope`.
    #[must_use]
    pub fn enrolled_mac(scope: Scope) -> Self {
        Self {
            scope,
            platform: PLATFORM_DARWIN.to_string(),
            enrolled: true,
        }
    }

    fn eligible(&self) -> bool {
        self.enrolled && self.platform == PLATFORM_DARWIN
    }
}

#[derive(Debug, Default, Clone)]
struct State {
    next_profile_id: ProfileId,
    profiles: BTreeMap<ProfileId, ConfigProfile>,
    hosts: BTreeMap<HostUuid, HostRecord>,
    host_profiles: BTreeMap<(HostUuid, ProfileId), HostProfile>,
    disk_keys: HashMap<HostUuid, (String, DiskEncryptionKey)>,
}

impl State {
    fn host_snapshots(&self, only: Option<&HashSet<HostUuid>>) -> Vec<HostSnapshot> {
        self.hosts
            .iter()
            .filter(|(uuid, _)| only.map_or(true, |set| set.contains(*uuid)))
            .map(|(uuid, record)| HostSnapshot {
                host_uuid: uuid.clone(),
                scope: record.scope,
                eligible: record.eligible(),
            })
            .collect()
    }

    fn profile_list(&self) -> Vec<ConfigProfile> {
        self.profiles.values().cloned().collect()
    }

    fn observed(&self) -> Vec<HostProfile> {
        self.host_profiles.values().cloned().collect()
    }

    fn find_in_scope(&self, scope: Scope, identifier: &str) -> Option<&ConfigProfile> {
        self.profiles
            .values()
            .find(|p| p.scope == scope && p.identifier == identifier)
    }

    /// Insert or update by (scope, identifier), enforcing the unique name.
    fn upsert_profile(
        &mut self,
        scope: Scope,
        content: ProfileContent,
        now: DateTime<Utc>,
    ) -> Result<ConfigProfile, StoreError> {
        let existing_id = self.find_in_scope(scope, &content.identifier).map(|p| p.id);

        let name_taken = self.profiles.values().any(|p| {
            p.scope == scope && p.name == content.name && Some(p.id) != existing_id
        });
        if name_taken {
            return Err(StoreError::already_exists(
                "ConfigurationProfile",
                format!("name {} in {scope}", content.name),
            ));
        }

        let profile = match existing_id.and_then(|id| self.profiles.get(&id)) {
            Some(current) => {
                let changed =
                    current.checksum != content.checksum || current.name != content.name;
                ConfigProfile {
                    name: content.name,
                    mobileconfig: content.mobileconfig,
                    checksum: content.checksum,
                    updated_at: if changed { now } else { current.updated_at },
                    ..current.clone()
                }
            }
            None => {
                self.next_profile_id += 1;
                ConfigProfile {
                    id: self.next_profile_id,
                    scope,
                    identifier: content.identifier,
                    name: content.name,
                    mobileconfig: content.mobileconfig,
                    checksum: content.checksum,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        self.profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    fn delete_by_identifier(&mut self, pairs: &[(HostUuid, String)]) -> u64 {
        let before = self.host_profiles.len();
        let targets: HashSet<(&HostUuid, &str)> =
            pairs.iter().map(|(h, i)| (h, i.as_str())).collect();
        self.host_profiles
            .retain(|(host, _), row| !targets.contains(&(host, row.profile_identifier.as_str())));
        (before - self.host_profiles.len()) as u64
    }

    fn upsert_rows(&mut self, rows: &[HostProfile]) {
        for row in rows {
            self.host_profiles
                .insert((row.host_uuid.clone(), row.profile_id), row.clone());
        }
    }

    fn key_of(&self, host: &HostUuid) -> Option<&DiskEncryptionKey> {
        self.disk_keys.get(host).map(|(_, key)| key)
    }

    fn hosts_in_scope(&self, scope: Scope) -> HashSet<&HostUuid> {
        self.hosts
            .iter()
            .filter(|(_, r)| r.scope == scope)
            .map(|(uuid, _)| uuid)
            .collect()
    }
}

/// In-memory implementation of [`ProfileStore`].
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    state: RwLock<State>,
}

impl InMemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enrolled macOS host (for testing).
    pub fn add_host(&self, host: &HostUuid, scope: Scope) {
        self.add_host_record(host, HostRecord::enrolled_mac(scope));
    }

    /// Register a host with explicit facts (for testing).
    pub fn add_host_record(&self, host: &HostUuid, record: HostRecord) {
        self.state
            .write()
            .expect("lock poisoned")
            .hosts
            .insert(host.clone(), record);
    }

    /// Move a host to another scope (for testing).
    pub fn set_host_scope(&self, host: &HostUuid, scope: Scope) {
        if let Some(record) = self.state.write().expect("lock poisoned").hosts.get_mut(host) {
            record.scope = scope;
        }
    }

    /// Flip a host's enrollment (for testing).
    pub fn set_host_enrolled(&self, host: &HostUuid, enrolled: bool) {
        if let Some(record) = self.state.write().expect("lock poisoned").hosts.get_mut(host) {
            record.enrolled = enrolled;
        }
    }

    /// Ledger row for (host, profile) (for testing).
    pub fn host_profile(&self, host: &HostUuid, profile_id: ProfileId) -> Option<HostProfile> {
        self.state
            .read()
            .expect("lock poisoned")
            .host_profiles
            .get(&(host.clone(), profile_id))
            .cloned()
    }

    /// All ledger rows (for testing).
    pub fn all_host_profiles(&self) -> Vec<HostProfile> {
        self.state.read().expect("lock poisoned").observed()
    }

    /// Number of ledger rows (for testing).
    pub fn host_profile_count(&self) -> usize {
        self.state.read().expect("lock poisoned").host_profiles.len()
    }

    /// Overwrite a key's timestamp (for testing).
    pub fn set_disk_key_updated_at(&self, host: &HostUuid, updated_at: DateTime<Utc>) {
        if let Some((_, key)) = self
            .state
            .write()
            .expect("lock poisoned")
            .disk_keys
            .get_mut(host)
        {
            key.updated_at = updated_at;
        }
    }

    /// Clear all state (for testing).
    pub fn clear(&self) {
        *self.state.write().expect("lock poisoned") = State::default();
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn set_profiles_for_scope(
        &self,
        scope: Scope,
        profiles: Vec<ProfileContent>,
    ) -> Result<Vec<ConfigProfile>, StoreError> {
        let mut guard = self.state.write().expect("lock poisoned");
        // Work on a copy so a failure leaves the store untouched.
        let mut state = guard.clone();
        let now = Utc::now();

        let incoming: HashSet<&str> = profiles.iter().map(|p| p.identifier.as_str()).collect();
        state.profiles.retain(|_, p| {
            p.scope != scope
                || incoming.contains(p.identifier.as_str())
                || is_reserved_identifier(&p.identifier)
        });

        let mut stored = Vec::with_capacity(profiles.len());
        for content in profiles.iter().cloned() {
            stored.push(state.upsert_profile(scope, content, now)?);
        }

        *guard = state;
        Ok(stored)
    }

    async fn new_profile(
        &self,
        scope: Scope,
        profile: ProfileContent,
    ) -> Result<ConfigProfile, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.find_in_scope(scope, &profile.identifier).is_some() {
            return Err(StoreError::already_exists(
                "ConfigurationProfile",
                format!("identifier {} in {scope}", profile.identifier),
            ));
        }
        state.upsert_profile(scope, profile, Utc::now())
    }

    async fn list_profiles(&self, scope: Scope) -> Result<Vec<ConfigProfile>, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        let mut profiles: Vec<ConfigProfile> = state
            .profiles
            .values()
            .filter(|p| p.scope == scope && !is_reserved_identifier(&p.identifier))
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    async fn get_profile(&self, id: ProfileId) -> Result<ConfigProfile, StoreError> {
        self.state
            .read()
            .expect("lock poisoned")
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("ConfigurationProfile", id))
    }

    async fn get_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<ConfigProfile, StoreError> {
        self.state
            .read()
            .expect("lock poisoned")
            .find_in_scope(scope, identifier)
            .cloned()
            .ok_or_else(|| StoreError::not_found("ConfigurationProfile", identifier))
    }

    async fn delete_profile(&self, id: ProfileId) -> Result<(), StoreError> {
        self.state
            .write()
            .expect("lock poisoned")
            .profiles
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("ConfigurationProfile", id))
    }

    async fn delete_profile_by_identifier(
        &self,
        scope: Scope,
        identifier: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        let id = state
            .find_in_scope(scope, identifier)
            .map(|p| p.id)
            .ok_or_else(|| StoreError::not_found("ConfigurationProfile", identifier))?;
        state.profiles.remove(&id);
        Ok(())
    }

    async fn profile_contents(
        &self,
        ids: &[ProfileId],
    ) -> Result<HashMap<ProfileId, Vec<u8>>, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        Ok(ids
            .iter()
            .filter_map(|id| state.profiles.get(id).map(|p| (*id, p.mobileconfig.clone())))
            .collect())
    }

    async fn scope_has_profile(&self, scope: Scope, identifier: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .expect("lock poisoned")
            .find_in_scope(scope, identifier)
            .is_some())
    }

    async fn list_profiles_to_install(&self) -> Result<Vec<ProfileCandidate>, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        Ok(diff::profiles_to_install(
            &state.host_snapshots(None),
            &state.profile_list(),
            &state.observed(),
        ))
    }

    async fn list_profiles_to_remove(&self) -> Result<Vec<ProfileCandidate>, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        Ok(diff::profiles_to_remove(
            &state.host_snapshots(None),
            &state.profile_list(),
            &state.observed(),
        ))
    }

    async fn delete_host_profiles_by_identifier(
        &self,
        pairs: &[(HostUuid, String)],
    ) -> Result<u64, StoreError> {
        Ok(self
            .state
            .write()
            .expect("lock poisoned")
            .delete_by_identifier(pairs))
    }

    async fn bulk_upsert_host_profiles(&self, rows: &[HostProfile]) -> Result<(), StoreError> {
        self.state.write().expect("lock poisoned").upsert_rows(rows);
        Ok(())
    }

    async fn apply_pending_plan(&self, plan: &PendingPlan) -> Result<u64, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        let deleted = state.delete_by_identifier(&plan.superseded);
        state.upsert_rows(&plan.rows);
        Ok(deleted)
    }

    async fn bulk_set_pending_host_profiles(
        &self,
        selector: &HostSelector,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");

        let selected: HashSet<HostUuid> = match selector {
            HostSelector::Hosts(hosts) => hosts.iter().cloned().collect(),
            HostSelector::Scopes(scopes) => state
                .hosts
                .iter()
                .filter(|(_, r)| scopes.contains(&r.scope))
                .map(|(uuid, _)| uuid.clone())
                .collect(),
            HostSelector::Profiles(ids) => {
                let scopes: HashSet<Scope> = ids
                    .iter()
                    .filter_map(|id| state.profiles.get(id).map(|p| p.scope))
                    .collect();
                state
                    .hosts
                    .iter()
                    .filter(|(_, r)| scopes.contains(&r.scope))
                    .map(|(uuid, _)| uuid.clone())
                    .chain(
                        state
                            .host_profiles
                            .values()
                            .filter(|row| ids.contains(&row.profile_id))
                            .map(|row| row.host_uuid.clone()),
                    )
                    .collect()
            }
        };

        let hosts = state.host_snapshots(Some(&selected));
        let profiles = state.profile_list();
        let observed = state.observed();
        let install = diff::profiles_to_install(&hosts, &profiles, &observed);
        let remove = diff::profiles_to_remove(&hosts, &profiles, &observed);
        let plan = diff::plan_pending(&install, &remove);

        state.delete_by_identifier(&plan.superseded);
        state.upsert_rows(&plan.rows);
        Ok(plan.rows.len() as u64)
    }

    async fn get_host_profile_by_command(
        &self,
        host: &HostUuid,
        command: CommandUuid,
    ) -> Result<Option<HostProfile>, StoreError> {
        Ok(self
            .state
            .read()
            .expect("lock poisoned")
            .host_profiles
            .values()
            .find(|row| &row.host_uuid == host && row.command_uuid == Some(command))
            .cloned())
    }

    async fn update_or_delete_host_profile(
        &self,
        update: &HostProfileUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        let key = state
            .host_profiles
            .iter()
            .find(|(_, row)| {
                row.host_uuid == update.host_uuid && row.command_uuid == Some(update.command_uuid)
            })
            .map(|(key, _)| key.clone())
            .ok_or_else(|| StoreError::not_found("HostProfile", update.command_uuid))?;

        if update.deletes_row() {
            state.host_profiles.remove(&key);
        } else if let Some(row) = state.host_profiles.get_mut(&key) {
            row.status = update.status;
            row.operation = update.operation;
            row.detail.clone_from(&update.detail);
        }
        Ok(())
    }

    async fn list_host_profiles(&self, host: &HostUuid) -> Result<Vec<HostProfile>, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        let mut rows: Vec<HostProfile> = state
            .host_profiles
            .values()
            .filter(|row| &row.host_uuid == host && !row.removal_confirmed())
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.profile_name, a.profile_id).cmp(&(&b.profile_name, b.profile_id)));
        Ok(rows)
    }

    async fn clear_host_mdm_state(&self, host: &HostUuid) -> Result<(), StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        state.host_profiles.retain(|(h, _), _| h != host);
        state.disk_keys.remove(host);
        Ok(())
    }

    async fn set_or_update_disk_encryption_key(
        &self,
        host: &HostUuid,
        encrypted_key: &str,
    ) -> Result<(), StoreError> {
        let key = DiskEncryptionKey {
            host_uuid: host.clone(),
            decryptable: None,
            updated_at: Utc::now(),
        };
        self.state
            .write()
            .expect("lock poisoned")
            .disk_keys
            .insert(host.clone(), (encrypted_key.to_string(), key));
        Ok(())
    }

    async fn set_disk_encryption_key_status(
        &self,
        hosts: &[HostUuid],
        decryptable: bool,
        threshold: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        let mut updated = 0;
        for host in hosts {
            if let Some((_, key)) = state.disk_keys.get_mut(host) {
                if key.updated_at <= threshold {
                    key.decryptable = Some(decryptable);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn get_disk_encryption_key(
        &self,
        host: &HostUuid,
    ) -> Result<Option<DiskEncryptionKey>, StoreError> {
        Ok(self.state.read().expect("lock poisoned").key_of(host).cloned())
    }

    async fn delete_disk_encryption_keys(&self, hosts: &[HostUuid]) -> Result<u64, StoreError> {
        let mut state = self.state.write().expect("lock poisoned");
        Ok(hosts
            .iter()
            .filter(|host| state.disk_keys.remove(*host).is_some())
            .count() as u64)
    }

    async fn profiles_summary(&self, scope: Scope) -> Result<ProfilesSummary, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        let in_scope = state.hosts_in_scope(scope);

        let mut per_host: BTreeMap<&HostUuid, Vec<HostProfile>> = BTreeMap::new();
        for row in state.host_profiles.values() {
            if in_scope.contains(&row.host_uuid) {
                per_host.entry(&row.host_uuid).or_default().push(row.clone());
            }
        }

        Ok(diff::summarize_profiles(
            per_host.values().map(Vec::as_slice),
            |host| state.key_of(host),
        ))
    }

    async fn disk_encryption_summary(
        &self,
        scope: Scope,
    ) -> Result<DiskEncryptionSummary, StoreError> {
        let state = self.state.read().expect("lock poisoned");
        let in_scope = state.hosts_in_scope(scope);

        Ok(diff::summarize_disk_encryption(
            state.host_profiles.values().filter(|row| {
                in_scope.contains(&row.host_uuid)
                    && row.profile_identifier == DISK_ENCRYPTION_PROFILE_IDENTIFIER
            }),
            |host| state.key_of(host),
        ))
    }
}
