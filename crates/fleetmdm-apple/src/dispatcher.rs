//! Command dispatcher.
//!
//! Turns queued ledger rows into device commands. Per host: assign a fresh
//! command UUID to every row and mark it pending in one write, enqueue each
//! command, put rows whose command could not be enqueued back to the queued
//! (NULL) state, then send one push. Hosts are dispatched concurrently under
//! a semaphore and never affect each other.

use std::collections::HashMap;
use std::sync::Arc;

use fleetmdm_core::{CommandUuid, HostUuid};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::commander::{Command, CommandQueue};
use crate::diff::group_by_host;
use crate::error::{CommandError, MdmError};
use crate::push::PushTransport;
use crate::store::ProfileStore;
use crate::types::{DeliveryStatus, HostProfile, OperationType, ProfileId};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of hosts dispatched concurrently.
    pub concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Outcome of dispatching a batch of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub hosts_dispatched: usize,
    pub hosts_failed: usize,
    pub commands_enqueued: usize,
    /// Commands whose rows were returned to the queued state.
    pub commands_failed: usize,
    pub pushes_failed: usize,
    pub failed_hosts: Vec<HostUuid>,
}

impl DispatchReport {
    fn absorb(&mut self, host: HostUuid, outcome: HostOutcome) {
        self.commands_enqueued += outcome.enqueued;
        self.commands_failed += outcome.failed;
        if outcome.push_failed {
            self.pushes_failed += 1;
        }
        if outcome.enqueued > 0 {
            self.hosts_dispatched += 1;
        }
        if outcome.failed > 0 {
            self.hosts_failed += 1;
            self.failed_hosts.push(host);
        }
    }
}

#[derive(Debug, Default)]
struct HostOutcome {
    enqueued: usize,
    failed: usize,
    push_failed: bool,
}

/// Sends queued operations to devices.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn ProfileStore>,
    queue: Arc<dyn CommandQueue>,
    push: Arc<dyn PushTransport>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        queue: Arc<dyn CommandQueue>,
        push: Arc<dyn PushTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            push,
            config,
        }
    }

    /// Dispatch queued rows, grouped by host.
    ///
    /// # Errors
    ///
    /// Only a failure to load install payloads is returned; per-host
    /// failures are counted in the report.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn dispatch(&self, rows: Vec<HostProfile>) -> Result<DispatchReport, MdmError> {
        let mut report = DispatchReport::default();
        if rows.is_empty() {
            return Ok(report);
        }

        let mut install_ids: Vec<ProfileId> = rows
            .iter()
            .filter(|r| r.operation == OperationType::Install)
            .map(|r| r.profile_id)
            .collect();
        install_ids.sort_unstable();
        install_ids.dedup();
        let contents = Arc::new(self.store.profile_contents(&install_ids).await?);

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (host, host_rows) in group_by_host(rows) {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let queue = self.queue.clone();
            let push = self.push.clone();
            let contents = contents.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome =
                    dispatch_host(&*store, &*queue, &*push, &host, host_rows, &contents).await;
                (host, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, outcome)) => report.absorb(host, outcome),
                Err(e) => {
                    error!(error = %e, "Host dispatch task panicked");
                    report.hosts_failed += 1;
                }
            }
        }

        info!(
            hosts_dispatched = report.hosts_dispatched,
            hosts_failed = report.hosts_failed,
            commands_enqueued = report.commands_enqueued,
            pushes_failed = report.pushes_failed,
            "Dispatch complete"
        );
        Ok(report)
    }
}

fn build_command(
    row: &HostProfile,
    contents: &HashMap<ProfileId, Vec<u8>>,
) -> Result<Command, CommandError> {
    match row.operation {
        OperationType::Install => contents
            .get(&row.profile_id)
            .map(|payload| Command::InstallProfile {
                payload: payload.clone(),
            })
            .ok_or(CommandError::MissingPayload(row.profile_id)),
        OperationType::Remove => Ok(Command::RemoveProfile {
            identifier: row.profile_identifier.clone(),
        }),
    }
}

#[instrument(skip_all, fields(host_uuid = %host, rows = rows.len()))]
async fn dispatch_host(
    store: &dyn ProfileStore,
    queue: &dyn CommandQueue,
    push: &dyn PushTransport,
    host: &HostUuid,
    rows: Vec<HostProfile>,
    contents: &HashMap<ProfileId, Vec<u8>>,
) -> HostOutcome {
    let mut outcome = HostOutcome::default();

    let pending: Vec<HostProfile> = rows
        .iter()
        .map(|row| row.with_delivery(Some(DeliveryStatus::Pending), Some(CommandUuid::new())))
        .collect();

    if let Err(e) = store.bulk_upsert_host_profiles(&pending).await {
        warn!(error = %e, "Failed to mark rows pending, leaving them queued");
        outcome.failed = rows.len();
        return outcome;
    }

    let mut reverted = Vec::new();
    for row in &pending {
        let Some(command_uuid) = row.command_uuid else {
            continue;
        };
        let result = match build_command(row, contents) {
            Ok(command) => queue.enqueue(host, command_uuid, &command).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => outcome.enqueued += 1,
            Err(e) => {
                warn!(
                    command_uuid = %command_uuid,
                    profile_identifier = %row.profile_identifier,
                    error = %e,
                    "Failed to enqueue command"
                );
                reverted.push(row.with_delivery(None, None));
            }
        }
    }

    outcome.failed = reverted.len();
    if !reverted.is_empty() {
        if let Err(e) = store.bulk_upsert_host_profiles(&reverted).await {
            error!(error = %e, count = reverted.len(), "Failed to revert undelivered rows");
        }
    }

    if outcome.enqueued > 0 {
        if let Err(e) = push.send_push(host).await {
            warn!(error = %e, "Push failed, device will fetch commands on next check-in");
            outcome.push_failed = true;
        }
    }

    debug!(enqueued = outcome.enqueued, failed = outcome.failed, "Host dispatched");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commander::InMemoryCommandQueue;
    use crate::mobileconfig::{build_mobileconfig, checksum};
    use crate::push::InMemoryPushTransport;
    use crate::store::InMemoryProfileStore;
    use crate::types::ProfileContent;
    use fleetmdm_core::Scope;

    struct Harness {
        store: Arc<InMemoryProfileStore>,
        queue: Arc<InMemoryCommandQueue>,
        push: Arc<InMemoryPushTransport>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryProfileStore::new());
        let queue = Arc::new(InMemoryCommandQueue::new());
        let push = Arc::new(InMemoryPushTransport::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            push.clone(),
            DispatcherConfig::default(),
        );
        Harness {
            store,
            queue,
            push,
            dispatcher,
        }
    }

    async fn queued_rows(h: &Harness, hosts: &[&str]) -> Vec<HostProfile> {
        let bytes = build_mobileconfig("I1", "N1", &[]);
        h.store
            .set_profiles_for_scope(
                Scope::Global,
                vec![ProfileContent {
                    identifier: "I1".to_string(),
                    name: "N1".to_string(),
                    checksum: checksum(&bytes),
                    mobileconfig: bytes,
                }],
            )
            .await
            .unwrap();
        for host in hosts {
            h.store.add_host(&HostUuid::new(*host), Scope::Global);
        }
        let install = h.store.list_profiles_to_install().await.unwrap();
        let plan = crate::diff::plan_pending(&install, &[]);
        h.store.bulk_upsert_host_profiles(&plan.rows).await.unwrap();
        plan.rows
    }

    #[tokio::test]
    async fn test_dispatch_marks_pending_and_pushes_once_per_host() {
        let h = harness();
        let rows = queued_rows(&h, &["A", "B"]).await;

        let report = h.dispatcher.dispatch(rows).await.unwrap();

        assert_eq!(report.commands_enqueued, 2);
        assert_eq!(report.hosts_dispatched, 2);
        assert_eq!(h.push.sent().len(), 2);
        for row in h.store.all_host_profiles() {
            assert_eq!(row.status, Some(DeliveryStatus::Pending));
            let command = row.command_uuid.unwrap();
            assert!(h
                .queue
                .commands_for(&row.host_uuid)
                .iter()
                .any(|c| c.command_uuid == command));
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_reverts_row_and_spares_other_hosts() {
        let h = harness();
        let rows = queued_rows(&h, &["A", "B"]).await;
        h.queue.fail_host(&HostUuid::new("B"));

        let report = h.dispatcher.dispatch(rows).await.unwrap();

        assert_eq!(report.commands_enqueued, 1);
        assert_eq!(report.failed_hosts, vec![HostUuid::new("B")]);
        let a = h.store.host_profile(&HostUuid::new("A"), 1).unwrap();
        let b = h.store.host_profile(&HostUuid::new("B"), 1).unwrap();
        assert_eq!(a.status, Some(DeliveryStatus::Pending));
        assert_eq!(b.status, None);
        assert_eq!(b.command_uuid, None);
        assert_eq!(h.push.sent(), vec![HostUuid::new("A")]);
    }

    #[tokio::test]
    async fn test_push_failure_is_counted_not_fatal() {
        let h = harness();
        let rows = queued_rows(&h, &["A"]).await;
        h.push.fail_host(&HostUuid::new("A"));

        let report = h.dispatcher.dispatch(rows).await.unwrap();

        assert_eq!(report.pushes_failed, 1);
        assert_eq!(report.hosts_failed, 0);
        assert_eq!(h.queue.count(), 1);
        let row = h.store.host_profile(&HostUuid::new("A"), 1).unwrap();
        assert_eq!(row.status, Some(DeliveryStatus::Pending));
    }

    #[test]
    fn test_build_command_without_payload_fails() {
        let row = HostProfile {
            host_uuid: HostUuid::new("A"),
            profile_id: 7,
            profile_identifier: "I7".to_string(),
            profile_name: "N7".to_string(),
            checksum: "c".to_string(),
            operation: OperationType::Install,
            status: None,
            command_uuid: None,
            detail: String::new(),
        };
        let err = build_command(&row, &HashMap::new()).unwrap_err();
        assert!(matches!(err, CommandError::MissingPayload(7)));

        let remove = HostProfile {
            operation: OperationType::Remove,
            ..row
        };
        assert_eq!(
            build_command(&remove, &HashMap::new()).unwrap(),
            Command::RemoveProfile {
                identifier: "I7".to_string()
            }
        );
    }
}
