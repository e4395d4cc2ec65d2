//! End-to-end reconciliation scenarios against the in-memory seams.

use std::sync::Arc;

use fleetmdm_apple::mobileconfig::{build_mobileconfig, DISK_ENCRYPTION_PROFILE_IDENTIFIER};
use fleetmdm_apple::results::{MDM_CLIENT_ERROR_DOMAIN, PROFILE_NOT_FOUND_CODE};
use fleetmdm_apple::{
    Command, CommandResult, CommandResultProcessor, CommandStatus, DeliveryStatus, Dispatcher,
    DispatcherConfig, ErrorChainItem, HostProfile, InMemoryActivitySink, InMemoryCommandQueue,
    InMemoryProfileStore, InMemoryPushTransport, InMemoryScheduleLock, LifecycleHooks, MdmError,
    OperationType, ProfileService, ProfileStore, ReconcileScheduler, ResultOutcome,
    SchedulerConfig,
};
use fleetmdm_core::{HostUuid, Scope, TeamId};

struct Fleet {
    store: Arc<InMemoryProfileStore>,
    queue: Arc<InMemoryCommandQueue>,
    push: Arc<InMemoryPushTransport>,
    service: ProfileService,
    hooks: LifecycleHooks,
    scheduler: ReconcileScheduler,
    processor: CommandResultProcessor,
}

fn fleet() -> Fleet {
    let store = Arc::new(InMemoryProfileStore::new());
    let queue = Arc::new(InMemoryCommandQueue::new());
    let push = Arc::new(InMemoryPushTransport::new());
    let hooks = LifecycleHooks::new(store.clone());
    let service = ProfileService::new(
        store.clone(),
        Arc::new(InMemoryActivitySink::new()),
        hooks.clone(),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        queue.clone(),
        push.clone(),
        DispatcherConfig::default(),
    );
    let scheduler = ReconcileScheduler::new(
        store.clone(),
        dispatcher,
        Arc::new(InMemoryScheduleLock::new()),
        SchedulerConfig {
            instance_id: "scenarios".to_string(),
            ..SchedulerConfig::default()
        },
    );
    let processor = CommandResultProcessor::new(store.clone());
    Fleet {
        store,
        queue,
        push,
        service,
        hooks,
        scheduler,
        processor,
    }
}

fn payload(identifier: &str, name: &str) -> Vec<u8> {
    build_mobileconfig(identifier, name, &[])
}

fn row<'a>(rows: &'a [HostProfile], identifier: &str) -> &'a HostProfile {
    rows.iter()
        .find(|r| r.profile_identifier == identifier)
        .unwrap_or_else(|| panic!("no row for {identifier}"))
}

fn result(host: &HostUuid, command: &fleetmdm_apple::QueuedCommand, status: CommandStatus) -> CommandResult {
    CommandResult {
        host_uuid: host.clone(),
        command_uuid: command.command_uuid,
        status,
        error_chain: Vec::new(),
        raw: Vec::new(),
    }
}

/// Acknowledge every queued command, then forget them.
async fn acknowledge_all(f: &Fleet) {
    for command in f.queue.commands() {
        f.processor
            .process(&result(&command.host_uuid, &command, CommandStatus::Acknowledged))
            .await
            .unwrap();
    }
    f.queue.clear();
}

fn identifiers(rows: &[HostProfile], operation: OperationType) -> Vec<String> {
    let mut ids: Vec<String> = rows
        .iter()
        .filter(|r| r.operation == operation)
        .map(|r| r.profile_identifier.clone())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_acknowledged_and_failed_installs_settle() {
    let f = fleet();
    let host = HostUuid::new("H");
    f.store.add_host(&host, Scope::Global);
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("I1", "N1"), payload("I2", "N2")])
        .await
        .unwrap();

    let first = f.scheduler.run_once().await.unwrap();
    assert_eq!(first.install_candidates, 2);

    let rows = f.store.all_host_profiles();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.operation == OperationType::Install
        && r.status == Some(DeliveryStatus::Pending)));

    for command in f.queue.commands() {
        let target = rows
            .iter()
            .find(|r| r.command_uuid == Some(command.command_uuid))
            .unwrap();
        let mut res = result(&host, &command, CommandStatus::Acknowledged);
        if target.profile_identifier == "I2" {
            res.status = CommandStatus::Error;
            res.error_chain = vec![ErrorChainItem {
                error_code: 12021,
                error_domain: "MCMDMErrorDomain".to_string(),
                localized_description: "Unknown command".to_string(),
                us_english_description: None,
            }];
        }
        f.processor.process(&res).await.unwrap();
    }
    f.queue.clear();

    let rows = f.store.all_host_profiles();
    assert_eq!(row(&rows, "I1").status, Some(DeliveryStatus::Verifying));
    let failed = row(&rows, "I2");
    assert_eq!(failed.status, Some(DeliveryStatus::Failed));
    assert!(failed.detail.contains("Unknown command"));

    let second = f.scheduler.run_once().await.unwrap();
    assert_eq!(second.install_candidates, 0);
    assert_eq!(second.remove_candidates, 0);
    assert_eq!(f.queue.count(), 0);

    let rows = f.store.all_host_profiles();
    assert_eq!(rows.len(), 2);
    assert_eq!(row(&rows, "I1").status, Some(DeliveryStatus::Verifying));
    assert_eq!(row(&rows, "I2").status, Some(DeliveryStatus::Failed));

    let summary = f.service.profiles_summary(Scope::Global).await.unwrap();
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_pending_remove_is_superseded_by_reinstall() {
    let f = fleet();
    let host = HostUuid::new("H");
    f.store.add_host(&host, Scope::Global);
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("X", "Wi-Fi")])
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();
    acknowledge_all(&f).await;

    f.service
        .batch_set_profiles(Scope::Global, Vec::new())
        .await
        .unwrap();
    let removal = f.scheduler.run_once().await.unwrap();
    assert_eq!(removal.remove_candidates, 1);
    let rows = f.store.all_host_profiles();
    assert_eq!(rows[0].operation, OperationType::Remove);
    assert_eq!(rows[0].status, Some(DeliveryStatus::Pending));
    f.queue.clear();

    f.service
        .batch_set_profiles(
            Scope::Global,
            vec![build_mobileconfig("X", "Wi-Fi", &[("com.apple.wifi.managed", "X.wifi")])],
        )
        .await
        .unwrap();
    let reinstall = f.scheduler.run_once().await.unwrap();

    assert_eq!(reinstall.install_candidates, 1);
    assert_eq!(reinstall.rows_deleted, 1);
    let rows = f.store.all_host_profiles();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].operation, OperationType::Install);
    assert_eq!(rows[0].status, Some(DeliveryStatus::Pending));
    let commands = f.queue.commands();
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0].command, Command::InstallProfile { .. }));
}

#[tokio::test]
async fn test_edited_payload_reinstalls_verifying_and_failed_hosts() {
    let f = fleet();
    let a = HostUuid::new("A");
    let b = HostUuid::new("B");
    f.store.add_host(&a, Scope::Global);
    f.store.add_host(&b, Scope::Global);
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("I1", "N1")])
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();

    for command in f.queue.commands() {
        let status = if command.host_uuid == a {
            CommandStatus::Acknowledged
        } else {
            CommandStatus::Error
        };
        f.processor
            .process(&result(&command.host_uuid, &command, status))
            .await
            .unwrap();
    }
    f.queue.clear();

    f.service
        .batch_set_profiles(
            Scope::Global,
            vec![build_mobileconfig("I1", "N1", &[("com.apple.dock", "I1.dock")])],
        )
        .await
        .unwrap();
    let report = f.scheduler.run_once().await.unwrap();

    assert_eq!(report.install_candidates, 2);
    assert_eq!(f.queue.commands_for(&a).len(), 1);
    assert_eq!(f.queue.commands_for(&b).len(), 1);
    assert!(f
        .store
        .all_host_profiles()
        .iter()
        .all(|r| r.status == Some(DeliveryStatus::Pending)));
}

#[tokio::test]
async fn test_team_transfer_round_trip() {
    let f = fleet();
    let host = HostUuid::new("H");
    let team = Scope::Team(TeamId::new(7).unwrap());
    f.store.add_host(&host, Scope::Global);
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("G1", "Global 1"), payload("G2", "Global 2")])
        .await
        .unwrap();
    f.service
        .batch_set_profiles(team, vec![payload("T1", "Team 1")])
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();
    acknowledge_all(&f).await;

    f.store.set_host_scope(&host, team);
    f.hooks.host_team_changed(&[host.clone()], team).await.unwrap();
    let preview = f.scheduler.preview().await.unwrap();
    assert_eq!(preview.install_count(), 1);
    assert_eq!(preview.remove_count(), 2);

    f.scheduler.run_once().await.unwrap();
    let rows = f.store.all_host_profiles();
    assert_eq!(identifiers(&rows, OperationType::Install), vec!["T1"]);
    assert_eq!(identifiers(&rows, OperationType::Remove), vec!["G1", "G2"]);
    acknowledge_all(&f).await;

    let rows = f.store.all_host_profiles();
    assert_eq!(rows.len(), 1);
    assert_eq!(row(&rows, "T1").status, Some(DeliveryStatus::Verifying));

    f.store.set_host_scope(&host, Scope::Global);
    f.scheduler.run_once().await.unwrap();
    let rows = f.store.all_host_profiles();
    assert_eq!(identifiers(&rows, OperationType::Install), vec!["G1", "G2"]);
    assert_eq!(identifiers(&rows, OperationType::Remove), vec!["T1"]);
}

#[tokio::test]
async fn test_reserved_profiles_survive_bulk_replace() {
    let f = fleet();
    f.service.enable_disk_encryption(Scope::Global).await.unwrap();

    let err = f
        .service
        .batch_set_profiles(
            Scope::Global,
            vec![payload(DISK_ENCRYPTION_PROFILE_IDENTIFIER, "Mine now")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MdmError::Validation(_)));

    f.service
        .batch_set_profiles(Scope::Global, vec![payload("I1", "N1")])
        .await
        .unwrap();

    assert!(f
        .store
        .scope_has_profile(Scope::Global, DISK_ENCRYPTION_PROFILE_IDENTIFIER)
        .await
        .unwrap());
    let listed = f.service.list_profiles(Scope::Global).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].identifier, "I1");
}

#[tokio::test]
async fn test_unenrolled_host_is_forgotten() {
    let f = fleet();
    let host = HostUuid::new("H");
    f.store.add_host(&host, Scope::Global);
    f.service.enable_disk_encryption(Scope::Global).await.unwrap();
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("I1", "N1")])
        .await
        .unwrap();
    f.service
        .record_disk_encryption_key(&host, "escrowed")
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();
    assert_eq!(f.store.host_profile_count(), 2);

    f.store.set_host_enrolled(&host, false);
    f.hooks.host_unenrolled(&host).await.unwrap();

    assert_eq!(f.store.host_profile_count(), 0);
    assert!(f.store.get_disk_encryption_key(&host).await.unwrap().is_none());
    let report = f.scheduler.run_once().await.unwrap();
    assert_eq!(report.install_candidates, 0);
    assert_eq!(report.remove_candidates, 0);
}

#[tokio::test]
async fn test_push_failure_leaves_commands_queued() {
    let f = fleet();
    let host = HostUuid::new("H");
    f.store.add_host(&host, Scope::Global);
    f.push.fail_host(&host);
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("I1", "N1")])
        .await
        .unwrap();

    let report = f.scheduler.run_once().await.unwrap();

    assert_eq!(report.dispatch.pushes_failed, 1);
    assert_eq!(report.dispatch.commands_enqueued, 1);
    assert_eq!(f.queue.count(), 1);
    assert_eq!(
        f.store.all_host_profiles()[0].status,
        Some(DeliveryStatus::Pending)
    );
}

#[tokio::test]
async fn test_removal_of_absent_profile_counts_as_done() {
    let f = fleet();
    let host = HostUuid::new("H");
    f.store.add_host(&host, Scope::Global);
    f.service
        .batch_set_profiles(Scope::Global, vec![payload("I1", "N1")])
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();
    acknowledge_all(&f).await;

    f.service
        .batch_set_profiles(Scope::Global, Vec::new())
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();

    let command = f.queue.commands().remove(0);
    assert!(matches!(command.command, Command::RemoveProfile { .. }));
    let mut res = result(&host, &command, CommandStatus::Error);
    res.error_chain = vec![ErrorChainItem {
        error_code: PROFILE_NOT_FOUND_CODE,
        error_domain: MDM_CLIENT_ERROR_DOMAIN.to_string(),
        localized_description: "Profile not found".to_string(),
        us_english_description: None,
    }];

    assert_eq!(
        f.processor.process(&res).await.unwrap(),
        ResultOutcome::Removed
    );
    assert_eq!(f.store.host_profile_count(), 0);
    assert!(f.service.host_profiles(&host).await.unwrap().is_empty());
}
