//! Reconciliation against PostgreSQL.
//!
//! Run with: `cargo test -p fleetmdm-apple --features integration`

#![cfg(feature = "integration")]

mod common;

use std::sync::Arc;

use common::TestContext;
use fleetmdm_apple::diff::PendingPlan;
use fleetmdm_apple::mobileconfig::{build_mobileconfig, DISK_ENCRYPTION_PROFILE_IDENTIFIER};
use fleetmdm_apple::{
    validate_batch, BootstrapPackageStatus, BootstrapPackageStore, BootstrapService,
    CommandResult, CommandResultProcessor, CommandStatus, DeliveryStatus, Dispatcher,
    DispatcherConfig, ErrorChainItem, HostProfile, HostSelector, InMemoryPushTransport,
    LifecycleHooks, OperationType, PgActivitySink, PgBootstrapPackageStore, PgCommandQueue,
    PgProfileStore, PgScheduleLock, ProfileService, ProfileStore, ReconcileScheduler,
    ResultOutcome, SchedulerConfig,
};
use fleetmdm_core::{CommandUuid, HostUuid, Scope, TeamId};
use fleetmdm_db::models::{ActivityRecord, Host, MdmCommand};

struct PgFleet {
    ctx: TestContext,
    store: Arc<PgProfileStore>,
    service: ProfileService,
    scheduler: ReconcileScheduler,
    processor: CommandResultProcessor,
}

async fn pg_fleet() -> PgFleet {
    let ctx = TestContext::new().await;
    let store = Arc::new(PgProfileStore::new(ctx.pool.clone()));
    let service = ProfileService::new(
        store.clone(),
        Arc::new(PgActivitySink::new(ctx.pool.clone())),
        LifecycleHooks::new(store.clone()),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(PgCommandQueue::new(ctx.pool.clone())),
        Arc::new(InMemoryPushTransport::new()),
        DispatcherConfig::default(),
    );
    let scheduler = ReconcileScheduler::new(
        store.clone(),
        dispatcher,
        Arc::new(PgScheduleLock::new(ctx.pool.clone())),
        SchedulerConfig {
            instance_id: "pg-test".to_string(),
            ..SchedulerConfig::default()
        },
    );
    let processor = CommandResultProcessor::new(store.clone());
    PgFleet {
        ctx,
        store,
        service,
        scheduler,
        processor,
    }
}

async fn queued_commands(f: &PgFleet, host: &str) -> Vec<MdmCommand> {
    MdmCommand::list_active_for_host(f.ctx.pool.inner(), host)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pass_acknowledge_and_fail() {
    let f = pg_fleet().await;
    f.ctx.enrolled_host("H", None).await;
    f.service
        .batch_set_profiles(
            Scope::Global,
            vec![
                build_mobileconfig("I1", "N1", &[]),
                build_mobileconfig("I2", "N2", &[]),
            ],
        )
        .await
        .unwrap();

    let first = f.scheduler.run_locked().await.unwrap().unwrap();
    assert_eq!(first.install_candidates, 2);
    assert_eq!(first.dispatch.commands_enqueued, 2);

    let host = HostUuid::new("H");
    let rows = f.store.list_host_profiles(&host).await.unwrap();
    assert!(rows.iter().all(|r| r.status == Some(DeliveryStatus::Pending)));
    assert_eq!(queued_commands(&f, "H").await.len(), 2);

    for row in &rows {
        let failed = row.profile_identifier == "I2";
        let outcome = f
            .processor
            .process(&CommandResult {
                host_uuid: host.clone(),
                command_uuid: row.command_uuid.unwrap(),
                status: if failed {
                    CommandStatus::Error
                } else {
                    CommandStatus::Acknowledged
                },
                error_chain: if failed {
                    vec![ErrorChainItem {
                        error_code: 12021,
                        error_domain: "MCMDMErrorDomain".to_string(),
                        localized_description: "Unknown command".to_string(),
                        us_english_description: None,
                    }]
                } else {
                    Vec::new()
                },
                raw: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(matches!(outcome, ResultOutcome::Failed { .. }), failed);
    }

    let second = f.scheduler.run_once().await.unwrap();
    assert_eq!(second.install_candidates, 0);
    assert_eq!(second.remove_candidates, 0);

    let rows = f.store.list_host_profiles(&host).await.unwrap();
    let i2 = rows.iter().find(|r| r.profile_identifier == "I2").unwrap();
    assert_eq!(i2.status, Some(DeliveryStatus::Failed));
    assert!(i2.detail.contains("Unknown command"));

    let summary = f.store.profiles_summary(Scope::Global).await.unwrap();
    assert_eq!(summary.failed, 1);

    let edits = ActivityRecord::list_by_type(f.ctx.pool.inner(), "edited_macos_profile", 10)
        .await
        .unwrap();
    assert_eq!(edits.len(), 1);
}

#[tokio::test]
async fn test_set_profiles_is_atomic() {
    let f = pg_fleet().await;
    let team = Scope::Team(TeamId::new(3).unwrap());
    let contents = validate_batch(&[build_mobileconfig("I1", "N1", &[])]).unwrap();
    f.store.set_profiles_for_scope(team, contents).await.unwrap();

    // Two profiles sharing a name fail on the second insert.
    let mut bad = validate_batch(&[
        build_mobileconfig("I2", "Dup", &[]),
        build_mobileconfig("I3", "Other", &[]),
    ])
    .unwrap();
    bad[1].name = "Dup".to_string();

    let err = f.store.set_profiles_for_scope(team, bad).await.unwrap_err();
    assert!(err.is_already_exists());

    let identifiers: Vec<String> = f
        .store
        .list_profiles(team)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.identifier)
        .collect();
    assert_eq!(identifiers, vec!["I1"]);
}

#[tokio::test]
async fn test_team_move_and_eager_pending() {
    let f = pg_fleet().await;
    let team = Scope::Team(TeamId::new(9).unwrap());
    f.ctx.enrolled_host("H", None).await;
    f.service
        .batch_set_profiles(Scope::Global, vec![build_mobileconfig("G1", "Global", &[])])
        .await
        .unwrap();
    f.service
        .batch_set_profiles(team, vec![build_mobileconfig("T1", "Team", &[])])
        .await
        .unwrap();
    f.scheduler.run_once().await.unwrap();

    let host = HostUuid::new("H");
    let row = f.store.list_host_profiles(&host).await.unwrap().remove(0);
    f.processor
        .process(&CommandResult {
            host_uuid: host.clone(),
            command_uuid: row.command_uuid.unwrap(),
            status: CommandStatus::Acknowledged,
            error_chain: Vec::new(),
            raw: Vec::new(),
        })
        .await
        .unwrap();

    Host::set_team(f.ctx.pool.inner(), &["H".to_string()], Some(9))
        .await
        .unwrap();
    let queued = f
        .store
        .bulk_set_pending_host_profiles(&HostSelector::Hosts(vec![host.clone()]))
        .await
        .unwrap();
    assert_eq!(queued, 2);

    let rows = f.store.list_host_profiles(&host).await.unwrap();
    let g1 = rows.iter().find(|r| r.profile_identifier == "G1").unwrap();
    let t1 = rows.iter().find(|r| r.profile_identifier == "T1").unwrap();
    assert_eq!((g1.operation, g1.status), (OperationType::Remove, None));
    assert_eq!((t1.operation, t1.status), (OperationType::Install, None));

    let report = f.scheduler.run_once().await.unwrap();
    assert_eq!(report.dispatch.commands_enqueued, 2);
}

#[tokio::test]
async fn test_pending_plan_rolls_back_delete_when_queueing_fails() {
    let f = pg_fleet().await;
    f.ctx.enrolled_host("H", None).await;
    let host = HostUuid::new("H");
    let in_flight = HostProfile {
        host_uuid: host.clone(),
        profile_id: 1,
        profile_identifier: "I1".to_string(),
        profile_name: "N1".to_string(),
        checksum: format!("{:0>64}", "a"),
        operation: OperationType::Remove,
        status: Some(DeliveryStatus::Pending),
        command_uuid: Some(CommandUuid::new()),
        detail: String::new(),
    };
    f.store
        .bulk_upsert_host_profiles(&[in_flight.clone()])
        .await
        .unwrap();

    // The checksum column holds 64 characters; this row cannot be written.
    let unwritable = HostProfile {
        profile_id: 2,
        checksum: "b".repeat(65),
        operation: OperationType::Install,
        status: None,
        command_uuid: None,
        ..in_flight.clone()
    };
    let plan = PendingPlan {
        superseded: vec![(host.clone(), "I1".to_string())],
        rows: vec![unwritable],
        install_count: 1,
        ..PendingPlan::default()
    };
    assert!(f.store.apply_pending_plan(&plan).await.is_err());

    let rows = f.store.list_host_profiles(&host).await.unwrap();
    assert_eq!(rows, vec![in_flight]);
}

#[tokio::test]
async fn test_unknown_command_result_is_unmatched() {
    let f = pg_fleet().await;
    f.ctx.enrolled_host("H", None).await;
    let outcome = f
        .processor
        .process(&CommandResult {
            host_uuid: HostUuid::new("H"),
            command_uuid: CommandUuid::new(),
            status: CommandStatus::Acknowledged,
            error_chain: Vec::new(),
            raw: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Unmatched);
}

#[tokio::test]
async fn test_bootstrap_install_is_tracked_through_results() {
    let f = pg_fleet().await;
    f.ctx.enrolled_host("H", None).await;
    let packages = Arc::new(PgBootstrapPackageStore::new(f.ctx.pool.clone()));
    let bootstrap = BootstrapService::new(
        packages.clone(),
        Arc::new(PgCommandQueue::new(f.ctx.pool.clone())),
        "https://fleet.example",
    );
    bootstrap
        .upload(Scope::Global, "boot.pkg", b"pkg".to_vec())
        .await
        .unwrap();

    let host = HostUuid::new("H");
    let command = bootstrap
        .enqueue_for_host(&host, Scope::Global)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queued_commands(&f, "H").await.len(), 1);

    let processor = f.processor.clone().with_bootstrap(packages.clone());
    let outcome = processor
        .process(&CommandResult {
            host_uuid: host.clone(),
            command_uuid: command,
            status: CommandStatus::Acknowledged,
            error_chain: Vec::new(),
            raw: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResultOutcome::Bootstrap(BootstrapPackageStatus::Installed)
    );

    let summary = packages.summary(Scope::Global).await.unwrap();
    assert_eq!(summary.installed, 1);
    assert_eq!(summary.pending, 0);
}

#[tokio::test]
async fn test_disk_encryption_lifecycle() {
    let f = pg_fleet().await;
    f.ctx.enrolled_host("H", None).await;
    let host = HostUuid::new("H");

    assert!(f.service.enable_disk_encryption(Scope::Global).await.unwrap());
    assert!(!f.service.enable_disk_encryption(Scope::Global).await.unwrap());
    f.scheduler.run_once().await.unwrap();

    let rows = f.store.list_host_profiles(&host).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].profile_identifier, DISK_ENCRYPTION_PROFILE_IDENTIFIER);
    assert_eq!(rows[0].status, Some(DeliveryStatus::Pending));

    f.service
        .record_disk_encryption_key(&host, "escrowed")
        .await
        .unwrap();
    f.service
        .set_disk_encryption_key_status(&[host.clone()], true, chrono::Utc::now())
        .await
        .unwrap();
    let key = f.store.get_disk_encryption_key(&host).await.unwrap().unwrap();
    assert_eq!(key.decryptable, Some(true));

    LifecycleHooks::new(f.store.clone())
        .host_unenrolled(&host)
        .await
        .unwrap();
    assert!(f.store.list_host_profiles(&host).await.unwrap().is_empty());
    assert!(f.store.get_disk_encryption_key(&host).await.unwrap().is_none());
}
