//! Reconciliation scheduler.
//!
//! One pass: read install and remove candidates, delete rows superseded by
//! an install for the same (host, identifier), queue every candidate with
//! status NULL, then hand the queued rows to the [`Dispatcher`]. A store read
//! failure aborts the pass; per-host dispatch failures do not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::diff::plan_pending;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::MdmError;
use crate::lock::ScheduleLock;
use crate::store::ProfileStore;
use crate::types::{OperationType, ProfileCandidate};

/// Lease name held while a pass runs.
pub const RECONCILE_LOCK_NAME: &str = "mdm_apple_profile_reconcile";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between passes.
    pub interval: Duration,

    /// How long a pass may hold the lease before another instance may
    /// take over.
    pub lock_ttl: Duration,

    /// Lease owner name of this process.
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(300),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub install_candidates: usize,
    pub remove_candidates: usize,
    /// Remove candidates dropped because an install for the same
    /// identifier supersedes them.
    pub removes_superseded: usize,
    pub rows_deleted: u64,
    pub dispatch: DispatchReport,
    pub duration_ms: u64,
}

/// Dry-run result: what a pass would queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviewReport {
    pub would_install: Vec<ProfileCandidate>,
    pub would_remove: Vec<ProfileCandidate>,
}

impl PreviewReport {
    #[must_use]
    pub fn install_count(&self) -> usize {
        self.would_install.len()
    }

    #[must_use]
    pub fn remove_count(&self) -> usize {
        self.would_remove.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.would_install.is_empty() && self.would_remove.is_empty()
    }
}

/// Drives reconciliation passes on an interval.
pub struct ReconcileScheduler {
    store: Arc<dyn ProfileStore>,
    dispatcher: Dispatcher,
    lock: Arc<dyn ScheduleLock>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
    stop: Arc<Notify>,
    wake: Arc<Notify>,
}

impl ReconcileScheduler {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        dispatcher: Dispatcher,
        lock: Arc<dyn ScheduleLock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            lock,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Run one pass without taking the lease.
    ///
    /// # Errors
    ///
    /// Returns the store error that aborted the pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReconcileReport, MdmError> {
        let start = Instant::now();

        let install = self.store.list_profiles_to_install().await?;
        let remove = self.store.list_profiles_to_remove().await?;
        let plan = plan_pending(&install, &remove);

        let mut report = ReconcileReport {
            install_candidates: install.len(),
            remove_candidates: remove.len(),
            removes_superseded: remove.len() - plan.remove_count,
            ..ReconcileReport::default()
        };

        if plan.is_empty() {
            debug!("Nothing to reconcile");
            report.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(report);
        }

        report.rows_deleted = self.store.apply_pending_plan(&plan).await?;

        report.dispatch = self.dispatcher.dispatch(plan.rows).await?;
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            install = plan.install_count,
            remove = plan.remove_count,
            superseded = report.removes_superseded,
            hosts_failed = report.dispatch.hosts_failed,
            duration_ms = report.duration_ms,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Compute what the next pass would queue, without writing anything.
    ///
    /// # Errors
    ///
    /// Returns the store error if the candidates cannot be read.
    pub async fn preview(&self) -> Result<PreviewReport, MdmError> {
        let install = self.store.list_profiles_to_install().await?;
        let remove = self.store.list_profiles_to_remove().await?;
        let plan = plan_pending(&install, &remove);

        let kept_removes: Vec<ProfileCandidate> = remove
            .into_iter()
            .filter(|c| {
                plan.rows.iter().any(|r| {
                    r.operation == OperationType::Remove
                        && r.host_uuid == c.host_uuid
                        && r.profile_id == c.profile_id
                })
            })
            .collect();

        Ok(PreviewReport {
            would_install: install,
            would_remove: kept_removes,
        })
    }

    /// Run one pass if this instance can take the lease. Returns `None` when
    /// another instance holds it.
    ///
    /// # Errors
    ///
    /// Returns lease errors and errors that aborted the pass.
    pub async fn run_locked(&self) -> Result<Option<ReconcileReport>, MdmError> {
        let owner = self.config.instance_id.as_str();
        if !self
            .lock
            .try_acquire(RECONCILE_LOCK_NAME, owner, self.config.lock_ttl)
            .await?
        {
            debug!(owner, "Reconcile lease held elsewhere, skipping pass");
            return Ok(None);
        }

        let result = self.run_once().await;

        if let Err(e) = self.lock.release(RECONCILE_LOCK_NAME, owner).await {
            warn!(error = %e, "Failed to release reconcile lease");
        }
        result.map(Some)
    }

    /// Run passes until [`ReconcileScheduler::shutdown`] is called.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            instance_id = %self.config.instance_id,
            "Starting reconcile scheduler"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.wake.notified() => {
                    debug!("Reconcile pass triggered");
                }
                () = self.stop.notified() => {}
            }

            if self.is_shutdown() {
                info!("Scheduler shutdown requested, stopping");
                break;
            }

            if let Err(e) = self.run_locked().await {
                error!(error = %e, retryable = e.is_retryable(), "Reconciliation pass failed");
            }
        }

        info!("Scheduler stopped");
    }

    /// Request a pass now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Request graceful shutdown. A running pass completes first.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.stop.notify_one();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
