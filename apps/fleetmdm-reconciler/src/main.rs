//! fleetmdm profile reconciler
//!
//! Runs reconciliation passes on an interval until interrupted. Several
//! instances may run against one database; a lease keeps passes exclusive.

use std::sync::Arc;

use fleetmdm_apple::{
    Dispatcher, HttpPushTransport, NoopPushTransport, PgCommandQueue, PgProfileStore,
    PgScheduleLock, PushTransport, ReconcileScheduler, ReconcilerConfig,
};
use fleetmdm_db::{run_migrations, DbPool};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fleetmdm_apple=debug")),
        )
        .init();

    let config = ReconcilerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    info!(
        instance_id = %config.instance_id,
        interval_secs = config.reconcile_interval_secs,
        dispatch_concurrency = config.dispatch_concurrency,
        push_gateway = config.push_gateway_url.is_some(),
        "Starting profile reconciler"
    );

    let pool = DbPool::connect_with(&config.database_url, config.database_max_connections)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Database connection error: {e}");
            std::process::exit(1);
        });

    if let Err(e) = run_migrations(&pool).await {
        eprintln!("Migration error: {e}");
        std::process::exit(1);
    }

    let push: Arc<dyn PushTransport> = match &config.push_gateway_url {
        Some(url) => Arc::new(HttpPushTransport::new(url.clone()).unwrap_or_else(|e| {
            eprintln!("Push transport error: {e}");
            std::process::exit(1);
        })),
        None => Arc::new(NoopPushTransport),
    };

    let store =
        Arc::new(PgProfileStore::new(pool.clone()).with_retry_policy(config.retry_policy()));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(PgCommandQueue::new(pool.clone())),
        push,
        config.dispatcher(),
    );
    let scheduler = Arc::new(ReconcileScheduler::new(
        store,
        dispatcher,
        Arc::new(PgScheduleLock::new(pool.clone())),
        config.scheduler(),
    ));

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    shutdown_signal().await;
    scheduler.shutdown();

    if let Err(e) = runner.await {
        tracing::error!("Scheduler task failed: {e}");
    }

    pool.close().await;
    info!("Reconciler shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("Shutdown signal received");
}
