//! vipdesk background worker
//!
//! Runs the reconcile sweep on a cron schedule until SIGINT/SIGTERM.

mod config;
mod reconcile_sweep;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vipdesk_billing::{BillingConfig, BillingServices, RetryPolicy};
use vipdesk_shared::create_pool;

use crate::config::WorkerConfig;
use crate::reconcile_sweep::ReconcileSweeper;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vipdesk_worker=info,vipdesk_billing=info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    let billing = BillingServices::new(
        pool.clone(),
        BillingConfig {
            retry: RetryPolicy::with_retries(config.db_conflict_retries),
            ..BillingConfig::default()
        },
    );
    let sweeper = ReconcileSweeper::new(billing.sync.clone(), config.sweep_batch);

    // Catch up immediately instead of waiting for the first tick
    if let Some(run) = sweeper.run_once().await {
        tracing::info!(
            expired = run.expired.repaired,
            orders_repaired = run.orders.repaired,
            failed = run.expired.failed + run.orders.failed,
            "Startup sweep finished"
        );
    }

    let mut scheduler = JobScheduler::new()
        .await
        .context("Failed to create job scheduler")?;
    let job_sweeper = sweeper.clone();
    let job = Job::new_async(config.sweep_cron.as_str(), move |_uuid, _lock| {
        let sweeper = job_sweeper.clone();
        Box::pin(async move {
            sweeper.run_once().await;
        })
    })
    .with_context(|| format!("Invalid SYNC_SWEEP_CRON expression {:?}", config.sweep_cron))?;
    scheduler.add(job).await.context("Failed to schedule sweep")?;
    scheduler.start().await.context("Failed to start scheduler")?;

    tracing::info!(
        cron = %config.sweep_cron,
        batch = config.sweep_batch,
        "vipdesk worker started"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping scheduler");

    scheduler.shutdown().await.context("Failed to stop scheduler")?;
    pool.close().await;
    Ok(())
}
