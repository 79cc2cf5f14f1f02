//! clipflow background worker
//!
//! Runs the periodic maintenance the request path cannot be trusted to
//! trigger: the quota cycle reset sweep and the webhook dedup purge.

mod jobs;

use anyhow::Context;
use clipflow_billing::{PgQuotaStore, QuotaLedger, QuotaStore};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = clipflow_shared::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    clipflow_shared::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn QuotaStore> = Arc::new(PgQuotaStore::new(pool));
    let ledger = QuotaLedger::new(store.clone());

    let scheduler = JobScheduler::new().await?;

    // Quota reset sweep every 15 minutes
    let sweep_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_id, _sched| {
            let ledger = sweep_ledger.clone();
            Box::pin(async move {
                jobs::run_quota_reset_sweep(&ledger).await;
            })
        })?)
        .await?;

    // Webhook dedup purge daily at 03:00 UTC
    let purge_store = store.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_id, _sched| {
            let store = purge_store.clone();
            Box::pin(async move {
                jobs::run_dedup_purge(store.as_ref()).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!("clipflow worker started");

    // Run one sweep immediately so a restart doesn't delay overdue resets
    jobs::run_quota_reset_sweep(&ledger).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down worker");
    Ok(())
}
