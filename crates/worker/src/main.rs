//! Hostara Billing Worker
//!
//! Runs the scheduled jobs that drive the billing lifecycle:
//! - Due-renewal scan (every 5 minutes)
//! - Overdue invoice sweep (hourly at :15)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hostara_billing::{
    BillingEngine, BillingNotifier, BillingStore, EngineConfig, GatewayRegistry, LogNotifier,
    MockGateway, PostgresStore, RenewalOutcome, SystemClock,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn renewal_batch_size() -> i64 {
    std::env::var("RENEWAL_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100)
}

/// Run one pass over the due subscriptions.
async fn run_renewal_scan(store: &Arc<dyn BillingStore>, engine: &Arc<BillingEngine>, batch: i64) {
    let due = match store.due_subscriptions(Utc::now(), batch).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Due-subscription scan failed");
            return;
        }
    };

    let total = due.len();
    let mut renewed = 0;
    let mut skipped = 0;
    let mut failed = 0;

    for sub in due {
        match engine.renewals.process_renewal(sub.id, sub.tenant_id).await {
            Ok(RenewalOutcome::Renewed { .. }) => renewed += 1,
            Ok(RenewalOutcome::NotDue { .. }) | Ok(RenewalOutcome::InProgress) => skipped += 1,
            Err(e) => {
                // Failed attempts are recorded by dunning; the next scan
                // retries.
                warn!(
                    subscription_id = %sub.id,
                    tenant_id = %sub.tenant_id,
                    error = %e,
                    "Renewal attempt failed"
                );
                failed += 1;
            }
        }
    }

    info!(
        total = total,
        renewed = renewed,
        skipped = skipped,
        failed = failed,
        "Renewal scan complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Hostara Billing Worker");

    let pool = create_db_pool().await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let store: Arc<dyn BillingStore> = Arc::new(PostgresStore::new(pool));
    let notifier: Arc<dyn BillingNotifier> = Arc::new(LogNotifier);

    // Tenant gateway registration comes from panel configuration; sandbox
    // installs fall back to the approving mock gateway.
    let gateways = Arc::new(GatewayRegistry::new());
    if std::env::var("SANDBOX_MOCK_GATEWAY").as_deref() == Ok("true") {
        warn!("SANDBOX_MOCK_GATEWAY=true - charges are simulated, not collected");
        gateways.register_default(Arc::new(MockGateway::approving()));
    }

    let engine = Arc::new(BillingEngine::new(
        store.clone(),
        Arc::new(SystemClock),
        gateways,
        notifier.clone(),
        EngineConfig::from_env(),
    ));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Due-renewal scan (every 5 minutes)
    let scan_store = store.clone();
    let scan_engine = engine.clone();
    let batch = renewal_batch_size();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let store = scan_store.clone();
            let engine = scan_engine.clone();
            Box::pin(async move {
                info!("Running due-renewal scan");
                run_renewal_scan(&store, &engine, batch).await;
            })
        })?)
        .await?;
    info!("Scheduled: Due-renewal scan (every 5 minutes)");

    // Job 2: Overdue invoice sweep (hourly at :15)
    let sweep_store = store.clone();
    let sweep_notifier = notifier.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let store = sweep_store.clone();
            let notifier = sweep_notifier.clone();
            Box::pin(async move {
                info!("Running overdue invoice sweep");
                match store.mark_overdue_invoices(Utc::now()).await {
                    Ok(flipped) => {
                        for invoice in &flipped {
                            notifier.invoice_overdue(invoice).await;
                        }
                        info!(flipped = flipped.len(), "Overdue invoice sweep complete");
                    }
                    Err(e) => error!(error = %e, "Overdue invoice sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Overdue invoice sweep (hourly at :15)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Hostara Billing Worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
