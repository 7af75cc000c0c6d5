//! One-shot monthly reset for external schedulers (cron, k8s CronJob).

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use usage_metering::billing::{MeteringService, PgLedgerStore, TracingNotifier};
use usage_metering::config;

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to the metering database")?;

    let service = MeteringService::new(
        Arc::new(PgLedgerStore::new(pool)),
        config::plan_catalog_from_env()?,
        Arc::new(TracingNotifier),
        config::metering_config_from_env(),
    );
    let summary = service
        .reset_all(Utc::now())
        .await
        .context("monthly usage reset failed")?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
