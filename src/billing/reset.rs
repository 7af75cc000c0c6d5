use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::error::MeteringResult;
use super::models::BillingPeriod;
use super::resources::ResourceType;
use super::store::{bounded, LedgerStore};

#[derive(Debug, Clone, Serialize)]
pub struct ResetSummary {
    pub organizations_reset: usize,
    pub period: BillingPeriod,
    pub reset_at: DateTime<Utc>,
}

/// key: billing-monthly-reset -> open zeroed counters for the new period
#[derive(Clone)]
pub struct MonthlyResetJob {
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
}

impl MonthlyResetJob {
    pub fn new(store: Arc<dyn LedgerStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Idempotent: a second run for the same period opens nothing.
    pub async fn reset_all(&self, now: DateTime<Utc>) -> MeteringResult<ResetSummary> {
        let period = BillingPeriod::containing(now);
        let opened = bounded(
            self.timeout,
            self.store.open_period(period, &ResourceType::ALL),
        )
        .await?;
        info!(
            year = period.year,
            month = period.month,
            organizations_reset = opened.len(),
            "monthly usage reset complete"
        );
        Ok(ResetSummary {
            organizations_reset: opened.len(),
            period,
            reset_at: now,
        })
    }
}
