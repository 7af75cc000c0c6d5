use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::error::{LedgerError, LedgerResult};
use super::models::{
    AlertHistory, BillingPeriod, Organization, PlanChange, UsageAlertConfig, UsageCounter,
    UsageRecord,
};
use super::resources::ResourceType;

/// Runs a ledger call under `limit`; an elapsed deadline becomes
/// `LedgerError::Timeout`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> LedgerResult<T>
where
    F: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit)),
    }
}

/// Atomic increment request applied to a single counter key.
#[derive(Debug, Clone)]
pub struct CounterIncrement {
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub period: BillingPeriod,
    pub quantity: i64,
    pub cost_cents: i64,
    pub tokens: i64,
    /// Limit used to flag the counter once exceeded; `None` for unlimited.
    pub limit: Option<i64>,
}

/// Compare-and-update claim on an alert config's throttle state.
#[derive(Debug, Clone)]
pub struct AlertClaim {
    pub config_id: Uuid,
    pub expected_last_fired_at: Option<DateTime<Utc>>,
    pub sent_today: i32,
    pub fired_at: DateTime<Utc>,
}

/// key: audit-alert-history-filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertHistoryFilter {
    pub resource_type: Option<ResourceType>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// key: billing-ledger-store -> storage seam for the usage ledger
///
/// Every mutation that touches shared counters or alert state must be a
/// single atomic operation in the backing store.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn organization(&self, organization_id: Uuid) -> LedgerResult<Option<Organization>>;

    async fn counter(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        period: BillingPeriod,
    ) -> LedgerResult<Option<UsageCounter>>;

    async fn counters_for_period(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> LedgerResult<Vec<UsageCounter>>;

    /// Appends `record` and increments its counter in one transaction.
    async fn record_usage(
        &self,
        record: &UsageRecord,
        increment: &CounterIncrement,
    ) -> LedgerResult<UsageCounter>;

    async fn usage_records(
        &self,
        organization_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<Vec<UsageRecord>>;

    async fn alert_configs(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
    ) -> LedgerResult<Vec<UsageAlertConfig>>;

    /// Inserts configs whose (org, resource, threshold) key is not taken yet.
    /// Returns only the rows that were created.
    async fn insert_alert_configs(
        &self,
        configs: &[UsageAlertConfig],
    ) -> LedgerResult<Vec<UsageAlertConfig>>;

    /// Applies the claim only if `last_fired_at` still equals the expected
    /// value. `false` means another worker fired first.
    async fn claim_alert(&self, claim: &AlertClaim) -> LedgerResult<bool>;

    async fn append_alert_history(&self, entry: &AlertHistory) -> LedgerResult<()>;

    async fn alert_history(
        &self,
        organization_id: Uuid,
        filter: &AlertHistoryFilter,
    ) -> LedgerResult<Vec<AlertHistory>>;

    /// Switches plan, clears limit overrides and logs the change atomically.
    /// Fails with `LedgerError::Conflict` when the organization is no longer
    /// on `change.previous_plan_id`.
    async fn change_plan(&self, change: &PlanChange) -> LedgerResult<Organization>;

    async fn set_limit_override(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        limit: Option<i64>,
    ) -> LedgerResult<Organization>;

    /// Creates zero counters for every organization and resource under
    /// `period`, leaving existing rows untouched. Returns the organizations
    /// that received at least one new row.
    async fn open_period(
        &self,
        period: BillingPeriod,
        resources: &[ResourceType],
    ) -> LedgerResult<Vec<Uuid>>;
}
