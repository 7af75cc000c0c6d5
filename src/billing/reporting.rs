use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::catalog::CatalogHandle;
use super::entitlements::{effective_limit, usage_percentage};
use super::error::{MeteringError, MeteringResult};
use super::models::{AlertHistory, BillingPeriod, Organization};
use super::resources::ResourceType;
use super::store::{bounded, AlertHistoryFilter, LedgerStore};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub resource_type: ResourceType,
    pub display_name: &'static str,
    pub quantity: i64,
    pub cost_cents: i64,
    pub tokens: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub percentage: f64,
    pub limit_exceeded: bool,
    pub overage_allowed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub organization_id: Uuid,
    pub plan_id: String,
    pub period: BillingPeriod,
    pub resources: Vec<ResourceUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub operations: i64,
    pub quantity: i64,
    pub cost_cents: i64,
    pub tokens: i64,
}

impl UsageTotals {
    fn add(&mut self, quantity: i64, cost_cents: i64, tokens: i64) {
        self.operations += 1;
        self.quantity += quantity;
        self.cost_cents += cost_cents;
        self.tokens += tokens;
    }
}

/// key: billing-summary -> period totals with platform breakdown
#[derive(Debug, Clone, Serialize)]
pub struct BillingSummary {
    pub organization_id: Uuid,
    pub plan_id: String,
    pub plan_name: Option<String>,
    pub period: BillingPeriod,
    pub totals: UsageTotals,
    pub by_resource: BTreeMap<ResourceType, UsageTotals>,
    pub by_platform: BTreeMap<String, UsageTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub organization_id: Uuid,
    pub since: Option<DateTime<Utc>>,
    pub total: i64,
    pub by_resource: BTreeMap<ResourceType, i64>,
    pub by_threshold: BTreeMap<i32, i64>,
    pub by_channel: BTreeMap<String, i64>,
}

/// key: billing-reporting -> read-only views over ledger + alert history
#[derive(Clone)]
pub struct UsageReporter {
    store: Arc<dyn LedgerStore>,
    catalog: CatalogHandle,
    timeout: Duration,
}

impl UsageReporter {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: CatalogHandle, timeout: Duration) -> Self {
        Self {
            store,
            catalog,
            timeout,
        }
    }

    async fn organization(&self, organization_id: Uuid) -> MeteringResult<Organization> {
        bounded(self.timeout, self.store.organization(organization_id))
            .await?
            .ok_or(MeteringError::UnknownOrganization(organization_id))
    }

    pub async fn usage_summary(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> MeteringResult<UsageSummary> {
        let organization = self.organization(organization_id).await?;
        let counters = bounded(
            self.timeout,
            self.store.counters_for_period(organization_id, period),
        )
        .await?;
        let catalog = self.catalog.snapshot();

        let resources = ResourceType::ALL
            .iter()
            .map(|resource| {
                let counter = counters.iter().find(|c| c.resource_type == *resource);
                let effective = effective_limit(&catalog, &organization, *resource).ok();
                let limit = effective.and_then(|e| e.limit.as_option());
                let quantity = counter.map(|c| c.quantity).unwrap_or(0);
                ResourceUsage {
                    resource_type: *resource,
                    display_name: resource.display_name(),
                    quantity,
                    cost_cents: counter.map(|c| c.cost_cents).unwrap_or(0),
                    tokens: counter.map(|c| c.tokens).unwrap_or(0),
                    limit,
                    remaining: limit.map(|limit| (limit - quantity).max(0)),
                    percentage: usage_percentage(quantity, limit),
                    limit_exceeded: counter.map(|c| c.limit_exceeded).unwrap_or(false),
                    overage_allowed: effective.map(|e| e.overage_allowed).unwrap_or(false),
                }
            })
            .collect();

        Ok(UsageSummary {
            organization_id,
            plan_id: organization.plan_id,
            period,
            resources,
        })
    }

    pub async fn billing_summary(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> MeteringResult<BillingSummary> {
        let organization = self.organization(organization_id).await?;
        let records = bounded(
            self.timeout,
            self.store
                .usage_records(organization_id, period.start(), period.end()),
        )
        .await?;

        let mut totals = UsageTotals::default();
        let mut by_resource: BTreeMap<ResourceType, UsageTotals> = BTreeMap::new();
        let mut by_platform: BTreeMap<String, UsageTotals> = BTreeMap::new();
        for record in &records {
            totals.add(record.quantity, record.cost_cents, record.tokens);
            by_resource
                .entry(record.resource_type)
                .or_default()
                .add(record.quantity, record.cost_cents, record.tokens);
            by_platform
                .entry(record.platform.clone())
                .or_default()
                .add(record.quantity, record.cost_cents, record.tokens);
        }

        let plan_name = self
            .catalog
            .snapshot()
            .plan(&organization.plan_id)
            .ok()
            .map(|plan| plan.name.clone());

        Ok(BillingSummary {
            organization_id,
            plan_id: organization.plan_id,
            plan_name,
            period,
            totals,
            by_resource,
            by_platform,
        })
    }

    /// Newest first; the page size is clamped.
    pub async fn alert_history(
        &self,
        organization_id: Uuid,
        mut filter: AlertHistoryFilter,
    ) -> MeteringResult<Vec<AlertHistory>> {
        filter.limit = Some(
            filter
                .limit
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .clamp(1, MAX_HISTORY_LIMIT),
        );
        Ok(bounded(
            self.timeout,
            self.store.alert_history(organization_id, &filter),
        )
        .await?)
    }

    pub async fn alert_stats(
        &self,
        organization_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> MeteringResult<AlertStats> {
        let filter = AlertHistoryFilter {
            start: since,
            ..AlertHistoryFilter::default()
        };
        let history = bounded(
            self.timeout,
            self.store.alert_history(organization_id, &filter),
        )
        .await?;

        let mut stats = AlertStats {
            organization_id,
            since,
            total: 0,
            by_resource: BTreeMap::new(),
            by_threshold: BTreeMap::new(),
            by_channel: BTreeMap::new(),
        };
        for entry in history {
            stats.total += 1;
            *stats.by_resource.entry(entry.resource_type).or_default() += 1;
            *stats
                .by_threshold
                .entry(entry.threshold_percentage)
                .or_default() += 1;
            *stats.by_channel.entry(entry.channel).or_default() += 1;
        }
        Ok(stats)
    }
}
