use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::alerts::{AlertDefaults, AlertEngine, AlertNotifier, TracingNotifier};
use super::catalog::{Capability, CatalogHandle};
use super::entitlements::{CapabilityDecision, EntitlementChecker, EntitlementDecision};
use super::error::MeteringResult;
use super::lifecycle::{PlanChangeOutcome, PlanLifecycle};
use super::models::{AlertHistory, BillingPeriod, Organization, UsagePayload};
use super::recorder::{RecordOutcome, UsageRecorder};
use super::reporting::{AlertStats, BillingSummary, UsageReporter, UsageSummary};
use super::reset::{MonthlyResetJob, ResetSummary};
use super::resources::ResourceType;
use super::store::{AlertHistoryFilter, LedgerStore};

/// Runtime knobs for the metering engine.
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Upper bound for every ledger call.
    pub store_timeout: Duration,
    pub near_limit_percent: f64,
    pub alert_defaults: AlertDefaults,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2_000),
            near_limit_percent: 90.0,
            alert_defaults: AlertDefaults::default(),
        }
    }
}

/// key: billing-metering-service -> engine facade shared by handlers and jobs
#[derive(Clone)]
pub struct MeteringService {
    catalog: CatalogHandle,
    checker: EntitlementChecker,
    recorder: UsageRecorder,
    lifecycle: PlanLifecycle,
    reset: MonthlyResetJob,
    reporter: UsageReporter,
}

impl MeteringService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: CatalogHandle,
        notifier: Arc<dyn AlertNotifier>,
        config: MeteringConfig,
    ) -> Self {
        let timeout = config.store_timeout;
        let alerts = AlertEngine::new(
            store.clone(),
            catalog.clone(),
            notifier,
            config.alert_defaults.clone(),
            timeout,
        );
        Self {
            checker: EntitlementChecker::new(store.clone(), catalog.clone(), timeout),
            recorder: UsageRecorder::new(
                store.clone(),
                catalog.clone(),
                alerts,
                timeout,
                config.near_limit_percent,
            ),
            lifecycle: PlanLifecycle::new(store.clone(), catalog.clone(), timeout),
            reset: MonthlyResetJob::new(store.clone(), timeout),
            reporter: UsageReporter::new(store, catalog.clone(), timeout),
            catalog,
        }
    }

    /// Builtin catalog, log-only notifier and default settings.
    pub fn with_defaults(store: Arc<dyn LedgerStore>) -> Self {
        Self::new(
            store,
            CatalogHandle::builtin(),
            Arc::new(TracingNotifier),
            MeteringConfig::default(),
        )
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    pub async fn can_perform(
        &self,
        organization_id: &str,
        resource_type: &str,
        quantity: i64,
    ) -> EntitlementDecision {
        self.checker
            .can_perform(organization_id, resource_type, quantity)
            .await
    }

    pub async fn check(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        quantity: i64,
    ) -> EntitlementDecision {
        self.checker
            .check(organization_id, resource_type, quantity)
            .await
    }

    pub async fn has_capability(
        &self,
        organization_id: Uuid,
        capability: Capability,
    ) -> CapabilityDecision {
        self.checker
            .has_capability(organization_id, capability)
            .await
    }

    pub async fn record(
        &self,
        organization_id: Uuid,
        payload: UsagePayload,
    ) -> MeteringResult<RecordOutcome> {
        self.recorder.record(organization_id, payload).await
    }

    pub async fn record_at(
        &self,
        organization_id: Uuid,
        payload: UsagePayload,
        now: DateTime<Utc>,
    ) -> MeteringResult<RecordOutcome> {
        self.recorder.record_at(organization_id, payload, now).await
    }

    pub async fn upgrade(
        &self,
        organization_id: Uuid,
        new_plan_id: &str,
        external_ref: Option<String>,
        actor: &str,
    ) -> MeteringResult<PlanChangeOutcome> {
        self.lifecycle
            .upgrade(organization_id, new_plan_id, external_ref, actor)
            .await
    }

    pub async fn downgrade(
        &self,
        organization_id: Uuid,
        new_plan_id: &str,
        actor: &str,
    ) -> MeteringResult<PlanChangeOutcome> {
        self.lifecycle
            .downgrade(organization_id, new_plan_id, actor)
            .await
    }

    pub async fn set_limit_override(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        limit: Option<i64>,
    ) -> MeteringResult<Organization> {
        self.lifecycle
            .set_limit_override(organization_id, resource_type, limit)
            .await
    }

    pub async fn reset_all(&self, now: DateTime<Utc>) -> MeteringResult<ResetSummary> {
        self.reset.reset_all(now).await
    }

    pub async fn usage_summary(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> MeteringResult<UsageSummary> {
        self.reporter.usage_summary(organization_id, period).await
    }

    pub async fn billing_summary(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> MeteringResult<BillingSummary> {
        self.reporter.billing_summary(organization_id, period).await
    }

    pub async fn alert_history(
        &self,
        organization_id: Uuid,
        filter: AlertHistoryFilter,
    ) -> MeteringResult<Vec<AlertHistory>> {
        self.reporter.alert_history(organization_id, filter).await
    }

    pub async fn alert_stats(
        &self,
        organization_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> MeteringResult<AlertStats> {
        self.reporter.alert_stats(organization_id, since).await
    }
}
