use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::alerts::{AlertEngine, AlertPayload};
use super::catalog::CatalogHandle;
use super::entitlements::{effective_limit, usage_percentage};
use super::error::{MeteringError, MeteringResult};
use super::models::{BillingPeriod, UsagePayload, UsageRecord};
use super::resources::ResourceType;
use super::store::{bounded, CounterIncrement, LedgerStore};

/// key: billing-record-outcome -> post-increment usage snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub recorded: bool,
    pub record_id: Uuid,
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub period: BillingPeriod,
    pub new_usage: i64,
    /// Accumulated cost of the counter for the period.
    pub cost_cents: i64,
    pub percentage: f64,
    pub limit: Option<i64>,
    pub near_limit: bool,
    pub limit_exceeded: bool,
    pub alerts_fired: Vec<AlertPayload>,
}

/// key: billing-usage-recorder -> audit append + atomic counter increment
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn LedgerStore>,
    catalog: CatalogHandle,
    alerts: AlertEngine,
    timeout: Duration,
    near_limit_percent: f64,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: CatalogHandle,
        alerts: AlertEngine,
        timeout: Duration,
        near_limit_percent: f64,
    ) -> Self {
        Self {
            store,
            catalog,
            alerts,
            timeout,
            near_limit_percent,
        }
    }

    pub async fn record(
        &self,
        organization_id: Uuid,
        payload: UsagePayload,
    ) -> MeteringResult<RecordOutcome> {
        self.record_at(organization_id, payload, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        organization_id: Uuid,
        payload: UsagePayload,
        now: DateTime<Utc>,
    ) -> MeteringResult<RecordOutcome> {
        if payload.quantity <= 0 {
            return Err(MeteringError::InvalidQuantity(payload.quantity));
        }
        for (field, value) in [("cost_cents", payload.cost_cents), ("tokens", payload.tokens)] {
            if value < 0 {
                return Err(MeteringError::NegativeAmount { field, value });
            }
        }

        let organization = bounded(self.timeout, self.store.organization(organization_id))
            .await
            .map_err(MeteringError::RecordFailure)?
            .ok_or(MeteringError::UnknownOrganization(organization_id))?;

        let resource = payload.resource_type;
        let limit = match effective_limit(&self.catalog.snapshot(), &organization, resource) {
            Ok(effective) => effective.limit.as_option(),
            Err(err) => {
                // The operation already ran; keep the audit trail even when the
                // plan cannot be resolved.
                warn!(
                    %organization_id,
                    plan = %organization.plan_id,
                    %resource,
                    ?err,
                    "recording usage without a resolvable limit"
                );
                None
            }
        };

        let period = BillingPeriod::containing(now);
        let record = UsageRecord::from_payload(organization_id, &payload, now);
        let increment = CounterIncrement {
            organization_id,
            resource_type: resource,
            period,
            quantity: payload.quantity,
            cost_cents: payload.cost_cents,
            tokens: payload.tokens,
            limit,
        };

        let counter = match bounded(self.timeout, self.store.record_usage(&record, &increment)).await
        {
            Ok(counter) => counter,
            Err(err) => {
                error!(
                    ?err,
                    %organization_id,
                    %resource,
                    quantity = payload.quantity,
                    code = "record_failure",
                    "usage could not be recorded"
                );
                return Err(MeteringError::RecordFailure(err));
            }
        };

        let percentage = usage_percentage(counter.quantity, limit);
        let near_limit = limit.is_some() && percentage >= self.near_limit_percent;
        if counter.limit_exceeded {
            info!(
                %organization_id,
                %resource,
                usage = counter.quantity,
                limit = ?limit,
                "usage counter beyond monthly limit"
            );
        }

        let alerts_fired = match self.alerts.evaluate(&organization, &counter, limit, now).await {
            Ok(fired) => fired,
            Err(err) => {
                warn!(
                    ?err,
                    %organization_id,
                    %resource,
                    code = "alert_delivery_failure",
                    "usage alert evaluation failed"
                );
                Vec::new()
            }
        };

        Ok(RecordOutcome {
            recorded: true,
            record_id: record.id,
            organization_id,
            resource_type: resource,
            period,
            new_usage: counter.quantity,
            cost_cents: counter.cost_cents,
            percentage,
            limit,
            near_limit,
            limit_exceeded: counter.limit_exceeded,
            alerts_fired,
        })
    }
}
