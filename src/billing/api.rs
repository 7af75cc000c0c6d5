use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::{
    AlertHistory, AlertHistoryFilter, AlertStats, BillingPeriod, BillingSummary,
    EntitlementDecision, MeteringService, OperationKind, Organization, PlanCatalog,
    PlanChangeOutcome, RecordOutcome, ResetSummary, ResourceType, UsagePayload, UsageSummary,
};

/// key: billing-api -> rest endpoints
pub async fn list_plans(Extension(service): Extension<MeteringService>) -> Json<PlanCatalog> {
    Json(service.catalog().snapshot().as_ref().clone())
}

/// Denials are reported in the body, never as an error status.
pub async fn check_entitlement(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<String>,
    Json(payload): Json<EntitlementCheckRequest>,
) -> Json<EntitlementDecision> {
    let quantity = payload.quantity.unwrap_or(1);
    let decision = service
        .can_perform(&organization_id, &payload.resource_type, quantity)
        .await;
    Json(decision)
}

pub async fn record_usage(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Json(payload): Json<RecordUsageRequest>,
) -> AppResult<Json<RecordOutcome>> {
    let payload = payload.into_payload()?;
    let outcome = service.record(organization_id, payload).await?;
    Ok(Json(outcome))
}

pub async fn usage_summary(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<PeriodQuery>,
) -> AppResult<Json<UsageSummary>> {
    let summary = service
        .usage_summary(organization_id, query.period()?)
        .await?;
    Ok(Json(summary))
}

pub async fn billing_summary(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<PeriodQuery>,
) -> AppResult<Json<BillingSummary>> {
    let summary = service
        .billing_summary(organization_id, query.period()?)
        .await?;
    Ok(Json(summary))
}

pub async fn upgrade_plan(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Json(payload): Json<PlanChangeRequest>,
) -> AppResult<Json<PlanChangeOutcome>> {
    let actor = payload.actor.as_deref().unwrap_or("api");
    let outcome = service
        .upgrade(organization_id, &payload.plan_id, payload.external_ref.clone(), actor)
        .await?;
    Ok(Json(outcome))
}

pub async fn downgrade_plan(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Json(payload): Json<PlanChangeRequest>,
) -> AppResult<Json<PlanChangeOutcome>> {
    let actor = payload.actor.as_deref().unwrap_or("api");
    let outcome = service
        .downgrade(organization_id, &payload.plan_id, actor)
        .await?;
    Ok(Json(outcome))
}

pub async fn set_limit_override(
    Extension(service): Extension<MeteringService>,
    Path((organization_id, resource)): Path<(Uuid, String)>,
    Json(payload): Json<LimitOverrideRequest>,
) -> AppResult<Json<Organization>> {
    let resource: ResourceType = resource.parse()?;
    let organization = service
        .set_limit_override(organization_id, resource, payload.limit)
        .await?;
    Ok(Json(organization))
}

pub async fn alert_history(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Query(filter): Query<AlertHistoryFilter>,
) -> AppResult<Json<Vec<AlertHistory>>> {
    let history = service.alert_history(organization_id, filter).await?;
    Ok(Json(history))
}

pub async fn alert_stats(
    Extension(service): Extension<MeteringService>,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<AlertStatsQuery>,
) -> AppResult<Json<AlertStats>> {
    let stats = service.alert_stats(organization_id, query.since).await?;
    Ok(Json(stats))
}

pub async fn reset_usage(
    Extension(service): Extension<MeteringService>,
) -> AppResult<Json<ResetSummary>> {
    let summary = service.reset_all(Utc::now()).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct EntitlementCheckRequest {
    pub resource_type: String,
    #[serde(default)]
    pub quantity: Option<i64>,
}

/// Either an operation kind (priced from the registry) or an explicit
/// resource type.
#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    pub platform: String,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub cost_cents: Option<i64>,
    #[serde(default)]
    pub tokens: Option<i64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RecordUsageRequest {
    pub fn into_payload(self) -> AppResult<UsagePayload> {
        let mut payload = match (self.operation.as_deref(), self.resource_type.as_deref()) {
            (Some(operation), resource) => {
                let operation: OperationKind = operation.parse()?;
                if let Some(resource) = resource {
                    let resource: ResourceType = resource.parse()?;
                    if resource != operation.resource_type() {
                        return Err(AppError::BadRequest(format!(
                            "operation `{}` meters {} not {}",
                            operation.as_str(),
                            operation.resource_type(),
                            resource
                        )));
                    }
                }
                UsagePayload::for_operation(operation, self.platform)
            }
            (None, Some(resource)) => UsagePayload::new(resource.parse()?, self.platform, 1),
            (None, None) => {
                return Err(AppError::BadRequest(
                    "either `operation` or `resource_type` is required".into(),
                ))
            }
        };
        if let Some(quantity) = self.quantity {
            payload.cost_cents = payload.operation.map_or(payload.cost_cents, |operation| {
                operation.unit_cost_cents().saturating_mul(quantity)
            });
            payload.quantity = quantity;
        }
        if let Some(cost_cents) = self.cost_cents {
            payload = payload.with_cost(cost_cents);
        }
        if let Some(tokens) = self.tokens {
            payload = payload.with_tokens(tokens);
        }
        payload.tags = self.tags;
        Ok(payload)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
}

impl PeriodQuery {
    pub fn period(&self) -> AppResult<BillingPeriod> {
        let current = BillingPeriod::containing(Utc::now());
        let period = BillingPeriod {
            year: self.year.unwrap_or(current.year),
            month: self.month.unwrap_or(current.month),
        };
        if !(1..=12).contains(&period.month) {
            return Err(AppError::BadRequest(format!(
                "month must be between 1 and 12, got {}",
                period.month
            )));
        }
        Ok(period)
    }
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub external_ref: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitOverrideRequest {
    /// `null` clears the override.
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertStatsQuery {
    pub since: Option<DateTime<Utc>>,
}
