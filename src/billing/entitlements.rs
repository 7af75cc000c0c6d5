use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::catalog::{Capability, CatalogHandle, PlanCatalog, PlanLimit};
use super::error::{LedgerError, MeteringError};
use super::models::{BillingPeriod, Organization};
use super::resources::ResourceType;
use super::store::{bounded, LedgerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementReason {
    VerificationError,
    LimitExceeded,
    OveragePermitted,
    SubscriptionInactive,
}

/// Cause behind a `verification_error` denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationFault {
    MalformedOrganizationId,
    UnknownOrganization,
    UnknownResource,
    UnknownPlan,
    ResourceNotProvisioned,
    InvalidQuantity,
    Timeout,
    StoreUnavailable,
}

impl From<&LedgerError> for VerificationFault {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::Timeout(_) => VerificationFault::Timeout,
            LedgerError::OrganizationNotFound(_) => VerificationFault::UnknownOrganization,
            _ => VerificationFault::StoreUnavailable,
        }
    }
}

/// key: billing-entitlement-decision -> structured allow/deny outcome
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<EntitlementReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<VerificationFault>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub organization_id: Option<Uuid>,
    pub resource_type: Option<ResourceType>,
    pub plan_id: Option<String>,
    pub requested: i64,
    pub current_usage: i64,
    /// `None` when the resource is unlimited.
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_plan: Option<String>,
}

impl EntitlementDecision {
    fn denied(fault: VerificationFault, message: impl Into<String>, requested: i64) -> Self {
        Self {
            allowed: false,
            reason: Some(EntitlementReason::VerificationError),
            fault: Some(fault),
            message: Some(message.into()),
            organization_id: None,
            resource_type: None,
            plan_id: None,
            requested,
            current_usage: 0,
            limit: Some(0),
            remaining: Some(0),
            percentage: 0.0,
            suggested_plan: None,
        }
    }

    fn scoped(mut self, organization_id: Uuid, resource_type: Option<ResourceType>) -> Self {
        self.organization_id = Some(organization_id);
        self.resource_type = resource_type;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDecision {
    pub allowed: bool,
    pub capability: Capability,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<VerificationFault>,
}

/// Resolved ceiling for one (organization, resource) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimit {
    pub limit: PlanLimit,
    pub overage_allowed: bool,
    pub overridden: bool,
}

/// Organization override first, then the plan's table entry.
pub fn effective_limit(
    catalog: &PlanCatalog,
    organization: &Organization,
    resource: ResourceType,
) -> Result<EffectiveLimit, MeteringError> {
    let plan = catalog.plan(&organization.plan_id)?;
    let overage_allowed = plan.allows_overage(resource);
    if let Some(value) = organization.limit_overrides.get(&resource) {
        return Ok(EffectiveLimit {
            limit: PlanLimit::Limited(*value),
            overage_allowed,
            overridden: true,
        });
    }
    let limit = plan
        .limit(resource)
        .ok_or_else(|| MeteringError::UnknownResource(resource.to_string()))?;
    Ok(EffectiveLimit {
        limit,
        overage_allowed,
        overridden: false,
    })
}

/// Share of `limit` consumed by `usage`, in percent.
pub fn usage_percentage(usage: i64, limit: Option<i64>) -> f64 {
    match limit {
        None => 0.0,
        Some(limit) if limit <= 0 => 100.0,
        Some(limit) => (usage as f64 / limit as f64) * 100.0,
    }
}

/// key: billing-entitlement-checker -> pre-flight quota gate
#[derive(Clone)]
pub struct EntitlementChecker {
    store: Arc<dyn LedgerStore>,
    catalog: CatalogHandle,
    timeout: Duration,
}

impl EntitlementChecker {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: CatalogHandle, timeout: Duration) -> Self {
        Self {
            store,
            catalog,
            timeout,
        }
    }

    /// Entry point for untrusted identifiers. Anything that does not parse
    /// is denied.
    pub async fn can_perform(
        &self,
        organization_id: &str,
        resource_type: &str,
        quantity: i64,
    ) -> EntitlementDecision {
        let Ok(organization_id) = Uuid::parse_str(organization_id.trim()) else {
            tracing::warn!(organization_id, "entitlement check with malformed organization id");
            return EntitlementDecision::denied(
                VerificationFault::MalformedOrganizationId,
                format!("invalid organization id `{organization_id}`"),
                quantity,
            );
        };
        let resource = match resource_type.parse::<ResourceType>() {
            Ok(resource) => resource,
            Err(err) => {
                tracing::warn!(%organization_id, resource_type, "entitlement check for unknown resource");
                return EntitlementDecision::denied(
                    VerificationFault::UnknownResource,
                    err.to_string(),
                    quantity,
                )
                .scoped(organization_id, None);
            }
        };
        self.check(organization_id, resource, quantity).await
    }

    pub async fn check(
        &self,
        organization_id: Uuid,
        resource: ResourceType,
        quantity: i64,
    ) -> EntitlementDecision {
        self.check_at(organization_id, resource, quantity, Utc::now())
            .await
    }

    pub async fn check_at(
        &self,
        organization_id: Uuid,
        resource: ResourceType,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> EntitlementDecision {
        if quantity <= 0 {
            return EntitlementDecision::denied(
                VerificationFault::InvalidQuantity,
                format!("quantity must be positive, got {quantity}"),
                quantity,
            )
            .scoped(organization_id, Some(resource));
        }

        let organization = match bounded(self.timeout, self.store.organization(organization_id)).await
        {
            Ok(Some(organization)) => organization,
            Ok(None) => {
                tracing::warn!(%organization_id, "entitlement check for unknown organization");
                return EntitlementDecision::denied(
                    VerificationFault::UnknownOrganization,
                    format!("organization {organization_id} not found"),
                    quantity,
                )
                .scoped(organization_id, Some(resource));
            }
            Err(err) => return self.ledger_fault(organization_id, resource, quantity, &err),
        };

        let catalog = self.catalog.snapshot();
        let effective = match effective_limit(&catalog, &organization, resource) {
            Ok(effective) => effective,
            Err(err) => {
                let fault = match err {
                    MeteringError::UnknownPlan(_) => VerificationFault::UnknownPlan,
                    _ => VerificationFault::ResourceNotProvisioned,
                };
                tracing::warn!(
                    %organization_id,
                    plan = %organization.plan_id,
                    %resource,
                    ?err,
                    "entitlement limit could not be resolved"
                );
                let mut decision = EntitlementDecision::denied(fault, err.to_string(), quantity)
                    .scoped(organization_id, Some(resource));
                decision.plan_id = Some(organization.plan_id);
                return decision;
            }
        };

        let suggested_plan = catalog
            .suggested_upgrade(&organization.plan_id)
            .map(str::to_string);

        if !organization.status.can_consume() {
            tracing::info!(
                %organization_id,
                status = organization.status.as_str(),
                "entitlement denied for inactive subscription"
            );
            return EntitlementDecision {
                allowed: false,
                reason: Some(EntitlementReason::SubscriptionInactive),
                fault: None,
                message: Some(format!(
                    "subscription is {}; reactivate to continue",
                    organization.status.as_str()
                )),
                organization_id: Some(organization_id),
                resource_type: Some(resource),
                plan_id: Some(organization.plan_id),
                requested: quantity,
                current_usage: 0,
                limit: effective.limit.as_option(),
                remaining: Some(0),
                percentage: 0.0,
                suggested_plan: None,
            };
        }

        let period = BillingPeriod::containing(now);
        let current_usage = match bounded(
            self.timeout,
            self.store.counter(organization_id, resource, period),
        )
        .await
        {
            Ok(counter) => counter.map(|counter| counter.quantity).unwrap_or(0),
            Err(err) => {
                let mut decision = self.ledger_fault(organization_id, resource, quantity, &err);
                decision.plan_id = Some(organization.plan_id);
                return decision;
            }
        };

        let limit = effective.limit.as_option();
        let percentage = usage_percentage(current_usage, limit);
        let mut decision = EntitlementDecision {
            allowed: true,
            reason: None,
            fault: None,
            message: None,
            organization_id: Some(organization_id),
            resource_type: Some(resource),
            plan_id: Some(organization.plan_id.clone()),
            requested: quantity,
            current_usage,
            limit,
            remaining: limit.map(|limit| (limit - current_usage).max(0)),
            percentage,
            suggested_plan: None,
        };

        let Some(limit) = limit else {
            return decision;
        };

        if current_usage.saturating_add(quantity) <= limit {
            return decision;
        }

        if effective.overage_allowed {
            decision.reason = Some(EntitlementReason::OveragePermitted);
            decision.message = Some(format!(
                "monthly {} limit of {limit} reached; additional usage is billed as overage",
                resource.display_name()
            ));
            tracing::info!(
                %organization_id,
                %resource,
                current_usage,
                limit,
                "entitlement allowed as overage"
            );
            return decision;
        }

        decision.allowed = false;
        decision.reason = Some(EntitlementReason::LimitExceeded);
        decision.message = Some(match &suggested_plan {
            Some(next) => format!(
                "monthly {} limit of {limit} reached; upgrade to `{next}` for more",
                resource.display_name()
            ),
            None => format!("monthly {} limit of {limit} reached", resource.display_name()),
        });
        if current_usage >= limit {
            decision.remaining = Some(0);
        }
        decision.suggested_plan = suggested_plan;
        tracing::info!(
            %organization_id,
            %resource,
            current_usage,
            requested = quantity,
            limit,
            "entitlement denied: limit exceeded"
        );
        decision
    }

    /// Plan capability gate; any lookup failure denies.
    pub async fn has_capability(
        &self,
        organization_id: Uuid,
        capability: Capability,
    ) -> CapabilityDecision {
        let mut decision = CapabilityDecision {
            allowed: false,
            capability,
            plan_id: None,
            plan_name: None,
            fault: None,
        };
        let organization =
            match bounded(self.timeout, self.store.organization(organization_id)).await {
                Ok(Some(organization)) => organization,
                Ok(None) => {
                    decision.fault = Some(VerificationFault::UnknownOrganization);
                    return decision;
                }
                Err(err) => {
                    tracing::warn!(%organization_id, ?err, "capability check failed closed");
                    decision.fault = Some(VerificationFault::from(&err));
                    return decision;
                }
            };
        let catalog = self.catalog.snapshot();
        decision.plan_id = Some(organization.plan_id.clone());
        match catalog.plan(&organization.plan_id) {
            Ok(plan) => {
                decision.plan_name = Some(plan.name.clone());
                decision.allowed =
                    organization.status.can_consume() && plan.has_capability(capability);
            }
            Err(_) => decision.fault = Some(VerificationFault::UnknownPlan),
        }
        decision
    }

    fn ledger_fault(
        &self,
        organization_id: Uuid,
        resource: ResourceType,
        quantity: i64,
        err: &LedgerError,
    ) -> EntitlementDecision {
        tracing::warn!(
            %organization_id,
            %resource,
            ?err,
            "entitlement check failed closed on ledger error"
        );
        EntitlementDecision::denied(
            VerificationFault::from(err),
            "entitlement could not be verified",
            quantity,
        )
        .scoped(organization_id, Some(resource))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::billing::models::OrganizationStatus;

    fn organization(plan_id: &str) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            owner_id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            status: OrganizationStatus::Active,
            limit_overrides: BTreeMap::new(),
        }
    }

    #[test]
    fn override_takes_precedence_over_plan_default() {
        let catalog = PlanCatalog::builtin();
        let mut org = organization("pro");
        assert_eq!(
            effective_limit(&catalog, &org, ResourceType::Roasts).unwrap().limit,
            PlanLimit::Limited(1_000)
        );
        org.limit_overrides.insert(ResourceType::Roasts, 250);
        let effective = effective_limit(&catalog, &org, ResourceType::Roasts).unwrap();
        assert_eq!(effective.limit, PlanLimit::Limited(250));
        assert!(effective.overridden);
    }

    #[test]
    fn unknown_plan_is_not_defaulted() {
        let catalog = PlanCatalog::builtin();
        let org = organization("legacy_gold");
        assert!(matches!(
            effective_limit(&catalog, &org, ResourceType::Roasts),
            Err(MeteringError::UnknownPlan(_))
        ));
    }

    #[test]
    fn percentage_handles_unlimited_and_zero_limits() {
        assert_eq!(usage_percentage(50, None), 0.0);
        assert_eq!(usage_percentage(0, Some(0)), 100.0);
        assert_eq!(usage_percentage(80, Some(100)), 80.0);
    }
}
