use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::catalog::{CatalogHandle, PlanCatalog, PlanLimit};
use super::entitlements::effective_limit;
use super::error::{MeteringError, MeteringResult};
use super::models::{Organization, PlanChange, PlanChangeDirection};
use super::resources::ResourceType;
use super::store::{bounded, LedgerStore};

/// key: billing-plan-change-outcome -> new plan + re-provisioned limits
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub organization: Organization,
    pub change: PlanChange,
    pub effective_limits: BTreeMap<ResourceType, PlanLimit>,
}

/// Limits in force for `organization` under `catalog`; unprovisioned
/// resources are omitted.
pub fn effective_limits(
    catalog: &PlanCatalog,
    organization: &Organization,
) -> BTreeMap<ResourceType, PlanLimit> {
    ResourceType::ALL
        .iter()
        .filter_map(|resource| {
            effective_limit(catalog, organization, *resource)
                .ok()
                .map(|effective| (*resource, effective.limit))
        })
        .collect()
}

/// key: billing-plan-lifecycle -> upgrade/downgrade + overrides
#[derive(Clone)]
pub struct PlanLifecycle {
    store: Arc<dyn LedgerStore>,
    catalog: CatalogHandle,
    timeout: Duration,
}

impl PlanLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: CatalogHandle, timeout: Duration) -> Self {
        Self {
            store,
            catalog,
            timeout,
        }
    }

    pub async fn upgrade(
        &self,
        organization_id: Uuid,
        new_plan_id: &str,
        external_ref: Option<String>,
        actor: &str,
    ) -> MeteringResult<PlanChangeOutcome> {
        self.change(
            organization_id,
            new_plan_id,
            PlanChangeDirection::Upgrade,
            external_ref,
            actor,
            Utc::now(),
        )
        .await
    }

    /// Current-period usage is kept; the lower limit applies to the next check.
    pub async fn downgrade(
        &self,
        organization_id: Uuid,
        new_plan_id: &str,
        actor: &str,
    ) -> MeteringResult<PlanChangeOutcome> {
        self.change(
            organization_id,
            new_plan_id,
            PlanChangeDirection::Downgrade,
            None,
            actor,
            Utc::now(),
        )
        .await
    }

    pub async fn change(
        &self,
        organization_id: Uuid,
        new_plan_id: &str,
        direction: PlanChangeDirection,
        external_ref: Option<String>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> MeteringResult<PlanChangeOutcome> {
        let catalog = self.catalog.snapshot();
        catalog.plan(new_plan_id)?;

        let organization = bounded(self.timeout, self.store.organization(organization_id))
            .await?
            .ok_or(MeteringError::UnknownOrganization(organization_id))?;

        // Plans off the upgrade path (legacy or retired tiers) have no order.
        let ranks = catalog
            .rank(&organization.plan_id)
            .zip(catalog.rank(new_plan_id));
        let out_of_order = match (direction, ranks) {
            (PlanChangeDirection::Upgrade, Some((current, target))) => target < current,
            (PlanChangeDirection::Downgrade, Some((current, target))) => target > current,
            (_, None) => false,
        };
        if out_of_order {
            return Err(MeteringError::InvalidTransition {
                direction: direction.as_str(),
                from: organization.plan_id,
                to: new_plan_id.to_string(),
            });
        }

        let change = PlanChange {
            id: Uuid::new_v4(),
            organization_id,
            previous_plan_id: organization.plan_id.clone(),
            new_plan_id: new_plan_id.to_string(),
            direction,
            actor: actor.to_string(),
            external_ref,
            changed_at: now,
        };
        let updated = bounded(self.timeout, self.store.change_plan(&change)).await?;

        info!(
            %organization_id,
            from = %change.previous_plan_id,
            to = %change.new_plan_id,
            direction = direction.as_str(),
            actor = %change.actor,
            changed_at = %change.changed_at,
            "organization plan changed"
        );

        Ok(PlanChangeOutcome {
            effective_limits: effective_limits(&catalog, &updated),
            organization: updated,
            change,
        })
    }

    /// `None` removes the override so the plan default applies again.
    pub async fn set_limit_override(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        limit: Option<i64>,
    ) -> MeteringResult<Organization> {
        if let Some(value) = limit {
            if value < 0 {
                return Err(MeteringError::InvalidLimit(value));
            }
        }
        let organization = bounded(
            self.timeout,
            self.store
                .set_limit_override(organization_id, resource_type, limit),
        )
        .await?;
        info!(
            %organization_id,
            resource = %resource_type,
            limit = ?limit,
            "usage limit override updated"
        );
        Ok(organization)
    }
}
