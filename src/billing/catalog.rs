use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::error::{MeteringError, MeteringResult};
use super::resources::ResourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Shield,
    Analytics,
    CustomTones,
    ApiAccess,
    PrioritySupport,
    DedicatedSupport,
}

/// Effective monthly ceiling for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanLimit {
    Limited(i64),
    Unlimited,
}

impl PlanLimit {
    pub fn as_option(&self) -> Option<i64> {
        match self {
            PlanLimit::Limited(value) => Some(*value),
            PlanLimit::Unlimited => None,
        }
    }
}

/// key: billing-plan-definition -> limits, overage, capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub id: String,
    pub name: String,
    /// `null` means unlimited; a missing resource is not provisioned at all.
    pub monthly_limits: BTreeMap<ResourceType, Option<i64>>,
    #[serde(default)]
    pub overage: BTreeSet<ResourceType>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl PlanDefinition {
    pub fn limit(&self, resource: ResourceType) -> Option<PlanLimit> {
        self.monthly_limits.get(&resource).map(|limit| match limit {
            Some(value) => PlanLimit::Limited(*value),
            None => PlanLimit::Unlimited,
        })
    }

    pub fn allows_overage(&self, resource: ResourceType) -> bool {
        self.overage.contains(&resource)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// key: billing-plan-catalog -> immutable versioned tier table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCatalog {
    pub version: u64,
    pub plans: BTreeMap<String, PlanDefinition>,
    /// Plans ordered from lowest to highest tier.
    pub upgrade_path: Vec<String>,
}

impl PlanCatalog {
    pub fn plan(&self, plan_id: &str) -> MeteringResult<&PlanDefinition> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| MeteringError::UnknownPlan(plan_id.to_string()))
    }

    /// Position of the plan in the upgrade path, `None` for plans off the path.
    pub fn rank(&self, plan_id: &str) -> Option<usize> {
        self.upgrade_path.iter().position(|id| id == plan_id)
    }

    pub fn suggested_upgrade(&self, plan_id: &str) -> Option<&str> {
        let position = self.upgrade_path.iter().position(|id| id == plan_id)?;
        self.upgrade_path.get(position + 1).map(String::as_str)
    }

    pub fn validate(&self) -> MeteringResult<()> {
        if self.plans.is_empty() {
            return Err(MeteringError::InvalidCatalog("catalog has no plans".into()));
        }
        for (key, plan) in &self.plans {
            if key != &plan.id {
                return Err(MeteringError::InvalidCatalog(format!(
                    "plan keyed `{key}` declares id `{}`",
                    plan.id
                )));
            }
            for (resource, limit) in &plan.monthly_limits {
                if let Some(value) = limit {
                    if *value < 0 {
                        return Err(MeteringError::InvalidCatalog(format!(
                            "plan `{key}` has negative limit for {resource}"
                        )));
                    }
                }
            }
            if let Some(resource) = plan
                .overage
                .iter()
                .find(|resource| !plan.monthly_limits.contains_key(resource))
            {
                return Err(MeteringError::InvalidCatalog(format!(
                    "plan `{key}` allows overage on unprovisioned resource {resource}"
                )));
            }
        }
        if let Some(missing) = self.upgrade_path.iter().find(|id| !self.plans.contains_key(*id)) {
            return Err(MeteringError::InvalidCatalog(format!(
                "upgrade path references unknown plan `{missing}`"
            )));
        }
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> MeteringResult<Self> {
        let catalog: PlanCatalog = serde_json::from_str(raw)
            .map_err(|err| MeteringError::InvalidCatalog(err.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan catalog {}", path.display()))?;
        let catalog = Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse plan catalog {}", path.display()))?;
        Ok(catalog)
    }

    /// Tier table shipped with the service.
    pub fn builtin() -> Self {
        use Capability::*;
        use ResourceType::*;

        let tiers: [(&str, &str, [Option<i64>; 4], &[ResourceType], &[Capability]); 5] = [
            (
                "starter_trial",
                "Starter Trial",
                [Some(10), Some(1_000), Some(500), Some(50)],
                &[],
                &[Shield],
            ),
            (
                "starter",
                "Starter",
                [Some(10), Some(1_000), Some(500), Some(100)],
                &[],
                &[Shield],
            ),
            (
                "pro",
                "Pro",
                [Some(1_000), Some(10_000), Some(5_000), Some(1_000)],
                &[],
                &[Shield, Analytics, CustomTones],
            ),
            (
                "plus",
                "Plus",
                [Some(5_000), Some(100_000), Some(50_000), Some(10_000)],
                &[Roasts, CommentAnalysis],
                &[Shield, Analytics, CustomTones, ApiAccess, PrioritySupport],
            ),
            (
                "custom",
                "Custom",
                [None, None, None, None],
                &[],
                &[
                    Shield,
                    Analytics,
                    CustomTones,
                    ApiAccess,
                    PrioritySupport,
                    DedicatedSupport,
                ],
            ),
        ];

        let mut plans = BTreeMap::new();
        let mut upgrade_path = Vec::with_capacity(tiers.len());
        for (id, name, limits, overage, capabilities) in tiers {
            let monthly_limits = ResourceType::ALL.iter().copied().zip(limits).collect();
            plans.insert(
                id.to_string(),
                PlanDefinition {
                    id: id.to_string(),
                    name: name.to_string(),
                    monthly_limits,
                    overage: overage.iter().copied().collect(),
                    capabilities: capabilities.iter().copied().collect(),
                },
            );
            upgrade_path.push(id.to_string());
        }

        Self {
            version: 1,
            plans,
            upgrade_path,
        }
    }
}

/// key: billing-catalog-handle -> reloadable snapshot holder
#[derive(Clone)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<PlanCatalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: PlanCatalog) -> MeteringResult<Self> {
        catalog.validate()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        })
    }

    pub fn builtin() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(PlanCatalog::builtin()))),
        }
    }

    /// Snapshot used for the duration of one decision.
    pub fn snapshot(&self) -> Arc<PlanCatalog> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a newer catalog; in-flight decisions keep their snapshot.
    pub fn reload(&self, catalog: PlanCatalog) -> MeteringResult<u64> {
        catalog.validate()?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if catalog.version <= guard.version {
            return Err(MeteringError::InvalidCatalog(format!(
                "catalog version {} is not newer than {}",
                catalog.version, guard.version
            )));
        }
        let version = catalog.version;
        *guard = Arc::new(catalog);
        tracing::info!(version, "plan catalog reloaded");
        Ok(version)
    }
}
