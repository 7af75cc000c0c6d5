use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resources::{OperationKind, ResourceType};

/// key: billing-period -> calendar month ledger key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Active,
    Trialing,
    PastDue,
    Suspended,
    Canceled,
}

impl OrganizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationStatus::Active => "active",
            OrganizationStatus::Trialing => "trialing",
            OrganizationStatus::PastDue => "past_due",
            OrganizationStatus::Suspended => "suspended",
            OrganizationStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "trialing" => Some(Self::Trialing),
            "past_due" => Some(Self::PastDue),
            "suspended" => Some(Self::Suspended),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn can_consume(&self) -> bool {
        matches!(self, OrganizationStatus::Active | OrganizationStatus::Trialing)
    }
}

/// key: billing-organization-model -> plan binding + overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub plan_id: String,
    pub status: OrganizationStatus,
    /// Per-resource monthly limits that replace the plan default.
    #[serde(default)]
    pub limit_overrides: BTreeMap<ResourceType, i64>,
}

/// key: billing-usage-counter -> (org, resource, year, month) ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub period: BillingPeriod,
    pub quantity: i64,
    pub cost_cents: i64,
    pub tokens: i64,
    pub limit_exceeded: bool,
}

impl UsageCounter {
    pub fn zeroed(organization_id: Uuid, resource_type: ResourceType, period: BillingPeriod) -> Self {
        Self {
            organization_id,
            resource_type,
            period,
            quantity: 0,
            cost_cents: 0,
            tokens: 0,
            limit_exceeded: false,
        }
    }
}

/// Structured description of one metered operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePayload {
    pub resource_type: ResourceType,
    #[serde(default)]
    pub operation: Option<OperationKind>,
    pub platform: String,
    pub quantity: i64,
    #[serde(default)]
    pub cost_cents: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl UsagePayload {
    pub fn new(resource_type: ResourceType, platform: impl Into<String>, quantity: i64) -> Self {
        Self {
            resource_type,
            operation: None,
            platform: platform.into(),
            quantity,
            cost_cents: 0,
            tokens: 0,
            tags: BTreeMap::new(),
        }
    }

    /// Single unit of `operation`, priced from the operation registry.
    pub fn for_operation(operation: OperationKind, platform: impl Into<String>) -> Self {
        Self {
            resource_type: operation.resource_type(),
            operation: Some(operation),
            platform: platform.into(),
            quantity: 1,
            cost_cents: operation.unit_cost_cents(),
            tokens: 0,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tokens(mut self, tokens: i64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_cost(mut self, cost_cents: i64) -> Self {
        self.cost_cents = cost_cents;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// key: billing-usage-record -> append-only audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub operation: Option<OperationKind>,
    pub platform: String,
    pub quantity: i64,
    pub cost_cents: i64,
    pub tokens: i64,
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn from_payload(organization_id: Uuid, payload: &UsagePayload, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            resource_type: payload.resource_type,
            operation: payload.operation,
            platform: payload.platform.clone(),
            quantity: payload.quantity,
            cost_cents: payload.cost_cents,
            tokens: payload.tokens,
            tags: payload.tags.clone(),
            recorded_at: at,
        }
    }
}

/// key: billing-alert-config -> per (org, resource, threshold) throttle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAlertConfig {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub threshold_percentage: i32,
    pub channel: String,
    pub max_per_day: i32,
    pub cooldown_hours: i32,
    pub active: bool,
    pub sent_today: i32,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl UsageAlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::hours(i64::from(self.cooldown_hours))
    }
}

/// key: billing-alert-history -> fired alert with usage snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistory {
    pub id: Uuid,
    pub alert_config_id: Uuid,
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub threshold_percentage: i32,
    pub percentage: f64,
    pub current_usage: i64,
    pub limit: Option<i64>,
    pub plan_id: String,
    pub channel: String,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeDirection {
    Upgrade,
    Downgrade,
}

impl PlanChangeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeDirection::Upgrade => "upgrade",
            PlanChangeDirection::Downgrade => "downgrade",
        }
    }
}

/// key: billing-plan-change -> append-only plan transition log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChange {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub previous_plan_id: String,
    pub new_plan_id: String,
    pub direction: PlanChangeDirection,
    pub actor: String,
    pub external_ref: Option<String>,
    pub changed_at: DateTime<Utc>,
}
