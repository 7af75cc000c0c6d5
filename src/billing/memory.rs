use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::error::{LedgerError, LedgerResult};
use super::models::{
    AlertHistory, BillingPeriod, Organization, PlanChange, UsageAlertConfig, UsageCounter,
    UsageRecord,
};
use super::resources::ResourceType;
use super::store::{AlertClaim, AlertHistoryFilter, CounterIncrement, LedgerStore};

type CounterKey = (Uuid, ResourceType, BillingPeriod);
type AlertKey = (Uuid, ResourceType, i32);

/// Fault applied to every subsequent ledger call.
#[derive(Debug, Clone)]
pub enum InjectedFault {
    /// Sleep before answering, simulating a stalled backing call.
    Stall(Duration),
    Unavailable(String),
}

/// key: billing-memory-store -> process-local ledger with the same atomicity
///
/// Counter and alert mutations go through `DashMap` entry guards, so each key
/// is updated under its shard lock exactly like a row-level upsert.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    organizations: DashMap<Uuid, Organization>,
    counters: DashMap<CounterKey, UsageCounter>,
    records: Mutex<Vec<UsageRecord>>,
    alert_keys: DashMap<AlertKey, Uuid>,
    alert_configs: DashMap<Uuid, UsageAlertConfig>,
    alert_history: Mutex<Vec<AlertHistory>>,
    plan_changes: Mutex<Vec<PlanChange>>,
    fault: RwLock<Option<InjectedFault>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.organizations.insert(organization.id, organization);
    }

    /// Seeds a counter directly, bypassing the recorder.
    pub fn seed_counter(&self, counter: UsageCounter) {
        let key = (counter.organization_id, counter.resource_type, counter.period);
        self.counters.insert(key, counter);
    }

    pub fn inject_fault(&self, fault: Option<InjectedFault>) {
        let mut guard = self.fault.write().unwrap_or_else(|p| p.into_inner());
        *guard = fault;
    }

    pub fn usage_record_count(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or_default()
    }

    pub fn plan_changes(&self) -> Vec<PlanChange> {
        self.plan_changes
            .lock()
            .map(|changes| changes.clone())
            .unwrap_or_default()
    }

    pub fn counter_snapshot(&self) -> BTreeMap<(Uuid, ResourceType, BillingPeriod), UsageCounter> {
        self.counters
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    async fn check_fault(&self) -> LedgerResult<()> {
        let fault = self
            .fault
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|p| p.into_inner().clone());
        match fault {
            None => Ok(()),
            Some(InjectedFault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(InjectedFault::Unavailable(reason)) => Err(LedgerError::Unavailable(reason)),
        }
    }

    fn poisoned(what: &str) -> LedgerError {
        LedgerError::Unavailable(format!("{what} lock poisoned"))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn organization(&self, organization_id: Uuid) -> LedgerResult<Option<Organization>> {
        self.check_fault().await?;
        Ok(self
            .organizations
            .get(&organization_id)
            .map(|entry| entry.value().clone()))
    }

    async fn counter(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        period: BillingPeriod,
    ) -> LedgerResult<Option<UsageCounter>> {
        self.check_fault().await?;
        Ok(self
            .counters
            .get(&(organization_id, resource_type, period))
            .map(|entry| entry.value().clone()))
    }

    async fn counters_for_period(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> LedgerResult<Vec<UsageCounter>> {
        self.check_fault().await?;
        let mut counters: Vec<UsageCounter> = self
            .counters
            .iter()
            .filter(|entry| entry.key().0 == organization_id && entry.key().2 == period)
            .map(|entry| entry.value().clone())
            .collect();
        counters.sort_by_key(|counter| counter.resource_type);
        Ok(counters)
    }

    async fn record_usage(
        &self,
        record: &UsageRecord,
        increment: &CounterIncrement,
    ) -> LedgerResult<UsageCounter> {
        self.check_fault().await?;
        let key = (
            increment.organization_id,
            increment.resource_type,
            increment.period,
        );
        let mut entry = self.counters.entry(key).or_insert_with(|| {
            UsageCounter::zeroed(
                increment.organization_id,
                increment.resource_type,
                increment.period,
            )
        });
        let counter = entry.value_mut();
        let out_of_range = || LedgerError::InvalidRow("counter value out of range".into());
        let quantity = counter
            .quantity
            .checked_add(increment.quantity)
            .ok_or_else(out_of_range)?;
        let cost_cents = counter
            .cost_cents
            .checked_add(increment.cost_cents)
            .ok_or_else(out_of_range)?;
        let tokens = counter
            .tokens
            .checked_add(increment.tokens)
            .ok_or_else(out_of_range)?;

        // Appended under the counter guard so a rejected increment leaves no record.
        self.records
            .lock()
            .map_err(|_| Self::poisoned("usage records"))?
            .push(record.clone());

        counter.quantity = quantity;
        counter.cost_cents = cost_cents;
        counter.tokens = tokens;
        if let Some(limit) = increment.limit {
            counter.limit_exceeded = counter.quantity > limit;
        }
        Ok(counter.clone())
    }

    async fn usage_records(
        &self,
        organization_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<Vec<UsageRecord>> {
        self.check_fault().await?;
        let records = self
            .records
            .lock()
            .map_err(|_| Self::poisoned("usage records"))?;
        Ok(records
            .iter()
            .filter(|record| {
                record.organization_id == organization_id
                    && record.recorded_at >= start
                    && record.recorded_at < end
            })
            .cloned()
            .collect())
    }

    async fn alert_configs(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
    ) -> LedgerResult<Vec<UsageAlertConfig>> {
        self.check_fault().await?;
        let mut configs: Vec<UsageAlertConfig> = self
            .alert_configs
            .iter()
            .filter(|entry| {
                entry.organization_id == organization_id && entry.resource_type == resource_type
            })
            .map(|entry| entry.value().clone())
            .collect();
        configs.sort_by_key(|config| config.threshold_percentage);
        Ok(configs)
    }

    async fn insert_alert_configs(
        &self,
        configs: &[UsageAlertConfig],
    ) -> LedgerResult<Vec<UsageAlertConfig>> {
        self.check_fault().await?;
        let mut created = Vec::new();
        for config in configs {
            let key = (
                config.organization_id,
                config.resource_type,
                config.threshold_percentage,
            );
            if let Entry::Vacant(slot) = self.alert_keys.entry(key) {
                slot.insert(config.id);
                self.alert_configs.insert(config.id, config.clone());
                created.push(config.clone());
            }
        }
        Ok(created)
    }

    async fn claim_alert(&self, claim: &AlertClaim) -> LedgerResult<bool> {
        self.check_fault().await?;
        let Some(mut config) = self.alert_configs.get_mut(&claim.config_id) else {
            return Ok(false);
        };
        if config.last_fired_at != claim.expected_last_fired_at {
            return Ok(false);
        }
        config.last_fired_at = Some(claim.fired_at);
        config.sent_today = claim.sent_today;
        Ok(true)
    }

    async fn append_alert_history(&self, entry: &AlertHistory) -> LedgerResult<()> {
        self.check_fault().await?;
        self.alert_history
            .lock()
            .map_err(|_| Self::poisoned("alert history"))?
            .push(entry.clone());
        Ok(())
    }

    async fn alert_history(
        &self,
        organization_id: Uuid,
        filter: &AlertHistoryFilter,
    ) -> LedgerResult<Vec<AlertHistory>> {
        self.check_fault().await?;
        let history = self
            .alert_history
            .lock()
            .map_err(|_| Self::poisoned("alert history"))?;
        let mut entries: Vec<AlertHistory> = history
            .iter()
            .filter(|entry| entry.organization_id == organization_id)
            .filter(|entry| {
                filter
                    .resource_type
                    .map_or(true, |resource| entry.resource_type == resource)
            })
            .filter(|entry| filter.start.map_or(true, |start| entry.fired_at >= start))
            .filter(|entry| filter.end.map_or(true, |end| entry.fired_at <= end))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        if let Some(limit) = filter.limit {
            entries.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        }
        Ok(entries)
    }

    async fn change_plan(&self, change: &PlanChange) -> LedgerResult<Organization> {
        self.check_fault().await?;
        let mut organization = self
            .organizations
            .get_mut(&change.organization_id)
            .ok_or(LedgerError::OrganizationNotFound(change.organization_id))?;
        if organization.plan_id != change.previous_plan_id {
            return Err(LedgerError::Conflict(format!(
                "organization moved to `{}` before the change from `{}`",
                organization.plan_id, change.previous_plan_id
            )));
        }
        organization.plan_id = change.new_plan_id.clone();
        organization.limit_overrides.clear();
        let updated = organization.clone();
        drop(organization);

        self.plan_changes
            .lock()
            .map_err(|_| Self::poisoned("plan changes"))?
            .push(change.clone());
        Ok(updated)
    }

    async fn set_limit_override(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        limit: Option<i64>,
    ) -> LedgerResult<Organization> {
        self.check_fault().await?;
        let mut organization = self
            .organizations
            .get_mut(&organization_id)
            .ok_or(LedgerError::OrganizationNotFound(organization_id))?;
        match limit {
            Some(value) => {
                organization.limit_overrides.insert(resource_type, value);
            }
            None => {
                organization.limit_overrides.remove(&resource_type);
            }
        }
        Ok(organization.clone())
    }

    async fn open_period(
        &self,
        period: BillingPeriod,
        resources: &[ResourceType],
    ) -> LedgerResult<Vec<Uuid>> {
        self.check_fault().await?;
        let organization_ids: Vec<Uuid> = self.organizations.iter().map(|entry| *entry.key()).collect();
        let mut opened = Vec::new();
        for organization_id in organization_ids {
            let mut created = false;
            for resource in resources {
                if let Entry::Vacant(slot) = self.counters.entry((organization_id, *resource, period)) {
                    slot.insert(UsageCounter::zeroed(organization_id, *resource, period));
                    created = true;
                }
            }
            if created {
                opened.push(organization_id);
            }
        }
        Ok(opened)
    }
}
