use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{channel, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::CatalogHandle;
use super::entitlements::usage_percentage;
use super::error::MeteringResult;
use super::models::{AlertHistory, Organization, UsageAlertConfig, UsageCounter};
use super::resources::ResourceType;
use super::store::{bounded, AlertClaim, LedgerStore};

/// Settings applied to auto-created alert configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDefaults {
    pub threshold_percentage: i32,
    pub max_per_day: i32,
    pub cooldown_hours: i32,
    pub channel: String,
}

impl Default for AlertDefaults {
    fn default() -> Self {
        Self {
            threshold_percentage: 80,
            max_per_day: 3,
            cooldown_hours: 4,
            channel: "in_app".to_string(),
        }
    }
}

impl AlertDefaults {
    pub fn config_for(&self, organization_id: Uuid, resource_type: ResourceType) -> UsageAlertConfig {
        UsageAlertConfig {
            id: Uuid::new_v4(),
            organization_id,
            resource_type,
            threshold_percentage: self.threshold_percentage,
            channel: self.channel.clone(),
            max_per_day: self.max_per_day,
            cooldown_hours: self.cooldown_hours,
            active: true,
            sent_today: 0,
            last_fired_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    DailyCap,
    Cooldown { until: DateTime<Utc> },
}

/// key: billing-alert-state -> pure threshold/throttle evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Inactive,
    BelowThreshold,
    Throttled(Throttle),
    /// Ready to fire; `sent_today` is the counter value after firing.
    Eligible { sent_today: i32 },
}

impl AlertState {
    pub fn evaluate(config: &UsageAlertConfig, percentage: f64, now: DateTime<Utc>) -> Self {
        if !config.active {
            return AlertState::Inactive;
        }
        if percentage < f64::from(config.threshold_percentage) {
            return AlertState::BelowThreshold;
        }
        should_fire(config, now)
    }
}

/// Throttle rules only: daily cap for today's fires, then cooldown since the
/// last fire. A fire on a prior day resets the daily counter but the
/// cooldown still runs across midnight.
pub fn should_fire(config: &UsageAlertConfig, now: DateTime<Utc>) -> AlertState {
    let Some(last_fired_at) = config.last_fired_at else {
        return AlertState::Eligible { sent_today: 1 };
    };

    let fired_today = last_fired_at.date_naive() == now.date_naive();
    let sent_today = if fired_today { config.sent_today } else { 0 };
    if fired_today && sent_today >= config.max_per_day {
        return AlertState::Throttled(Throttle::DailyCap);
    }

    let until = last_fired_at + config.cooldown();
    if now < until {
        return AlertState::Throttled(Throttle::Cooldown { until });
    }

    AlertState::Eligible {
        sent_today: sent_today + 1,
    }
}

/// key: billing-alert-payload -> notification boundary message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_config_id: Uuid,
    pub organization_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub percentage: f64,
    pub threshold_percentage: i32,
    pub current_usage: i64,
    pub limit: Option<i64>,
    pub plan_id: String,
    pub suggested_plan: Option<String>,
    pub channel: String,
    pub fired_at: DateTime<Utc>,
}

impl AlertPayload {
    pub fn message(&self) -> String {
        let limit = self
            .limit
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "unlimited".into());
        format!(
            "You've used {:.0}% of your monthly {} ({}/{})",
            self.percentage, self.resource_name, self.current_usage, limit
        )
    }
}

/// Delivery seam for fired alerts.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &AlertPayload) -> Result<()>;
}

/// Writes each alert as a structured log line.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl AlertNotifier for TracingNotifier {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        info!(
            organization_id = %alert.organization_id,
            resource = %alert.resource_type,
            threshold = alert.threshold_percentage,
            percentage = alert.percentage,
            current_usage = alert.current_usage,
            limit = ?alert.limit,
            plan = %alert.plan_id,
            channel = %alert.channel,
            text = %alert.message(),
            "usage alert fired"
        );
        Ok(())
    }
}

/// key: billing-alert-channel -> hand-off to a delivery worker
#[derive(Clone)]
pub struct ChannelNotifier {
    sender: Sender<AlertPayload>,
}

impl ChannelNotifier {
    pub fn new(sender: Sender<AlertPayload>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl AlertNotifier for ChannelNotifier {
    async fn notify(&self, alert: &AlertPayload) -> Result<()> {
        self.sender
            .send(alert.clone())
            .await
            .map_err(|err| anyhow!("failed to enqueue usage alert: {err}"))
    }
}

/// Spawns a worker that forwards queued alerts to `downstream`.
pub fn start_delivery_worker(downstream: Arc<dyn AlertNotifier>, capacity: usize) -> ChannelNotifier {
    let (tx, mut rx) = channel::<AlertPayload>(capacity.max(1));
    tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            if let Err(err) = downstream.notify(&alert).await {
                warn!(
                    ?err,
                    organization_id = %alert.organization_id,
                    resource = %alert.resource_type,
                    code = "alert_delivery_failure",
                    "usage alert delivery failed"
                );
            }
        }
        debug!("usage alert delivery worker stopped");
    });
    ChannelNotifier::new(tx)
}

/// key: billing-alert-engine -> threshold evaluation after each recording
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<dyn LedgerStore>,
    catalog: CatalogHandle,
    notifier: Arc<dyn AlertNotifier>,
    defaults: AlertDefaults,
    timeout: Duration,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: CatalogHandle,
        notifier: Arc<dyn AlertNotifier>,
        defaults: AlertDefaults,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            defaults,
            timeout,
        }
    }

    /// Evaluates every threshold configured for the counter's resource and
    /// returns the alerts that fired. Unlimited resources never alert.
    pub async fn evaluate(
        &self,
        organization: &Organization,
        counter: &UsageCounter,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> MeteringResult<Vec<AlertPayload>> {
        if limit.is_none() {
            return Ok(Vec::new());
        }
        let percentage = usage_percentage(counter.quantity, limit);
        let configs = self
            .configs_or_defaults(organization.id, counter.resource_type)
            .await?;

        let mut fired = Vec::new();
        for config in configs {
            let state = AlertState::evaluate(&config, percentage, now);
            let AlertState::Eligible { sent_today } = state else {
                if let AlertState::Throttled(throttle) = state {
                    debug!(
                        organization_id = %organization.id,
                        resource = %counter.resource_type,
                        threshold = config.threshold_percentage,
                        ?throttle,
                        "usage alert suppressed"
                    );
                }
                continue;
            };

            let claim = AlertClaim {
                config_id: config.id,
                expected_last_fired_at: config.last_fired_at,
                sent_today,
                fired_at: now,
            };
            if !bounded(self.timeout, self.store.claim_alert(&claim)).await? {
                debug!(
                    organization_id = %organization.id,
                    threshold = config.threshold_percentage,
                    "usage alert claimed by a concurrent recording"
                );
                continue;
            }

            let history = AlertHistory {
                id: Uuid::new_v4(),
                alert_config_id: config.id,
                organization_id: organization.id,
                resource_type: counter.resource_type,
                threshold_percentage: config.threshold_percentage,
                percentage,
                current_usage: counter.quantity,
                limit,
                plan_id: organization.plan_id.clone(),
                channel: config.channel.clone(),
                fired_at: now,
            };
            bounded(self.timeout, self.store.append_alert_history(&history)).await?;

            let payload = AlertPayload {
                alert_config_id: config.id,
                organization_id: organization.id,
                resource_type: counter.resource_type,
                resource_name: counter.resource_type.display_name().to_string(),
                percentage,
                threshold_percentage: config.threshold_percentage,
                current_usage: counter.quantity,
                limit,
                plan_id: organization.plan_id.clone(),
                suggested_plan: self
                    .catalog
                    .snapshot()
                    .suggested_upgrade(&organization.plan_id)
                    .map(str::to_string),
                channel: config.channel.clone(),
                fired_at: now,
            };
            if let Err(err) = self.notifier.notify(&payload).await {
                warn!(
                    ?err,
                    organization_id = %organization.id,
                    resource = %counter.resource_type,
                    code = "alert_delivery_failure",
                    "usage alert could not be delivered"
                );
            }
            fired.push(payload);
        }
        Ok(fired)
    }

    async fn configs_or_defaults(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
    ) -> MeteringResult<Vec<UsageAlertConfig>> {
        let configs = bounded(
            self.timeout,
            self.store.alert_configs(organization_id, resource_type),
        )
        .await?;
        if !configs.is_empty() {
            return Ok(configs);
        }

        let defaults: Vec<UsageAlertConfig> = ResourceType::ALL
            .iter()
            .map(|resource| self.defaults.config_for(organization_id, *resource))
            .collect();
        let created = bounded(self.timeout, self.store.insert_alert_configs(&defaults)).await?;
        if !created.is_empty() {
            info!(
                %organization_id,
                created = created.len(),
                threshold = self.defaults.threshold_percentage,
                "default usage alert configs created"
            );
        }
        // Re-read so a concurrent creator's rows are used instead of ours.
        Ok(bounded(
            self.timeout,
            self.store.alert_configs(organization_id, resource_type),
        )
        .await?)
    }
}
