use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::error::{LedgerError, LedgerResult};
use super::models::{
    AlertHistory, BillingPeriod, Organization, OrganizationStatus, PlanChange, UsageAlertConfig,
    UsageCounter, UsageRecord,
};
use super::resources::{OperationKind, ResourceType};
use super::store::{AlertClaim, AlertHistoryFilter, CounterIncrement, LedgerStore};

const ORGANIZATION_COLUMNS: &str = "id, name, owner_id, plan_id, status, limit_overrides";
const COUNTER_COLUMNS: &str = "organization_id, resource_type, period_year, period_month, quantity, cost_cents, tokens, limit_exceeded";
const ALERT_CONFIG_COLUMNS: &str = "id, organization_id, resource_type, threshold_percentage, channel, max_per_day, cooldown_hours, active, sent_today, last_fired_at";

fn parse_resource(value: &str) -> LedgerResult<ResourceType> {
    value
        .parse()
        .map_err(|_| LedgerError::InvalidRow(format!("unknown resource type `{value}`")))
}

#[derive(Debug, FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    plan_id: String,
    status: String,
    limit_overrides: Json<BTreeMap<ResourceType, i64>>,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = LedgerError;

    fn try_from(row: OrganizationRow) -> LedgerResult<Self> {
        let status = OrganizationStatus::from_str(&row.status).ok_or_else(|| {
            LedgerError::InvalidRow(format!("unknown organization status `{}`", row.status))
        })?;
        Ok(Organization {
            id: row.id,
            name: row.name,
            owner_id: row.owner_id,
            plan_id: row.plan_id,
            status,
            limit_overrides: row.limit_overrides.0,
        })
    }
}

#[derive(Debug, FromRow)]
struct CounterRow {
    organization_id: Uuid,
    resource_type: String,
    period_year: i32,
    period_month: i32,
    quantity: i64,
    cost_cents: i64,
    tokens: i64,
    limit_exceeded: bool,
}

impl TryFrom<CounterRow> for UsageCounter {
    type Error = LedgerError;

    fn try_from(row: CounterRow) -> LedgerResult<Self> {
        let month = u32::try_from(row.period_month)
            .map_err(|_| LedgerError::InvalidRow(format!("invalid month {}", row.period_month)))?;
        Ok(UsageCounter {
            organization_id: row.organization_id,
            resource_type: parse_resource(&row.resource_type)?,
            period: BillingPeriod {
                year: row.period_year,
                month,
            },
            quantity: row.quantity,
            cost_cents: row.cost_cents,
            tokens: row.tokens,
            limit_exceeded: row.limit_exceeded,
        })
    }
}

#[derive(Debug, FromRow)]
struct UsageRecordRow {
    id: Uuid,
    organization_id: Uuid,
    resource_type: String,
    operation: Option<String>,
    platform: String,
    quantity: i64,
    cost_cents: i64,
    tokens: i64,
    tags: Json<BTreeMap<String, String>>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<UsageRecordRow> for UsageRecord {
    type Error = LedgerError;

    fn try_from(row: UsageRecordRow) -> LedgerResult<Self> {
        let operation = row
            .operation
            .as_deref()
            .map(|value| {
                value
                    .parse::<OperationKind>()
                    .map_err(|_| LedgerError::InvalidRow(format!("unknown operation `{value}`")))
            })
            .transpose()?;
        Ok(UsageRecord {
            id: row.id,
            organization_id: row.organization_id,
            resource_type: parse_resource(&row.resource_type)?,
            operation,
            platform: row.platform,
            quantity: row.quantity,
            cost_cents: row.cost_cents,
            tokens: row.tokens,
            tags: row.tags.0,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AlertConfigRow {
    id: Uuid,
    organization_id: Uuid,
    resource_type: String,
    threshold_percentage: i32,
    channel: String,
    max_per_day: i32,
    cooldown_hours: i32,
    active: bool,
    sent_today: i32,
    last_fired_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertConfigRow> for UsageAlertConfig {
    type Error = LedgerError;

    fn try_from(row: AlertConfigRow) -> LedgerResult<Self> {
        Ok(UsageAlertConfig {
            id: row.id,
            organization_id: row.organization_id,
            resource_type: parse_resource(&row.resource_type)?,
            threshold_percentage: row.threshold_percentage,
            channel: row.channel,
            max_per_day: row.max_per_day,
            cooldown_hours: row.cooldown_hours,
            active: row.active,
            sent_today: row.sent_today,
            last_fired_at: row.last_fired_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AlertHistoryRow {
    id: Uuid,
    alert_config_id: Uuid,
    organization_id: Uuid,
    resource_type: String,
    threshold_percentage: i32,
    percentage: f64,
    current_usage: i64,
    usage_limit: Option<i64>,
    plan_id: String,
    channel: String,
    fired_at: DateTime<Utc>,
}

impl TryFrom<AlertHistoryRow> for AlertHistory {
    type Error = LedgerError;

    fn try_from(row: AlertHistoryRow) -> LedgerResult<Self> {
        Ok(AlertHistory {
            id: row.id,
            alert_config_id: row.alert_config_id,
            organization_id: row.organization_id,
            resource_type: parse_resource(&row.resource_type)?,
            threshold_percentage: row.threshold_percentage,
            percentage: row.percentage,
            current_usage: row.current_usage,
            limit: row.usage_limit,
            plan_id: row.plan_id,
            channel: row.channel,
            fired_at: row.fired_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> LedgerResult<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// key: billing-pg-ledger -> Postgres-backed usage ledger
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_organization(&self, organization: &Organization) -> LedgerResult<Organization> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"
            INSERT INTO organizations (id, name, owner_id, plan_id, status, limit_overrides)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(organization.id)
        .bind(&organization.name)
        .bind(organization.owner_id)
        .bind(&organization.plan_id)
        .bind(organization.status.as_str())
        .bind(Json(&organization.limit_overrides))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn organization(&self, organization_id: Uuid) -> LedgerResult<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Organization::try_from).transpose()
    }

    async fn counter(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        period: BillingPeriod,
    ) -> LedgerResult<Option<UsageCounter>> {
        let row = sqlx::query_as::<_, CounterRow>(&format!(
            r#"
            SELECT {COUNTER_COLUMNS} FROM usage_counters
            WHERE organization_id = $1
              AND resource_type = $2
              AND period_year = $3
              AND period_month = $4
            "#
        ))
        .bind(organization_id)
        .bind(resource_type.as_str())
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UsageCounter::try_from).transpose()
    }

    async fn counters_for_period(
        &self,
        organization_id: Uuid,
        period: BillingPeriod,
    ) -> LedgerResult<Vec<UsageCounter>> {
        let rows = sqlx::query_as::<_, CounterRow>(&format!(
            r#"
            SELECT {COUNTER_COLUMNS} FROM usage_counters
            WHERE organization_id = $1 AND period_year = $2 AND period_month = $3
            ORDER BY resource_type
            "#
        ))
        .bind(organization_id)
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn record_usage(
        &self,
        record: &UsageRecord,
        increment: &CounterIncrement,
    ) -> LedgerResult<UsageCounter> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO usage_records (
                id,
                organization_id,
                resource_type,
                operation,
                platform,
                quantity,
                cost_cents,
                tokens,
                tags,
                recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.organization_id)
        .bind(record.resource_type.as_str())
        .bind(record.operation.map(|operation| operation.as_str()))
        .bind(&record.platform)
        .bind(record.quantity)
        .bind(record.cost_cents)
        .bind(record.tokens)
        .bind(Json(&record.tags))
        .bind(record.recorded_at)
        .execute(&mut tx)
        .await?;

        let row = sqlx::query_as::<_, CounterRow>(&format!(
            r#"
            INSERT INTO usage_counters (
                organization_id,
                resource_type,
                period_year,
                period_month,
                quantity,
                cost_cents,
                tokens,
                limit_exceeded
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                COALESCE($5 > $8::BIGINT, FALSE)
            )
            ON CONFLICT (organization_id, resource_type, period_year, period_month)
            DO UPDATE SET
                quantity = usage_counters.quantity + EXCLUDED.quantity,
                cost_cents = usage_counters.cost_cents + EXCLUDED.cost_cents,
                tokens = usage_counters.tokens + EXCLUDED.tokens,
                limit_exceeded = COALESCE(
                    usage_counters.quantity + EXCLUDED.quantity > $8::BIGINT,
                    usage_counters.limit_exceeded
                ),
                updated_at = NOW()
            RETURNING {COUNTER_COLUMNS}
            "#
        ))
        .bind(increment.organization_id)
        .bind(increment.resource_type.as_str())
        .bind(increment.period.year)
        .bind(increment.period.month as i32)
        .bind(increment.quantity)
        .bind(increment.cost_cents)
        .bind(increment.tokens)
        .bind(increment.limit)
        .fetch_one(&mut tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn usage_records(
        &self,
        organization_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> LedgerResult<Vec<UsageRecord>> {
        let rows = sqlx::query_as::<_, UsageRecordRow>(
            r#"
            SELECT id, organization_id, resource_type, operation, platform,
                   quantity, cost_cents, tokens, tags, recorded_at
            FROM usage_records
            WHERE organization_id = $1 AND recorded_at >= $2 AND recorded_at < $3
            ORDER BY recorded_at
            "#,
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn alert_configs(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
    ) -> LedgerResult<Vec<UsageAlertConfig>> {
        let rows = sqlx::query_as::<_, AlertConfigRow>(&format!(
            r#"
            SELECT {ALERT_CONFIG_COLUMNS} FROM usage_alert_configs
            WHERE organization_id = $1 AND resource_type = $2
            ORDER BY threshold_percentage
            "#
        ))
        .bind(organization_id)
        .bind(resource_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn insert_alert_configs(
        &self,
        configs: &[UsageAlertConfig],
    ) -> LedgerResult<Vec<UsageAlertConfig>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::new();
        for config in configs {
            let row = sqlx::query_as::<_, AlertConfigRow>(&format!(
                r#"
                INSERT INTO usage_alert_configs (
                    id,
                    organization_id,
                    resource_type,
                    threshold_percentage,
                    channel,
                    max_per_day,
                    cooldown_hours,
                    active,
                    sent_today,
                    last_fired_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (organization_id, resource_type, threshold_percentage) DO NOTHING
                RETURNING {ALERT_CONFIG_COLUMNS}
                "#
            ))
            .bind(config.id)
            .bind(config.organization_id)
            .bind(config.resource_type.as_str())
            .bind(config.threshold_percentage)
            .bind(&config.channel)
            .bind(config.max_per_day)
            .bind(config.cooldown_hours)
            .bind(config.active)
            .bind(config.sent_today)
            .bind(config.last_fired_at)
            .fetch_optional(&mut tx)
            .await?;
            if let Some(row) = row {
                created.push(row.try_into()?);
            }
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn claim_alert(&self, claim: &AlertClaim) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE usage_alert_configs
            SET last_fired_at = $2, sent_today = $3
            WHERE id = $1 AND last_fired_at IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(claim.config_id)
        .bind(claim.fired_at)
        .bind(claim.sent_today)
        .bind(claim.expected_last_fired_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_alert_history(&self, entry: &AlertHistory) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_history (
                id,
                alert_config_id,
                organization_id,
                resource_type,
                threshold_percentage,
                percentage,
                current_usage,
                usage_limit,
                plan_id,
                channel,
                fired_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.alert_config_id)
        .bind(entry.organization_id)
        .bind(entry.resource_type.as_str())
        .bind(entry.threshold_percentage)
        .bind(entry.percentage)
        .bind(entry.current_usage)
        .bind(entry.limit)
        .bind(&entry.plan_id)
        .bind(&entry.channel)
        .bind(entry.fired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alert_history(
        &self,
        organization_id: Uuid,
        filter: &AlertHistoryFilter,
    ) -> LedgerResult<Vec<AlertHistory>> {
        let rows = sqlx::query_as::<_, AlertHistoryRow>(
            r#"
            SELECT id, alert_config_id, organization_id, resource_type, threshold_percentage,
                   percentage, current_usage, usage_limit, plan_id, channel, fired_at
            FROM alert_history
            WHERE organization_id = $1
              AND ($2::TEXT IS NULL OR resource_type = $2)
              AND ($3::TIMESTAMPTZ IS NULL OR fired_at >= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR fired_at <= $4)
            ORDER BY fired_at DESC
            LIMIT $5
            "#,
        )
        .bind(organization_id)
        .bind(filter.resource_type.map(|resource| resource.as_str()))
        .bind(filter.start)
        .bind(filter.end)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn change_plan(&self, change: &PlanChange) -> LedgerResult<Organization> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"
            UPDATE organizations
            SET plan_id = $2, limit_overrides = '{{}}'::jsonb, updated_at = NOW()
            WHERE id = $1 AND plan_id = $3
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(change.organization_id)
        .bind(&change.new_plan_id)
        .bind(&change.previous_plan_id)
        .fetch_optional(&mut tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                let current = sqlx::query_scalar::<_, String>(
                    "SELECT plan_id FROM organizations WHERE id = $1",
                )
                .bind(change.organization_id)
                .fetch_optional(&mut tx)
                .await?;
                return Err(match current {
                    Some(plan_id) => LedgerError::Conflict(format!(
                        "organization moved to `{plan_id}` before the change from `{}`",
                        change.previous_plan_id
                    )),
                    None => LedgerError::OrganizationNotFound(change.organization_id),
                });
            }
        };

        sqlx::query(
            r#"
            INSERT INTO plan_changes (
                id,
                organization_id,
                previous_plan_id,
                new_plan_id,
                direction,
                actor,
                external_ref,
                changed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(change.id)
        .bind(change.organization_id)
        .bind(&change.previous_plan_id)
        .bind(&change.new_plan_id)
        .bind(change.direction.as_str())
        .bind(&change.actor)
        .bind(&change.external_ref)
        .bind(change.changed_at)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn set_limit_override(
        &self,
        organization_id: Uuid,
        resource_type: ResourceType,
        limit: Option<i64>,
    ) -> LedgerResult<Organization> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"
            UPDATE organizations
            SET limit_overrides = CASE
                    WHEN $3::BIGINT IS NULL THEN limit_overrides - $2::TEXT
                    ELSE limit_overrides || jsonb_build_object($2::TEXT, $3::BIGINT)
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(organization_id)
        .bind(resource_type.as_str())
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::OrganizationNotFound(organization_id))?;
        row.try_into()
    }

    async fn open_period(
        &self,
        period: BillingPeriod,
        resources: &[ResourceType],
    ) -> LedgerResult<Vec<Uuid>> {
        let resources: Vec<String> = resources
            .iter()
            .map(|resource| resource.as_str().to_string())
            .collect();
        let mut opened = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO usage_counters (organization_id, resource_type, period_year, period_month)
            SELECT o.id, r.resource_type, $1, $2
            FROM organizations o
            CROSS JOIN UNNEST($3::TEXT[]) AS r(resource_type)
            ON CONFLICT (organization_id, resource_type, period_year, period_month) DO NOTHING
            RETURNING organization_id
            "#,
        )
        .bind(period.year)
        .bind(period.month as i32)
        .bind(&resources)
        .fetch_all(&self.pool)
        .await?;
        opened.sort();
        opened.dedup();
        Ok(opened)
    }
}
