use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use usage_metering::billing::{
    AlertHistoryFilter, BillingPeriod, EntitlementReason, LedgerError, LedgerStore,
    MeteringService, OperationKind, Organization, OrganizationStatus, PgLedgerStore, PlanChange,
    PlanChangeDirection, ResourceType, UsagePayload,
};

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

// key: metering-pg-tests -> ledger atomicity against Postgres
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_records_increment_atomically(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = Arc::new(PgLedgerStore::new(pool));
    let org = store
        .create_organization(&organization("starter"))
        .await
        .unwrap();
    let service = MeteringService::with_defaults(store.clone());
    let at = Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap();

    let tasks = (0..20).map(|_| {
        let service = service.clone();
        let org_id = org.id;
        async move {
            service
                .record_at(
                    org_id,
                    UsagePayload::for_operation(OperationKind::GenerateReply, "twitter"),
                    at,
                )
                .await
        }
    });
    for result in futures_util::future::join_all(tasks).await {
        result.unwrap();
    }

    let counter = store
        .counter(org.id, ResourceType::Roasts, BillingPeriod::containing(at))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counter.quantity, 20);
    assert_eq!(counter.cost_cents, 100);
    assert!(counter.limit_exceeded);

    let history = service
        .alert_history(org.id, AlertHistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1, "cooldown claim lets exactly one alert through");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reset_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = Arc::new(PgLedgerStore::new(pool));
    store.create_organization(&organization("starter")).await.unwrap();
    store.create_organization(&organization("pro")).await.unwrap();
    let service = MeteringService::with_defaults(store);
    let june = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

    let first = service.reset_all(june).await.unwrap();
    assert_eq!(first.organizations_reset, 2);
    let second = service.reset_all(june).await.unwrap();
    assert_eq!(second.organizations_reset, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_change_clears_overrides_and_re_denies(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = Arc::new(PgLedgerStore::new(pool));
    let org = store.create_organization(&organization("pro")).await.unwrap();
    let service = MeteringService::with_defaults(store.clone());

    let updated = service
        .set_limit_override(org.id, ResourceType::Roasts, Some(42))
        .await
        .unwrap();
    assert_eq!(updated.limit_overrides.get(&ResourceType::Roasts), Some(&42));

    service
        .record(org.id, UsagePayload::new(ResourceType::Roasts, "twitter", 40))
        .await
        .unwrap();

    let outcome = service.downgrade(org.id, "starter", "support").await.unwrap();
    assert_eq!(outcome.organization.plan_id, "starter");
    assert!(outcome.organization.limit_overrides.is_empty());

    let decision = service.check(org.id, ResourceType::Roasts, 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(EntitlementReason::LimitExceeded));
    assert_eq!(decision.current_usage, 40);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn stale_plan_change_conflicts(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgLedgerStore::new(pool);
    let org = store.create_organization(&organization("pro")).await.unwrap();
    let change = |previous: &str, next: &str| PlanChange {
        id: Uuid::new_v4(),
        organization_id: org.id,
        previous_plan_id: previous.into(),
        new_plan_id: next.into(),
        direction: PlanChangeDirection::Upgrade,
        actor: "billing".into(),
        external_ref: None,
        changed_at: Utc::now(),
    };

    store.change_plan(&change("pro", "plus")).await.unwrap();
    let err = store.change_plan(&change("pro", "custom")).await.unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));
    let current = store.organization(org.id).await.unwrap().unwrap();
    assert_eq!(current.plan_id, "plus");
}
