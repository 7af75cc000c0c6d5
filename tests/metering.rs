use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use usage_metering::billing::{
    AlertDefaults, AlertHistoryFilter, BillingPeriod, Capability, CatalogHandle, ChannelNotifier,
    EntitlementReason, InMemoryLedgerStore, InjectedFault, LedgerStore, MeteringConfig,
    MeteringError, MeteringService, OperationKind, Organization, OrganizationStatus, PlanCatalog,
    PlanLimit, ResourceType, TracingNotifier, UsageCounter, UsagePayload, VerificationFault,
};

// key: metering-tests -> entitlement, recording, alert and reset flows

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

fn seed(store: &InMemoryLedgerStore, org: Uuid, resource: ResourceType, at: DateTime<Utc>, quantity: i64) {
    let mut counter = UsageCounter::zeroed(org, resource, BillingPeriod::containing(at));
    counter.quantity = quantity;
    store.seed_counter(counter);
}

fn service_with(store: Arc<InMemoryLedgerStore>) -> MeteringService {
    MeteringService::with_defaults(store)
}

#[tokio::test]
async fn starter_roasts_deny_at_limit_with_upgrade_hint() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("starter");
    store.insert_organization(org.clone());
    seed(&store, org.id, ResourceType::Roasts, Utc::now(), 9);
    let service = service_with(store.clone());

    let decision = service
        .can_perform(&org.id.to_string(), "roasts", 1)
        .await;
    assert!(decision.allowed);
    assert_eq!(decision.current_usage, 9);
    assert_eq!(decision.limit, Some(10));

    let outcome = service
        .record(
            org.id,
            UsagePayload::for_operation(OperationKind::GenerateReply, "twitter"),
        )
        .await
        .expect("recorded");
    assert_eq!(outcome.new_usage, 10);
    assert_eq!(outcome.percentage, 100.0);
    assert!(outcome.near_limit);

    let decision = service
        .can_perform(&org.id.to_string(), "roasts", 1)
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(EntitlementReason::LimitExceeded));
    assert_eq!(decision.remaining, Some(0));
    assert_eq!(decision.suggested_plan.as_deref(), Some("pro"));
    assert!(decision.message.unwrap_or_default().contains("roast responses"));
}

#[tokio::test]
async fn plus_plan_allows_overage_on_roasts() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("plus");
    store.insert_organization(org.clone());
    seed(&store, org.id, ResourceType::Roasts, Utc::now(), 5_000);
    let service = service_with(store);

    let decision = service.check(org.id, ResourceType::Roasts, 1).await;
    assert!(decision.allowed);
    assert_eq!(decision.reason, Some(EntitlementReason::OveragePermitted));
    assert_eq!(decision.limit, Some(5_000));

    let decision = service.check(org.id, ResourceType::ApiCalls, 1).await;
    assert!(decision.allowed);
    assert_eq!(decision.reason, None);
}

#[tokio::test]
async fn custom_plan_is_unlimited() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("custom");
    store.insert_organization(org.clone());
    seed(&store, org.id, ResourceType::Roasts, Utc::now(), 1_000_000);
    let service = service_with(store);

    let decision = service.check(org.id, ResourceType::Roasts, 500).await;
    assert!(decision.allowed);
    assert_eq!(decision.limit, None);
    assert_eq!(decision.remaining, None);
}

#[tokio::test]
async fn threshold_alert_fires_once_within_cooldown() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("starter");
    store.insert_organization(org.clone());
    let t0 = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
    seed(&store, org.id, ResourceType::Roasts, t0, 7);

    let (tx, mut rx) = mpsc::channel(8);
    let service = MeteringService::new(
        store.clone(),
        CatalogHandle::builtin(),
        Arc::new(ChannelNotifier::new(tx)),
        MeteringConfig::default(),
    );

    let mut fired = 0;
    for offset in [0, 1, 2] {
        let outcome = service
            .record_at(
                org.id,
                UsagePayload::new(ResourceType::Roasts, "youtube", 1),
                t0 + ChronoDuration::hours(offset),
            )
            .await
            .expect("recorded");
        fired += outcome.alerts_fired.len();
    }
    assert_eq!(fired, 1);

    let alert = rx.recv().await.expect("alert delivered");
    assert_eq!(alert.threshold_percentage, 80);
    assert_eq!(alert.current_usage, 8);
    assert_eq!(alert.suggested_plan.as_deref(), Some("pro"));
    assert!(rx.try_recv().is_err());

    let history = service
        .alert_history(org.id, AlertHistoryFilter::default())
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].fired_at, t0);

    let configs = store
        .alert_configs(org.id, ResourceType::ApiCalls)
        .await
        .expect("configs");
    assert_eq!(configs.len(), 1, "defaults are created for every resource type");

    let later = service
        .record_at(
            org.id,
            UsagePayload::new(ResourceType::Roasts, "youtube", 1),
            t0 + ChronoDuration::hours(5),
        )
        .await
        .expect("recorded");
    assert_eq!(later.alerts_fired.len(), 1);

    let stats = service.alert_stats(org.id, None).await.expect("stats");
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_threshold.get(&80), Some(&2));
}

#[tokio::test]
async fn reset_opens_new_period_once() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let first = organization("starter");
    let second = organization("pro");
    store.insert_organization(first.clone());
    store.insert_organization(second.clone());
    let may = Utc.with_ymd_and_hms(2025, 5, 20, 12, 0, 0).unwrap();
    seed(&store, first.id, ResourceType::Roasts, may, 9);
    let service = service_with(store.clone());

    let june = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 5).unwrap();
    let summary = service.reset_all(june).await.expect("reset");
    assert_eq!(summary.organizations_reset, 2);
    assert_eq!(summary.period, BillingPeriod { year: 2025, month: 6 });

    let june_period = BillingPeriod::containing(june);
    let counters = store.counter_snapshot();
    for org in [first.id, second.id] {
        for resource in ResourceType::ALL {
            let counter = counters
                .get(&(org, resource, june_period))
                .expect("zero counter");
            assert_eq!(counter.quantity, 0);
        }
    }
    let may_counter = counters
        .get(&(first.id, ResourceType::Roasts, BillingPeriod::containing(may)))
        .expect("closed period counter");
    assert_eq!(may_counter.quantity, 9);

    let again = service.reset_all(june).await.expect("second reset");
    assert_eq!(again.organizations_reset, 0);
}

#[tokio::test]
async fn concurrent_recordings_lose_no_updates() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("pro");
    store.insert_organization(org.clone());
    let service = service_with(store.clone());
    let org_id = org.id;

    let tasks = (0..64).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .record(
                    org_id,
                    UsagePayload::for_operation(OperationKind::AnalyzeToxicity, "twitch"),
                )
                .await
        })
    });
    for joined in futures_util::future::join_all(tasks).await {
        joined.expect("task").expect("recorded");
    }

    let counter = store
        .counter(
            org.id,
            ResourceType::CommentAnalysis,
            BillingPeriod::containing(Utc::now()),
        )
        .await
        .expect("counter")
        .expect("counter row");
    assert_eq!(counter.quantity, 64);
    assert_eq!(counter.cost_cents, 64);
    assert_eq!(store.usage_record_count(), 64);
}

#[tokio::test]
async fn checks_fail_closed() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("pro");
    store.insert_organization(org.clone());
    let service = MeteringService::new(
        store.clone(),
        CatalogHandle::builtin(),
        Arc::new(TracingNotifier),
        MeteringConfig {
            store_timeout: Duration::from_millis(50),
            ..MeteringConfig::default()
        },
    );
    let org_id = org.id.to_string();

    let decision = service.can_perform("not-a-uuid", "roasts", 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(EntitlementReason::VerificationError));
    assert_eq!(decision.fault, Some(VerificationFault::MalformedOrganizationId));

    let decision = service.can_perform(&org_id, "tweets", 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.fault, Some(VerificationFault::UnknownResource));

    let decision = service
        .can_perform(&Uuid::new_v4().to_string(), "roasts", 1)
        .await;
    assert_eq!(decision.fault, Some(VerificationFault::UnknownOrganization));

    let decision = service.can_perform(&org_id, "roasts", 0).await;
    assert_eq!(decision.fault, Some(VerificationFault::InvalidQuantity));

    store.inject_fault(Some(InjectedFault::Stall(Duration::from_millis(500))));
    let decision = service.can_perform(&org_id, "roasts", 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.fault, Some(VerificationFault::Timeout));

    store.inject_fault(Some(InjectedFault::Unavailable("connection reset".into())));
    let decision = service.can_perform(&org_id, "roasts", 1).await;
    assert_eq!(decision.fault, Some(VerificationFault::StoreUnavailable));
    let capability = service.has_capability(org.id, Capability::Shield).await;
    assert!(!capability.allowed);

    let err = service
        .record(org.id, UsagePayload::new(ResourceType::Roasts, "twitter", 1))
        .await
        .expect_err("store down");
    assert!(matches!(err, MeteringError::RecordFailure(_)));
    assert_eq!(err.code(), "record_failure");

    store.inject_fault(None);
    assert!(service.can_perform(&org_id, "roasts", 1).await.allowed);
}

#[tokio::test]
async fn unknown_plan_and_inactive_subscription_deny() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let legacy = organization("legacy_gold");
    let mut suspended = organization("pro");
    suspended.status = OrganizationStatus::Suspended;
    store.insert_organization(legacy.clone());
    store.insert_organization(suspended.clone());
    let service = service_with(store);

    let decision = service.check(legacy.id, ResourceType::Roasts, 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.fault, Some(VerificationFault::UnknownPlan));

    let decision = service.check(suspended.id, ResourceType::Roasts, 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(EntitlementReason::SubscriptionInactive));
}

#[tokio::test]
async fn downgrade_re_denies_without_truncating_usage() {
    let catalog = PlanCatalog::from_json_str(
        r#"{
            "version": 1,
            "plans": {
                "small": { "id": "small", "name": "Small", "monthly_limits": { "roasts": 500 } },
                "large": { "id": "large", "name": "Large", "monthly_limits": { "roasts": 1000 } }
            },
            "upgrade_path": ["small", "large"]
        }"#,
    )
    .expect("catalog");
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("large");
    store.insert_organization(org.clone());
    seed(&store, org.id, ResourceType::Roasts, Utc::now(), 900);
    let service = MeteringService::new(
        store.clone(),
        CatalogHandle::new(catalog).expect("valid catalog"),
        Arc::new(TracingNotifier),
        MeteringConfig::default(),
    );

    assert!(service.check(org.id, ResourceType::Roasts, 1).await.allowed);

    let err = service
        .upgrade(org.id, "small", None, "billing-webhook")
        .await
        .expect_err("upgrade to a lower tier");
    assert!(matches!(err, MeteringError::InvalidTransition { .. }));

    let outcome = service
        .downgrade(org.id, "small", "support")
        .await
        .expect("downgrade");
    assert_eq!(outcome.organization.plan_id, "small");
    assert_eq!(
        outcome.effective_limits.get(&ResourceType::Roasts),
        Some(&PlanLimit::Limited(500))
    );

    let decision = service.check(org.id, ResourceType::Roasts, 1).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(EntitlementReason::LimitExceeded));
    assert_eq!(decision.current_usage, 900);
    assert_eq!(decision.suggested_plan.as_deref(), Some("large"));

    let err = service
        .upgrade(org.id, "enterprise", None, "support")
        .await
        .expect_err("unknown plan");
    assert!(matches!(err, MeteringError::UnknownPlan(_)));
    assert_eq!(store.plan_changes().len(), 1);
}

#[tokio::test]
async fn overrides_apply_until_plan_changes() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("starter");
    store.insert_organization(org.clone());
    seed(&store, org.id, ResourceType::Roasts, Utc::now(), 10);
    let service = service_with(store);

    assert!(!service.check(org.id, ResourceType::Roasts, 1).await.allowed);

    let err = service
        .set_limit_override(org.id, ResourceType::Roasts, Some(-1))
        .await
        .expect_err("negative limit");
    assert!(matches!(err, MeteringError::InvalidLimit(-1)));

    service
        .set_limit_override(org.id, ResourceType::Roasts, Some(12))
        .await
        .expect("override");
    let decision = service.check(org.id, ResourceType::Roasts, 2).await;
    assert!(decision.allowed);
    assert_eq!(decision.limit, Some(12));
    assert!(!service.check(org.id, ResourceType::Roasts, 3).await.allowed);

    let outcome = service
        .upgrade(org.id, "pro", Some("sub_42".into()), "billing-webhook")
        .await
        .expect("upgrade");
    assert!(outcome.organization.limit_overrides.is_empty());
    assert_eq!(
        outcome.effective_limits.get(&ResourceType::Roasts),
        Some(&PlanLimit::Limited(1_000))
    );
    assert_eq!(outcome.change.external_ref.as_deref(), Some("sub_42"));
}

#[tokio::test]
async fn catalog_reload_applies_without_restart() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("starter");
    store.insert_organization(org.clone());
    seed(&store, org.id, ResourceType::Roasts, Utc::now(), 10);
    let service = service_with(store);
    assert!(!service.check(org.id, ResourceType::Roasts, 1).await.allowed);

    let mut next = PlanCatalog::builtin();
    next.version = 2;
    next.plans
        .get_mut("starter")
        .expect("starter plan")
        .monthly_limits
        .insert(ResourceType::Roasts, Some(25));
    service.catalog().reload(next).expect("reload");

    let decision = service.check(org.id, ResourceType::Roasts, 1).await;
    assert!(decision.allowed);
    assert_eq!(decision.limit, Some(25));
}

#[tokio::test]
async fn billing_summary_breaks_down_by_platform() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("pro");
    store.insert_organization(org.clone());
    let service = service_with(store);
    let at = Utc.with_ymd_and_hms(2025, 7, 3, 8, 0, 0).unwrap();

    for (operation, platform) in [
        (OperationKind::GenerateReply, "twitter"),
        (OperationKind::GenerateReply, "youtube"),
        (OperationKind::AnalyzeToxicity, "twitter"),
        (OperationKind::ShieldAction, "twitter"),
    ] {
        service
            .record_at(org.id, UsagePayload::for_operation(operation, platform), at)
            .await
            .expect("recorded");
    }

    let period = BillingPeriod::containing(at);
    let summary = service
        .billing_summary(org.id, period)
        .await
        .expect("summary");
    assert_eq!(summary.totals.operations, 4);
    assert_eq!(summary.totals.cost_cents, 11);
    assert_eq!(summary.by_platform["twitter"].operations, 3);
    assert_eq!(summary.by_platform["youtube"].cost_cents, 5);
    assert_eq!(summary.by_resource[&ResourceType::ShieldActions].quantity, 1);
    assert_eq!(summary.plan_name.as_deref(), Some("Pro"));

    let usage = service.usage_summary(org.id, period).await.expect("usage");
    let roasts = usage
        .resources
        .iter()
        .find(|entry| entry.resource_type == ResourceType::Roasts)
        .expect("roasts row");
    assert_eq!(roasts.quantity, 2);
    assert_eq!(roasts.limit, Some(1_000));
    assert_eq!(roasts.remaining, Some(998));
}

#[tokio::test]
async fn capability_gate_follows_plan() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let starter = organization("starter");
    let plus = organization("plus");
    store.insert_organization(starter.clone());
    store.insert_organization(plus.clone());
    let service = service_with(store);

    assert!(service.has_capability(starter.id, Capability::Shield).await.allowed);
    assert!(!service.has_capability(starter.id, Capability::ApiAccess).await.allowed);
    assert!(service.has_capability(plus.id, Capability::ApiAccess).await.allowed);
    let missing = service
        .has_capability(Uuid::new_v4(), Capability::Shield)
        .await;
    assert_eq!(missing.fault, Some(VerificationFault::UnknownOrganization));
}

#[tokio::test]
async fn thresholds_fire_independently() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("starter");
    store.insert_organization(org.clone());
    let t0 = Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap();
    seed(&store, org.id, ResourceType::Roasts, t0, 7);

    let configs: Vec<_> = [80, 90, 100]
        .into_iter()
        .map(|threshold| {
            let mut config = AlertDefaults::default().config_for(org.id, ResourceType::Roasts);
            config.threshold_percentage = threshold;
            config
        })
        .collect();
    store.insert_alert_configs(&configs).await.expect("configs");
    let service = service_with(store.clone());

    let mut fired = Vec::new();
    for step in 0..3 {
        let outcome = service
            .record_at(
                org.id,
                UsagePayload::new(ResourceType::Roasts, "twitter", 1),
                t0 + ChronoDuration::minutes(10 * step),
            )
            .await
            .expect("recorded");
        fired.push(
            outcome
                .alerts_fired
                .iter()
                .map(|alert| alert.threshold_percentage)
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(fired, vec![vec![80], vec![90], vec![100]]);

    let stored = store
        .alert_configs(org.id, ResourceType::Roasts)
        .await
        .expect("configs");
    for config in &stored {
        let step = i64::from((config.threshold_percentage - 80) / 10);
        assert_eq!(config.sent_today, 1);
        assert_eq!(config.last_fired_at, Some(t0 + ChronoDuration::minutes(10 * step)));
    }

    // Past every cooldown all three are eligible again, each on its own count.
    let later = service
        .record_at(
            org.id,
            UsagePayload::new(ResourceType::Roasts, "twitter", 1),
            t0 + ChronoDuration::hours(5),
        )
        .await
        .expect("recorded");
    let mut thresholds: Vec<_> = later
        .alerts_fired
        .iter()
        .map(|alert| alert.threshold_percentage)
        .collect();
    thresholds.sort_unstable();
    assert_eq!(thresholds, vec![80, 90, 100]);
    let stored = store
        .alert_configs(org.id, ResourceType::Roasts)
        .await
        .expect("configs");
    assert!(stored.iter().all(|config| config.sent_today == 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_threshold_crossings_fire_one_alert() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("starter");
    store.insert_organization(org.clone());
    let at = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
    seed(&store, org.id, ResourceType::Roasts, at, 5);
    let service = service_with(store.clone());
    let org_id = org.id;

    let tasks = (0..8).map(|_| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .record_at(
                    org_id,
                    UsagePayload::new(ResourceType::Roasts, "twitter", 1),
                    at,
                )
                .await
        })
    });
    let mut fired = 0;
    for joined in futures_util::future::join_all(tasks).await {
        fired += joined.expect("task").expect("recorded").alerts_fired.len();
    }
    assert_eq!(fired, 1);

    let history = service
        .alert_history(org.id, AlertHistoryFilter::default())
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].threshold_percentage, 80);
}

#[tokio::test]
async fn off_path_plan_can_move_in_either_direction() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let mut catalog = PlanCatalog::builtin();
    let mut legacy = catalog.plan("starter").expect("starter plan").clone();
    legacy.id = "legacy".into();
    legacy.name = "Legacy".into();
    catalog.plans.insert(legacy.id.clone(), legacy);

    let upgraded = organization("legacy");
    let downgraded = organization("legacy");
    store.insert_organization(upgraded.clone());
    store.insert_organization(downgraded.clone());
    let service = MeteringService::new(
        store.clone(),
        CatalogHandle::new(catalog).expect("valid catalog"),
        Arc::new(TracingNotifier),
        MeteringConfig::default(),
    );

    let outcome = service
        .upgrade(upgraded.id, "pro", None, "billing")
        .await
        .expect("upgrade from legacy");
    assert_eq!(outcome.organization.plan_id, "pro");
    assert_eq!(outcome.change.previous_plan_id, "legacy");

    let outcome = service
        .downgrade(downgraded.id, "starter", "billing")
        .await
        .expect("downgrade from legacy");
    assert_eq!(outcome.organization.plan_id, "starter");

    // Both plans on the path: direction is still enforced.
    let err = service
        .downgrade(upgraded.id, "custom", "billing")
        .await
        .expect_err("custom ranks above pro");
    assert!(matches!(err, MeteringError::InvalidTransition { .. }));
}

#[tokio::test]
async fn negative_cost_names_the_field() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let org = organization("pro");
    store.insert_organization(org.clone());
    let service = service_with(store.clone());

    let mut payload = UsagePayload::new(ResourceType::Roasts, "twitter", 1);
    payload.cost_cents = -5;
    let err = service.record(org.id, payload).await.expect_err("rejected");
    assert!(matches!(
        err,
        MeteringError::NegativeAmount { field: "cost_cents", value: -5 }
    ));
    assert_eq!(err.to_string(), "cost_cents must be non-negative, got -5");
    assert_eq!(store.usage_record_count(), 0);
}
