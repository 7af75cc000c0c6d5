pub mod alerts;
pub mod api;
pub mod catalog;
pub mod entitlements;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod recorder;
pub mod reporting;
pub mod reset;
pub mod resources;
pub mod service;
pub mod store;

pub use alerts::{
    should_fire, start_delivery_worker, AlertDefaults, AlertEngine, AlertNotifier, AlertPayload,
    AlertState, ChannelNotifier, Throttle, TracingNotifier,
};
pub use catalog::{Capability, CatalogHandle, PlanCatalog, PlanDefinition, PlanLimit};
pub use entitlements::{
    CapabilityDecision, EntitlementChecker, EntitlementDecision, EntitlementReason,
    VerificationFault,
};
pub use error::{LedgerError, LedgerResult, MeteringError, MeteringResult};
pub use lifecycle::{PlanChangeOutcome, PlanLifecycle};
pub use memory::{InMemoryLedgerStore, InjectedFault};
pub use models::{
    AlertHistory, BillingPeriod, Organization, OrganizationStatus, PlanChange,
    PlanChangeDirection, UsageAlertConfig, UsageCounter, UsagePayload, UsageRecord,
};
pub use postgres::PgLedgerStore;
pub use recorder::{RecordOutcome, UsageRecorder};
pub use reporting::{AlertStats, BillingSummary, ResourceUsage, UsageReporter, UsageSummary};
pub use reset::{MonthlyResetJob, ResetSummary};
pub use resources::{OperationKind, ResourceType};
pub use service::{MeteringConfig, MeteringService};
pub use store::{AlertHistoryFilter, LedgerStore};
