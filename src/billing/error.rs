use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Faults raised by the backing ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("ledger call exceeded {0:?}")]
    Timeout(Duration),
    #[error("organization {0} not found")]
    OrganizationNotFound(Uuid),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger row is invalid: {0}")]
    InvalidRow(String),
    #[error("ledger write conflicted: {0}")]
    Conflict(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// key: billing-error-taxonomy -> configuration + recording failures
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("unknown resource type `{0}`")]
    UnknownResource(String),
    #[error("unknown plan `{0}`")]
    UnknownPlan(String),
    #[error("organization {0} not found")]
    UnknownOrganization(Uuid),
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i64),
    #[error("{field} must be non-negative, got {value}")]
    NegativeAmount { field: &'static str, value: i64 },
    #[error("limit must be non-negative, got {0}")]
    InvalidLimit(i64),
    #[error("cannot {direction} from `{from}` to `{to}`")]
    InvalidTransition {
        direction: &'static str,
        from: String,
        to: String,
    },
    #[error("invalid plan catalog: {0}")]
    InvalidCatalog(String),
    #[error("usage could not be recorded: {0}")]
    RecordFailure(#[source] LedgerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl MeteringError {
    /// Stable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            MeteringError::UnknownResource(_) => "unknown_resource",
            MeteringError::UnknownPlan(_) => "unknown_plan",
            MeteringError::UnknownOrganization(_) => "verification_error",
            MeteringError::InvalidQuantity(_)
            | MeteringError::NegativeAmount { .. }
            | MeteringError::InvalidLimit(_) => "invalid_request",
            MeteringError::InvalidTransition { .. } => "invalid_transition",
            MeteringError::InvalidCatalog(_) => "invalid_catalog",
            MeteringError::RecordFailure(_) => "record_failure",
            MeteringError::Ledger(LedgerError::Conflict(_)) => "conflict",
            MeteringError::Ledger(_) => "ledger_unavailable",
        }
    }
}

pub type MeteringResult<T> = Result<T, MeteringError>;
