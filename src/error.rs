use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::{LedgerError, MeteringError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Metering(#[from] MeteringError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Metering(err) => match err {
                MeteringError::UnknownResource(_)
                | MeteringError::InvalidQuantity(_)
                | MeteringError::NegativeAmount { .. }
                | MeteringError::InvalidLimit(_) => StatusCode::BAD_REQUEST,
                MeteringError::UnknownOrganization(_)
                | MeteringError::Ledger(LedgerError::OrganizationNotFound(_)) => {
                    StatusCode::NOT_FOUND
                }
                MeteringError::UnknownPlan(_) | MeteringError::InvalidCatalog(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                MeteringError::InvalidTransition { .. }
                | MeteringError::Ledger(LedgerError::Conflict(_)) => StatusCode::CONFLICT,
                MeteringError::RecordFailure(_) | MeteringError::Ledger(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "invalid_request",
            AppError::Metering(err) => err.code(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        let body = json!({ "error": self.code(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
