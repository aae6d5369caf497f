use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::{LedgerError, LimiterError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("usage limiter error: {0}")]
    Limiter(#[from] LimiterError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Ledger(LedgerError::InsufficientCredits { .. }) => StatusCode::PAYMENT_REQUIRED,
            AppError::Ledger(LedgerError::UnknownAction(_) | LedgerError::InvalidAmount) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Ledger(LedgerError::DuplicateCharge { .. }) => StatusCode::CONFLICT,
            AppError::Ledger(_) | AppError::Limiter(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
