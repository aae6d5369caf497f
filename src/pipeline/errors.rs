use std::fmt::Display;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinError;

use crate::deadline::DeadlineExceeded;
use crate::providers::{ProviderError, SelectionError};

use super::models::PipelineStage;

/// Stable, caller-visible error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputError,
    AuthGateError,
    LimitError,
    TimeoutError,
    ProviderError,
    ValidationError,
    InternalError,
}

/// Why a single stage or evaluation section did not produce output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageFailure {
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Internal(String),
}

impl StageFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageFailure::Timeout(_) => ErrorKind::TimeoutError,
            StageFailure::Provider(_) => ErrorKind::ProviderError,
            StageFailure::Validation(_) => ErrorKind::ValidationError,
            StageFailure::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl From<DeadlineExceeded> for StageFailure {
    fn from(value: DeadlineExceeded) -> Self {
        StageFailure::Timeout(value.to_string())
    }
}

impl From<JoinError> for StageFailure {
    fn from(value: JoinError) -> Self {
        StageFailure::Internal(format!("provider task failed: {value}"))
    }
}

impl From<ProviderError> for StageFailure {
    fn from(value: ProviderError) -> Self {
        StageFailure::Provider(value.to_string())
    }
}

impl From<SelectionError> for StageFailure {
    fn from(value: SelectionError) -> Self {
        StageFailure::Internal(value.to_string())
    }
}

/// key: pipeline-error -> terminal failure of one run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no transcript or document text was submitted")]
    InputMissing,
    #[error("submission is {size} characters; the limit is {limit}")]
    InputTooLarge { size: usize, limit: usize },
    #[error("caller identity is missing")]
    Unauthenticated,
    #[error("{message}")]
    LimitReached { message: String },
    #[error("insufficient credits: {required} required, {remaining} remaining")]
    InsufficientCredits {
        stage: PipelineStage,
        required: u64,
        remaining: u64,
    },
    #[error("{stage:?} timed out: {message}")]
    Timeout { stage: PipelineStage, message: String },
    #[error("{stage:?} provider failure: {message}")]
    Provider { stage: PipelineStage, message: String },
    #[error("{stage:?} produced invalid output: {message}")]
    Validation { stage: PipelineStage, message: String },
    #[error("{stage:?} internal failure: {message}")]
    Internal { stage: PipelineStage, message: String },
}

impl PipelineError {
    pub fn internal(stage: PipelineStage, err: impl Display) -> Self {
        PipelineError::Internal {
            stage,
            message: err.to_string(),
        }
    }

    pub fn from_stage(stage: PipelineStage, failure: StageFailure) -> Self {
        match failure {
            StageFailure::Timeout(message) => PipelineError::Timeout { stage, message },
            StageFailure::Provider(message) => PipelineError::Provider { stage, message },
            StageFailure::Validation(message) => PipelineError::Validation { stage, message },
            StageFailure::Internal(message) => PipelineError::Internal { stage, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InputMissing | PipelineError::InputTooLarge { .. } => ErrorKind::InputError,
            PipelineError::Unauthenticated => ErrorKind::AuthGateError,
            PipelineError::LimitReached { .. } | PipelineError::InsufficientCredits { .. } => {
                ErrorKind::LimitError
            }
            PipelineError::Timeout { .. } => ErrorKind::TimeoutError,
            PipelineError::Provider { .. } => ErrorKind::ProviderError,
            PipelineError::Validation { .. } => ErrorKind::ValidationError,
            PipelineError::Internal { .. } => ErrorKind::InternalError,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::InputMissing
            | PipelineError::InputTooLarge { .. }
            | PipelineError::Unauthenticated
            | PipelineError::LimitReached { .. } => PipelineStage::Gating,
            PipelineError::InsufficientCredits { stage, .. }
            | PipelineError::Timeout { stage, .. }
            | PipelineError::Provider { stage, .. }
            | PipelineError::Validation { stage, .. }
            | PipelineError::Internal { stage, .. } => *stage,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::InputMissing | PipelineError::InputTooLarge { .. } => StatusCode::BAD_REQUEST,
            PipelineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PipelineError::LimitReached { .. } => StatusCode::FORBIDDEN,
            PipelineError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Provider { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TimeoutError | ErrorKind::ProviderError)
    }

    pub fn upgrade_required(&self) -> bool {
        self.kind() == ErrorKind::LimitError
    }

    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Timeout { .. } => format!(
                "The {} step took too long. Try reducing the input size or retrying.",
                self.stage().as_str()
            ),
            PipelineError::Provider { .. } => format!(
                "An upstream analysis provider failed during {}. Please retry shortly.",
                self.stage().as_str()
            ),
            PipelineError::InsufficientCredits {
                required, remaining, ..
            } => format!(
                "This analysis needs {required} credit(s) and you have {remaining}. Purchase credits to continue."
            ),
            PipelineError::Internal { .. } => "Something went wrong while analysing your submission.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<DeadlineExceeded> for PipelineError {
    fn from(value: DeadlineExceeded) -> Self {
        PipelineError::Timeout {
            stage: PipelineStage::Run,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        if self.kind() == ErrorKind::InternalError {
            tracing::error!(error = ?self, stage = self.stage().as_str(), "analysis failed internally");
        } else {
            tracing::warn!(error = %self, kind = ?self.kind(), "analysis failed");
        }
        let body = json!({
            "status": "failed",
            "error": {
                "kind": self.kind(),
                "message": self.public_message(),
                "stage": self.stage(),
                "retryable": self.retryable(),
                "upgrade_required": self.upgrade_required(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
