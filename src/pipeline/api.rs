use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use crate::extractor::AuthUser;

use super::{AnalysisPipeline, AnalysisReport, PipelineError, SubmissionInput};

/// key: analysis-api -> POST /api/analyses
pub async fn create_analysis(
    Extension(pipeline): Extension<Arc<AnalysisPipeline>>,
    user: Option<AuthUser>,
    Json(input): Json<SubmissionInput>,
) -> Result<(StatusCode, Json<AnalysisReport>), PipelineError> {
    let caller = user.ok_or(PipelineError::Unauthenticated)?.caller();
    let report = pipeline.run(&caller, input).await?;
    Ok((StatusCode::CREATED, Json(report)))
}
