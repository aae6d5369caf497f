use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::deadline::DeadlineConfig;
use crate::providers::StageKind;

use super::errors::ErrorKind;

/// Raw caller content. Either field may be empty, not both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionInput {
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub document_text: Option<String>,
    /// Free-form hints passed through to extraction, e.g. company name or funding stage.
    #[serde(default)]
    pub context: Option<Value>,
}

impl SubmissionInput {
    fn parts(&self) -> impl Iterator<Item = &str> {
        [self.transcript.as_deref(), self.document_text.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
    }

    /// Combined size in characters of the text that will be sent downstream.
    pub fn size(&self) -> usize {
        self.parts().map(|part| part.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts().next().is_none()
    }

    /// Canonical payload handed to the extraction stage.
    pub fn canonical(&self) -> Value {
        json!({
            "transcript": self.transcript.as_deref().map(str::trim).filter(|text| !text.is_empty()),
            "document_text": self.document_text.as_deref().map(str::trim).filter(|text| !text.is_empty()),
            "context": self.context.clone().unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    /// Pay-per-use; gated by `has_enough_credits`, charged with `use_credits`.
    Credits,
    /// Flat plan; gated by `check_usage`, metered with `increment_usage`.
    PlanQuota,
}

/// Verified identity handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub billing: BillingModel,
}

impl Caller {
    pub fn credits(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            billing: BillingModel::Credits,
        }
    }

    pub fn plan_quota(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            billing: BillingModel::PlanQuota,
        }
    }
}

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Gating,
    Extraction,
    Evaluation,
    Adjudication,
    Charging,
    Run,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Gating => "gating",
            PipelineStage::Extraction => "extraction",
            PipelineStage::Evaluation => "evaluation",
            PipelineStage::Adjudication => "adjudication",
            PipelineStage::Charging => "charging",
            PipelineStage::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Gating,
    Extraction,
    Evaluation,
    Adjudication,
    Charging,
    Done,
    Failed(PipelineStage, ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionOutcome {
    Completed { provider: String, output: Value },
    Omitted { kind: ErrorKind, reason: String },
}

impl SectionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SectionOutcome::Completed { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            SectionOutcome::Completed { output, .. } => Some(output),
            SectionOutcome::Omitted { .. } => None,
        }
    }
}

/// Stand-in adjudication input for an evaluation section that did not complete.
pub fn omitted_section_default(stage: StageKind) -> Value {
    match stage {
        StageKind::Research => json!({"findings": [], "omitted": true}),
        _ => json!({"score": null, "omitted": true}),
    }
}

/// key: pipeline-run -> transient per-request state, owned by one `run` call
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub input: SubmissionInput,
    pub state: RunState,
    pub stage_outputs: BTreeMap<StageKind, SectionOutcome>,
    pub started_at: Instant,
    pub deadlines: BTreeMap<StageKind, Duration>,
}

impl PipelineRun {
    pub fn new(input: SubmissionInput, deadlines: &DeadlineConfig) -> Self {
        let deadlines = [
            StageKind::Extraction,
            StageKind::Research,
            StageKind::AdvocateScoring,
            StageKind::CriticScoring,
            StageKind::Adjudication,
        ]
        .into_iter()
        .map(|stage| (stage, deadlines.budget(stage.operation_class())))
        .collect();

        Self {
            run_id: Uuid::new_v4(),
            input,
            state: RunState::Gating,
            stage_outputs: BTreeMap::new(),
            started_at: Instant::now(),
            deadlines,
        }
    }

    pub fn transition(&mut self, next: RunState) {
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "pipeline state transition");
        self.state = next;
    }

    pub fn record(&mut self, stage: StageKind, outcome: SectionOutcome) {
        self.stage_outputs.insert(stage, outcome);
    }

    /// The stage the run is working on and the longest single-call budget it allows.
    pub fn in_flight(&self) -> Option<(PipelineStage, Duration)> {
        let (stage, kinds) = match self.state {
            RunState::Extraction => (PipelineStage::Extraction, &[StageKind::Extraction][..]),
            RunState::Evaluation => (PipelineStage::Evaluation, &StageKind::EVALUATIONS[..]),
            RunState::Adjudication => (PipelineStage::Adjudication, &[StageKind::Adjudication][..]),
            _ => return None,
        };
        let budget = kinds
            .iter()
            .filter_map(|kind| self.deadlines.get(kind))
            .max()
            .copied()
            .unwrap_or_default();
        Some((stage, budget))
    }

    pub fn omitted(&self) -> Vec<StageKind> {
        self.stage_outputs
            .iter()
            .filter(|(_, outcome)| !outcome.is_completed())
            .map(|(stage, _)| *stage)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub score: u8,
    pub passed: bool,
    pub pass_threshold: u8,
    pub rationale: String,
}

impl Verdict {
    /// Reads `{score, rationale}` from adjudication output. Scores are clamped to 0..=100.
    pub fn from_output(output: &Value, pass_threshold: u8) -> Result<Self, String> {
        let score = output
            .get("score")
            .and_then(Value::as_f64)
            .filter(|score| score.is_finite())
            .ok_or_else(|| "adjudication output has no numeric `score`".to_string())?;
        let score = score.round().clamp(0.0, 100.0) as u8;
        let rationale = output
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or("No rationale provided.")
            .to_string();

        Ok(Self {
            score,
            passed: score >= pass_threshold,
            pass_threshold,
            rationale,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum BillingReceipt {
    Credits {
        action: String,
        credits: u64,
        remaining_credits: u64,
    },
    /// Usage is metered in the background after the response is produced.
    PlanQuota { action: String },
}

/// key: analysis-report -> caller-facing result of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub run_id: Uuid,
    pub status: &'static str,
    pub stages: BTreeMap<StageKind, SectionOutcome>,
    pub omitted: Vec<StageKind>,
    pub verdict: Verdict,
    pub billing: BillingReceipt,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}
