pub mod api;
pub mod errors;
pub mod models;
pub mod orchestrator;

use std::collections::{BTreeMap, BTreeSet};

use crate::deadline::DeadlineConfig;
use crate::providers::StageKind;

pub use api::create_analysis;
pub use errors::{ErrorKind, PipelineError, StageFailure};
pub use models::{
    AnalysisReport, BillingModel, BillingReceipt, Caller, PipelineRun, PipelineStage, RunState,
    SectionOutcome, SubmissionInput, Verdict,
};
pub use orchestrator::AnalysisPipeline;

/// How many of the parallel evaluation sections must complete for a run to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationPolicy {
    pub minimum_successes: usize,
    /// Sections that must complete regardless of the count.
    pub required: BTreeSet<StageKind>,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            minimum_successes: 2,
            required: BTreeSet::new(),
        }
    }
}

impl EvaluationPolicy {
    /// Escalates to an internal error when any section had no usable provider, and to a
    /// timeout only when every failed section timed out.
    pub fn check(&self, sections: &BTreeMap<StageKind, SectionOutcome>) -> Result<(), StageFailure> {
        let mut completed = 0;
        let mut failures = Vec::new();
        let mut all_timeouts = true;
        let mut misconfigured = false;

        for stage in StageKind::EVALUATIONS {
            match sections.get(&stage) {
                Some(SectionOutcome::Completed { .. }) => completed += 1,
                Some(SectionOutcome::Omitted { kind, reason }) => {
                    all_timeouts &= *kind == ErrorKind::TimeoutError;
                    misconfigured |= *kind == ErrorKind::InternalError;
                    failures.push(format!("{stage}: {reason}"));
                }
                None => {
                    all_timeouts = false;
                    failures.push(format!("{stage}: not run"));
                }
            }
        }

        let missing_required: Vec<&str> = self
            .required
            .iter()
            .filter(|stage| !sections.get(*stage).map_or(false, SectionOutcome::is_completed))
            .map(StageKind::as_str)
            .collect();

        let message = if !missing_required.is_empty() {
            format!(
                "required evaluation(s) {} did not complete ({})",
                missing_required.join(", "),
                failures.join("; ")
            )
        } else if completed < self.minimum_successes {
            format!(
                "only {completed} of {} evaluations completed, {} required ({})",
                StageKind::EVALUATIONS.len(),
                self.minimum_successes,
                failures.join("; ")
            )
        } else {
            return Ok(());
        };

        if misconfigured {
            Err(StageFailure::Internal(message))
        } else if all_timeouts && !failures.is_empty() {
            Err(StageFailure::Timeout(message))
        } else {
            Err(StageFailure::Provider(message))
        }
    }
}

/// key: pipeline-settings -> immutable per-process pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Credit cost table entry charged for one successful run.
    pub billable_action: String,
    /// Plan quota action class metered for one successful run.
    pub usage_action: String,
    pub max_input_chars: usize,
    pub evaluation: EvaluationPolicy,
    pub pass_threshold: u8,
    pub deadlines: DeadlineConfig,
    /// Stages that move on to the next provider when a call fails, not only when a provider
    /// is unusable.
    pub fallback_on_error: BTreeSet<StageKind>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            billable_action: "pitch_analysis".to_string(),
            usage_action: "analysis".to_string(),
            max_input_chars: 120_000,
            evaluation: EvaluationPolicy::default(),
            pass_threshold: 70,
            deadlines: DeadlineConfig::default(),
            fallback_on_error: BTreeSet::from([StageKind::Research]),
        }
    }
}
