use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::billing::{CreditLedger, LedgerError, UsageEvent, UsageEventHandle, UsageLimiter};
use crate::deadline::{spawn_with_deadline, with_deadline};
use crate::providers::{Candidate, ProviderSelector, StageInput, StageKind};

use super::errors::{ErrorKind, PipelineError, StageFailure};
use super::models::{
    omitted_section_default, AnalysisReport, BillingModel, BillingReceipt, Caller, PipelineRun,
    PipelineStage, RunState, SectionOutcome, SubmissionInput, Verdict,
};
use super::PipelineSettings;

/// key: analysis-pipeline -> gate, extract, evaluate, adjudicate, charge
///
/// One `run` call owns its `PipelineRun` outright. The only state shared between runs is the
/// caller's ledger account and usage counter, and both are only mutated through their
/// transactional operations.
#[derive(Clone)]
pub struct AnalysisPipeline {
    ledger: CreditLedger,
    limiter: UsageLimiter,
    selector: ProviderSelector,
    usage_events: UsageEventHandle,
    settings: PipelineSettings,
}

impl AnalysisPipeline {
    pub fn new(
        ledger: CreditLedger,
        limiter: UsageLimiter,
        selector: ProviderSelector,
        usage_events: UsageEventHandle,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            limiter,
            selector,
            usage_events,
            settings,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn limiter(&self) -> &UsageLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        caller: &Caller,
        input: SubmissionInput,
    ) -> Result<AnalysisReport, PipelineError> {
        let mut run = PipelineRun::new(input, &self.settings.deadlines);

        if let Err(err) = self.gate(caller, &run.input).await {
            run.transition(RunState::Failed(PipelineStage::Gating, err.kind()));
            return Err(err);
        }

        let budget = self.settings.deadlines.run;
        let on_timeout = format!("analysis run {} exceeded its time budget", run.run_id);
        let verdict = match with_deadline(self.execute(&mut run), budget, on_timeout).await {
            Ok(verdict) => verdict,
            Err(PipelineError::Timeout {
                stage: PipelineStage::Run,
                message,
            }) => {
                let message = match run.in_flight() {
                    Some((in_flight, stage_budget)) => {
                        warn!(
                            run_id = %run.run_id,
                            in_flight = in_flight.as_str(),
                            stage_budget_ms = stage_budget.as_millis() as u64,
                            run_budget_ms = budget.as_millis() as u64,
                            "run budget exhausted mid-stage"
                        );
                        format!("{message} during {}", in_flight.as_str())
                    }
                    None => message,
                };
                run.transition(RunState::Failed(PipelineStage::Run, ErrorKind::TimeoutError));
                return Err(PipelineError::Timeout {
                    stage: PipelineStage::Run,
                    message,
                });
            }
            Err(err) => {
                run.transition(RunState::Failed(err.stage(), err.kind()));
                return Err(err);
            }
        };

        run.transition(RunState::Charging);
        let billing = match self.charge(caller, run.run_id).await {
            Ok(receipt) => receipt,
            Err(err) => {
                run.transition(RunState::Failed(PipelineStage::Charging, err.kind()));
                return Err(err);
            }
        };

        run.transition(RunState::Done);
        let omitted = run.omitted();
        let duration_ms = run.started_at.elapsed().as_millis() as u64;
        info!(
            run_id = %run.run_id,
            user_id = %caller.user_id,
            duration_ms,
            score = verdict.score,
            passed = verdict.passed,
            ?omitted,
            "analysis run completed"
        );

        Ok(AnalysisReport {
            run_id: run.run_id,
            status: "completed",
            stages: run.stage_outputs,
            omitted,
            verdict,
            billing,
            completed_at: Utc::now(),
            duration_ms,
        })
    }

    /// Rejects the run before any provider is called.
    async fn gate(&self, caller: &Caller, input: &SubmissionInput) -> Result<(), PipelineError> {
        if caller.user_id.trim().is_empty() {
            return Err(PipelineError::Unauthenticated);
        }
        if input.is_empty() {
            return Err(PipelineError::InputMissing);
        }
        let size = input.size();
        if size > self.settings.max_input_chars {
            return Err(PipelineError::InputTooLarge {
                size,
                limit: self.settings.max_input_chars,
            });
        }

        match caller.billing {
            BillingModel::PlanQuota => {
                let decision = self
                    .limiter
                    .check_usage(&caller.user_id, &self.settings.usage_action)
                    .await
                    .map_err(|err| PipelineError::internal(PipelineStage::Gating, err))?;
                if !decision.allowed {
                    return Err(PipelineError::LimitReached {
                        message: decision
                            .message
                            .unwrap_or_else(|| "Plan limit reached. Upgrade your plan to continue.".to_string()),
                    });
                }
            }
            BillingModel::Credits => {
                let action = &self.settings.billable_action;
                let affordable = self
                    .ledger
                    .has_enough_credits(&caller.user_id, action)
                    .await
                    .map_err(|err| PipelineError::internal(PipelineStage::Gating, err))?;
                if !affordable {
                    let required = self
                        .ledger
                        .cost(action)
                        .map_err(|err| PipelineError::internal(PipelineStage::Gating, err))?;
                    let balance = self
                        .ledger
                        .get_balance(&caller.user_id)
                        .await
                        .map_err(|err| PipelineError::internal(PipelineStage::Gating, err))?;
                    return Err(PipelineError::InsufficientCredits {
                        stage: PipelineStage::Gating,
                        required,
                        remaining: balance.remaining_credits,
                    });
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<Verdict, PipelineError> {
        let run_id = run.run_id;

        run.transition(RunState::Extraction);
        let (provider, extraction) = self
            .invoke_stage(run_id, StageKind::Extraction, run.input.canonical())
            .await
            .map_err(|failure| PipelineError::from_stage(PipelineStage::Extraction, failure))?;
        if !extraction.is_object() {
            return Err(PipelineError::Validation {
                stage: PipelineStage::Extraction,
                message: "extraction output is not a JSON object".to_string(),
            });
        }
        run.record(
            StageKind::Extraction,
            SectionOutcome::Completed {
                provider,
                output: extraction.clone(),
            },
        );

        run.transition(RunState::Evaluation);
        let payload = json!({ "extraction": extraction });
        let sections = join_all(
            StageKind::EVALUATIONS
                .into_iter()
                .map(|stage| self.evaluate(run_id, stage, payload.clone())),
        )
        .await;
        for (stage, outcome) in StageKind::EVALUATIONS.into_iter().zip(sections) {
            if let SectionOutcome::Omitted { kind, reason } = &outcome {
                warn!(%run_id, %stage, ?kind, %reason, "evaluation section omitted");
            }
            run.record(stage, outcome);
        }
        self.settings
            .evaluation
            .check(&run.stage_outputs)
            .map_err(|failure| PipelineError::from_stage(PipelineStage::Evaluation, failure))?;

        run.transition(RunState::Adjudication);
        let mut adjudication_input = json!({
            "extraction": extraction,
            "pass_threshold": self.settings.pass_threshold,
        });
        for stage in StageKind::EVALUATIONS {
            let section = run
                .stage_outputs
                .get(&stage)
                .and_then(SectionOutcome::output)
                .cloned()
                .unwrap_or_else(|| omitted_section_default(stage));
            adjudication_input[stage.as_str()] = section;
        }
        let (provider, output) = self
            .invoke_stage(run_id, StageKind::Adjudication, adjudication_input)
            .await
            .map_err(|failure| PipelineError::from_stage(PipelineStage::Adjudication, failure))?;
        let verdict = Verdict::from_output(&output, self.settings.pass_threshold).map_err(|message| {
            PipelineError::Validation {
                stage: PipelineStage::Adjudication,
                message,
            }
        })?;
        run.record(StageKind::Adjudication, SectionOutcome::Completed { provider, output });

        Ok(verdict)
    }

    /// Failures degrade to an omitted section; the evaluation policy decides afterwards.
    async fn evaluate(&self, run_id: Uuid, stage: StageKind, payload: Value) -> SectionOutcome {
        let result = self
            .invoke_stage(run_id, stage, payload)
            .await
            .and_then(|(provider, output)| {
                validate_evaluation(stage, &output)
                    .map(|_| (provider, output))
                    .map_err(StageFailure::Validation)
            });
        match result {
            Ok((provider, output)) => SectionOutcome::Completed { provider, output },
            Err(failure) => SectionOutcome::Omitted {
                kind: failure.kind(),
                reason: failure.to_string(),
            },
        }
    }

    /// Calls providers for `stage` in selector order. Moving past a provider that failed
    /// mid-call only happens for stages listed in `fallback_on_error`.
    async fn invoke_stage(
        &self,
        run_id: Uuid,
        stage: StageKind,
        payload: Value,
    ) -> Result<(String, Value), StageFailure> {
        let candidates = self.selector.candidates(stage)?;
        let budget = self.settings.deadlines.budget(stage.operation_class());
        let fallback = self.settings.fallback_on_error.contains(&stage);
        let input = StageInput {
            run_id,
            stage,
            payload,
        };

        let mut last_failure = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let provider = candidate.config.provider_id.clone();
            debug!(%run_id, %stage, %provider, "invoking provider");
            match call_provider(candidate, &input, budget).await {
                Ok(output) => return Ok((provider, output)),
                Err(failure) => {
                    let next = candidates.get(index + 1);
                    match next {
                        Some(next) if fallback => {
                            warn!(
                                %run_id,
                                %stage,
                                %provider,
                                next = %next.config.provider_id,
                                error = %failure,
                                "provider failed; falling back"
                            );
                            last_failure = Some(failure);
                        }
                        _ => return Err(failure),
                    }
                }
            }
        }

        Err(last_failure
            .unwrap_or_else(|| StageFailure::Internal(format!("no provider attempted for `{stage}`"))))
    }

    /// Credits are re-validated atomically here. Plan quotas are not: runs that passed the
    /// gate together are all metered, so a quota can be overshot by the number of runs in
    /// flight when it was last checked.
    async fn charge(&self, caller: &Caller, run_id: Uuid) -> Result<BillingReceipt, PipelineError> {
        match caller.billing {
            BillingModel::Credits => {
                let action = &self.settings.billable_action;
                match self
                    .ledger
                    .use_credits(&caller.user_id, action, &run_id.to_string())
                    .await
                {
                    Ok(usage) => Ok(BillingReceipt::Credits {
                        action: usage.action,
                        credits: usage.credits,
                        remaining_credits: usage.balance.remaining_credits,
                    }),
                    Err(LedgerError::InsufficientCredits { required, remaining }) => {
                        warn!(%run_id, user_id = %caller.user_id, "charge lost a race for the last credits; result discarded");
                        Err(PipelineError::InsufficientCredits {
                            stage: PipelineStage::Charging,
                            required,
                            remaining,
                        })
                    }
                    Err(err) => Err(PipelineError::internal(PipelineStage::Charging, err)),
                }
            }
            BillingModel::PlanQuota => {
                let action = self.settings.usage_action.clone();
                self.usage_events.record(UsageEvent::Increment {
                    user_id: caller.user_id.clone(),
                    action: action.clone(),
                    run_id,
                });
                Ok(BillingReceipt::PlanQuota { action })
            }
        }
    }
}

async fn call_provider(
    candidate: &Candidate,
    input: &StageInput,
    budget: Duration,
) -> Result<Value, StageFailure> {
    let on_timeout = format!(
        "{} via `{}` did not answer within {}s",
        input.stage,
        candidate.config.provider_id,
        budget.as_secs()
    );
    if candidate.adapter.honors_cancellation() {
        with_deadline(
            async {
                candidate
                    .adapter
                    .invoke(input, &candidate.config)
                    .await
                    .map_err(StageFailure::from)
            },
            budget,
            on_timeout,
        )
        .await
    } else {
        let adapter = candidate.adapter.clone();
        let config = candidate.config.clone();
        let input = input.clone();
        spawn_with_deadline(
            async move { adapter.invoke(&input, &config).await.map_err(StageFailure::from) },
            budget,
            on_timeout,
        )
        .await
    }
}

fn validate_evaluation(stage: StageKind, output: &Value) -> Result<(), String> {
    match stage {
        StageKind::AdvocateScoring | StageKind::CriticScoring => output
            .get("score")
            .and_then(Value::as_f64)
            .map(|_| ())
            .ok_or_else(|| format!("{stage} output has no numeric `score`")),
        _ if output.is_object() => Ok(()),
        _ => Err(format!("{stage} output is not a JSON object")),
    }
}
