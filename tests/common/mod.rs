#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pitchscope::billing::{
    start_usage_worker, CreditCosts, CreditLedger, PlanQuotas, UsageEventReport, UsageLimiter,
};
use pitchscope::deadline::DeadlineConfig;
use pitchscope::pipeline::{AnalysisPipeline, PipelineSettings, SubmissionInput};
use pitchscope::providers::{
    ProviderAdapter, ProviderConfig, ProviderError, ProviderSelector, StageInput, StageKind,
};
use pitchscope::store::{
    DocumentStore, MemoryStore, StoreError, TransactionFn, TransactionOutcome,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

#[derive(Clone)]
struct Step {
    delay: Duration,
    result: Result<Value, ProviderError>,
}

/// Provider adapter whose answers, failures and latency are scripted per stage.
pub struct ScriptedProvider {
    id: String,
    steps: HashMap<StageKind, Step>,
    cancellable: bool,
    calls: Mutex<Vec<(StageKind, Value)>>,
    finished: AtomicUsize,
}

impl ScriptedProvider {
    /// Answers every stage with a well-formed output.
    pub fn healthy(id: &str) -> Self {
        let ok = |value: Value| Step {
            delay: Duration::ZERO,
            result: Ok(value),
        };
        let steps = HashMap::from([
            (
                StageKind::Extraction,
                ok(json!({"summary": "Seed-stage logistics startup", "traction": "40 pilots"})),
            ),
            (
                StageKind::Research,
                ok(json!({"findings": ["three funded competitors"]})),
            ),
            (StageKind::AdvocateScoring, ok(json!({"score": 84}))),
            (StageKind::CriticScoring, ok(json!({"score": 61}))),
            (
                StageKind::Adjudication,
                ok(json!({"score": 76, "rationale": "credible team, crowded market"})),
            ),
        ]);
        Self {
            id: id.to_string(),
            steps,
            cancellable: true,
            calls: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn respond(mut self, stage: StageKind, output: Value) -> Self {
        self.step(stage).result = Ok(output);
        self
    }

    pub fn fail(mut self, stage: StageKind, status: u16) -> Self {
        let provider = self.id.clone();
        self.step(stage).result = Err(ProviderError::Status {
            provider,
            status,
            body: "upstream unavailable".to_string(),
        });
        self
    }

    pub fn delay(mut self, stage: StageKind, delay: Duration) -> Self {
        self.step(stage).delay = delay;
        self
    }

    /// Reports that dropping `invoke` does not stop it, so the pipeline runs it detached.
    pub fn non_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    fn step(&mut self, stage: StageKind) -> &mut Step {
        self.steps.entry(stage).or_insert(Step {
            delay: Duration::ZERO,
            result: Ok(json!({})),
        })
    }

    pub fn calls(&self) -> Vec<StageKind> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(stage, _)| *stage)
            .collect()
    }

    pub fn payload(&self, stage: StageKind) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(called, _)| *called == stage)
            .map(|(_, payload)| payload.clone())
    }

    /// Calls that ran to completion, including ones whose result was discarded.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn honors_cancellation(&self) -> bool {
        self.cancellable
    }

    async fn invoke(&self, input: &StageInput, _config: &ProviderConfig) -> Result<Value, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((input.stage, input.payload.clone()));
        let step = self.steps.get(&input.stage).cloned().unwrap_or(Step {
            delay: Duration::ZERO,
            result: Ok(json!({})),
        });
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        step.result
    }
}

/// Wraps a store and reports a serialization conflict on the next `conflicts` transactions.
pub struct ConflictingStore {
    inner: MemoryStore,
    remaining_conflicts: AtomicU32,
    always: AtomicBool,
}

impl ConflictingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            remaining_conflicts: AtomicU32::new(0),
            always: AtomicBool::new(false),
        }
    }

    pub fn conflict_next(&self, conflicts: u32) {
        self.remaining_conflicts.store(conflicts, Ordering::SeqCst);
    }

    pub fn conflict_always(&self, enabled: bool) {
        self.always.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for ConflictingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn run_transaction(
        &self,
        key: &str,
        apply: &mut TransactionFn<'_>,
    ) -> Result<TransactionOutcome, StoreError> {
        let scheduled = self
            .remaining_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scheduled || self.always.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict(format!("simulated conflict on {key}")));
        }
        self.inner.run_transaction(key, apply).await
    }

    async fn log(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        self.inner.log(collection).await
    }
}

pub struct Harness {
    pub pipeline: Arc<AnalysisPipeline>,
    pub ledger: CreditLedger,
    pub limiter: UsageLimiter,
    pub reports: UnboundedReceiver<UsageEventReport>,
}

/// Short budgets so deadline tests finish quickly.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        deadlines: DeadlineConfig {
            document_parsing: Duration::from_millis(400),
            chat: Duration::from_millis(300),
            run: Duration::from_secs(3),
        },
        ..PipelineSettings::default()
    }
}

pub fn submission() -> SubmissionInput {
    SubmissionInput {
        transcript: Some("We route freight for regional grocers and cut spoilage by 18%.".to_string()),
        document_text: Some("Slide 1: Problem. Slide 2: Market. Slide 3: Team.".to_string()),
        context: Some(json!({"company": "Coldline"})),
    }
}

pub fn harness(providers: Vec<Arc<ScriptedProvider>>, settings: PipelineSettings) -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()), providers, settings)
}

/// Providers are prioritised in the order given.
pub fn harness_with_store(
    store: Arc<dyn DocumentStore>,
    providers: Vec<Arc<ScriptedProvider>>,
    settings: PipelineSettings,
) -> Harness {
    let configs = providers
        .iter()
        .enumerate()
        .map(|(index, provider)| ProviderConfig::new(provider.provider_id(), index as u32))
        .collect();
    let selector = providers
        .into_iter()
        .fold(ProviderSelector::new(configs), |selector, provider| {
            selector.with_adapter(provider)
        });
    harness_with_selector(store, selector, settings)
}

pub fn harness_with_selector(
    store: Arc<dyn DocumentStore>,
    selector: ProviderSelector,
    settings: PipelineSettings,
) -> Harness {
    let ledger = CreditLedger::new(store.clone(), CreditCosts::default());
    let limiter = UsageLimiter::new(store, PlanQuotas::default());
    let (tx, reports) = unbounded_channel();
    let usage_events = start_usage_worker(limiter.clone(), Some(tx));
    let pipeline = Arc::new(AnalysisPipeline::new(
        ledger.clone(),
        limiter.clone(),
        selector,
        usage_events,
        settings,
    ));
    Harness {
        pipeline,
        ledger,
        limiter,
        reports,
    }
}
