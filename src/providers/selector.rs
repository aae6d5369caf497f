use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{ProviderAdapter, ProviderConfig, StageKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no usable provider for stage `{stage}` (skipped: {})", skipped.join("; "))]
    NoProvider {
        stage: StageKind,
        skipped: Vec<String>,
    },
}

#[derive(Clone)]
pub struct Candidate {
    pub config: Arc<ProviderConfig>,
    pub adapter: Arc<dyn ProviderAdapter>,
}

/// key: provider-selector -> deterministic primary→secondary order
///
/// Selection only filters out providers that cannot be called at all: disabled, not
/// serving the stage, misconfigured, or without a registered adapter. Call failures are
/// the caller's concern.
#[derive(Clone, Default)]
pub struct ProviderSelector {
    providers: Vec<Arc<ProviderConfig>>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderSelector {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
        self
    }

    pub fn providers(&self) -> &[Arc<ProviderConfig>] {
        &self.providers
    }

    /// Usable providers for `stage`, ordered by ascending priority then provider id.
    pub fn candidates(&self, stage: StageKind) -> Result<Vec<Candidate>, SelectionError> {
        let mut skipped = Vec::new();
        let mut candidates = Vec::new();

        for config in &self.providers {
            if !config.enabled || !config.supports(stage) {
                continue;
            }
            let Some(adapter) = self.adapters.get(&config.provider_id) else {
                skipped.push(format!("{}: no adapter registered", config.provider_id));
                continue;
            };
            if let Some(reason) = config.misconfiguration() {
                skipped.push(format!("{}: {reason}", config.provider_id));
                continue;
            }
            if let Err(reason) = adapter.check_config(config) {
                skipped.push(format!("{}: {reason}", config.provider_id));
                continue;
            }
            candidates.push(Candidate {
                config: config.clone(),
                adapter: adapter.clone(),
            });
        }

        if !skipped.is_empty() {
            debug!(%stage, ?skipped, "providers skipped during selection");
        }
        if candidates.is_empty() {
            return Err(SelectionError::NoProvider { stage, skipped });
        }

        candidates.sort_by(|left, right| {
            left.config
                .priority
                .cmp(&right.config.priority)
                .then_with(|| left.config.provider_id.cmp(&right.config.provider_id))
        });
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderError, StageInput};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo(&'static str);

    #[async_trait]
    impl ProviderAdapter for Echo {
        fn provider_id(&self) -> &str {
            self.0
        }

        async fn invoke(
            &self,
            _input: &StageInput,
            _config: &ProviderConfig,
        ) -> Result<Value, ProviderError> {
            Ok(json!({"provider": self.0}))
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates
            .iter()
            .map(|candidate| candidate.config.provider_id.as_str())
            .collect()
    }

    #[test]
    fn candidates_follow_priority_then_id() {
        let selector = ProviderSelector::new(vec![
            ProviderConfig::new("zeta", 1),
            ProviderConfig::new("beta", 2),
            ProviderConfig::new("alpha", 1),
        ])
        .with_adapter(Arc::new(Echo("zeta")))
        .with_adapter(Arc::new(Echo("beta")))
        .with_adapter(Arc::new(Echo("alpha")));

        let candidates = selector.candidates(StageKind::Extraction).unwrap();
        assert_eq!(ids(&candidates), vec!["alpha", "zeta", "beta"]);
    }

    #[test]
    fn disabled_and_unsupported_providers_are_filtered() {
        let mut disabled = ProviderConfig::new("disabled", 0);
        disabled.enabled = false;
        let mut research_only = ProviderConfig::new("research-only", 0);
        research_only.stages = vec![StageKind::Research];

        let selector = ProviderSelector::new(vec![
            disabled,
            research_only,
            ProviderConfig::new("general", 5),
        ])
        .with_adapter(Arc::new(Echo("disabled")))
        .with_adapter(Arc::new(Echo("research-only")))
        .with_adapter(Arc::new(Echo("general")));

        assert_eq!(
            ids(&selector.candidates(StageKind::Research).unwrap()),
            vec!["research-only", "general"]
        );
        assert_eq!(
            ids(&selector.candidates(StageKind::Adjudication).unwrap()),
            vec!["general"]
        );
    }

    #[test]
    fn misconfigured_providers_are_reported_when_nothing_is_left() {
        let mut keyed = ProviderConfig::new("keyed", 0);
        keyed.credential_env = Some("PITCHSCOPE_SELECTOR_MISSING_KEY".to_string());
        let selector = ProviderSelector::new(vec![keyed.resolve_credential(), ProviderConfig::new("orphan", 1)])
            .with_adapter(Arc::new(Echo("keyed")));

        let err = selector
            .candidates(StageKind::Extraction)
            .err()
            .expect("no usable provider");
        let SelectionError::NoProvider { stage, skipped } = err;
        assert_eq!(stage, StageKind::Extraction);
        assert_eq!(skipped.len(), 2);
        assert!(skipped[0].contains("PITCHSCOPE_SELECTOR_MISSING_KEY"));
        assert!(skipped[1].contains("no adapter registered"));
    }
}
