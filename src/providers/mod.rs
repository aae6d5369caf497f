pub mod http;
pub mod selector;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::deadline::OperationClass;

pub use http::HttpProviderAdapter;
pub use selector::{Candidate, ProviderSelector, SelectionError};

/// One provider-backed computation in the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extraction,
    Research,
    AdvocateScoring,
    CriticScoring,
    Adjudication,
}

impl StageKind {
    pub const EVALUATIONS: [StageKind; 3] = [
        StageKind::Research,
        StageKind::AdvocateScoring,
        StageKind::CriticScoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Extraction => "extraction",
            StageKind::Research => "research",
            StageKind::AdvocateScoring => "advocate_scoring",
            StageKind::CriticScoring => "critic_scoring",
            StageKind::Adjudication => "adjudication",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "extraction" => Some(StageKind::Extraction),
            "research" => Some(StageKind::Research),
            "advocate_scoring" => Some(StageKind::AdvocateScoring),
            "critic_scoring" => Some(StageKind::CriticScoring),
            "adjudication" => Some(StageKind::Adjudication),
            _ => None,
        }
    }

    pub fn operation_class(&self) -> OperationClass {
        match self {
            StageKind::Extraction => OperationClass::DocumentParsing,
            _ => OperationClass::Chat,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret material resolved at load time. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// key: provider-config -> static, read-only during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Stages this provider serves; empty serves every stage.
    #[serde(default)]
    pub stages: Vec<StageKind>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the provider credential.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(skip)]
    pub credential: Option<Credential>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>, priority: u32) -> Self {
        Self {
            provider_id: provider_id.into(),
            priority,
            enabled: true,
            stages: Vec::new(),
            endpoint: None,
            model: None,
            credential_env: None,
            credential: None,
        }
    }

    pub fn supports(&self, stage: StageKind) -> bool {
        self.stages.is_empty() || self.stages.contains(&stage)
    }

    pub fn resolve_credential(mut self) -> Self {
        if let Some(var) = &self.credential_env {
            self.credential = std::env::var(var)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(Credential::new);
        }
        self
    }

    /// Why this provider cannot be selected, if anything.
    pub fn misconfiguration(&self) -> Option<String> {
        if let Some(var) = &self.credential_env {
            if self.credential.is_none() {
                return Some(format!("credential `{var}` is not set"));
            }
        }
        if let Some(endpoint) = &self.endpoint {
            if let Err(err) = url::Url::parse(endpoint) {
                return Some(format!("endpoint `{endpoint}` is invalid: {err}"));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageInput {
    pub run_id: Uuid,
    pub stage: StageKind,
    pub payload: Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider `{provider}` request failed: {message}")]
    Transport { provider: String, message: String },
    #[error("provider `{provider}` returned status {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("provider `{provider}` returned an unreadable response: {message}")]
    InvalidResponse { provider: String, message: String },
    #[error("provider `{provider}` is not configured: {reason}")]
    Misconfigured { provider: String, reason: String },
}

/// key: provider-adapter -> one implementation per external provider
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Whether dropping an in-flight `invoke` future actually stops the work. Adapters
    /// that return `false` are run detached and their late results discarded.
    fn honors_cancellation(&self) -> bool {
        true
    }

    /// Adapter-specific configuration requirements beyond `ProviderConfig::misconfiguration`.
    fn check_config(&self, _config: &ProviderConfig) -> Result<(), String> {
        Ok(())
    }

    async fn invoke(&self, input: &StageInput, config: &ProviderConfig) -> Result<Value, ProviderError>;
}
