use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;

use crate::billing::{CreditCosts, PlanQuotas, PlanTier};
use crate::deadline::DeadlineConfig;
use crate::pipeline::{EvaluationPolicy, PipelineSettings};
use crate::providers::{ProviderConfig, StageKind};

/// Secret used to verify caller tokens. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// Postgres connection string. When unset the process keeps its documents in memory.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: billing-config -> HMAC key for payment-confirmed purchase notifications
pub static PAYMENT_WEBHOOK_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("PAYMENT_WEBHOOK_SECRET", "PAYMENT_WEBHOOK_SECRET_FILE"));

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| anyhow!("{key} has invalid value `{raw}`: {err}"))
        })
        .transpose()
}

fn json_from<T: DeserializeOwned>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<T>> {
    lookup(key)
        .map(|raw| serde_json::from_str(&raw).with_context(|| format!("failed to parse {key} as JSON")))
        .transpose()
}

fn stage_list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<BTreeSet<StageKind>>> {
    lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| {
                    StageKind::parse(entry).ok_or_else(|| anyhow!("{key} names unknown stage `{entry}`"))
                })
                .collect()
        })
        .transpose()
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(parsed::<u64>(lookup, key)?
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default))
}

impl PipelineSettings {
    /// Snapshot of the pipeline configuration at process start.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(read_optional_env)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = PipelineSettings::default();
        let deadline_defaults = DeadlineConfig::default();

        let deadlines = DeadlineConfig {
            document_parsing: seconds(
                &lookup,
                "DEADLINE_DOCUMENT_PARSING_SECS",
                deadline_defaults.document_parsing,
            )?,
            chat: seconds(&lookup, "DEADLINE_CHAT_SECS", deadline_defaults.chat)?,
            run: seconds(&lookup, "DEADLINE_RUN_SECS", deadline_defaults.run)?,
        };

        let minimum_successes = parsed::<usize>(&lookup, "ANALYSIS_MIN_EVALUATIONS")?
            .unwrap_or(defaults.evaluation.minimum_successes);
        if minimum_successes > StageKind::EVALUATIONS.len() {
            return Err(anyhow!(
                "ANALYSIS_MIN_EVALUATIONS is {minimum_successes} but only {} evaluations run",
                StageKind::EVALUATIONS.len()
            ));
        }
        let required = stage_list(&lookup, "ANALYSIS_REQUIRED_EVALUATIONS")?.unwrap_or_default();
        if let Some(stage) = required
            .iter()
            .find(|stage| !StageKind::EVALUATIONS.contains(stage))
        {
            return Err(anyhow!("ANALYSIS_REQUIRED_EVALUATIONS names non-evaluation stage `{stage}`"));
        }

        let pass_threshold = parsed::<u8>(&lookup, "ANALYSIS_PASS_THRESHOLD")?
            .unwrap_or(defaults.pass_threshold)
            .min(100);

        Ok(Self {
            billable_action: lookup("ANALYSIS_BILLABLE_ACTION").unwrap_or(defaults.billable_action),
            usage_action: lookup("ANALYSIS_USAGE_ACTION").unwrap_or(defaults.usage_action),
            max_input_chars: parsed::<usize>(&lookup, "ANALYSIS_MAX_INPUT_CHARS")?
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.max_input_chars),
            evaluation: EvaluationPolicy {
                minimum_successes,
                required,
            },
            pass_threshold,
            deadlines,
            fallback_on_error: stage_list(&lookup, "ANALYSIS_FALLBACK_STAGES")?
                .unwrap_or(defaults.fallback_on_error),
        })
    }
}

/// key: billing-config -> static credit cost table
pub fn credit_costs_from_env() -> anyhow::Result<CreditCosts> {
    credit_costs_from(read_optional_env)
}

fn credit_costs_from(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<CreditCosts> {
    Ok(json_from::<HashMap<String, u64>>(&lookup, "CREDIT_COSTS")?
        .map(CreditCosts::new)
        .unwrap_or_default())
}

/// key: billing-config -> plan quota table, `null` meaning unlimited
pub fn plan_quotas_from_env() -> anyhow::Result<PlanQuotas> {
    plan_quotas_from(read_optional_env)
}

fn plan_quotas_from(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<PlanQuotas> {
    let Some(raw) = json_from::<HashMap<String, HashMap<String, Option<u64>>>>(&lookup, "PLAN_QUOTAS")? else {
        return Ok(PlanQuotas::default());
    };
    let table = raw
        .into_iter()
        .map(|(tier, actions)| {
            let tier: PlanTier = serde_json::from_value(serde_json::Value::String(tier.clone()))
                .with_context(|| format!("PLAN_QUOTAS names unknown plan tier `{tier}`"))?;
            Ok((tier, actions))
        })
        .collect::<anyhow::Result<HashMap<_, _>>>()?;
    Ok(PlanQuotas::from_limits(table))
}

pub fn ledger_max_attempts_from_env() -> anyhow::Result<u32> {
    Ok(parsed::<u32>(&read_optional_env, "LEDGER_MAX_TRANSACTION_ATTEMPTS")?
        .filter(|attempts| *attempts > 0)
        .unwrap_or(crate::billing::ledger::DEFAULT_MAX_TRANSACTION_ATTEMPTS))
}

/// Provider definitions from `ANALYSIS_PROVIDERS` (inline JSON) or the file named by
/// `ANALYSIS_PROVIDERS_PATH`, with credentials resolved from their env variables.
pub fn providers_from_env() -> anyhow::Result<Vec<ProviderConfig>> {
    let raw = match read_optional_env("ANALYSIS_PROVIDERS") {
        Some(inline) => Some(inline),
        None => match read_optional_env("ANALYSIS_PROVIDERS_PATH") {
            Some(path) => Some(
                fs::read_to_string(&path)
                    .with_context(|| format!("failed to read ANALYSIS_PROVIDERS_PATH from {path}"))?,
            ),
            None => None,
        },
    };
    let Some(raw) = raw else {
        tracing::warn!("no analysis providers configured; every analysis will fail");
        return Ok(Vec::new());
    };
    let providers: Vec<ProviderConfig> =
        serde_json::from_str(&raw).context("failed to parse analysis provider list")?;
    Ok(providers
        .into_iter()
        .map(ProviderConfig::resolve_credential)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::Quota;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn pipeline_settings_default_when_unset() {
        let settings = PipelineSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.max_input_chars, 120_000);
        assert_eq!(settings.evaluation.minimum_successes, 2);
        assert_eq!(settings.pass_threshold, 70);
        assert_eq!(settings.deadlines, DeadlineConfig::default());
        assert!(settings.fallback_on_error.contains(&StageKind::Research));
    }

    #[test]
    fn pipeline_settings_read_overrides() {
        let settings = PipelineSettings::from_lookup(lookup(&[
            ("ANALYSIS_MIN_EVALUATIONS", "3"),
            ("ANALYSIS_REQUIRED_EVALUATIONS", "critic_scoring, advocate_scoring"),
            ("DEADLINE_CHAT_SECS", "5"),
            ("ANALYSIS_FALLBACK_STAGES", "extraction,research"),
        ]))
        .unwrap();
        assert_eq!(settings.evaluation.minimum_successes, 3);
        assert_eq!(
            settings.evaluation.required,
            BTreeSet::from([StageKind::AdvocateScoring, StageKind::CriticScoring])
        );
        assert_eq!(settings.deadlines.chat, Duration::from_secs(5));
        assert!(settings.fallback_on_error.contains(&StageKind::Extraction));
    }

    #[test]
    fn impossible_evaluation_policy_is_rejected() {
        assert!(PipelineSettings::from_lookup(lookup(&[("ANALYSIS_MIN_EVALUATIONS", "4")])).is_err());
        assert!(PipelineSettings::from_lookup(lookup(&[(
            "ANALYSIS_REQUIRED_EVALUATIONS",
            "adjudication"
        )]))
        .is_err());
    }

    #[test]
    fn plan_quotas_parse_tiers_and_unlimited() {
        let quotas = plan_quotas_from(lookup(&[(
            "PLAN_QUOTAS",
            r#"{"starter": {"analysis": 10}, "enterprise": {"analysis": null}}"#,
        )]))
        .unwrap();
        assert_eq!(quotas.quota(PlanTier::Starter, "analysis"), Some(Quota::Limited(10)));
        assert_eq!(quotas.quota(PlanTier::Enterprise, "analysis"), Some(Quota::Unlimited));

        assert!(plan_quotas_from(lookup(&[("PLAN_QUOTAS", r#"{"platinum": {}}"#)])).is_err());
    }

    #[test]
    fn credit_costs_fall_back_to_defaults() {
        let costs = credit_costs_from(lookup(&[])).unwrap();
        assert_eq!(costs.cost("pitch_analysis"), Some(1));

        let costs = credit_costs_from(lookup(&[("CREDIT_COSTS", r#"{"pitch_analysis": 3}"#)])).unwrap();
        assert_eq!(costs.cost("pitch_analysis"), Some(3));
    }
}
