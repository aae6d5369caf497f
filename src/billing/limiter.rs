use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::store::{
    DocumentStore, StoreError, TransactionOutcome, TransactionStep, TransactionWrite,
};

use super::models::{PlanTier, UsageCounter, UsageDecision};

const MAX_INCREMENT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored usage document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("usage counter `{key}` kept conflicting after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Limited(u64),
    Unlimited,
}

/// Per-tier, per-action quotas for one billing period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanQuotas(HashMap<PlanTier, HashMap<String, Quota>>);

impl PlanQuotas {
    pub fn new(table: HashMap<PlanTier, HashMap<String, Quota>>) -> Self {
        Self(table)
    }

    /// Builds the table from the `{tier: {action: limit|null}}` shape used in configuration.
    pub fn from_limits(table: HashMap<PlanTier, HashMap<String, Option<u64>>>) -> Self {
        Self(
            table
                .into_iter()
                .map(|(tier, actions)| {
                    let actions = actions
                        .into_iter()
                        .map(|(action, limit)| {
                            (action, limit.map(Quota::Limited).unwrap_or(Quota::Unlimited))
                        })
                        .collect();
                    (tier, actions)
                })
                .collect(),
        )
    }

    /// `None` means the tier does not include the action at all.
    pub fn quota(&self, tier: PlanTier, action: &str) -> Option<Quota> {
        self.0.get(&tier).and_then(|actions| actions.get(action)).copied()
    }
}

impl Default for PlanQuotas {
    fn default() -> Self {
        let analysis = |quota: Quota| HashMap::from([("analysis".to_string(), quota)]);
        Self(HashMap::from([
            (PlanTier::Free, analysis(Quota::Limited(3))),
            (PlanTier::Starter, analysis(Quota::Limited(10))),
            (PlanTier::Pro, analysis(Quota::Limited(50))),
            (PlanTier::Enterprise, analysis(Quota::Unlimited)),
        ]))
    }
}

/// Stored shape of `subscriptions/{user_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscriptionDocument {
    tier: PlanTier,
    updated_at: DateTime<Utc>,
}

pub fn subscription_key(user_id: &str) -> String {
    format!("subscriptions/{user_id}")
}

/// Calendar-month period label, e.g. `2026-10`.
pub fn period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

pub fn period_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    (start, start + Months::new(1))
}

/// key: usage-limiter -> plan quota gate + meter
///
/// `check_usage` is the gate and runs before any expensive work; `increment_usage` is the
/// meter and only runs after the gated work succeeded.
#[derive(Clone)]
pub struct UsageLimiter {
    store: Arc<dyn DocumentStore>,
    quotas: PlanQuotas,
}

impl UsageLimiter {
    pub fn new(store: Arc<dyn DocumentStore>, quotas: PlanQuotas) -> Self {
        Self { store, quotas }
    }

    pub async fn plan_tier(&self, user_id: &str) -> Result<PlanTier, LimiterError> {
        match self.store.get(&subscription_key(user_id)).await? {
            Some(document) => {
                let subscription: SubscriptionDocument = serde_json::from_value(document)?;
                Ok(subscription.tier)
            }
            None => Ok(PlanTier::Free),
        }
    }

    pub async fn set_plan_tier(&self, user_id: &str, tier: PlanTier) -> Result<(), LimiterError> {
        let document = serde_json::to_value(SubscriptionDocument {
            tier,
            updated_at: Utc::now(),
        })?;
        self.store.set(&subscription_key(user_id), document).await?;
        Ok(())
    }

    pub async fn check_usage(&self, user_id: &str, action: &str) -> Result<UsageDecision, LimiterError> {
        self.check_usage_at(user_id, action, Utc::now()).await
    }

    pub async fn check_usage_at(
        &self,
        user_id: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageDecision, LimiterError> {
        let tier = self.plan_tier(user_id).await?;
        let period = period_key(now);
        let (_, resets_at) = period_bounds(now);
        let used = self.current_count(user_id, &period, action).await?;

        let mut decision = UsageDecision {
            allowed: true,
            message: None,
            action: action.to_string(),
            tier,
            limit: None,
            used,
            remaining: None,
            resets_at,
            upgrade_required: false,
            notes: Vec::new(),
        };

        match self.quotas.quota(tier, action) {
            None => {
                decision.allowed = false;
                decision.limit = Some(0);
                decision.remaining = Some(0);
                decision.upgrade_required = true;
                decision.message = Some(format!(
                    "The {tier} plan does not include {action}. Upgrade your plan to continue."
                ));
                decision.notes.push(format!("usage:quota-missing:{action}"));
            }
            Some(Quota::Unlimited) => {
                decision.notes.push(format!("usage:quota:{action}:unlimited"));
            }
            Some(Quota::Limited(limit)) => {
                decision.limit = Some(limit);
                decision.remaining = Some(limit.saturating_sub(used));
                if used < limit {
                    decision.notes.push(format!("usage:quota:{action}:{used}/{limit}"));
                } else {
                    decision.allowed = false;
                    decision.upgrade_required = true;
                    decision.message = Some(format!(
                        "You have used all {limit} {action} runs included in the {tier} plan this month. Upgrade your plan to continue."
                    ));
                    decision.notes.push(format!("usage:quota-exceeded:{action}"));
                }
            }
        }

        debug!(%user_id, %action, allowed = decision.allowed, used, "usage checked");
        Ok(decision)
    }

    pub async fn increment_usage(&self, user_id: &str, action: &str) -> Result<UsageCounter, LimiterError> {
        self.increment_usage_at(user_id, action, Utc::now()).await
    }

    pub async fn increment_usage_at(
        &self,
        user_id: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter, LimiterError> {
        let period = period_key(now);
        let key = UsageCounter::key(user_id, &period, action);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut malformed: Option<serde_json::Error> = None;
            let outcome = self
                .store
                .run_transaction(&key, &mut |current| {
                    let count = match current.map(counter_from_document).transpose() {
                        Ok(counter) => counter.map(|counter| counter.count).unwrap_or(0),
                        Err(err) => {
                            malformed = Some(err);
                            return TransactionStep::Abort;
                        }
                    };
                    let counter = UsageCounter {
                        user_id: user_id.to_string(),
                        period: period.clone(),
                        action: action.to_string(),
                        count: count.saturating_add(1),
                    };
                    match serde_json::to_value(&counter) {
                        Ok(document) => TransactionStep::Commit(TransactionWrite {
                            document,
                            appends: Vec::new(),
                        }),
                        Err(err) => {
                            malformed = Some(err);
                            TransactionStep::Abort
                        }
                    }
                })
                .await;

            match outcome {
                Ok(TransactionOutcome::Committed(document)) => {
                    return Ok(counter_from_document(&document)?);
                }
                Ok(TransactionOutcome::Aborted) => {
                    return Err(match malformed {
                        Some(err) => LimiterError::Malformed(err),
                        None => LimiterError::Contention { key, attempts: attempt },
                    });
                }
                Err(err) if err.is_conflict() && attempt < MAX_INCREMENT_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                Err(err) if err.is_conflict() => {
                    return Err(LimiterError::Contention { key, attempts: attempt });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn current_count(&self, user_id: &str, period: &str, action: &str) -> Result<u64, LimiterError> {
        let key = UsageCounter::key(user_id, period, action);
        match self.store.get(&key).await? {
            Some(document) => Ok(counter_from_document(&document)?.count),
            None => Ok(0),
        }
    }
}

fn counter_from_document(document: &Value) -> Result<UsageCounter, serde_json::Error> {
    UsageCounter::deserialize(document)
}
