use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::store::{
    DocumentStore, LogEntry, StoreError, TransactionOutcome, TransactionStep, TransactionWrite,
};

use super::models::{CreditTransaction, CreditUsage, PurchaseOutcome, UserCredits};

pub const DEFAULT_MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Most recent charge markers kept on an account for duplicate-charge detection.
pub const CHARGE_MARKER_RETENTION: usize = 256;
/// Most recent payment references kept on an account for webhook replay detection.
pub const PURCHASE_REF_RETENTION: usize = 1024;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: {required} required, {remaining} remaining")]
    InsufficientCredits { required: u64, remaining: u64 },
    #[error("unknown billable action `{0}`")]
    UnknownAction(String),
    #[error("`{resource_id}` was already charged for `{action}`")]
    DuplicateCharge { action: String, resource_id: String },
    #[error("credit amount must be positive and fit the balance")]
    InvalidAmount,
    #[error("ledger transaction for `{user_id}` kept conflicting after {attempts} attempts")]
    Contention { user_id: String, attempts: u32 },
    #[error("ledger transaction aborted without a reason")]
    Aborted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored credit account is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Static per-action credit prices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditCosts(HashMap<String, u64>);

impl CreditCosts {
    pub fn new(costs: HashMap<String, u64>) -> Self {
        Self(costs)
    }

    pub fn cost(&self, action: &str) -> Option<u64> {
        self.0.get(action).copied()
    }
}

impl Default for CreditCosts {
    fn default() -> Self {
        Self(HashMap::from([("pitch_analysis".to_string(), 1)]))
    }
}

/// Stored shape of `credits/{user_id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CreditAccount {
    total_credits: u64,
    used_credits: u64,
    remaining_credits: u64,
    /// Recent `{action}:{resource_id}` pairs already charged, oldest first.
    #[serde(default)]
    charged: VecDeque<String>,
    /// Recent payment references, oldest first.
    #[serde(default)]
    purchase_refs: VecDeque<String>,
}

/// Appends `marker`, evicting the oldest entries past `retention`.
fn remember(markers: &mut VecDeque<String>, marker: String, retention: usize) {
    markers.push_back(marker);
    while markers.len() > retention {
        markers.pop_front();
    }
}

impl CreditAccount {
    fn snapshot(&self, user_id: &str) -> UserCredits {
        UserCredits {
            user_id: user_id.to_string(),
            total_credits: self.total_credits,
            used_credits: self.used_credits,
            remaining_credits: self.remaining_credits,
        }
    }
}

pub fn account_key(user_id: &str) -> String {
    format!("credits/{user_id}")
}

pub fn transactions_key(user_id: &str) -> String {
    format!("credit_transactions/{user_id}")
}

/// key: credit-ledger -> pay-per-use balances
///
/// Every mutation of a user's balance goes through one store transaction keyed by the
/// user, so concurrent charges serialize and the balance never goes negative.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn DocumentStore>,
    costs: CreditCosts,
    max_attempts: u32,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn DocumentStore>, costs: CreditCosts) -> Self {
        Self {
            store,
            costs,
            max_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn cost(&self, action: &str) -> Result<u64, LedgerError> {
        self.costs
            .cost(action)
            .ok_or_else(|| LedgerError::UnknownAction(action.to_string()))
    }

    /// Missing accounts read as a zero balance and are not created.
    pub async fn get_balance(&self, user_id: &str) -> Result<UserCredits, LedgerError> {
        match self.store.get(&account_key(user_id)).await? {
            Some(document) => {
                let account: CreditAccount = serde_json::from_value(document)?;
                Ok(account.snapshot(user_id))
            }
            None => Ok(UserCredits::empty(user_id)),
        }
    }

    pub async fn has_enough_credits(&self, user_id: &str, action: &str) -> Result<bool, LedgerError> {
        let cost = self.cost(action)?;
        let balance = self.get_balance(user_id).await?;
        Ok(balance.remaining_credits >= cost)
    }

    /// Atomically verifies and deducts the cost of `action`, appending a usage record.
    ///
    /// A repeated `(action, resource_id)` is rejected while it is among the last
    /// [`CHARGE_MARKER_RETENTION`] charges of the account, which keeps the account document
    /// the same size however many runs a user pays for.
    pub async fn use_credits(
        &self,
        user_id: &str,
        action: &str,
        resource_id: &str,
    ) -> Result<CreditUsage, LedgerError> {
        let cost = self.cost(action)?;
        let charge_key = format!("{action}:{resource_id}");
        let charged_at = Utc::now();

        let balance = self
            .transact(user_id, |account| {
                if account.charged.contains(&charge_key) {
                    return Err(LedgerError::DuplicateCharge {
                        action: action.to_string(),
                        resource_id: resource_id.to_string(),
                    });
                }
                if account.remaining_credits < cost {
                    return Err(LedgerError::InsufficientCredits {
                        required: cost,
                        remaining: account.remaining_credits,
                    });
                }
                account.used_credits += cost;
                account.remaining_credits -= cost;
                remember(&mut account.charged, charge_key.clone(), CHARGE_MARKER_RETENTION);
                Ok(vec![CreditTransaction::Usage {
                    user_id: user_id.to_string(),
                    action: action.to_string(),
                    credits: cost,
                    resource_id: resource_id.to_string(),
                    timestamp: charged_at,
                }])
            })
            .await?;

        debug!(%user_id, %action, %resource_id, remaining = balance.remaining_credits, "credits charged");
        Ok(CreditUsage {
            user_id: user_id.to_string(),
            action: action.to_string(),
            credits: cost,
            resource_id: resource_id.to_string(),
            balance,
            charged_at,
        })
    }

    /// Credits a confirmed payment. Payment verification is the caller's job; a repeated
    /// `external_ref` is recognised and leaves the balance untouched.
    ///
    /// References are scoped to the account: the same `external_ref` posted for two users
    /// credits both, so the payment processor must bind a reference to one user. Only the
    /// last [`PURCHASE_REF_RETENTION`] references of an account are remembered.
    pub async fn purchase_credits(
        &self,
        user_id: &str,
        amount: u64,
        price_cents: u64,
        source: &str,
        external_ref: Option<&str>,
    ) -> Result<PurchaseOutcome, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let timestamp = Utc::now();
        let mut duplicate = false;

        let result = self
            .transact(user_id, |account| {
                if let Some(reference) = external_ref {
                    if account.purchase_refs.iter().any(|seen| seen == reference) {
                        duplicate = true;
                        return Err(LedgerError::Aborted);
                    }
                    remember(
                        &mut account.purchase_refs,
                        reference.to_string(),
                        PURCHASE_REF_RETENTION,
                    );
                }
                account.total_credits = account
                    .total_credits
                    .checked_add(amount)
                    .ok_or(LedgerError::InvalidAmount)?;
                account.remaining_credits = account
                    .remaining_credits
                    .checked_add(amount)
                    .ok_or(LedgerError::InvalidAmount)?;
                Ok(vec![CreditTransaction::Purchase {
                    user_id: user_id.to_string(),
                    credits: amount,
                    price_cents,
                    source: source.to_string(),
                    external_ref: external_ref.map(str::to_string),
                    timestamp,
                }])
            })
            .await;

        match result {
            Ok(balance) => {
                info!(%user_id, amount, %source, "credits purchased");
                Ok(PurchaseOutcome::Applied(balance))
            }
            Err(LedgerError::Aborted) if duplicate => {
                info!(%user_id, external_ref = ?external_ref, "duplicate purchase reference ignored");
                Ok(PurchaseOutcome::Duplicate(self.get_balance(user_id).await?))
            }
            Err(err) => Err(err),
        }
    }

    /// Promotional or administrative top-up, recorded as a zero-price purchase.
    pub async fn grant_credits(
        &self,
        user_id: &str,
        amount: u64,
        source: &str,
    ) -> Result<UserCredits, LedgerError> {
        let outcome = self
            .purchase_credits(user_id, amount, 0, source, None)
            .await?;
        Ok(outcome.balance().clone())
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<CreditTransaction>, LedgerError> {
        self.store
            .log(&transactions_key(user_id))
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(LedgerError::from))
            .collect()
    }

    async fn transact<F>(&self, user_id: &str, mut mutate: F) -> Result<UserCredits, LedgerError>
    where
        F: FnMut(&mut CreditAccount) -> Result<Vec<CreditTransaction>, LedgerError> + Send,
    {
        let key = account_key(user_id);
        let log_key = transactions_key(user_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut rejection: Option<LedgerError> = None;
            let outcome = self
                .store
                .run_transaction(&key, &mut |current| {
                    let mut account = match current {
                        Some(document) => {
                            match serde_json::from_value::<CreditAccount>(document.clone()) {
                                Ok(account) => account,
                                Err(err) => {
                                    rejection = Some(err.into());
                                    return TransactionStep::Abort;
                                }
                            }
                        }
                        None => CreditAccount::default(),
                    };

                    let entries = match mutate(&mut account) {
                        Ok(entries) => entries,
                        Err(err) => {
                            rejection = Some(err);
                            return TransactionStep::Abort;
                        }
                    };

                    let write = serde_json::to_value(&account).and_then(|document| {
                        let appends = entries
                            .iter()
                            .map(|entry| {
                                serde_json::to_value(entry).map(|value| LogEntry {
                                    collection: log_key.clone(),
                                    value,
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(TransactionWrite { document, appends })
                    });

                    match write {
                        Ok(write) => TransactionStep::Commit(write),
                        Err(err) => {
                            rejection = Some(err.into());
                            TransactionStep::Abort
                        }
                    }
                })
                .await;

            match outcome {
                Ok(TransactionOutcome::Committed(document)) => {
                    let account: CreditAccount = serde_json::from_value(document)?;
                    return Ok(account.snapshot(user_id));
                }
                Ok(TransactionOutcome::Aborted) => {
                    return Err(rejection.unwrap_or(LedgerError::Aborted));
                }
                Err(err) if err.is_conflict() && attempt < self.max_attempts => {
                    debug!(%user_id, attempt, "ledger transaction conflicted; retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                Err(err) if err.is_conflict() => {
                    error!(%user_id, attempts = attempt, "ledger transaction conflict retries exhausted");
                    return Err(LedgerError::Contention {
                        user_id: user_id.to_string(),
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
