use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// key: billing-models -> credits,transactions,usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredits {
    pub user_id: String,
    pub total_credits: u64,
    pub used_credits: u64,
    pub remaining_credits: u64,
}

impl UserCredits {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_credits: 0,
            used_credits: 0,
            remaining_credits: 0,
        }
    }

    /// `total = used + remaining` holds for every stored snapshot.
    pub fn is_balanced(&self) -> bool {
        self.used_credits.checked_add(self.remaining_credits) == Some(self.total_credits)
    }
}

/// Append-only audit record. Usage entries carry the charged resource; purchase entries
/// carry the payment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreditTransaction {
    Usage {
        user_id: String,
        action: String,
        credits: u64,
        resource_id: String,
        timestamp: DateTime<Utc>,
    },
    Purchase {
        user_id: String,
        credits: u64,
        price_cents: u64,
        source: String,
        external_ref: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditUsage {
    pub user_id: String,
    pub action: String,
    pub credits: u64,
    pub resource_id: String,
    pub balance: UserCredits,
    pub charged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "balance", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Applied(UserCredits),
    /// The payment reference was already credited; the balance is unchanged.
    Duplicate(UserCredits),
}

impl PurchaseOutcome {
    pub fn balance(&self) -> &UserCredits {
        match self {
            PurchaseOutcome::Applied(balance) | PurchaseOutcome::Duplicate(balance) => balance,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            PlanTier::Free => "Free",
            PlanTier::Starter => "Starter",
            PlanTier::Pro => "Pro",
            PlanTier::Enterprise => "Enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// key: usage-counter -> per user, per period, per action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub user_id: String,
    pub period: String,
    pub action: String,
    pub count: u64,
}

impl UsageCounter {
    pub fn key(user_id: &str, period: &str, action: &str) -> String {
        format!("usage/{user_id}/{period}/{action}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub action: String,
    pub tier: PlanTier,
    /// `None` means unlimited.
    pub limit: Option<u64>,
    pub used: u64,
    pub remaining: Option<u64>,
    pub resets_at: DateTime<Utc>,
    pub upgrade_required: bool,
    pub notes: Vec<String>,
}
