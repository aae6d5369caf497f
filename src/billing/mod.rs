pub mod api;
pub mod ledger;
pub mod limiter;
pub mod models;
pub mod usage_events;

pub use api::{
    check_usage as billing_check_usage, get_balance as billing_get_balance,
    list_transactions as billing_list_transactions, purchase_webhook as billing_purchase_webhook,
    PaymentWebhookSecret, PurchaseRequest, PurchaseResponse, PAYMENT_SIGNATURE_HEADER,
};
pub use ledger::{CreditCosts, CreditLedger, LedgerError};
pub use limiter::{PlanQuotas, Quota, LimiterError, UsageLimiter};
pub use models::{
    CreditTransaction, CreditUsage, PlanTier, PurchaseOutcome, UsageCounter, UsageDecision,
    UserCredits,
};
pub use usage_events::{start_usage_worker, UsageEvent, UsageEventHandle, UsageEventReport};
