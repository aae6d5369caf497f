use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::{CreditLedger, CreditTransaction, PurchaseOutcome, UsageDecision, UsageLimiter, UserCredits};

pub const PAYMENT_SIGNATURE_HEADER: &str = "x-payment-signature";

/// Shared secret the payment processor signs purchase notifications with.
#[derive(Clone, Default)]
pub struct PaymentWebhookSecret(pub Option<String>);

/// key: billing-api -> rest endpoints
pub async fn get_balance(
    Extension(ledger): Extension<CreditLedger>,
    AuthUser { user_id, .. }: AuthUser,
) -> AppResult<Json<UserCredits>> {
    Ok(Json(ledger.get_balance(&user_id).await?))
}

pub async fn list_transactions(
    Extension(ledger): Extension<CreditLedger>,
    AuthUser { user_id, .. }: AuthUser,
) -> AppResult<Json<Vec<CreditTransaction>>> {
    Ok(Json(ledger.transactions(&user_id).await?))
}

pub async fn check_usage(
    Extension(limiter): Extension<UsageLimiter>,
    AuthUser { user_id, .. }: AuthUser,
    Path(action): Path<String>,
) -> AppResult<Json<UsageDecision>> {
    Ok(Json(limiter.check_usage(&user_id, &action).await?))
}

/// Payment-confirmed purchase notification. The signature check here is the payment
/// verification the ledger itself does not perform.
pub async fn purchase_webhook(
    Extension(ledger): Extension<CreditLedger>,
    Extension(secret): Extension<PaymentWebhookSecret>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<PurchaseResponse>)> {
    let Some(secret) = secret.0 else {
        return Err(AppError::NotFound);
    };

    let signature = headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .ok_or(AppError::BadRequest("Missing signature".into()))?
        .to_str()
        .map_err(|_| AppError::BadRequest("Bad signature".into()))?;
    if !signature_matches(secret.as_bytes(), &body, signature) {
        warn!("purchase webhook signature mismatch");
        return Err(AppError::Unauthorized);
    }

    let request: PurchaseRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid purchase payload: {err}")))?;
    let outcome = ledger
        .purchase_credits(
            &request.user_id,
            request.credits,
            request.price_cents,
            &request.source,
            Some(request.external_ref.as_str()),
        )
        .await?;

    let status = match outcome {
        PurchaseOutcome::Applied(_) => StatusCode::CREATED,
        PurchaseOutcome::Duplicate(_) => StatusCode::OK,
    };
    Ok((status, Json(PurchaseResponse { outcome })))
}

pub fn sign_payload(secret: &[u8], body: &[u8]) -> String {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(secret).expect("HMAC can use any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn signature_matches(secret: &[u8], body: &[u8], provided: &str) -> bool {
    let Some(provided) = provided.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: String,
    pub credits: u64,
    #[serde(default)]
    pub price_cents: u64,
    #[serde(default = "default_purchase_source")]
    pub source: String,
    pub external_ref: String,
}

fn default_purchase_source() -> String {
    "checkout".to_string()
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    pub outcome: PurchaseOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_and_rejects_tampering() {
        let body = br#"{"user_id":"u-1","credits":5,"external_ref":"pi_1"}"#;
        let signature = sign_payload(b"whsec", body);
        assert!(signature_matches(b"whsec", body, &signature));
        assert!(!signature_matches(b"other", body, &signature));
        assert!(!signature_matches(b"whsec", b"{}", &signature));
        assert!(!signature_matches(b"whsec", body, "sha256=zz"));
    }
}
