mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{fast_settings, harness, ScriptedProvider};
use jsonwebtoken::{encode, EncodingKey, Header};
use pitchscope::billing::{api::sign_payload, PaymentWebhookSecret, PAYMENT_SIGNATURE_HEADER};
use pitchscope::routes;
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

const WEBHOOK_SECRET: &str = "whsec_test";

fn token(claims: Value) -> String {
    std::env::set_var("JWT_SECRET", "secret");
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap()
}

fn founder_token(user_id: &str) -> String {
    token(json!({"sub": user_id, "exp": 9999999999u64}))
}

fn app_with_secret(secret: Option<&str>) -> Router {
    std::env::set_var("JWT_SECRET", "secret");
    let h = harness(vec![Arc::new(ScriptedProvider::healthy("primary"))], fast_settings());
    routes::app(
        h.pipeline,
        PaymentWebhookSecret(secret.map(str::to_string)),
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn analysis_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/analyses")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            json!({"transcript": "We sell route optimisation to grocers."}).to_string(),
        ))
        .unwrap()
}

fn purchase_request(body: &Value, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/credits/purchases")
        .header("content-type", "application/json")
        .header(PAYMENT_SIGNATURE_HEADER, signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn root_responds_ok() {
    let app = app_with_secret(None);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, "Pitchscope API".as_bytes());
}

#[tokio::test]
async fn analysis_without_token_is_an_auth_gate_error() {
    let app = app_with_secret(None);
    let (status, body) = send(&app, analysis_request(None)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["kind"], "auth_gate_error");
    assert_eq!(body["error"]["retryable"], false);
}

#[tokio::test]
async fn analysis_without_credits_asks_for_upgrade() {
    let app = app_with_secret(None);
    let token = founder_token("broke-founder");
    let (status, body) = send(&app, analysis_request(Some(&token))).await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["kind"], "limit_error");
    assert_eq!(body["error"]["stage"], "gating");
    assert_eq!(body["error"]["upgrade_required"], true);
}

#[tokio::test]
async fn signed_purchase_funds_an_analysis() {
    let app = app_with_secret(Some(WEBHOOK_SECRET));
    let token = founder_token("paying-founder");
    let purchase = json!({
        "user_id": "paying-founder",
        "credits": 5,
        "price_cents": 2500,
        "external_ref": "pi_abc"
    });
    let signature = sign_payload(WEBHOOK_SECRET.as_bytes(), purchase.to_string().as_bytes());

    let (status, body) = send(&app, purchase_request(&purchase, &signature)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["outcome"]["outcome"], "applied");

    let (status, body) = send(&app, purchase_request(&purchase, &signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["outcome"], "duplicate");

    let (status, body) = send(&app, analysis_request(Some(&token))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["verdict"]["score"], 76);
    assert_eq!(body["billing"]["model"], "credits");
    assert_eq!(body["billing"]["remaining_credits"], 4);

    let (status, balance) = send(&app, authed_get("/api/credits", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance["total_credits"], 5);
    assert_eq!(balance["used_credits"], 1);

    let (_, history) = send(&app, authed_get("/api/credits/transactions", &token)).await;
    let kinds: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["purchase", "usage"]);
}

#[tokio::test]
async fn purchase_with_bad_signature_is_rejected() {
    let app = app_with_secret(Some(WEBHOOK_SECRET));
    let purchase = json!({"user_id": "mallory", "credits": 500, "external_ref": "pi_forged"});
    let forged = sign_payload(b"guessed", purchase.to_string().as_bytes());

    let (status, _) = send(&app, purchase_request(&purchase, &forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = founder_token("mallory");
    let (_, balance) = send(&app, authed_get("/api/credits", &token)).await;
    assert_eq!(balance["total_credits"], 0);
}

#[tokio::test]
async fn purchase_endpoint_is_disabled_without_secret() {
    let app = app_with_secret(None);
    let purchase = json!({"user_id": "u", "credits": 1, "external_ref": "pi_1"});
    let signature = sign_payload(b"anything", purchase.to_string().as_bytes());

    let (status, _) = send(&app, purchase_request(&purchase, &signature)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn organization_member_sees_plan_usage() {
    let app = app_with_secret(None);
    let token = token(json!({"sub": "member-9", "org": "acme", "exp": 9999999999u64}));

    let (status, decision) = send(&app, authed_get("/api/usage/analysis", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["allowed"], true);
    assert_eq!(decision["tier"], "free");
    assert_eq!(decision["limit"], 3);

    let (status, body) = send(&app, analysis_request(Some(&token))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["billing"], json!({"model": "plan_quota", "action": "analysis"}));
}
