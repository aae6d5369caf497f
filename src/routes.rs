use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use axum_prometheus::PrometheusMetricLayer;

use crate::billing::{self, PaymentWebhookSecret};
use crate::pipeline::{self, AnalysisPipeline};

async fn root() -> &'static str {
    "Pitchscope API"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/analyses", post(pipeline::create_analysis))
        .route("/api/credits", get(billing::billing_get_balance))
        .route(
            "/api/credits/transactions",
            get(billing::billing_list_transactions),
        )
        .route(
            "/api/credits/purchases",
            post(billing::billing_purchase_webhook),
        )
        .route("/api/usage/:action", get(billing::billing_check_usage))
}

/// Full application router with every shared service attached as an extension.
pub fn app(pipeline: Arc<AnalysisPipeline>, webhook_secret: PaymentWebhookSecret) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(pipeline.ledger().clone()))
        .layer(Extension(pipeline.limiter().clone()))
        .layer(Extension(webhook_secret))
        .layer(Extension(pipeline))
}

/// Adds request metrics and `GET /metrics`. Installs the global recorder, so call it once
/// per process.
pub fn with_metrics(app: Router) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    app.route(
        "/metrics",
        get(move || async move { metrics_handle.render() }),
    )
    .layer(prometheus_layer)
}
