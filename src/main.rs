use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use pitchscope::billing::{start_usage_worker, CreditLedger, PaymentWebhookSecret, UsageLimiter};
use pitchscope::config;
use pitchscope::pipeline::{AnalysisPipeline, PipelineSettings};
use pitchscope::providers::{HttpProviderAdapter, ProviderSelector};
use pitchscope::routes;
use pitchscope::store::{DocumentStore, MemoryStore, PgDocumentStore};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn document_store() -> anyhow::Result<Arc<dyn DocumentStore>> {
    let Some(db_url) = config::DATABASE_URL.as_deref() else {
        tracing::warn!("DATABASE_URL not set; balances and usage are kept in memory");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("failed to connect to Postgres")?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("database migrations failed");
        }
    }
    Ok(Arc::new(PgDocumentStore::new(pool)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let settings = PipelineSettings::from_env()?;
    let store = document_store().await?;
    let ledger = CreditLedger::new(store.clone(), config::credit_costs_from_env()?)
        .with_max_attempts(config::ledger_max_attempts_from_env()?);
    let limiter = UsageLimiter::new(store, config::plan_quotas_from_env()?);

    let providers = config::providers_from_env()?;
    let selector = providers.iter().fold(
        ProviderSelector::new(providers.clone()),
        |selector, provider| {
            selector.with_adapter(Arc::new(HttpProviderAdapter::new(
                provider.provider_id.clone(),
            )))
        },
    );
    tracing::info!(providers = providers.len(), "analysis providers loaded");

    let usage_events = start_usage_worker(limiter.clone(), None);
    let pipeline = Arc::new(AnalysisPipeline::new(
        ledger,
        limiter,
        selector,
        usage_events,
        settings,
    ));

    let webhook_secret = PaymentWebhookSecret(config::PAYMENT_WEBHOOK_SECRET.clone());
    let app = routes::with_metrics(routes::app(pipeline, webhook_secret));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
