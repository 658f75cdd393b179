use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use clickhouse::Client;
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use beacon_pipeline::alert_core::AlertCore;
use beacon_pipeline::cache::Cache;
use beacon_pipeline::config::PipelineConfig;
use beacon_pipeline::config_db::ConfigDb;
use beacon_pipeline::escalation::Escalation;
use beacon_pipeline::ingestion::{self, IngestionPipeline};
use beacon_pipeline::notify::dispatch::Dispatcher;
use beacon_pipeline::rule_engine::RuleEngine;
use beacon_pipeline::telemetry_store::TelemetryStore;
use beacon_pipeline::tenant::TenantRateLimiters;
use beacon_pipeline::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telemetry_pipeline=debug,tower_http=debug")),
        )
        .init();

    let config_path = std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| "./pipeline.toml".to_string());
    let config = PipelineConfig::load(&config_path)?.apply_env_overrides();

    let config_db = Arc::new(ConfigDb::open(&config.db.dsn)?);
    tracing::info!("config db opened at {}", config.db.dsn);

    let ch = Client::default()
        .with_url(&config.db.clickhouse_url)
        .with_database(&config.db.clickhouse_database)
        .with_user(&config.db.clickhouse_user)
        .with_password(&config.db.clickhouse_password);
    let telemetry = Arc::new(TelemetryStore::new(ch));

    let cache = Arc::new(Cache::new(config.cache.url.is_some(), config.cache.max_entries));
    let rate_limiters = Arc::new(TenantRateLimiters::new(config.webhook.rate_per_second, config.webhook.burst));

    let dispatcher = Arc::new(Dispatcher::new(config_db.clone(), &config));
    let push_registry = dispatcher.push_registry();
    let escalation = Arc::new(Escalation::new(config_db.clone(), dispatcher.clone()));
    let alert_core = Arc::new(AlertCore::new(config_db.clone(), cache.clone(), escalation.clone(), dispatcher.clone()));
    let rule_engine = Arc::new(RuleEngine::new(
        config_db.clone(),
        telemetry.clone(),
        cache.clone(),
        alert_core.clone(),
        config.rule_engine.max_consecutive_errors,
        config.tenant_enforcement,
    ));
    let ingestion_pipeline = Arc::new(IngestionPipeline::new(
        config_db.clone(),
        telemetry.clone(),
        cache.clone(),
        config.tenant_enforcement,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(rule_engine.clone().spawn(config.rule_engine.interval_secs, shutdown_rx.clone()));
    tasks.push(alert_core.clone().spawn_sla_sweep(shutdown_rx.clone()));
    tasks.push(escalation.clone().spawn(shutdown_rx.clone()));
    tasks.push(ingestion::mqtt::spawn(config.mqtt.clone(), ingestion_pipeline.clone(), shutdown_rx.clone()));
    tasks.push(ingestion::coap::spawn(config.coap.clone(), ingestion_pipeline.clone(), shutdown_rx.clone()));
    tasks.push(ingestion::amqp::spawn(config.amqp.clone(), config_db.clone(), ingestion_pipeline.clone(), shutdown_rx.clone()));
    tasks.push(ingestion::opcua::spawn(config.opcua.clone(), config_db.clone(), ingestion_pipeline.clone(), shutdown_rx.clone()));

    let state = AppState {
        config_db,
        cache,
        telemetry,
        rate_limiters,
        push_registry,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/tenants/{tenant_id}/stream", get(push_stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("telemetry pipeline listening on {addr}");

    let serve = axum::serve(listener, app).with_graceful_shutdown(wait_for_ctrl_c());
    serve.await?;

    tracing::info!("shutdown signal received, draining background tasks (grace={}s)", config.shutdown.grace_secs);
    let _ = shutdown_tx.send(true);
    let drain = futures_util::future::join_all(tasks.iter_mut().map(|h| async move { h.await }));
    if tokio::time::timeout(Duration::from_secs(config.shutdown.grace_secs), drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed, aborting remaining tasks");
        for task in &tasks {
            task.abort();
        }
    }

    Ok(())
}

async fn wait_for_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn healthz() -> &'static str {
    "ok"
}

/// Minimal push-stream endpoint (§4.7): replays the last 60 s of events for
/// this tenant, then forwards the live broadcast. Authentication/principal
/// resolution is out of scope for this endpoint surface; a real deployment
/// puts this behind the same `auth -> tenant` chain as every other route.
async fn push_stream(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (replay, rx) = state.push_registry.subscribe(tenant_id).await;

    let replay_stream = stream::iter(replay.into_iter().map(|m| {
        Ok(Event::default().json_data(m).unwrap_or_else(|_| Event::default()))
    }));
    let live_stream = BroadcastStream::new(rx).filter_map(|m| async move {
        match m {
            Ok(message) => Some(Ok(Event::default().json_data(message).unwrap_or_else(|_| Event::default()))),
            Err(_) => None,
        }
    });

    Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::default())
}
