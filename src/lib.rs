pub mod alert_core;
pub mod cache;
pub mod config;
pub mod config_db;
pub mod error;
pub mod escalation;
pub mod ingestion;
pub mod models;
pub mod notify;
pub mod rule_engine;
pub mod telemetry_store;
pub mod tenant;

use std::sync::Arc;

use config_db::ConfigDb;
use notify::push::PushRegistry;
use tenant::TenantRateLimiters;

/// Shared application handles, built once in `main` and cloned into every
/// axum handler and background task. No field here is process-global —
/// this struct is the single carrier (§4.8 "never process-global").
#[derive(Clone)]
pub struct AppState {
    pub config_db: Arc<ConfigDb>,
    pub cache: Arc<cache::Cache>,
    pub telemetry: Arc<telemetry_store::TelemetryStore>,
    pub rate_limiters: Arc<TenantRateLimiters>,
    pub push_registry: Arc<PushRegistry>,
}
