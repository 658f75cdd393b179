//! Rule Engine (C4): periodic evaluation of the four rule families. An
//! interval loop fetches due rules, evaluates each independently, and logs
//! per-rule errors without ever aborting the loop.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::alert_core::AlertCore;
use crate::cache::Cache;
use crate::config::TenantEnforcement;
use crate::config_db::ConfigDb;
use crate::models::rule::{Aggregate, ComparisonOp, EvalOutcome, Rule, RuleParams, StatMeasure};
use crate::models::telemetry::TelemetryRecord;
use crate::models::tenant::TenantStatus;
use crate::telemetry_store::TelemetryStore;

pub struct RuleEngine {
    config_db: Arc<ConfigDb>,
    telemetry: Arc<TelemetryStore>,
    cache: Arc<Cache>,
    alert_core: Arc<AlertCore>,
    max_consecutive_errors: u32,
    tenant_enforcement: TenantEnforcement,
    /// Per-rule guard: two evaluations of the same rule cannot overlap
    /// (§4.4 "Ordering and concurrency").
    guards: DashMap<Uuid, Arc<AsyncMutex<()>>>,
}

impl RuleEngine {
    pub fn new(
        config_db: Arc<ConfigDb>,
        telemetry: Arc<TelemetryStore>,
        cache: Arc<Cache>,
        alert_core: Arc<AlertCore>,
        max_consecutive_errors: u32,
        tenant_enforcement: TenantEnforcement,
    ) -> Self {
        Self {
            config_db,
            telemetry,
            cache,
            alert_core,
            max_consecutive_errors,
            tenant_enforcement,
            guards: DashMap::new(),
        }
    }

    fn guard_for(&self, rule_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.guards
            .entry(rule_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Spawns the scheduler task. Exits when `shutdown` flips to `true`.
    pub fn spawn(
        self: Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            tracing::info!("rule engine scheduler starting, interval={interval_secs}s");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            tracing::error!("rule engine tick failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("rule engine scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let rules = self.fetch_enabled_rules()?;
        let mut by_device: HashMap<Uuid, Vec<Rule>> = HashMap::new();
        for rule in rules {
            by_device.entry(rule.device_id).or_default().push(rule);
        }

        let mut handles = Vec::new();
        for (_device_id, rules) in by_device {
            for rule in rules {
                handles.push(self.evaluate_one(rule));
            }
        }
        futures_util::future::join_all(handles).await;
        Ok(())
    }

    /// Fetches the enabled-rule list per tenant, C2 then C1 (§4.4), and
    /// skips tenants that are suspended under strict enforcement — the
    /// same boundary ingestion applies in `IngestionPipeline::ingest`,
    /// applied here so a suspended tenant's existing rules stop firing
    /// new alerts too (§4.8).
    fn fetch_enabled_rules(&self) -> anyhow::Result<Vec<Rule>> {
        let mut rules = Vec::new();
        for tenant in self.config_db.list_tenants()? {
            if tenant.status == TenantStatus::Suspended
                && matches!(self.tenant_enforcement, TenantEnforcement::Strict)
            {
                continue;
            }

            let key = Cache::rules_enabled_key(tenant.id);
            if let Some(cached) = self.cache.get::<Vec<Rule>>(&key) {
                rules.extend(cached);
                continue;
            }
            let tenant_rules = self.config_db.list_enabled_rules_for_tenant(tenant.id)?;
            self.cache.set(key, &tenant_rules, crate::cache::RULES_ENABLED_TTL);
            rules.extend(tenant_rules);
        }
        Ok(rules)
    }

    async fn evaluate_one(&self, rule: Rule) {
        let guard = self.guard_for(rule.id);
        let _permit = guard.lock().await;

        let outcome = self.evaluate(&rule).await;
        match &outcome {
            EvalOutcome::Fired { metadata } => {
                if let Err(e) = self.config_db.record_rule_eval_ok(rule.id) {
                    tracing::warn!("failed to record eval for rule {}: {e:#}", rule.id);
                }
                if let Err(e) = self
                    .alert_core
                    .handle_fire(&rule, metadata.clone())
                    .await
                {
                    tracing::error!("alert_core failed to handle fire for rule {}: {e:#}", rule.id);
                }
            }
            EvalOutcome::Ok | EvalOutcome::InsufficientData => {
                if let Err(e) = self.config_db.record_rule_eval_ok(rule.id) {
                    tracing::warn!("failed to record eval for rule {}: {e:#}", rule.id);
                }
            }
            EvalOutcome::Error(reason) => {
                tracing::warn!("rule {} errored: {reason}", rule.id);
                match self.config_db.record_rule_eval_error(rule.id) {
                    Ok(count) if count >= self.max_consecutive_errors => {
                        if let Err(e) = self.config_db.disable_rule(rule.id) {
                            tracing::error!("failed to auto-disable rule {}: {e:#}", rule.id);
                        } else {
                            tracing::warn!(rule.id = %rule.id, "rule.auto_disabled");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("failed to record rule error for {}: {e:#}", rule.id),
                }
            }
        }
    }

    /// The evaluation contract (§4.4): `{fired(metadata), ok,
    /// insufficient_data, error(reason)}`.
    async fn evaluate(&self, rule: &Rule) -> EvalOutcome {
        match &rule.params {
            RuleParams::Threshold { op, value } => {
                match self.latest_value(rule.tenant_id, rule.device_id, &rule.metric).await {
                    Ok(Some(record)) => {
                        if op.apply(record.value, *value) {
                            EvalOutcome::Fired {
                                metadata: serde_json::json!({
                                    "metric": rule.metric,
                                    "observed": record.value,
                                    "threshold": value,
                                }),
                            }
                        } else {
                            EvalOutcome::Ok
                        }
                    }
                    Ok(None) => EvalOutcome::InsufficientData,
                    Err(e) => EvalOutcome::Error(e.to_string()),
                }
            }
            RuleParams::Comparison { metric_a, metric_b, op } => {
                let a = self.latest_value(rule.tenant_id, rule.device_id, metric_a).await;
                let b = self.latest_value(rule.tenant_id, rule.device_id, metric_b).await;
                match (a, b) {
                    (Ok(Some(ra)), Ok(Some(rb))) => {
                        if op.apply(ra.value, rb.value) {
                            EvalOutcome::Fired {
                                metadata: serde_json::json!({
                                    "metric_a": metric_a, "value_a": ra.value,
                                    "metric_b": metric_b, "value_b": rb.value,
                                }),
                            }
                        } else {
                            EvalOutcome::Ok
                        }
                    }
                    (Ok(None), Ok(_)) | (Ok(_), Ok(None)) => EvalOutcome::InsufficientData,
                    (Err(e), _) | (_, Err(e)) => EvalOutcome::Error(e.to_string()),
                }
            }
            RuleParams::TimeWindow { window_seconds, aggregate, op, value } => {
                match self.windowed_aggregate(rule, *window_seconds, *aggregate).await {
                    Ok(Some(observed)) => {
                        if op.apply(observed, *value) {
                            EvalOutcome::Fired {
                                metadata: serde_json::json!({
                                    "metric": rule.metric, "observed": observed, "threshold": value,
                                    "window_seconds": window_seconds,
                                }),
                            }
                        } else {
                            EvalOutcome::Ok
                        }
                    }
                    Ok(None) => EvalOutcome::InsufficientData,
                    Err(e) => EvalOutcome::Error(e.to_string()),
                }
            }
            RuleParams::Statistical { window_seconds, aggregate, op, value } => {
                match self
                    .telemetry
                    .mean_and_stddev(rule.tenant_id, rule.device_id, &rule.metric, *window_seconds)
                    .await
                {
                    Ok(Some((mean, stddev))) => {
                        let observed = match aggregate {
                            StatMeasure::Stddev => stddev,
                            StatMeasure::Zscore => {
                                if stddev.abs() < f64::EPSILON {
                                    return EvalOutcome::InsufficientData;
                                }
                                let latest = self
                                    .latest_value(rule.tenant_id, rule.device_id, &rule.metric)
                                    .await;
                                match latest {
                                    Ok(Some(r)) => (r.value - mean) / stddev,
                                    Ok(None) => return EvalOutcome::InsufficientData,
                                    Err(e) => return EvalOutcome::Error(e.to_string()),
                                }
                            }
                        };
                        if op.apply(observed, *value) {
                            EvalOutcome::Fired {
                                metadata: serde_json::json!({
                                    "metric": rule.metric, "observed": observed, "threshold": value,
                                    "mean": mean, "stddev": stddev,
                                }),
                            }
                        } else {
                            EvalOutcome::Ok
                        }
                    }
                    Ok(None) => EvalOutcome::InsufficientData,
                    Err(e) => EvalOutcome::Error(e.to_string()),
                }
            }
        }
    }

    async fn latest_value(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        metric: &str,
    ) -> anyhow::Result<Option<TelemetryRecord>> {
        let key = Cache::device_latest_key(tenant_id, device_id);
        if let Some(cached) = self.cache.get::<HashMap<String, TelemetryRecord>>(&key) {
            if let Some(record) = cached.get(metric) {
                return Ok(Some(record.clone()));
            }
        }
        let record = self.telemetry.latest(tenant_id, device_id, metric).await?;
        if let Some(r) = &record {
            let mut by_metric = self
                .cache
                .get::<HashMap<String, TelemetryRecord>>(&key)
                .unwrap_or_default();
            by_metric.insert(metric.to_string(), r.clone());
            self.cache.set(key, &by_metric, crate::cache::DEVICE_LATEST_TTL);
        }
        Ok(record)
    }

    async fn windowed_aggregate(
        &self,
        rule: &Rule,
        window_seconds: u32,
        aggregate: Aggregate,
    ) -> anyhow::Result<Option<f64>> {
        let key = Cache::aggregate_key(rule.tenant_id, rule.device_id, &rule.metric, window_seconds);
        if let Some(cached) = self.cache.get::<f64>(&key) {
            return Ok(Some(cached));
        }
        let fn_name = match aggregate {
            Aggregate::Avg => "avg",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Sum => "sum",
            Aggregate::Count => "count",
        };
        let value = self
            .telemetry
            .aggregate(rule.tenant_id, rule.device_id, &rule.metric, window_seconds, fn_name)
            .await?;
        if let Some(v) = value {
            let ttl = crate::cache::aggregate_ttl(std::time::Duration::from_secs(window_seconds as u64));
            self.cache.set(key, &v, ttl);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rule::Severity;

    #[test]
    fn comparison_op_threshold_semantics() {
        let op = ComparisonOp::Gt;
        assert!(op.apply(85.0, 80.0));
        assert!(!op.apply(75.0, 80.0));
    }

    #[test]
    fn rule_params_family_name() {
        let p = RuleParams::Threshold { op: ComparisonOp::Gt, value: 80.0 };
        assert_eq!(p.family_name(), "THRESHOLD");
    }

    #[test]
    fn severity_sla_targets_match_table() {
        assert_eq!(Severity::Critical.default_sla_targets(), Some((300, 3600)));
        assert_eq!(Severity::Info.default_sla_targets(), None);
    }
}
