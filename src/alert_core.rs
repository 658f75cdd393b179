//! Alert Core (C5): state machine, SLA targets/sweep, and grouping. Every
//! state transition inserts a row into an append-only history table in
//! addition to updating the alert's current-state column.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::Cache;
use crate::config_db::ConfigDb;
use crate::error::{PipelineError, Result};
use crate::escalation::Escalation;
use crate::models::alert::{Alert, AlertState, AlertStateEvent, TransitionKind};
use crate::models::group::{AlertGroup, GroupingKey, NotifyOn, GROUPING_WINDOW_SECS};
use crate::models::rule::Rule;
use crate::models::sla::AlertSla;
use crate::notify::dispatch::Dispatcher;

pub struct AlertCore {
    config_db: Arc<ConfigDb>,
    cache: Arc<Cache>,
    escalation: Arc<Escalation>,
    dispatcher: Arc<Dispatcher>,
}

impl AlertCore {
    pub fn new(
        config_db: Arc<ConfigDb>,
        cache: Arc<Cache>,
        escalation: Arc<Escalation>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config_db,
            cache,
            escalation,
            dispatcher,
        }
    }

    /// Called by the rule engine on `fired`. Applies deduplication (§4.4):
    /// a rule with an already-open alert does not create a new one.
    pub async fn handle_fire(&self, rule: &Rule, metadata: serde_json::Value) -> Result<()> {
        if self.config_db.find_open_alert_for_rule(rule.id)?.is_some() {
            tracing::debug!(rule.id = %rule.id, "deduplicated: alert already open for rule");
            return Ok(());
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            tenant_id: rule.tenant_id,
            rule_id: Some(rule.id),
            source: None,
            device_id: rule.device_id,
            severity: rule.severity,
            message: format!("rule {} fired on metric {}", rule.id, rule.metric),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.create_alert(alert, rule.params.family_name(), rule.notify_on).await
    }

    /// Create path shared by rule-fired alerts and external-source (ML
    /// anomaly) alerts (§3 "Alert").
    pub async fn create_alert(&self, alert: Alert, rule_family: &str, notify_on: NotifyOn) -> Result<()> {
        self.config_db.create_alert(&alert)?;

        let sla = AlertSla::new(alert.id, alert.tenant_id, alert.severity.default_sla_targets());
        self.config_db.create_alert_sla(&sla)?;

        let group = self.attach_to_group(&alert, rule_family, notify_on).await?;

        self.cache
            .invalidate(&Cache::rules_enabled_key(alert.tenant_id));

        self.escalation.schedule_initial_tier(&alert).await?;

        let now = Utc::now();
        if self.should_notify(&group, now) {
            self.config_db.mark_group_notified(group.id, now)?;
            self.dispatcher.notify_alert_created(&alert).await;
        }
        Ok(())
    }

    /// Applies the group's `notify_on` fan-out policy (§4.5): `First` fires
    /// only for the group's opening occurrence, `Every` fires for every
    /// occurrence, `RateLimited { per_minute }` fires at most once per
    /// `60 / per_minute` seconds since the last notification.
    fn should_notify(&self, group: &AlertGroup, now: chrono::DateTime<Utc>) -> bool {
        match group.notify_on {
            NotifyOn::First => group.occurrence_count <= 1,
            NotifyOn::Every => true,
            NotifyOn::RateLimited { per_minute } => {
                if per_minute == 0 {
                    return false;
                }
                match group.last_notified_at {
                    None => true,
                    Some(last) => {
                        let min_gap_secs = 60.0 / per_minute as f64;
                        (now - last).num_milliseconds() as f64 / 1000.0 >= min_gap_secs
                    }
                }
            }
        }
    }

    /// Grouping key = `(tenant, device, rule_family, metric)` (§4.5).
    /// Returns the group the alert now belongs to (existing or newly
    /// created), which callers inspect to apply `notify_on`.
    async fn attach_to_group(&self, alert: &Alert, rule_family: &str, notify_on: NotifyOn) -> Result<AlertGroup> {
        let metric = alert
            .metadata
            .get("metric")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let key: GroupingKey = (alert.tenant_id, alert.device_id, rule_family.to_string(), metric.clone());

        let now = Utc::now();
        if let Some(mut group) = self.config_db.find_active_group(&key)? {
            let within_window = (now - group.last_occurrence).num_seconds() <= GROUPING_WINDOW_SECS;
            if within_window {
                self.config_db.attach_to_group(group.id, now)?;
                self.config_db.set_alert_group(alert.id, group.id)?;
                group.occurrence_count += 1;
                group.last_occurrence = now;
                return Ok(group);
            }
        }

        let group = AlertGroup {
            id: Uuid::new_v4(),
            tenant_id: alert.tenant_id,
            status: crate::models::group::GroupStatus::Active,
            device_id: alert.device_id,
            rule_family: rule_family.to_string(),
            metric,
            first_occurrence: now,
            last_occurrence: now,
            occurrence_count: 1,
            notify_on,
            last_notified_at: None,
        };
        self.config_db.create_group(&group)?;
        self.config_db.set_alert_group(alert.id, group.id)?;
        Ok(group)
    }

    /// Validates and applies a requested FSM transition (§4.5).
    pub async fn transition(
        &self,
        alert_id: Uuid,
        kind: TransitionKind,
        by_principal: Option<String>,
        note: Option<String>,
    ) -> Result<AlertState> {
        let current = self
            .config_db
            .current_alert_state(alert_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("alert {alert_id}")))?;

        let next = Self::next_state(current, kind)
            .ok_or_else(|| PipelineError::Validation("invalid_state_transition".to_string()))?;

        let at = Utc::now();
        self.config_db.append_alert_state(&AlertStateEvent {
            id: Uuid::new_v4(),
            alert_id,
            state: next,
            by_principal,
            at,
            note,
        })?;

        if let Some(mut sla) = self.config_db.get_alert_sla(alert_id)? {
            match kind {
                TransitionKind::Ack => {
                    let created_at = self.alert_created_at(alert_id)?;
                    sla.record_ack(created_at, at);
                    self.config_db.save_alert_sla(&sla)?;
                }
                TransitionKind::Resolve => {
                    let created_at = self.alert_created_at(alert_id)?;
                    sla.record_resolve(created_at, at);
                    self.config_db.save_alert_sla(&sla)?;
                }
                _ => {}
            }
        }

        if matches!(kind, TransitionKind::Ack | TransitionKind::Resolve | TransitionKind::Suppress) {
            self.escalation.cancel_for_alert(alert_id).await?;
        }

        if next.is_terminal() {
            if let Some(group_id) = self.alert_group_id(alert_id)? {
                self.config_db.close_group_if_all_terminal(group_id)?;
            }
        }

        Ok(next)
    }

    fn alert_created_at(&self, alert_id: Uuid) -> Result<chrono::DateTime<Utc>> {
        self.config_db
            .get_alert(alert_id)?
            .map(|a| a.created_at)
            .ok_or_else(|| PipelineError::NotFound(format!("alert {alert_id}")))
    }

    fn alert_group_id(&self, alert_id: Uuid) -> Result<Option<Uuid>> {
        self.config_db.get_alert_group_id(alert_id)
    }

    fn next_state(current: AlertState, kind: TransitionKind) -> Option<AlertState> {
        use AlertState::*;
        use TransitionKind::*;
        match (current, kind) {
            (New, Ack) => Some(Acknowledged),
            (New, Suppress) => Some(Suppressed),
            (New, Expire) => Some(Expired),
            (New, Resolve) => Some(Resolved),
            (Acknowledged, Investigate) => Some(Investigating),
            (Acknowledged, Resolve) => Some(Resolved),
            (Acknowledged, Expire) => Some(Expired),
            (Investigating, Resolve) => Some(Resolved),
            (Investigating, Expire) => Some(Expired),
            _ => None,
        }
    }

    /// Background SLA sweep (§4.5), run every 60s: marks `tta_breached |
    /// ttr_breached` on overdue-but-unresolved alerts and emits a breach
    /// event (dispatched through the same notifier as alert create).
    pub fn spawn_sla_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!("SLA sweep failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("SLA sweep task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn sweep_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for (alert_id, created_at) in self.config_db.list_unresolved_alert_ids_with_created_at()? {
            let Some(mut sla) = self.config_db.get_alert_sla(alert_id)? else {
                continue;
            };
            if sla.mark_overdue(created_at, now) {
                self.config_db.save_alert_sla(&sla)?;
                self.dispatcher.notify_sla_breached(alert_id, sla.tenant_id).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_forward_only() {
        use AlertState::*;
        use TransitionKind::*;
        assert_eq!(AlertCore::next_state(New, Ack), Some(Acknowledged));
        assert_eq!(AlertCore::next_state(Resolved, Ack), None);
        assert_eq!(AlertCore::next_state(Acknowledged, Ack), None);
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for state in [AlertState::Resolved, AlertState::Suppressed, AlertState::Expired] {
            for kind in [
                TransitionKind::Ack,
                TransitionKind::Investigate,
                TransitionKind::Resolve,
                TransitionKind::Suppress,
                TransitionKind::Expire,
            ] {
                assert_eq!(AlertCore::next_state(state, kind), None);
            }
        }
    }
}
