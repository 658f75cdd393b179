//! Escalation & On-Call (C6). No direct teacher analogue; grounded on the
//! teacher's background-task-with-interval pattern for the timer sweep, and
//! on the severity/escalation vocabulary surveyed from other monitoring
//! examples in the retrieval pack — reimplemented here with typed structs
//! and `rusqlite` persistence rather than an in-memory KV map.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config_db::ConfigDb;
use crate::error::Result;
use crate::models::alert::Alert;
use crate::models::escalation::{EscalationTimer, RecipientResolver};
use crate::models::oncall::OnCallResolution;
use crate::notify::dispatch::Dispatcher;

pub struct Escalation {
    config_db: Arc<ConfigDb>,
    dispatcher: Arc<Dispatcher>,
}

impl Escalation {
    pub fn new(config_db: Arc<ConfigDb>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config_db, dispatcher }
    }

    /// On alert create, find the first policy whose severity set matches
    /// and schedule its tier 1 fire (§4.6).
    pub async fn schedule_initial_tier(&self, alert: &Alert) -> Result<()> {
        let policies = self.config_db.list_policies_for_tenant(alert.tenant_id)?;
        let Some(policy) = policies.iter().find(|p| p.matches(alert.severity)) else {
            return Ok(());
        };
        let Some(tier) = policy.tiers.first() else {
            return Ok(());
        };

        let timer = EscalationTimer {
            id: Uuid::new_v4(),
            tenant_id: alert.tenant_id,
            alert_id: alert.id,
            policy_id: policy.id,
            tier_index: 0,
            fire_at: Utc::now() + chrono::Duration::seconds(tier.wait_secs as i64),
            cancelled: false,
            fired: false,
        };
        self.config_db.create_escalation_timer(&timer)?;
        Ok(())
    }

    /// Cancels all remaining (not-yet-fired) tiers for an alert — called on
    /// ack/resolve/suppress (§4.6).
    pub async fn cancel_for_alert(&self, alert_id: Uuid) -> Result<()> {
        self.config_db.cancel_timers_for_alert(alert_id)?;
        Ok(())
    }

    /// Spawns the escalation timer sweep task. Each iteration re-checks the
    /// alert's current state before dispatching, so cancellation racing a
    /// fire yields at most one spurious notification per tier (§4.6).
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!("escalation sweep failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("escalation timer task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn sweep_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for timer in self.config_db.due_escalation_timers(now)? {
            if let Err(e) = self.fire_timer(timer).await {
                tracing::error!("failed to fire escalation timer: {e:#}");
            }
        }
        Ok(())
    }

    async fn fire_timer(&self, timer: EscalationTimer) -> Result<()> {
        // Re-read current state in the same "transaction" (best-effort here,
        // since the control-plane store is a single-writer Mutex<Connection>)
        // as the dispatch, per §4.6's cancellation-race note.
        let state = self.config_db.current_alert_state(timer.alert_id)?;
        if matches!(state, Some(s) if !s.is_open()) {
            return Ok(());
        }

        self.config_db.mark_timer_fired(timer.id)?;

        let policies = self.config_db.list_policies_for_tenant(timer.tenant_id)?;
        let Some(policy) = policies.iter().find(|p| p.id == timer.policy_id) else {
            return Ok(());
        };
        let Some(tier) = policy.tiers.get(timer.tier_index) else {
            return Ok(());
        };

        let recipients = self.resolve_recipients(&tier.recipient).await?;
        self.dispatcher
            .notify_escalation_tier(timer.tenant_id, timer.alert_id, &tier.channel_action_ids, &recipients)
            .await;

        if let Some(next_tier) = policy.tiers.get(timer.tier_index + 1) {
            let next = EscalationTimer {
                id: Uuid::new_v4(),
                tenant_id: timer.tenant_id,
                alert_id: timer.alert_id,
                policy_id: policy.id,
                tier_index: timer.tier_index + 1,
                fire_at: Utc::now() + chrono::Duration::seconds(next_tier.wait_secs as i64),
                cancelled: false,
                fired: false,
            };
            self.config_db.create_escalation_timer(&next)?;
        }
        Ok(())
    }

    /// Recipient resolution (§4.6): fixed user, role (out of scope to
    /// expand to tenant_users here — represented as the literal role name),
    /// or on-call schedule.
    async fn resolve_recipients(&self, resolver: &RecipientResolver) -> Result<Vec<String>> {
        match resolver {
            RecipientResolver::FixedUser { user_id } => Ok(vec![user_id.to_string()]),
            RecipientResolver::Role { role } => Ok(vec![format!("role:{role}")]),
            RecipientResolver::OnCallSchedule { schedule_id } => {
                let Some(schedule) = self.config_db.get_on_call_schedule(*schedule_id)? else {
                    return Ok(vec![]);
                };
                match schedule.resolve(Utc::now()) {
                    OnCallResolution::Principal(user_id) => Ok(vec![user_id.to_string()]),
                    OnCallResolution::Unassigned => {
                        tracing::warn!(schedule_id = %schedule_id, "on-call schedule resolved to unassigned");
                        Ok(vec![])
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::oncall::{OnCallOverride, OnCallSchedule, RotationUnit};

    #[test]
    fn override_takes_precedence_over_rotation() {
        let now = Utc::now();
        let schedule = OnCallSchedule {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "primary".to_string(),
            rotation: vec![Uuid::new_v4(), Uuid::new_v4()],
            rotation_unit: RotationUnit::Weekly,
            custom_shift_secs: None,
            timezone: chrono_tz::UTC,
            anchor: now - chrono::Duration::days(30),
            overrides: vec![OnCallOverride {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                starts_at: now - chrono::Duration::hours(1),
                ends_at: now + chrono::Duration::hours(1),
            }],
        };
        let resolved = schedule.resolve(now);
        assert_eq!(resolved, OnCallResolution::Principal(schedule.overrides[0].user_id));

        let resolved_later = schedule.resolve(now + chrono::Duration::hours(2));
        assert_ne!(resolved_later, OnCallResolution::Principal(schedule.overrides[0].user_id));
    }
}
