use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSla {
    pub alert_id: Uuid,
    pub tenant_id: Uuid,
    pub tta_target_secs: Option<i64>,
    pub ttr_target_secs: Option<i64>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub tta_seconds: Option<i64>,
    pub ttr_seconds: Option<i64>,
    pub tta_breached: bool,
    pub ttr_breached: bool,
}

impl AlertSla {
    pub fn new(alert_id: Uuid, tenant_id: Uuid, targets: Option<(i64, i64)>) -> Self {
        Self {
            alert_id,
            tenant_id,
            tta_target_secs: targets.map(|(tta, _)| tta),
            ttr_target_secs: targets.map(|(_, ttr)| ttr),
            acknowledged_at: None,
            resolved_at: None,
            tta_seconds: None,
            ttr_seconds: None,
            tta_breached: false,
            ttr_breached: false,
        }
    }

    pub fn record_ack(&mut self, created_at: DateTime<Utc>, at: DateTime<Utc>) {
        self.acknowledged_at = Some(at);
        let secs = (at - created_at).num_seconds();
        self.tta_seconds = Some(secs);
        self.tta_breached = self.tta_target_secs.is_some_and(|t| secs > t);
    }

    pub fn record_resolve(&mut self, created_at: DateTime<Utc>, at: DateTime<Utc>) {
        self.resolved_at = Some(at);
        let base = self.acknowledged_at.unwrap_or(created_at);
        let secs = (at - base).num_seconds();
        self.ttr_seconds = Some(secs);
        self.ttr_breached = self.ttr_target_secs.is_some_and(|t| secs > t);
    }

    /// Invoked by the minute-cadence SLA sweep on overdue-but-unresolved
    /// alerts (§4.5).
    pub fn mark_overdue(&mut self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.acknowledged_at.is_none() {
            if let Some(target) = self.tta_target_secs {
                let elapsed = (now - created_at).num_seconds();
                if elapsed > target && !self.tta_breached {
                    self.tta_breached = true;
                    changed = true;
                }
            }
        }
        if self.resolved_at.is_none() {
            if let Some(target) = self.ttr_target_secs {
                let base = self.acknowledged_at.unwrap_or(created_at);
                let elapsed = (now - base).num_seconds();
                if elapsed > target && !self.ttr_breached {
                    self.ttr_breached = true;
                    changed = true;
                }
            }
        }
        changed
    }
}
