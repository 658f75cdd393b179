use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rule::Severity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecipientResolver {
    FixedUser { user_id: Uuid },
    Role { role: String },
    OnCallSchedule { schedule_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTier {
    pub wait_secs: u32,
    pub channel_action_ids: Vec<Uuid>,
    pub recipient: RecipientResolver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub applies_to_severities: Vec<Severity>,
    pub tiers: Vec<EscalationTier>,
}

impl EscalationPolicy {
    pub fn matches(&self, severity: Severity) -> bool {
        self.applies_to_severities.contains(&severity)
    }
}

/// A scheduled tier fire, persisted so the escalation timer survives a
/// restart (§4.6 timeline, `escalation_timers` table in §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTimer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub alert_id: Uuid,
    pub policy_id: Uuid,
    pub tier_index: usize,
    pub fire_at: DateTime<Utc>,
    pub cancelled: bool,
    pub fired: bool,
}
