use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Closed,
}

/// `notify_on` policy for an active group's fan-out (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOn {
    First,
    Every,
    RateLimited { per_minute: u32 },
}

impl Default for NotifyOn {
    fn default() -> Self {
        Self::First
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertGroup {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: GroupStatus,
    pub device_id: Uuid,
    pub rule_family: String,
    pub metric: String,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub occurrence_count: u64,
    #[serde(default)]
    pub notify_on: NotifyOn,
    /// Last time this group actually fanned out a notification, used by
    /// `NotifyOn::RateLimited` to decide whether enough time has passed.
    #[serde(default)]
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// Grouping key = `(tenant, device, rule_family, metric)` (§4.5).
pub type GroupingKey = (Uuid, Uuid, String, String);

pub const GROUPING_WINDOW_SECS: i64 = 5 * 60;
