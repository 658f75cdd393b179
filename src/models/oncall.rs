use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationUnit {
    Daily,
    Weekly,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnCallOverride {
    pub id: Uuid,
    pub user_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl OnCallOverride {
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.starts_at && instant < self.ends_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnCallSchedule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub rotation: Vec<Uuid>,
    pub rotation_unit: RotationUnit,
    /// Custom-unit shift length; ignored for Daily/Weekly.
    pub custom_shift_secs: Option<i64>,
    pub timezone: chrono_tz::Tz,
    pub anchor: DateTime<Utc>,
    /// Overrides take precedence in definition order (§4.6).
    pub overrides: Vec<OnCallOverride>,
}

/// Resolution result for `(schedule, instant)` (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnCallResolution {
    Principal(Uuid),
    Unassigned,
}

impl OnCallSchedule {
    fn rotation_slot(&self, instant: DateTime<Utc>) -> OnCallResolution {
        if self.rotation.is_empty() {
            return OnCallResolution::Unassigned;
        }
        let shift_secs = match self.rotation_unit {
            RotationUnit::Daily => 86_400,
            RotationUnit::Weekly => 7 * 86_400,
            RotationUnit::Custom => self.custom_shift_secs.unwrap_or(86_400).max(1),
        };
        let elapsed = (instant - self.anchor).num_seconds();
        if elapsed < 0 {
            return OnCallResolution::Unassigned;
        }
        let slot = (elapsed / shift_secs) as usize % self.rotation.len();
        OnCallResolution::Principal(self.rotation[slot])
    }

    /// Apply overrides (in definition order, first match wins) on top of
    /// the base rotation slot.
    pub fn resolve(&self, instant: DateTime<Utc>) -> OnCallResolution {
        for ov in &self.overrides {
            if ov.covers(instant) {
                return OnCallResolution::Principal(ov.user_id);
            }
        }
        self.rotation_slot(instant)
    }
}
