use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::rule::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    New,
    Acknowledged,
    Investigating,
    Resolved,
    Suppressed,
    Expired,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Investigating => "INVESTIGATING",
            Self::Resolved => "RESOLVED",
            Self::Suppressed => "SUPPRESSED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "ACKNOWLEDGED" => Some(Self::Acknowledged),
            "INVESTIGATING" => Some(Self::Investigating),
            "RESOLVED" => Some(Self::Resolved),
            "SUPPRESSED" => Some(Self::Suppressed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Suppressed | Self::Expired)
    }

    /// Alert states that count as "already open" for the rule-engine
    /// deduplication check (§4.4).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::Acknowledged | Self::Investigating)
    }
}

/// A requested FSM transition (§4.5). Validity is checked by
/// `AlertState::can_transition_to` in `alert_core`, not here — this is a
/// plain data carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Ack,
    Investigate,
    Resolve,
    Suppress,
    Expire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub source: Option<String>,
    pub device_id: Uuid,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only `alert_states` history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStateEvent {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub state: AlertState,
    pub by_principal: Option<String>,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub transition: String,
    #[serde(default)]
    pub by_principal: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}
