use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A side-effect reference, owned by the tenant that owns the enclosing
/// rule (§3 "Action").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum Action {
    Email { address: String },
    Webhook { url: String, secret: String },
    Push { channel: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub action: Action,
}

impl Action {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Email { .. } => "EMAIL",
            Self::Webhook { .. } => "WEBHOOK",
            Self::Push { .. } => "PUSH",
        }
    }
}
