use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Trial,
}

impl TenantStatus {
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "trial" => Some(Self::Trial),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Trial => "trial",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantQuotas {
    pub max_devices: u64,
    pub max_users: u64,
    pub max_telemetry_points_per_day: u64,
}

impl Default for TenantQuotas {
    fn default() -> Self {
        Self {
            max_devices: 100,
            max_users: 10,
            max_telemetry_points_per_day: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub status: TenantStatus,
    pub tier: String,
    pub quotas: TenantQuotas,
    /// Free-form flags such as `ml_anomaly_detection`, `advanced_alerting`.
    pub features: Vec<String>,
}

impl Tenant {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

/// The `{tenant_id, tier, features, quotas}` bundle carried explicitly
/// through every boundary call — never a process global.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub tier: String,
    pub status: TenantStatus,
    pub features: Vec<String>,
    pub quotas: TenantQuotas,
}

impl TenantContext {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TenantStatus::Active | TenantStatus::Trial)
    }
}

impl From<&Tenant> for TenantContext {
    fn from(t: &Tenant) -> Self {
        Self {
            tenant_id: t.id,
            tier: t.tier.clone(),
            status: t.status,
            features: t.features.clone(),
            quotas: t.quotas.clone(),
        }
    }
}

/// A kind of quota-bounded resource, used by `TenantContext` quota checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Devices,
    Users,
    TelemetryPointsPerDay,
}
