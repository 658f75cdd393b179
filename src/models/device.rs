use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub device_type: String,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

/// Protocol-level peer identity, resolved to a `(tenant, device)` pair by
/// each ingestion adapter's registration lookup (§4.3 step 2).
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    /// Allow-listed metric names this device may report.
    pub allowed_metrics: Vec<String>,
    /// Optional per-metric `(min, max)` range bound.
    pub metric_bounds: std::collections::HashMap<String, (f64, f64)>,
}
