use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unified telemetry record every ingestion adapter converges on, regardless
/// of transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

/// The on-wire JSON payload shape shared by MQTT/CoAP/AMQP (§6): `{ "ts":
/// <ISO-8601>, "value": <number>, "unit": <string?>, "attrs": <object?> }`.
#[derive(Debug, Deserialize)]
pub struct TelemetryPayload {
    pub ts: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub attrs: serde_json::Map<String, Value>,
}

impl TelemetryPayload {
    pub fn into_record(self, tenant_id: Uuid, device_id: Uuid, metric: String) -> TelemetryRecord {
        TelemetryRecord {
            tenant_id,
            device_id,
            timestamp: self.ts,
            metric,
            value: self.value,
            unit: self.unit,
            attributes: self.attrs,
        }
    }
}

/// Clock-skew tolerance applied to every ingested record (invariant 2).
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 60;

/// Reason a payload was dropped to the dead-letter sink (§4.3 step 3/4).
#[derive(Debug, Clone, Serialize)]
pub enum DeadLetterReason {
    UnknownPeer,
    MalformedPayload(String),
    ClockSkewExceeded,
    MetricNotAllowed(String),
    ValueOutOfRange { metric: String, value: f64 },
    TenantSuspended,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub tenant_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
    pub reason: DeadLetterReason,
    pub raw_payload: String,
}
