//! Shared ingestion steps 2-5 (§4.3), run after each adapter's own
//! protocol-specific peer authentication (step 1). Every adapter converges
//! on this one function so the validation and dead-letter rules are
//! enforced identically regardless of transport.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::cache::Cache;
use crate::config::TenantEnforcement;
use crate::config_db::ConfigDb;
use crate::models::telemetry::{
    DeadLetterEntry, DeadLetterReason, TelemetryPayload, CLOCK_SKEW_TOLERANCE_SECS,
};
use crate::tenant::{self, Principal};
use crate::telemetry_store::TelemetryStore;

pub struct IngestionPipeline {
    config_db: Arc<ConfigDb>,
    telemetry: Arc<TelemetryStore>,
    cache: Arc<Cache>,
    tenant_enforcement: TenantEnforcement,
}

impl IngestionPipeline {
    pub fn new(
        config_db: Arc<ConfigDb>,
        telemetry: Arc<TelemetryStore>,
        cache: Arc<Cache>,
        tenant_enforcement: TenantEnforcement,
    ) -> Self {
        Self { config_db, telemetry, cache, tenant_enforcement }
    }

    /// Runs steps 2-5 of §4.3 for one raw reading from one metric on one
    /// peer. `peer_key` is the protocol-specific identity the adapter
    /// already authenticated in step 1.
    pub async fn ingest(&self, peer_key: &str, metric: &str, raw_payload: &[u8]) {
        let registration = match self.config_db.find_device_registration_by_peer(peer_key) {
            Ok(Some(r)) => r,
            Ok(None) => {
                self.dead_letter(None, None, DeadLetterReason::UnknownPeer, raw_payload);
                return;
            }
            Err(e) => {
                tracing::error!("registration lookup failed for peer {peer_key}: {e:#}");
                return;
            }
        };

        // Every ingested point is a tenant-scoped write, so it goes through
        // the same tenant -> quota chain any other boundary uses (§4.8).
        // There's no RBAC principal on the wire here (the device's peer
        // identity already stood in for auth in step 1), so we resolve the
        // tenant context as if the device were its own principal.
        let principal = Principal {
            id: registration.device_id,
            tenant_id: registration.tenant_id,
            permissions: Vec::new(),
        };
        if let Err(e) = tenant::resolve_tenant_context(&self.config_db, &principal, false).await {
            match self.tenant_enforcement {
                TenantEnforcement::Strict => {
                    self.dead_letter(
                        Some(registration.tenant_id),
                        Some(registration.device_id),
                        DeadLetterReason::TenantSuspended,
                        raw_payload,
                    );
                    return;
                }
                TenantEnforcement::Permissive => {
                    tracing::warn!(
                        "tenant {} rejected write under strict enforcement ({e}), allowing under permissive mode",
                        registration.tenant_id
                    );
                }
            }
        }

        let payload: TelemetryPayload = match serde_json::from_slice(raw_payload) {
            Ok(p) => p,
            Err(e) => {
                self.dead_letter(
                    Some(registration.tenant_id),
                    Some(registration.device_id),
                    DeadLetterReason::MalformedPayload(e.to_string()),
                    raw_payload,
                );
                return;
            }
        };

        // Invariant 2 (§3) is a one-sided bound: a reading is only rejected
        // for being too far in the future. A device replaying buffered
        // readings from an outage is legitimately far in the past and must
        // not be dead-lettered for it.
        if payload.ts > Utc::now() + ChronoDuration::seconds(CLOCK_SKEW_TOLERANCE_SECS) {
            self.dead_letter(
                Some(registration.tenant_id),
                Some(registration.device_id),
                DeadLetterReason::ClockSkewExceeded,
                raw_payload,
            );
            return;
        }

        if !registration.allowed_metrics.iter().any(|m| m == metric) {
            self.dead_letter(
                Some(registration.tenant_id),
                Some(registration.device_id),
                DeadLetterReason::MetricNotAllowed(metric.to_string()),
                raw_payload,
            );
            return;
        }

        if let Some((min, max)) = registration.metric_bounds.get(metric) {
            if payload.value < *min || payload.value > *max {
                self.dead_letter(
                    Some(registration.tenant_id),
                    Some(registration.device_id),
                    DeadLetterReason::ValueOutOfRange { metric: metric.to_string(), value: payload.value },
                    raw_payload,
                );
                return;
            }
        }

        let record = payload.into_record(registration.tenant_id, registration.device_id, metric.to_string());

        if let Err(e) = self.telemetry.append(&record).await {
            tracing::error!(
                "append failed for tenant {} device {}: {e:#}",
                registration.tenant_id, registration.device_id
            );
            return;
        }

        self.cache
            .invalidate(&Cache::device_latest_key(registration.tenant_id, registration.device_id));
    }

    fn dead_letter(
        &self,
        tenant_id: Option<uuid::Uuid>,
        device_id: Option<uuid::Uuid>,
        reason: DeadLetterReason,
        raw_payload: &[u8],
    ) {
        let entry = DeadLetterEntry {
            tenant_id,
            device_id,
            received_at: Utc::now(),
            reason: reason.clone(),
            raw_payload: String::from_utf8_lossy(raw_payload).to_string(),
        };
        tracing::warn!(reason = ?entry.reason, "ingestion: dead-lettering payload");
        let reason_str = serde_json::to_string(&reason).unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = self.config_db.record_dead_letter(tenant_id, device_id, &reason_str, &entry.raw_payload) {
            tracing::error!("failed to persist dead letter: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::Device;
    use crate::models::tenant::{Tenant, TenantQuotas, TenantStatus};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn setup() -> (ConfigDb, Uuid, Uuid) {
        let db = ConfigDb::open_in_memory().unwrap();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: "acme".to_string(),
            status: TenantStatus::Active,
            tier: "pro".to_string(),
            quotas: TenantQuotas::default(),
            features: vec![],
        };
        db.create_tenant(&tenant).unwrap();
        let device = Device {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            name: "d1".to_string(),
            device_type: "sensor".to_string(),
            location: None,
            created_at: Utc::now(),
            attributes: Default::default(),
        };
        db.create_device(&device).unwrap();
        let mut bounds = HashMap::new();
        bounds.insert("temp".to_string(), (-40.0, 85.0));
        db.register_device_peer(device.id, "mqtt:client-1", &["temp".to_string()], &bounds)
            .unwrap();
        (db, tenant.id, device.id)
    }

    #[test]
    fn unknown_peer_key_yields_no_registration() {
        let (db, _tenant, _device) = setup();
        assert!(db.find_device_registration_by_peer("mqtt:unknown").unwrap().is_none());
    }

    #[test]
    fn registered_peer_round_trips_allowed_metrics() {
        let (db, tenant, device) = setup();
        let reg = db.find_device_registration_by_peer("mqtt:client-1").unwrap().unwrap();
        assert_eq!(reg.tenant_id, tenant);
        assert_eq!(reg.device_id, device);
        assert_eq!(reg.allowed_metrics, vec!["temp".to_string()]);
    }
}
