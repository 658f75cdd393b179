//! Telemetry Store Adapter (C1): append/latest/range against ClickHouse,
//! always tenant-scoped.

use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::telemetry::TelemetryRecord;

pub const RANGE_QUERY_MAX_ROWS: u64 = 10_000;

#[derive(Debug, Serialize, Deserialize, Row)]
struct TelemetryRow {
    tenant_id: String,
    device_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    timestamp: DateTime<Utc>,
    metric: String,
    value: f64,
    unit: String,
    attributes: String,
}

impl TelemetryRow {
    fn from_record(r: &TelemetryRecord) -> Self {
        Self {
            tenant_id: r.tenant_id.to_string(),
            device_id: r.device_id.to_string(),
            timestamp: r.timestamp,
            metric: r.metric.clone(),
            value: r.value,
            unit: r.unit.clone().unwrap_or_default(),
            attributes: serde_json::to_string(&r.attributes).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    fn into_record(self) -> Option<TelemetryRecord> {
        Some(TelemetryRecord {
            tenant_id: Uuid::parse_str(&self.tenant_id).ok()?,
            device_id: Uuid::parse_str(&self.device_id).ok()?,
            timestamp: self.timestamp,
            metric: self.metric,
            value: self.value,
            unit: if self.unit.is_empty() { None } else { Some(self.unit) },
            attributes: serde_json::from_str(&self.attributes).unwrap_or_default(),
        })
    }
}

pub struct TelemetryStore {
    ch: Client,
}

impl TelemetryStore {
    pub fn new(ch: Client) -> Self {
        Self { ch }
    }

    /// Idempotent on `(tenant, device, metric, timestamp)` collisions —
    /// relies on the `telemetry` table being a `ReplacingMergeTree` keyed
    /// on those four columns so the newer insert eventually wins; schema
    /// provisioning is out of scope here (§4.1).
    pub async fn append(&self, record: &TelemetryRecord) -> Result<()> {
        let mut insert = self.ch.insert("telemetry")?;
        insert.write(&TelemetryRow::from_record(record)).await?;
        insert.end().await?;
        Ok(())
    }

    pub async fn latest(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        metric: &str,
    ) -> Result<Option<TelemetryRecord>> {
        let query = format!(
            "SELECT tenant_id, device_id, timestamp, metric, value, unit, attributes
             FROM telemetry
             WHERE tenant_id = ? AND device_id = ? AND metric = ?
             ORDER BY timestamp DESC LIMIT 1"
        );
        let row = self
            .ch
            .query(&query)
            .bind(tenant_id.to_string())
            .bind(device_id.to_string())
            .bind(metric)
            .fetch_optional::<TelemetryRow>()
            .await?;
        Ok(row.and_then(TelemetryRow::into_record))
    }

    pub async fn range(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<TelemetryRecord>> {
        let limit = limit.min(RANGE_QUERY_MAX_ROWS);
        let query = format!(
            "SELECT tenant_id, device_id, timestamp, metric, value, unit, attributes
             FROM telemetry
             WHERE tenant_id = ? AND device_id = ? AND metric = ?
               AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC LIMIT ?"
        );
        let rows = self
            .ch
            .query(&query)
            .bind(tenant_id.to_string())
            .bind(device_id.to_string())
            .bind(metric)
            .bind(from.timestamp())
            .bind(to.timestamp())
            .bind(limit)
            .fetch_all::<TelemetryRow>()
            .await?;
        Ok(rows.into_iter().filter_map(TelemetryRow::into_record).collect())
    }

    /// Aggregate over a trailing window, used by TIME_WINDOW/STATISTICAL
    /// rules (§4.4). Computed in ClickHouse rather than pulled row-by-row.
    pub async fn aggregate(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        metric: &str,
        window_secs: u32,
        aggregate_fn: &str,
    ) -> Result<Option<f64>> {
        let query = format!(
            "SELECT {aggregate_fn}(value) FROM telemetry
             WHERE tenant_id = ? AND device_id = ? AND metric = ?
               AND timestamp >= now() - INTERVAL ? SECOND"
        );
        let value: Option<f64> = self
            .ch
            .query(&query)
            .bind(tenant_id.to_string())
            .bind(device_id.to_string())
            .bind(metric)
            .bind(window_secs)
            .fetch_optional::<f64>()
            .await?;
        Ok(value)
    }

    /// Mean and sample stddev over a trailing window, used by STATISTICAL
    /// rules' `stddev`/`zscore` measures.
    pub async fn mean_and_stddev(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        metric: &str,
        window_secs: u32,
    ) -> Result<Option<(f64, f64)>> {
        #[derive(Row, Deserialize)]
        struct MeanStddev {
            mean: f64,
            stddev: f64,
        }
        let query = "SELECT avg(value) as mean, stddevSamp(value) as stddev FROM telemetry
             WHERE tenant_id = ? AND device_id = ? AND metric = ?
               AND timestamp >= now() - INTERVAL ? SECOND";
        let row = self
            .ch
            .query(query)
            .bind(tenant_id.to_string())
            .bind(device_id.to_string())
            .bind(metric)
            .bind(window_secs)
            .fetch_optional::<MeanStddev>()
            .await?;
        Ok(row.map(|r| (r.mean, r.stddev)))
    }
}
