//! Control-plane store: tenants, devices, rules, actions, alerts and their
//! lifecycle/SLA/grouping state, escalation policies/timers, and on-call
//! schedules. Everything here is tenant-scoped SQLite, in the same
//! `Mutex<Connection>` + `execute_batch` migration idiom the observability
//! config store uses — generalized from "dashboards/alert_rules/slos" to
//! "tenant/device/rule/alert control plane."

use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::models::action::{Action, ActionRecord};
use crate::models::alert::{Alert, AlertState, AlertStateEvent};
use crate::models::device::Device;
use crate::models::escalation::{EscalationPolicy, EscalationTimer};
use crate::models::group::{AlertGroup, GroupStatus, GroupingKey, NotifyOn};
use crate::models::oncall::OnCallSchedule;
use crate::models::rule::{Rule, RuleParams, Severity};
use crate::models::sla::AlertSla;
use crate::models::tenant::{Tenant, TenantQuotas, TenantStatus};

pub struct ConfigDb {
    conn: Mutex<Connection>,
}

impl ConfigDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                id          TEXT PRIMARY KEY,
                slug        TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','suspended','trial')),
                tier        TEXT NOT NULL DEFAULT 'free',
                quotas      TEXT NOT NULL DEFAULT '{}',
                features    TEXT NOT NULL DEFAULT '[]',
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS devices (
                id              TEXT PRIMARY KEY,
                tenant_id       TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name            TEXT NOT NULL,
                device_type     TEXT NOT NULL,
                location        TEXT,
                attributes      TEXT NOT NULL DEFAULT '{}',
                peer_key        TEXT UNIQUE,
                allowed_metrics TEXT NOT NULL DEFAULT '[]',
                metric_bounds   TEXT NOT NULL DEFAULT '{}',
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_devices_tenant ON devices(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_devices_peer_key ON devices(peer_key);

            CREATE TABLE IF NOT EXISTS actions (
                id        TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                action    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_tenant ON actions(tenant_id);

            CREATE TABLE IF NOT EXISTS rules (
                id                 TEXT PRIMARY KEY,
                tenant_id          TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                enabled            INTEGER NOT NULL DEFAULT 1,
                device_id          TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                metric             TEXT NOT NULL,
                family             TEXT NOT NULL,
                params             TEXT NOT NULL,
                severity           TEXT NOT NULL,
                action_ids         TEXT NOT NULL DEFAULT '[]',
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                notify_on          TEXT NOT NULL DEFAULT '{\"type\":\"first\"}',
                last_eval_at       TEXT,
                created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_rules_tenant_enabled ON rules(tenant_id, enabled);
            CREATE INDEX IF NOT EXISTS idx_rules_device ON rules(device_id);

            CREATE TABLE IF NOT EXISTS alerts (
                id         TEXT PRIMARY KEY,
                tenant_id  TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                rule_id    TEXT REFERENCES rules(id) ON DELETE SET NULL,
                source     TEXT,
                device_id  TEXT NOT NULL,
                severity   TEXT NOT NULL,
                message    TEXT NOT NULL,
                metadata   TEXT NOT NULL DEFAULT '{}',
                group_id   TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_tenant ON alerts(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts(rule_id);

            CREATE TABLE IF NOT EXISTS alert_states (
                id           TEXT PRIMARY KEY,
                alert_id     TEXT NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
                state        TEXT NOT NULL,
                by_principal TEXT,
                note         TEXT,
                at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_alert_states_alert ON alert_states(alert_id, at DESC);

            CREATE TABLE IF NOT EXISTS alert_slas (
                alert_id        TEXT PRIMARY KEY REFERENCES alerts(id) ON DELETE CASCADE,
                tenant_id       TEXT NOT NULL,
                tta_target_secs INTEGER,
                ttr_target_secs INTEGER,
                acknowledged_at TEXT,
                resolved_at     TEXT,
                tta_seconds     INTEGER,
                ttr_seconds     INTEGER,
                tta_breached    INTEGER NOT NULL DEFAULT 0,
                ttr_breached    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS alert_groups (
                id                TEXT PRIMARY KEY,
                tenant_id         TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','closed')),
                device_id         TEXT NOT NULL,
                rule_family       TEXT NOT NULL,
                metric            TEXT NOT NULL,
                first_occurrence  TEXT NOT NULL,
                last_occurrence   TEXT NOT NULL,
                occurrence_count  INTEGER NOT NULL DEFAULT 1,
                notify_on         TEXT NOT NULL DEFAULT '{\"type\":\"first\"}',
                last_notified_at  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alert_groups_key
                ON alert_groups(tenant_id, device_id, rule_family, metric, status);

            CREATE TABLE IF NOT EXISTS escalation_policies (
                id                      TEXT PRIMARY KEY,
                tenant_id               TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                applies_to_severities   TEXT NOT NULL,
                tiers                   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS escalation_timers (
                id         TEXT PRIMARY KEY,
                tenant_id  TEXT NOT NULL,
                alert_id   TEXT NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
                policy_id  TEXT NOT NULL,
                tier_index INTEGER NOT NULL,
                fire_at    TEXT NOT NULL,
                cancelled  INTEGER NOT NULL DEFAULT 0,
                fired      INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_escalation_timers_due ON escalation_timers(fire_at, cancelled, fired);
            CREATE INDEX IF NOT EXISTS idx_escalation_timers_alert ON escalation_timers(alert_id);

            CREATE TABLE IF NOT EXISTS on_call_schedules (
                id          TEXT PRIMARY KEY,
                tenant_id   TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                rotation    TEXT NOT NULL,
                rotation_unit TEXT NOT NULL,
                custom_shift_secs INTEGER,
                timezone    TEXT NOT NULL DEFAULT 'UTC',
                anchor      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS on_call_overrides (
                id          TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL REFERENCES on_call_schedules(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                starts_at   TEXT NOT NULL,
                ends_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_oncall_overrides_schedule ON on_call_overrides(schedule_id);

            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id         TEXT PRIMARY KEY,
                tenant_id  TEXT NOT NULL,
                channel    TEXT NOT NULL,
                recipient  TEXT NOT NULL,
                status     TEXT NOT NULL CHECK(status IN ('queued','sent','delivered','failed')),
                error      TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_attempts_tenant ON delivery_attempts(tenant_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS dead_letters (
                id           TEXT PRIMARY KEY,
                tenant_id    TEXT,
                device_id    TEXT,
                reason       TEXT NOT NULL,
                raw_payload  TEXT NOT NULL,
                received_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            ",
        )?;
        Ok(())
    }

    // ── Tenants ──

    pub fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenants (id, slug, status, tier, quotas, features) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant.id.to_string(),
                tenant.slug,
                tenant.status.as_str(),
                tenant.tier,
                serde_json::to_string(&tenant.quotas)?,
                serde_json::to_string(&tenant.features)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, slug, status, tier, quotas, features FROM tenants WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let slug: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    let tier: String = row.get(3)?;
                    let quotas: String = row.get(4)?;
                    let features: String = row.get(5)?;
                    Ok((id, slug, status, tier, quotas, features))
                },
            )
            .optional()?;
        Ok(row.map(|(id, slug, status, tier, quotas, features)| Tenant {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            slug,
            status: TenantStatus::from_str_lenient(&status).unwrap_or(TenantStatus::Suspended),
            tier,
            quotas: serde_json::from_str::<TenantQuotas>(&quotas).unwrap_or_default(),
            features: serde_json::from_str(&features).unwrap_or_default(),
        }))
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, slug, status, tier, quotas, features FROM tenants")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, slug, status, tier, quotas, features)| Tenant {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                slug,
                status: TenantStatus::from_str_lenient(&status).unwrap_or(TenantStatus::Suspended),
                tier,
                quotas: serde_json::from_str::<TenantQuotas>(&quotas).unwrap_or_default(),
                features: serde_json::from_str(&features).unwrap_or_default(),
            })
            .collect())
    }

    // ── Devices ──

    pub fn create_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (id, tenant_id, name, device_type, location, attributes) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                device.id.to_string(),
                device.tenant_id.to_string(),
                device.name,
                device.device_type,
                device.location,
                serde_json::to_string(&device.attributes)?,
            ],
        )?;
        Ok(())
    }

    pub fn count_devices_for_tenant(&self, tenant_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1",
            params![tenant_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, name, device_type, location, attributes, created_at FROM devices WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, tenant_id, name, device_type, location, attributes, created_at)| Device {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
            name,
            device_type,
            location,
            created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
            attributes: serde_json::from_str(&attributes).unwrap_or_default(),
        }))
    }

    /// Binds a device to the protocol-level identity its ingestion adapter
    /// authenticates (MQTT client id, AMQP SASL identity, OPC-UA cert
    /// fingerprint, CoAP PSK identity), plus its allow-listed metrics and
    /// optional per-metric range bounds (§4.3 step 2, §4.1 step 4).
    pub fn register_device_peer(
        &self,
        device_id: Uuid,
        peer_key: &str,
        allowed_metrics: &[String],
        metric_bounds: &std::collections::HashMap<String, (f64, f64)>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET peer_key = ?1, allowed_metrics = ?2, metric_bounds = ?3 WHERE id = ?4",
            params![
                peer_key,
                serde_json::to_string(allowed_metrics)?,
                serde_json::to_string(metric_bounds)?,
                device_id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn find_device_registration_by_peer(
        &self,
        peer_key: &str,
    ) -> Result<Option<crate::models::device::DeviceRegistration>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT tenant_id, id, allowed_metrics, metric_bounds FROM devices WHERE peer_key = ?1",
                params![peer_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(tenant_id, device_id, allowed_metrics, metric_bounds)| {
            crate::models::device::DeviceRegistration {
                tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
                device_id: Uuid::parse_str(&device_id).unwrap_or_default(),
                allowed_metrics: serde_json::from_str(&allowed_metrics).unwrap_or_default(),
                metric_bounds: serde_json::from_str(&metric_bounds).unwrap_or_default(),
            }
        }))
    }

    /// Every device with a registered peer identity and its tenant, for
    /// adapters that build a protocol-native identity/subscription surface
    /// at startup instead of resolving peers lazily (OPC-UA's address
    /// space, per §6).
    pub fn list_device_peer_registrations(
        &self,
    ) -> Result<Vec<(Uuid, Uuid, String, Vec<String>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tenant_id, id, peer_key, allowed_metrics FROM devices WHERE peer_key IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(tenant_id, device_id, peer_key, allowed_metrics)| {
                (
                    Uuid::parse_str(&tenant_id).unwrap_or_default(),
                    Uuid::parse_str(&device_id).unwrap_or_default(),
                    peer_key,
                    serde_json::from_str(&allowed_metrics).unwrap_or_default(),
                )
            })
            .collect())
    }

    // ── Actions ──

    pub fn create_action(&self, record: &ActionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO actions (id, tenant_id, action) VALUES (?1, ?2, ?3)",
            params![
                record.id.to_string(),
                record.tenant_id.to_string(),
                serde_json::to_string(&record.action)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_actions(&self, ids: &[Uuid]) -> Result<Vec<ActionRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, tenant_id, action FROM actions WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let id_strings: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(id_strings.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, tenant_id, action)| {
                Some(ActionRecord {
                    id: Uuid::parse_str(&id).ok()?,
                    tenant_id: Uuid::parse_str(&tenant_id).ok()?,
                    action: serde_json::from_str::<Action>(&action).ok()?,
                })
            })
            .collect())
    }

    // ── Rules ──

    const RULE_COLUMNS: &'static str =
        "id, tenant_id, enabled, device_id, metric, params, severity, action_ids, consecutive_errors, notify_on";

    pub fn create_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rules (id, tenant_id, enabled, device_id, metric, family, params, severity, action_ids, consecutive_errors, notify_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.id.to_string(),
                rule.tenant_id.to_string(),
                rule.enabled,
                rule.device_id.to_string(),
                rule.metric,
                rule.params.family_name(),
                serde_json::to_string(&rule.params)?,
                serde_json::to_string(&rule.severity)?,
                serde_json::to_string(&rule.action_ids)?,
                rule.consecutive_errors,
                serde_json::to_string(&rule.notify_on)?,
            ],
        )?;
        Ok(())
    }

    fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<Rule> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let enabled: bool = row.get(2)?;
        let device_id: String = row.get(3)?;
        let metric: String = row.get(4)?;
        let params: String = row.get(5)?;
        let severity: String = row.get(6)?;
        let action_ids: String = row.get(7)?;
        let consecutive_errors: u32 = row.get(8)?;
        let notify_on: String = row.get(9)?;
        Ok(Rule {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
            enabled,
            device_id: Uuid::parse_str(&device_id).unwrap_or_default(),
            metric,
            params: serde_json::from_str::<RuleParams>(&params)
                .unwrap_or(RuleParams::Threshold {
                    op: crate::models::rule::ComparisonOp::Gt,
                    value: 0.0,
                }),
            severity: serde_json::from_str::<Severity>(&severity).unwrap_or(Severity::Info),
            action_ids: serde_json::from_str(&action_ids).unwrap_or_default(),
            consecutive_errors,
            notify_on: serde_json::from_str(&notify_on).unwrap_or(NotifyOn::First),
        })
    }

    /// Every enabled rule, tenant-prefix-agnostic (the rule scheduler groups
    /// by tenant itself). Cadence is per-tick-global rather than per-rule,
    /// so there is no time predicate here.
    pub fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM rules WHERE enabled = 1", Self::RULE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_enabled_rules_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM rules WHERE enabled = 1 AND tenant_id = ?1",
            Self::RULE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![tenant_id.to_string()], Self::row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_rule(&self, rule_id: Uuid) -> Result<Option<Rule>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM rules WHERE id = ?1", Self::RULE_COLUMNS);
        conn.query_row(&sql, params![rule_id.to_string()], Self::row_to_rule)
            .optional()
            .map_err(Into::into)
    }

    pub fn record_rule_eval_ok(&self, rule_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET consecutive_errors = 0, last_eval_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![rule_id.to_string()],
        )?;
        Ok(())
    }

    /// Returns the new consecutive-error count so the caller can decide
    /// whether to auto-disable (§7).
    pub fn record_rule_eval_error(&self, rule_id: Uuid) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET consecutive_errors = consecutive_errors + 1,
             last_eval_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![rule_id.to_string()],
        )?;
        let count: u32 = conn.query_row(
            "SELECT consecutive_errors FROM rules WHERE id = ?1",
            params![rule_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn disable_rule(&self, rule_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET enabled = 0 WHERE id = ?1",
            params![rule_id.to_string()],
        )?;
        Ok(())
    }

    // ── Alerts & lifecycle ──

    pub fn create_alert(&self, alert: &Alert) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (id, tenant_id, rule_id, source, device_id, severity, message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.id.to_string(),
                alert.tenant_id.to_string(),
                alert.rule_id.map(|r| r.to_string()),
                alert.source,
                alert.device_id.to_string(),
                serde_json::to_string(&alert.severity)?,
                alert.message,
                serde_json::to_string(&alert.metadata)?,
            ],
        )?;
        conn.execute(
            "INSERT INTO alert_states (id, alert_id, state) VALUES (?1, ?2, ?3)",
            params![Uuid::new_v4().to_string(), alert.id.to_string(), AlertState::New.as_str()],
        )?;
        Ok(())
    }

    pub fn get_alert(&self, alert_id: Uuid) -> Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, rule_id, source, device_id, severity, message, metadata, created_at
             FROM alerts WHERE id = ?1",
            params![alert_id.to_string()],
            |row| {
                let id: String = row.get(0)?;
                let tenant_id: String = row.get(1)?;
                let rule_id: Option<String> = row.get(2)?;
                let source: Option<String> = row.get(3)?;
                let device_id: String = row.get(4)?;
                let severity: String = row.get(5)?;
                let message: String = row.get(6)?;
                let metadata: String = row.get(7)?;
                let created_at: String = row.get(8)?;
                Ok((id, tenant_id, rule_id, source, device_id, severity, message, metadata, created_at))
            },
        )
        .optional()?
        .map(|(id, tenant_id, rule_id, source, device_id, severity, message, metadata, created_at)| {
            Ok(Alert {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
                rule_id: rule_id.and_then(|r| Uuid::parse_str(&r).ok()),
                source,
                device_id: Uuid::parse_str(&device_id).unwrap_or_default(),
                severity: serde_json::from_str(&severity)?,
                message,
                metadata: serde_json::from_str(&metadata)?,
                created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
            })
        })
        .transpose()
    }

    pub fn get_alert_group_id(&self, alert_id: Uuid) -> Result<Option<Uuid>> {
        let conn = self.conn.lock().unwrap();
        let group_id: Option<String> = conn.query_row(
            "SELECT group_id FROM alerts WHERE id = ?1",
            params![alert_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(group_id.and_then(|g| Uuid::parse_str(&g).ok()))
    }

    /// One open alert per rule, used by the deduplication check (§4.4).
    pub fn find_open_alert_for_rule(&self, rule_id: Uuid) -> Result<Option<Uuid>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<String> = conn
            .query_row(
                "SELECT a.id FROM alerts a
                 JOIN (
                     SELECT alert_id, state FROM alert_states s1
                     WHERE at = (SELECT MAX(at) FROM alert_states s2 WHERE s2.alert_id = s1.alert_id)
                 ) cur ON cur.alert_id = a.id
                 WHERE a.rule_id = ?1 AND cur.state IN ('NEW','ACKNOWLEDGED','INVESTIGATING')
                 ORDER BY a.created_at DESC LIMIT 1",
                params![rule_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    pub fn current_alert_state(&self, alert_id: Uuid) -> Result<Option<AlertState>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<String> = conn
            .query_row(
                "SELECT state FROM alert_states WHERE alert_id = ?1 ORDER BY at DESC LIMIT 1",
                params![alert_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.and_then(|s| AlertState::parse(&s)))
    }

    pub fn append_alert_state(&self, event: &AlertStateEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_states (id, alert_id, state, by_principal, note, at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.alert_id.to_string(),
                event.state.as_str(),
                event.by_principal,
                event.note,
                event.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ── SLA ──

    pub fn create_alert_sla(&self, sla: &AlertSla) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_slas (alert_id, tenant_id, tta_target_secs, ttr_target_secs)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                sla.alert_id.to_string(),
                sla.tenant_id.to_string(),
                sla.tta_target_secs,
                sla.ttr_target_secs,
            ],
        )?;
        Ok(())
    }

    pub fn get_alert_sla(&self, alert_id: Uuid) -> Result<Option<AlertSla>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT alert_id, tenant_id, tta_target_secs, ttr_target_secs, acknowledged_at, resolved_at,
                    tta_seconds, ttr_seconds, tta_breached, ttr_breached
             FROM alert_slas WHERE alert_id = ?1",
            params![alert_id.to_string()],
            Self::row_to_sla,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_sla(row: &rusqlite::Row) -> rusqlite::Result<AlertSla> {
        let alert_id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        Ok(AlertSla {
            alert_id: Uuid::parse_str(&alert_id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
            tta_target_secs: row.get(2)?,
            ttr_target_secs: row.get(3)?,
            acknowledged_at: row.get::<_, Option<String>>(4)?.and_then(|s| s.parse().ok()),
            resolved_at: row.get::<_, Option<String>>(5)?.and_then(|s| s.parse().ok()),
            tta_seconds: row.get(6)?,
            ttr_seconds: row.get(7)?,
            tta_breached: row.get(8)?,
            ttr_breached: row.get(9)?,
        })
    }

    pub fn save_alert_sla(&self, sla: &AlertSla) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_slas SET acknowledged_at = ?2, resolved_at = ?3, tta_seconds = ?4,
             ttr_seconds = ?5, tta_breached = ?6, ttr_breached = ?7 WHERE alert_id = ?1",
            params![
                sla.alert_id.to_string(),
                sla.acknowledged_at.map(|t| t.to_rfc3339()),
                sla.resolved_at.map(|t| t.to_rfc3339()),
                sla.tta_seconds,
                sla.ttr_seconds,
                sla.tta_breached,
                sla.ttr_breached,
            ],
        )?;
        Ok(())
    }

    /// Unresolved alerts with an SLA row, for the minute-cadence sweep.
    pub fn list_unresolved_alert_ids_with_created_at(&self) -> Result<Vec<(Uuid, chrono::DateTime<chrono::Utc>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.created_at FROM alerts a
             JOIN alert_slas s ON s.alert_id = a.id
             WHERE s.resolved_at IS NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let created_at: String = row.get(1)?;
                Ok((id, created_at))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, created_at)| {
                Some((
                    Uuid::parse_str(&id).ok()?,
                    created_at.parse::<chrono::DateTime<chrono::Utc>>().ok()?,
                ))
            })
            .collect())
    }

    // ── Groups ──

    pub fn find_active_group(&self, key: &GroupingKey) -> Result<Option<AlertGroup>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, status, device_id, rule_family, metric, first_occurrence,
                    last_occurrence, occurrence_count, notify_on, last_notified_at
             FROM alert_groups
             WHERE tenant_id = ?1 AND device_id = ?2 AND rule_family = ?3 AND metric = ?4 AND status = 'active'
             ORDER BY last_occurrence DESC LIMIT 1",
            params![key.0.to_string(), key.1.to_string(), key.2, key.3],
            Self::row_to_group,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_group(row: &rusqlite::Row) -> rusqlite::Result<AlertGroup> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let status: String = row.get(2)?;
        let device_id: String = row.get(3)?;
        let notify_on: String = row.get(9)?;
        let last_notified_at: Option<String> = row.get(10)?;
        Ok(AlertGroup {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
            status: if status == "active" { GroupStatus::Active } else { GroupStatus::Closed },
            device_id: Uuid::parse_str(&device_id).unwrap_or_default(),
            rule_family: row.get(4)?,
            metric: row.get(5)?,
            first_occurrence: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
            last_occurrence: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
            occurrence_count: row.get::<_, i64>(8)? as u64,
            notify_on: serde_json::from_str(&notify_on).unwrap_or(NotifyOn::First),
            last_notified_at: last_notified_at.and_then(|s| s.parse().ok()),
        })
    }

    pub fn create_group(&self, group: &AlertGroup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_groups (id, tenant_id, status, device_id, rule_family, metric,
             first_occurrence, last_occurrence, occurrence_count, notify_on, last_notified_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
            params![
                group.id.to_string(),
                group.tenant_id.to_string(),
                group.device_id.to_string(),
                group.rule_family,
                group.metric,
                group.first_occurrence.to_rfc3339(),
                group.last_occurrence.to_rfc3339(),
                serde_json::to_string(&group.notify_on)?,
                group.last_notified_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn attach_to_group(&self, group_id: Uuid, at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_groups SET occurrence_count = occurrence_count + 1, last_occurrence = ?2 WHERE id = ?1",
            params![group_id.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Records that a group's fan-out policy actually fired a notification,
    /// so `NotifyOn::RateLimited` has a reference point for its next check.
    pub fn mark_group_notified(&self, group_id: Uuid, at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_groups SET last_notified_at = ?2 WHERE id = ?1",
            params![group_id.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_alert_group(&self, alert_id: Uuid, group_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET group_id = ?2 WHERE id = ?1",
            params![alert_id.to_string(), group_id.to_string()],
        )?;
        Ok(())
    }

    /// Closes a group if every member alert is now in a terminal state
    /// (§4.5 "Group closure", invariant 4).
    pub fn close_group_if_all_terminal(&self, group_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let open_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts a
             WHERE a.group_id = ?1 AND (
                 SELECT state FROM alert_states s WHERE s.alert_id = a.id ORDER BY s.at DESC LIMIT 1
             ) NOT IN ('RESOLVED','EXPIRED','SUPPRESSED')",
            params![group_id.to_string()],
            |row| row.get(0),
        )?;
        if open_count == 0 {
            conn.execute(
                "UPDATE alert_groups SET status = 'closed' WHERE id = ?1",
                params![group_id.to_string()],
            )?;
            return Ok(true);
        }
        Ok(false)
    }

    // ── Escalation ──

    pub fn create_escalation_policy(&self, policy: &EscalationPolicy) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO escalation_policies (id, tenant_id, applies_to_severities, tiers) VALUES (?1, ?2, ?3, ?4)",
            params![
                policy.id.to_string(),
                policy.tenant_id.to_string(),
                serde_json::to_string(&policy.applies_to_severities)?,
                serde_json::to_string(&policy.tiers)?,
            ],
        )?;
        Ok(())
    }

    pub fn list_policies_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<EscalationPolicy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, applies_to_severities, tiers FROM escalation_policies WHERE tenant_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![tenant_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let tenant_id: String = row.get(1)?;
                let severities: String = row.get(2)?;
                let tiers: String = row.get(3)?;
                Ok((id, tenant_id, severities, tiers))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, tenant_id, severities, tiers)| {
                Some(EscalationPolicy {
                    id: Uuid::parse_str(&id).ok()?,
                    tenant_id: Uuid::parse_str(&tenant_id).ok()?,
                    applies_to_severities: serde_json::from_str(&severities).ok()?,
                    tiers: serde_json::from_str(&tiers).ok()?,
                })
            })
            .collect())
    }

    pub fn create_escalation_timer(&self, timer: &EscalationTimer) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO escalation_timers (id, tenant_id, alert_id, policy_id, tier_index, fire_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                timer.id.to_string(),
                timer.tenant_id.to_string(),
                timer.alert_id.to_string(),
                timer.policy_id.to_string(),
                timer.tier_index as i64,
                timer.fire_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn due_escalation_timers(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<EscalationTimer>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, alert_id, policy_id, tier_index, fire_at, cancelled, fired
             FROM escalation_timers WHERE cancelled = 0 AND fired = 0 AND fire_at <= ?1",
        )?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], Self::row_to_timer)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_timer(row: &rusqlite::Row) -> rusqlite::Result<EscalationTimer> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let alert_id: String = row.get(2)?;
        let policy_id: String = row.get(3)?;
        let tier_index: i64 = row.get(4)?;
        let fire_at: String = row.get(5)?;
        Ok(EscalationTimer {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
            alert_id: Uuid::parse_str(&alert_id).unwrap_or_default(),
            policy_id: Uuid::parse_str(&policy_id).unwrap_or_default(),
            tier_index: tier_index as usize,
            fire_at: fire_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
            cancelled: row.get(6)?,
            fired: row.get(7)?,
        })
    }

    pub fn mark_timer_fired(&self, timer_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE escalation_timers SET fired = 1 WHERE id = ?1",
            params![timer_id.to_string()],
        )?;
        Ok(())
    }

    /// Cancels all not-yet-fired timers for an alert (§4.6, ack/resolve/
    /// suppress cancels the remaining tiers).
    pub fn cancel_timers_for_alert(&self, alert_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE escalation_timers SET cancelled = 1 WHERE alert_id = ?1 AND fired = 0",
            params![alert_id.to_string()],
        )?;
        Ok(())
    }

    // ── On-call ──

    pub fn get_on_call_schedule(&self, id: Uuid) -> Result<Option<OnCallSchedule>> {
        let conn = self.conn.lock().unwrap();
        let base = conn
            .query_row(
                "SELECT id, tenant_id, name, rotation, rotation_unit, custom_shift_secs, timezone, anchor
                 FROM on_call_schedules WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, tenant_id, name, rotation, rotation_unit, custom_shift_secs, timezone, anchor)) = base
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, user_id, starts_at, ends_at FROM on_call_overrides WHERE schedule_id = ?1 ORDER BY rowid",
        )?;
        let overrides = stmt
            .query_map(params![id.clone()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(oid, user_id, starts_at, ends_at)| {
                Some(crate::models::oncall::OnCallOverride {
                    id: Uuid::parse_str(&oid).ok()?,
                    user_id: Uuid::parse_str(&user_id).ok()?,
                    starts_at: starts_at.parse().ok()?,
                    ends_at: ends_at.parse().ok()?,
                })
            })
            .collect();

        Ok(Some(OnCallSchedule {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            tenant_id: Uuid::parse_str(&tenant_id).unwrap_or_default(),
            name,
            rotation: serde_json::from_str(&rotation).unwrap_or_default(),
            rotation_unit: match rotation_unit.as_str() {
                "daily" => crate::models::oncall::RotationUnit::Daily,
                "custom" => crate::models::oncall::RotationUnit::Custom,
                _ => crate::models::oncall::RotationUnit::Weekly,
            },
            custom_shift_secs,
            timezone: timezone.parse().unwrap_or(chrono_tz::UTC),
            anchor: anchor.parse().unwrap_or_else(|_| chrono::Utc::now()),
            overrides,
        }))
    }

    // ── Delivery attempts & dead letters ──

    pub fn record_delivery_attempt(
        &self,
        tenant_id: Uuid,
        channel: &str,
        recipient: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO delivery_attempts (id, tenant_id, channel, recipient, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                tenant_id.to_string(),
                channel,
                recipient,
                status,
                error,
            ],
        )?;
        Ok(())
    }

    pub fn record_dead_letter(
        &self,
        tenant_id: Option<Uuid>,
        device_id: Option<Uuid>,
        reason: &str,
        raw_payload: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dead_letters (id, tenant_id, device_id, reason, raw_payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                tenant_id.map(|t| t.to_string()),
                device_id.map(|d| d.to_string()),
                reason,
                raw_payload,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rule::ComparisonOp;

    fn sample_tenant() -> Tenant {
        Tenant {
            id: Uuid::new_v4(),
            slug: "acme".to_string(),
            status: TenantStatus::Active,
            tier: "pro".to_string(),
            quotas: TenantQuotas::default(),
            features: vec![],
        }
    }

    #[test]
    fn create_and_get_tenant_round_trips() {
        let db = ConfigDb::open_in_memory().unwrap();
        let tenant = sample_tenant();
        db.create_tenant(&tenant).unwrap();
        let fetched = db.get_tenant(tenant.id).unwrap().unwrap();
        assert_eq!(fetched.slug, "acme");
        assert_eq!(fetched.status, TenantStatus::Active);
    }

    #[test]
    fn rule_lifecycle_tracks_consecutive_errors() {
        let db = ConfigDb::open_in_memory().unwrap();
        let tenant = sample_tenant();
        db.create_tenant(&tenant).unwrap();
        let device = Device {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            name: "d1".to_string(),
            device_type: "sensor".to_string(),
            location: None,
            created_at: chrono::Utc::now(),
            attributes: Default::default(),
        };
        db.create_device(&device).unwrap();
        let rule = Rule {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            enabled: true,
            device_id: device.id,
            metric: "temperature".to_string(),
            params: RuleParams::Threshold { op: ComparisonOp::Gt, value: 80.0 },
            severity: Severity::High,
            action_ids: vec![],
            consecutive_errors: 0,
            notify_on: NotifyOn::First,
        };
        db.create_rule(&rule).unwrap();
        assert_eq!(db.record_rule_eval_error(rule.id).unwrap(), 1);
        assert_eq!(db.record_rule_eval_error(rule.id).unwrap(), 2);
        db.record_rule_eval_ok(rule.id).unwrap();
        let rules = db.list_enabled_rules_for_tenant(tenant.id).unwrap();
        assert_eq!(rules[0].consecutive_errors, 0);
    }

    #[test]
    fn alert_dedup_finds_open_alert() {
        let db = ConfigDb::open_in_memory().unwrap();
        let tenant = sample_tenant();
        db.create_tenant(&tenant).unwrap();
        let device_id = Uuid::new_v4();
        let rule_id = Uuid::new_v4();
        let alert = Alert {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            rule_id: Some(rule_id),
            source: None,
            device_id,
            severity: Severity::High,
            message: "hot".to_string(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
        };
        db.create_alert(&alert).unwrap();
        assert_eq!(db.find_open_alert_for_rule(rule_id).unwrap(), Some(alert.id));

        let event = AlertStateEvent {
            id: Uuid::new_v4(),
            alert_id: alert.id,
            state: AlertState::Resolved,
            by_principal: Some("alice".to_string()),
            at: chrono::Utc::now(),
            note: None,
        };
        db.append_alert_state(&event).unwrap();
        assert_eq!(db.find_open_alert_for_rule(rule_id).unwrap(), None);
    }
}
