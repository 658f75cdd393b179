use serde::Deserialize;
use std::path::Path;

/// Tenant enforcement mode (`TENANT_ENFORCEMENT`). `Permissive` is meant for
/// development only — the adapter layer still tenant-prefixes every query,
/// but a missing/ambiguous tenant context logs instead of rejecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantEnforcement {
    #[default]
    Strict,
    Permissive,
}

/// Top-level config, loaded from a TOML file and overridden by environment
/// variables. A missing file isn't an error, it just means "run with
/// defaults."
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub rule_engine: RuleEngineConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub tenant_enforcement: TenantEnforcement,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub coap: CoapConfig,
    #[serde(default)]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub opcua: OpcUaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// `DB_DSN` — control-plane SQLite path.
    #[serde(default = "default_config_db_path")]
    pub dsn: String,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    #[serde(default)]
    pub clickhouse_user: String,
    #[serde(default)]
    pub clickhouse_password: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dsn: default_config_db_path(),
            clickhouse_url: default_clickhouse_url(),
            clickhouse_database: default_clickhouse_database(),
            clickhouse_user: "default".to_string(),
            clickhouse_password: String::new(),
        }
    }
}

fn default_config_db_path() -> String {
    "./beacon_control.db".to_string()
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "telemetry".to_string()
}

/// `CACHE_URL` absent ⇒ the cache is disabled and every lookup is a miss.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheConfig {
    pub url: Option<String>,
    #[serde(default = "default_cache_capacity")]
    pub max_entries: usize,
}

fn default_cache_capacity() -> usize {
    100_000
}

/// `SMTP_URL` absent ⇒ email channel disabled.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default = "default_smtp_from")]
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_from() -> String {
    "alerts@localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleEngineConfig {
    /// `SCHEDULE_INTERVAL_SECONDS`
    #[serde(default = "default_schedule_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// A rule auto-disables after this many consecutive `error(reason)`
    /// evaluations.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_schedule_interval(),
            worker_pool_size: default_worker_pool_size(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

fn default_schedule_interval() -> u64 {
    30
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_consecutive_errors() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// `WEBHOOK_RATE_PER_SECOND`
    #[serde(default = "default_webhook_rate")]
    pub rate_per_second: u32,
    #[serde(default = "default_webhook_burst")]
    pub burst: u32,
    #[serde(default)]
    pub allowed_private_test_hosts: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            rate_per_second: default_webhook_rate(),
            burst: default_webhook_burst(),
            allowed_private_test_hosts: Vec::new(),
        }
    }
}

fn default_webhook_rate() -> u32 {
    1
}

fn default_webhook_burst() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// `SHUTDOWN_GRACE_SECONDS`
    #[serde(default = "default_shutdown_grace")]
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_shutdown_grace() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MqttConfig {
    pub broker_url: Option<String>,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_mqtt_client_id() -> String {
    "beacon-pipeline".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoapConfig {
    pub bind_addr: Option<String>,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AmqpConfig {
    pub amqp_url: Option<String>,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OpcUaConfig {
    pub endpoint_url: Option<String>,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_inbox_capacity() -> usize {
    1_000
}

impl PipelineConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't
    /// exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply recognized environment variable overrides on top of a loaded
    /// config.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(dsn) = std::env::var("DB_DSN") {
            self.db.dsn = dsn;
        }
        if let Ok(cache_url) = std::env::var("CACHE_URL") {
            self.cache.url = Some(cache_url);
        }
        if let Ok(smtp_url) = std::env::var("SMTP_URL") {
            self.smtp.host = Some(smtp_url);
        }
        if let Ok(v) = std::env::var("SCHEDULE_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse() {
                self.rule_engine.interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WEBHOOK_RATE_PER_SECOND") {
            if let Ok(n) = v.parse() {
                self.webhook.rate_per_second = n;
            }
        }
        if let Ok(v) = std::env::var("SHUTDOWN_GRACE_SECONDS") {
            if let Ok(n) = v.parse() {
                self.shutdown.grace_secs = n;
            }
        }
        if let Ok(v) = std::env::var("TENANT_ENFORCEMENT") {
            self.tenant_enforcement = match v.as_str() {
                "permissive" => TenantEnforcement::Permissive,
                _ => TenantEnforcement::Strict,
            };
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = PipelineConfig::load("/nonexistent/path/beacon.toml").unwrap();
        assert_eq!(cfg.rule_engine.interval_secs, 30);
        assert_eq!(cfg.tenant_enforcement, TenantEnforcement::Strict);
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: single-threaded test process, no other test reads these keys.
        unsafe {
            std::env::set_var("SCHEDULE_INTERVAL_SECONDS", "45");
            std::env::set_var("TENANT_ENFORCEMENT", "permissive");
        }
        let cfg = PipelineConfig::default().apply_env_overrides();
        assert_eq!(cfg.rule_engine.interval_secs, 45);
        assert_eq!(cfg.tenant_enforcement, TenantEnforcement::Permissive);
        unsafe {
            std::env::remove_var("SCHEDULE_INTERVAL_SECONDS");
            std::env::remove_var("TENANT_ENFORCEMENT");
        }
    }
}
