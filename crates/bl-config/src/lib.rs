//! Bookline configuration system.
//!
//! Process-level settings come from a TOML file plus `BOOKLINE_*` environment
//! overrides. Per-tenant settings live in the tenants table and deserialize
//! into [`TenantSettings`]; the `[tenant_defaults]` section here only fills
//! fields a tenant row omits. Configuration changes take effect on the next
//! cron tick or claim cycle; nothing caches settings beyond that.

pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub calendar: CalendarConfig,
    pub dialogue: DialogueConfig,
    pub admin: AdminConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub tenant_defaults: TenantSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            gateway: GatewayConfig::default(),
            calendar: CalendarConfig::default(),
            dialogue: DialogueConfig::default(),
            admin: AdminConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            tenant_defaults: TenantSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be > 0".into()));
        }
        if self.tenant_defaults.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "tenant_defaults.batch_size must be > 0".into(),
            ));
        }
        if self.tenant_defaults.previsit_hour > 23 || self.tenant_defaults.audit_hour > 23 {
            return Err(ConfigError::Invalid("trigger hours must be 0-23".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `postgres://...` or `sqlite://...`; the backend is picked by scheme.
    pub url: String,
    pub max_connections: u32,
    /// Statement timeout for SQL round-trips.
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
            timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Cache round-trip deadline.
    pub timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            timeout_secs: 2,
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Outbound chat gateway (`POST {base}/message/sendText/{instance}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    /// `delay` field sent in the gateway body (typing simulation, ms).
    pub send_delay_ms: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            api_key: String::new(),
            request_timeout_secs: 10,
            send_delay_ms: 1200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub base_url: String,
    pub api_token: String,
    pub request_timeout_secs: u64,
    pub page_size: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082".to_string(),
            api_token: String::new(),
            request_timeout_secs: 10,
            page_size: 100,
        }
    }
}

/// The external dialogue collaborator that handles free-form messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Empty disables forwarding (inbound falls through silently).
    pub url: String,
    pub request_timeout_secs: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Static bearer token; empty disables the admin surface.
    pub token: String,
}

/// Process-level worker knobs. Batch size, poll cadence and visibility
/// timeout are per-tenant ([`TenantSettings`]); this covers only what a
/// single tenant cannot own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of identical delivery consumers.
    pub concurrency: usize,
    /// Consumer loop tick; a tenant's `poll_interval_secs` cannot fire more
    /// often than this.
    pub tick_secs: u64,
    /// Minimum spacing between sends to the same recipient.
    pub inter_message_delay_ms: u64,
    /// Opt-out/handoff reads may be memoized this long.
    pub gate_memo_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            tick_secs: 30,
            inter_message_delay_ms: 2000,
            gate_memo_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn inter_message_delay(&self) -> Duration {
        Duration::from_millis(self.inter_message_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Trigger-check cadence; granularity of all cron firing.
    pub tick_secs: u64,
    /// Terminal jobs older than this are deleted by the retention sweep.
    pub retention_days: u32,
    /// Stale-lease sweep cadence.
    pub recovery_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            retention_days: 30,
            recovery_interval_secs: 60,
        }
    }
}

/// Per-tenant settings, stored as JSON in the tenants table. Fields a tenant
/// omits fall back to `[tenant_defaults]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Chat gateway instance identifier for this tenant.
    pub instance: String,
    pub business_name: String,
    pub business_address: Option<String>,
    pub previsit_enabled: bool,
    /// Tenant-local hour-of-day the pre-visit and no-show producers fire.
    pub previsit_hour: u8,
    pub noshow_enabled: bool,
    pub audit_enabled: bool,
    pub audit_hour: u8,
    /// How many past days each audit run reconciles.
    pub audit_days: u32,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// How far `run_at` is pushed when a handoff is active.
    pub handoff_grace_secs: u64,
    /// Max jobs claimed for this tenant per poll.
    pub batch_size: u32,
    /// How often this tenant's queue is polled; clamped below by the
    /// worker tick.
    pub poll_interval_secs: u64,
    /// An uncommitted claim on this tenant's jobs is reclaimable after
    /// this long.
    pub visibility_timeout_secs: u64,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            instance: String::new(),
            business_name: String::new(),
            business_address: None,
            previsit_enabled: true,
            previsit_hour: 18,
            noshow_enabled: true,
            audit_enabled: true,
            audit_hour: 2,
            audit_days: 7,
            max_attempts: 3,
            base_delay_secs: 1,
            max_delay_secs: 10,
            handoff_grace_secs: 300,
            batch_size: 50,
            poll_interval_secs: 30,
            visibility_timeout_secs: 600,
        }
    }
}

impl TenantSettings {
    pub fn handoff_grace(&self) -> Duration {
        Duration::from_secs(self.handoff_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Overlay a tenant's stored settings JSON onto the configured defaults.
    /// Fields the tenant row omits keep the default value; a malformed row
    /// falls back to the defaults entirely.
    pub fn from_value_with_defaults(
        value: &serde_json::Value,
        defaults: &TenantSettings,
    ) -> TenantSettings {
        let mut merged = match serde_json::to_value(defaults) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return defaults.clone(),
        };
        if let serde_json::Value::Object(overrides) = value {
            for (key, val) in overrides {
                merged.insert(key.clone(), val.clone());
            }
        }
        serde_json::from_value(serde_json::Value::Object(merged))
            .unwrap_or_else(|_| defaults.clone())
    }
}
