//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "bookline.toml",
    "config.toml",
    "./config/bookline.toml",
    "/etc/bookline/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment overrides.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("BOOKLINE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("BOOKLINE_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("BOOKLINE_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }

        // Storage
        if let Ok(val) = env::var("BOOKLINE_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("BOOKLINE_REDIS_URL") {
            config.redis.url = val;
        }

        // Chat gateway
        if let Ok(val) = env::var("BOOKLINE_GATEWAY_URL") {
            config.gateway.base_url = val;
        }
        if let Ok(val) = env::var("BOOKLINE_GATEWAY_API_KEY") {
            config.gateway.api_key = val;
        }

        // Calendar
        if let Ok(val) = env::var("BOOKLINE_CALENDAR_URL") {
            config.calendar.base_url = val;
        }
        if let Ok(val) = env::var("BOOKLINE_CALENDAR_TOKEN") {
            config.calendar.api_token = val;
        }

        // Dialogue collaborator
        if let Ok(val) = env::var("BOOKLINE_DIALOGUE_URL") {
            config.dialogue.url = val;
        }

        // Admin
        if let Ok(val) = env::var("BOOKLINE_ADMIN_TOKEN") {
            config.admin.token = val;
        }

        // Worker
        if let Ok(val) = env::var("BOOKLINE_WORKER_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                config.worker.concurrency = n;
            }
        }
        if let Ok(val) = env::var("BOOKLINE_WORKER_TICK_SECS") {
            if let Ok(n) = val.parse() {
                config.worker.tick_secs = n;
            }
        }
        // Tenant defaults (per-tenant overrides live in the tenants table)
        if let Ok(val) = env::var("BOOKLINE_DEFAULT_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.tenant_defaults.batch_size = n;
            }
        }
        if let Ok(val) = env::var("BOOKLINE_DEFAULT_POLL_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.tenant_defaults.poll_interval_secs = n;
            }
        }
        if let Ok(val) = env::var("BOOKLINE_DEFAULT_VISIBILITY_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.tenant_defaults.visibility_timeout_secs = n;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
