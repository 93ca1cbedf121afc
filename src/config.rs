//! Configuration module.
//!
//! Static server configuration comes from environment variables with
//! sensible defaults. Monitoring knobs additionally live in a JSON settings
//! row in the database so they can be changed at runtime; reads go through
//! a short TTL cache so the tick loop never hits the database every tick.

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::Store;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "daare.db")
    pub db_path: String,
    /// Directory for the durable check-result buffer log (default: "data")
    pub data_dir: String,
    /// Discord webhook URL for state-change notifications (default: unset)
    pub discord_webhook_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "daare.db".to_string(),
            data_dir: "data".to_string(),
            discord_webhook_url: String::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DAARE_DB_PATH`: SQLite database path
    /// - `DAARE_DATA_DIR`: buffer log directory
    /// - `DAARE_DISCORD_WEBHOOK`: state-change webhook URL
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("DAARE_DB_PATH") {
            cfg.db_path = path;
        }
        if let Ok(dir) = env::var("DAARE_DATA_DIR") {
            cfg.data_dir = dir;
        }
        if let Ok(url) = env::var("DAARE_DISCORD_WEBHOOK") {
            cfg.discord_webhook_url = url;
        }

        cfg
    }
}

/// Monitoring knobs consumed by the engine. Stored settings are partial:
/// any field missing from the settings row falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Per-check timeout enforced by each strategy.
    pub timeout_ms: u64,
    /// Extra margin the outer watchdog grants a strategy past its timeout.
    pub watchdog_margin_ms: u64,
    pub max_redirects: usize,
    pub max_content_length_bytes: u64,
    /// Tick loop cadence.
    pub tick_interval_ms: u64,
    /// Global ceiling on simultaneously in-flight checks.
    pub max_concurrency: usize,
    pub min_interval_ms: i64,
    pub max_interval_ms: i64,
    /// How often the registry is reconciled against the monitors table.
    pub sync_interval_ms: u64,
    /// Cap on the random offset applied to first-seen monitors.
    pub startup_jitter_max_ms: i64,
    pub retention_days: i64,
    pub cleanup_interval_ms: u64,
    /// How often the result buffer is flushed to the database.
    pub flush_interval_ms: u64,
    /// Refuse checks whose target resolves to a private address.
    pub block_private_ips: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            watchdog_margin_ms: 2_000,
            max_redirects: 5,
            max_content_length_bytes: 2 * 1024 * 1024,
            tick_interval_ms: 500,
            max_concurrency: 5,
            min_interval_ms: 10_000,
            max_interval_ms: 3_600_000,
            sync_interval_ms: 3_000,
            startup_jitter_max_ms: 5_000,
            retention_days: 30,
            cleanup_interval_ms: 24 * 60 * 60 * 1000,
            flush_interval_ms: 5 * 60 * 1000,
            block_private_ips: true,
        }
    }
}

const SETTINGS_CACHE_TTL: Duration = Duration::from_secs(5);

/// Database-backed monitoring settings with a TTL read cache.
pub struct Settings {
    store: Store,
    cached: Mutex<Option<(MonitoringConfig, Instant)>>,
}

impl Settings {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Current monitoring configuration. Re-reads the settings row at most
    /// once per cache TTL; on a read failure the previous value (or the
    /// defaults) stays in effect.
    pub fn monitoring(&self) -> MonitoringConfig {
        let mut cached = self.cached.lock().unwrap();

        if let Some((cfg, at)) = cached.as_ref() {
            if at.elapsed() < SETTINGS_CACHE_TTL {
                return cfg.clone();
            }
        }

        let cfg = match self.store.read_settings() {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("Settings: stored settings unreadable, using defaults: {}", e);
                    MonitoringConfig::default()
                }
            },
            Ok(None) => MonitoringConfig::default(),
            Err(e) => {
                tracing::warn!("Settings: read failed, keeping previous values: {}", e);
                cached
                    .as_ref()
                    .map(|(cfg, _)| cfg.clone())
                    .unwrap_or_default()
            }
        };

        *cached = Some((cfg.clone(), Instant::now()));
        cfg
    }

    /// Persist new monitoring settings and refresh the cache immediately.
    pub fn update(&self, cfg: &MonitoringConfig) -> Result<(), crate::db::DbError> {
        let json = serde_json::to_string(cfg).unwrap_or_else(|_| "{}".to_string());
        self.store.write_settings(&json)?;
        *self.cached.lock().unwrap() = Some((cfg.clone(), Instant::now()));
        Ok(())
    }
}
