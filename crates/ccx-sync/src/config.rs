use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ccx_adapters::{GatewayConfig, DEFAULT_PRICING_URL, DEFAULT_REFERENCE_URL};

use crate::controller::ControllerOptions;
use crate::reconcile::DEFAULT_CHUNK_SIZE;
use crate::store::MAX_CHUNK_ROWS;
use crate::summary::DEFAULT_SUMMARY_TOP_N;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub gateway: GatewayConfig,
    pub chunk_size: usize,
    pub summary_top_n: usize,
    pub cache_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    env_string(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_string("DATABASE_URL"),
            db_max_connections: env_parse("CCX_DB_MAX_CONNECTIONS", 5),
            gateway: GatewayConfig {
                reference_url: env_string("CCX_REFERENCE_URL")
                    .unwrap_or_else(|| DEFAULT_REFERENCE_URL.to_string()),
                pricing_url: env_string("CCX_PRICING_URL")
                    .unwrap_or_else(|| DEFAULT_PRICING_URL.to_string()),
                reference_fixture: env_string("CCX_REFERENCE_FIXTURE").map(PathBuf::from),
                pricing_fixture: env_string("CCX_PRICING_FIXTURE").map(PathBuf::from),
                timeout: Duration::from_secs(env_parse("CCX_SOURCE_TIMEOUT_SECS", 30)),
                user_agent: env_string("CCX_USER_AGENT").unwrap_or_else(|| "ccx-bot/0.1".to_string()),
                max_retries: env_parse("CCX_SOURCE_MAX_RETRIES", 0),
            },
            chunk_size: env_parse("CCX_RECONCILE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).clamp(1, MAX_CHUNK_ROWS),
            summary_top_n: env_parse("CCX_SUMMARY_TOP_N", DEFAULT_SUMMARY_TOP_N),
            cache_dir: env_string("CCX_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            scheduler_enabled: env_flag("CCX_SCHEDULER_ENABLED"),
            refresh_cron: env_string("CCX_REFRESH_CRON").unwrap_or_else(|| "0 */6 * * *".to_string()),
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            chunk_size: self.chunk_size,
            summary_top_n: self.summary_top_n,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            gateway: GatewayConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            summary_top_n: DEFAULT_SUMMARY_TOP_N,
            cache_dir: PathBuf::from("./cache"),
            scheduler_enabled: false,
            refresh_cron: "0 */6 * * *".to_string(),
        }
    }
}
