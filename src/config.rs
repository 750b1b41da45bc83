//! Runtime configuration, loaded from the environment (spec.md §6
//! "Configuration"). Mirrors the teacher's `Config::from_env()` convention
//! used in `packages/server/src/server/main.rs`.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub poll_interval_cron: Duration,
    pub poll_interval_delayed: Duration,
    pub poll_interval_chain: Duration,
    pub poll_interval_monitor: Duration,

    pub executor_pool_size: usize,
    pub probe_http_max_response_bytes: usize,
    pub probe_icmp_max_count: u32,
    pub overlap_cleanup_period: Duration,
    pub execution_retention_default_days: i64,
    pub notification_webhook_timeout: Duration,

    /// Overridable only for tests, per spec.md §6.
    pub ssrf_blocked_cidrs_override: Option<Vec<String>>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        let ssrf_override = std::env::var("SSRF_BLOCKED_CIDRS_OVERRIDE")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect());

        Ok(Self {
            database_url,
            port: env_or("PORT", 8080),
            poll_interval_cron: Duration::from_secs(env_or("SCHEDULER_POLL_INTERVAL_CRON_SECS", 2)),
            poll_interval_delayed: Duration::from_secs(env_or(
                "SCHEDULER_POLL_INTERVAL_DELAYED_SECS",
                1,
            )),
            poll_interval_chain: Duration::from_secs(env_or(
                "SCHEDULER_POLL_INTERVAL_CHAIN_SECS",
                5,
            )),
            poll_interval_monitor: Duration::from_secs(env_or(
                "SCHEDULER_POLL_INTERVAL_MONITOR_SECS",
                30,
            )),
            executor_pool_size: env_or("EXECUTOR_POOL_SIZE", 16),
            probe_http_max_response_bytes: env_or("PROBE_HTTP_MAX_RESPONSE_BYTES", 65536),
            probe_icmp_max_count: env_or("PROBE_ICMP_MAX_COUNT", 10),
            overlap_cleanup_period: Duration::from_secs(env_or(
                "OVERLAP_CLEANUP_PERIOD_SECS",
                300,
            )),
            execution_retention_default_days: env_or("EXECUTION_RETENTION_DEFAULT_DAYS", 7),
            notification_webhook_timeout: Duration::from_secs(env_or(
                "NOTIFICATION_WEBHOOK_TIMEOUT_SECS",
                30,
            )),
            ssrf_blocked_cidrs_override: ssrf_override,
        })
    }
}
