//! Configuration for KASA

use crate::encode::BatchFormat;
use crate::error::{KasaError, Result};
use crate::scheduler::TimerPolicy;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for KASA
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingestion server address
    pub http_addr: SocketAddr,

    /// Metrics server address
    pub metrics_addr: SocketAddr,

    /// Occupancy (buffered records) that triggers an immediate flush
    pub buffer_limit: f64,

    /// Deferred flush interval in milliseconds
    pub sync_interval_ms: u64,

    /// Re-arm behaviour of the deferred flush
    pub timer_policy: TimerPolicy,

    /// Bulk insert body format
    pub batch_format: BatchFormat,

    /// Total values the buffer store may hold, 0 for unbounded
    pub store_capacity: usize,

    /// ClickHouse endpoint; batches go to stdout when unset
    pub clickhouse: Option<ClickHouseConfig>,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,
}

/// ClickHouse HTTP endpoint settings
#[derive(Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for ClickHouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseConfig")
            .field("url", &self.url)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            buffer_limit: 1000.0,
            sync_interval_ms: 5000,
            timer_policy: TimerPolicy::Coalesce,
            batch_format: BatchFormat::JsonCompactEachRow,
            store_capacity: 0,
            clickhouse: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("KASA_HTTP_ADDR") {
            config.http_addr = parse("KASA_HTTP_ADDR", &addr)?;
        }

        if let Some(addr) = lookup("KASA_METRICS_ADDR") {
            config.metrics_addr = parse("KASA_METRICS_ADDR", &addr)?;
        }

        if let Some(limit) = lookup("KASA_BUFFER_LIMIT") {
            let limit: f64 = parse("KASA_BUFFER_LIMIT", &limit)?;
            if !limit.is_finite() || limit <= 0.0 {
                return Err(KasaError::Config(format!(
                    "invalid KASA_BUFFER_LIMIT: {limit} (must be a positive number)"
                )));
            }
            config.buffer_limit = limit;
        }

        if let Some(interval) = lookup("KASA_SYNC_INTERVAL_MS") {
            let interval: u64 = parse("KASA_SYNC_INTERVAL_MS", &interval)?;
            if interval == 0 {
                return Err(KasaError::Config(
                    "invalid KASA_SYNC_INTERVAL_MS: must be greater than zero".to_string(),
                ));
            }
            config.sync_interval_ms = interval;
        }

        if let Some(policy) = lookup("KASA_TIMER_POLICY") {
            config.timer_policy = policy
                .parse()
                .map_err(|e| KasaError::Config(format!("invalid KASA_TIMER_POLICY: {e}")))?;
        }

        if let Some(format) = lookup("KASA_BATCH_FORMAT") {
            config.batch_format = format
                .parse()
                .map_err(|e| KasaError::Config(format!("invalid KASA_BATCH_FORMAT: {e}")))?;
        }

        if let Some(capacity) = lookup("KASA_STORE_CAPACITY") {
            config.store_capacity = parse("KASA_STORE_CAPACITY", &capacity)?;
        }

        if let Some(url) = lookup("KASA_CLICKHOUSE_URL").filter(|u| !u.trim().is_empty()) {
            config.clickhouse = Some(ClickHouseConfig {
                url,
                database: lookup("KASA_CLICKHOUSE_DATABASE"),
                user: lookup("KASA_CLICKHOUSE_USER"),
                password: lookup("KASA_CLICKHOUSE_PASSWORD"),
            });
        }

        if let Some(level) = lookup("KASA_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(format) = lookup("KASA_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(KasaError::Config(format!(
                        "invalid KASA_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| KasaError::Config(format!("invalid {key}: {e}")))
}
