//! KASA Gateway - Buffered Batch Ingestion Gateway
//!
//! ## Usage
//!
//! ```bash
//! # Print batches to stdout
//! cargo run
//!
//! # Write to ClickHouse
//! KASA_CLICKHOUSE_URL=http://localhost:8123 cargo run
//! ```
//!
//! ## Environment Variables
//!
//! - `KASA_HTTP_ADDR`: ingestion address (default: "0.0.0.0:8080")
//! - `KASA_METRICS_ADDR`: metrics address (default: "0.0.0.0:9090")
//! - `KASA_BUFFER_LIMIT`: records per table before an immediate flush (default: 1000)
//! - `KASA_SYNC_INTERVAL_MS`: deferred flush interval (default: 5000)
//! - `KASA_TIMER_POLICY`: `coalesce` or `reset` (default: coalesce)
//! - `KASA_BATCH_FORMAT`: `json` or `values` (default: json)
//! - `KASA_STORE_CAPACITY`: total buffered values, 0 for unbounded (default: 0)
//! - `KASA_CLICKHOUSE_URL`, `KASA_CLICKHOUSE_DATABASE`, `KASA_CLICKHOUSE_USER`,
//!   `KASA_CLICKHOUSE_PASSWORD`: datastore endpoint
//! - `KASA_LOG_LEVEL`: log level (default: "info")
//! - `KASA_LOG_FORMAT`: `json` or `pretty` (default: pretty)

use kasa_gateway::buffer::MemoryBufferStore;
use kasa_gateway::config::{Config, LogFormat};
use kasa_gateway::metrics::Metrics;
use kasa_gateway::metrics_server::MetricsServer;
use kasa_gateway::pipeline::Pipeline;
use kasa_gateway::server;
use kasa_gateway::sink::{ClickHouseSink, Sink, StdoutSink};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!(
        http_addr = %config.http_addr,
        metrics_addr = %config.metrics_addr,
        buffer_limit = config.buffer_limit,
        sync_interval_ms = config.sync_interval_ms,
        timer_policy = config.timer_policy.as_str(),
        batch_format = config.batch_format.as_str(),
        "Starting KASA Gateway"
    );

    Metrics::init()?;
    let metrics_handle = MetricsServer::start(config.metrics_addr);

    let sink: Arc<dyn Sink> = match &config.clickhouse {
        Some(clickhouse) => {
            let mut sink = ClickHouseSink::new(clickhouse.url.clone())?;
            if let Some(database) = &clickhouse.database {
                sink = sink.database(database.clone());
            }
            if let Some(user) = &clickhouse.user {
                sink = sink.credentials(
                    user.clone(),
                    clickhouse.password.clone().unwrap_or_default(),
                );
            }
            info!(url = %sink.url(), "Writing batches to ClickHouse");
            if !sink.health().await {
                warn!(url = %sink.url(), "ClickHouse not reachable yet, batches stay buffered until it is");
            }
            Arc::new(sink)
        }
        None => {
            info!("No ClickHouse URL configured, printing batches to stdout");
            Arc::new(StdoutSink::pretty())
        }
    };

    let store = match config.store_capacity {
        0 => MemoryBufferStore::new(),
        capacity => MemoryBufferStore::with_capacity(capacity),
    };

    let pipeline = Arc::new(
        Pipeline::builder()
            .buffer_limit(config.buffer_limit)
            .sync_interval(config.sync_interval())
            .timer_policy(config.timer_policy)
            .format(config.batch_format)
            .store(store)
            .sink_arc(sink)
            .build()?,
    );

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    server::serve(listener, Arc::clone(&pipeline), shutdown_signal()).await?;

    // Drain buffered data before exiting
    let rows = pipeline.shutdown().await?;
    metrics_handle.abort();

    info!(rows_flushed = rows, "KASA Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
