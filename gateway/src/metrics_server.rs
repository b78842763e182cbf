//! HTTP server for Prometheus metrics endpoint
//!
//! Runs on its own port, apart from the ingestion API:
//!
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /health`: `200` with the `kasa_*` metric families currently
//!   exported, `503` until [`Metrics::init`] has run
//!
//! # Example
//!
//! ```ignore
//! use kasa_gateway::metrics_server::MetricsServer;
//!
//! // Start metrics server on port 9090
//! let metrics_handle = MetricsServer::start("0.0.0.0:9090".parse()?);
//!
//! // Later, to shutdown
//! metrics_handle.abort();
//! ```

use crate::metrics::{self, Metrics};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Prefix shared by every metric this crate registers
const METRIC_PREFIX: &str = "kasa_";

/// Body of the metrics server's `/health`
#[derive(Debug, Serialize)]
struct MetricsHealth {
    status: &'static str,
    /// Names of the exported `kasa_*` families, sorted
    families: Vec<String>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on the given address
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(addr: SocketAddr) -> JoinHandle<()> {
        tokio::spawn(async move {
            let app = router();

            info!(%addr, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Names of the `kasa_*` families in the default registry
fn exported_families() -> Vec<String> {
    let mut names: Vec<String> = prometheus::gather()
        .iter()
        .map(|family| family.get_name())
        .filter(|name| name.starts_with(METRIC_PREFIX))
        .map(String::from)
        .collect();
    names.sort();
    names
}

/// Handler for /health endpoint
async fn health_handler() -> impl IntoResponse {
    if Metrics::get().is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(MetricsHealth {
                status: "uninitialized",
                families: Vec::new(),
            }),
        );
    }
    (
        StatusCode::OK,
        Json(MetricsHealth {
            status: "ok",
            families: exported_families(),
        }),
    )
}
