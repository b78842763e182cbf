//! HTTP ingestion server for KASA
//!
//! Routes:
//!
//! - `POST /`: one JSON object per request; the first key names the table,
//!   the remaining keys are the record's fields in order
//! - `POST /flush/{table}`: flush a table now
//! - `GET /health`: buffer store and sink health
//!
//! Anything else answers `404`.

use crate::error::{DecodeError, FlushError, IngestError, Result};
use crate::metrics;
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::record::Record;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Acknowledgement for a buffered record
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub table: String,
    pub rows_written: u64,
    pub remaining_values: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub sink: &'static str,
    pub sink_healthy: bool,
    pub buffered_tables: usize,
    pub pending_flushes: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request failure with the status it maps to
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        Self {
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

impl From<FlushError> for ApiError {
    fn from(err: FlushError) -> Self {
        Self {
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Build the ingestion router
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/", post(ingest_handler))
        .route("/flush/{table}", post(flush_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(pipeline)
}

/// Serve the ingestion API until `shutdown` resolves
///
/// Buffered data is not flushed here; call [`Pipeline::shutdown`] afterwards.
pub async fn serve<F>(listener: TcpListener, pipeline: Arc<Pipeline>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Ingestion server listening");
    }
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ingest_handler(State(pipeline): State<Arc<Pipeline>>, body: Bytes) -> Response {
    match process_ingest(&pipeline, &body).await {
        Ok(outcome) => Json(IngestResponse {
            message: "All data successfully stored",
            outcome,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn process_ingest(
    pipeline: &Pipeline,
    body: &[u8],
) -> std::result::Result<IngestOutcome, ApiError> {
    let record = Record::from_json(body).map_err(|e| {
        debug!(error = %e, "Rejected undecodable record");
        metrics::try_record_rejected("decode");
        e
    })?;
    Ok(pipeline.ingest(record).await?)
}

async fn flush_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Path(table): Path<String>,
) -> std::result::Result<Json<FlushResponse>, ApiError> {
    let outcome = pipeline.flush(&table).await.map_err(|e| {
        warn!(table = %table, error = %e, "Manual flush failed");
        e
    })?;
    Ok(Json(FlushResponse {
        table,
        rows_written: outcome.rows_written,
        remaining_values: outcome.remaining_values,
    }))
}

async fn health_handler(State(pipeline): State<Arc<Pipeline>>) -> Response {
    let sink_healthy = pipeline.sink_health().await;
    let buffered_tables = match pipeline.buffered_tables().await {
        Ok(tables) => Some(tables.len()),
        Err(e) => {
            warn!(error = %e, "Buffer store unavailable");
            None
        }
    };

    let healthy = sink_healthy && buffered_tables.is_some();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            store: pipeline.store_name(),
            sink: pipeline.sink_name(),
            sink_healthy,
            buffered_tables: buffered_tables.unwrap_or(0),
            pending_flushes: pipeline.pending_flushes().len(),
        }),
    )
        .into_response()
}

async fn not_found_handler() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "This page does not exist".to_string(),
    }
}
