//! ClickHouse sink over the HTTP interface
//!
//! Sends the `INSERT` statement as the `query` parameter and the encoded rows
//! as the request body, so row data never becomes part of the SQL text.
//!
//! # Example
//!
//! ```ignore
//! let sink = ClickHouseSink::new("http://clickhouse:8123")?
//!     .database("analytics")
//!     .credentials("ingest", "secret");
//! ```

use crate::encode::BatchPayload;
use crate::error::SinkError;
use crate::sink::Sink;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Progress summary ClickHouse attaches to HTTP responses
#[derive(Deserialize)]
struct QuerySummary {
    written_rows: String,
}

/// Rows reported in `X-ClickHouse-Summary`, if the header is present and valid
fn summary_written_rows(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("x-clickhouse-summary")?.to_str().ok()?;
    let summary: QuerySummary = serde_json::from_str(raw).ok()?;
    summary.written_rows.parse().ok()
}

/// HTTP sink for ClickHouse
pub struct ClickHouseSink {
    client: Client,
    url: String,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseSink {
    /// Create a sink for the given HTTP endpoint (e.g. `http://localhost:8123`)
    ///
    /// # Errors
    /// Returns `SinkError::Init` if the HTTP client cannot be created
    pub fn new(url: impl Into<String>) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SinkError::Init(format!("Failed to build HTTP client: {}", e)))?;

        let url: String = url.into();

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            database: None,
            user: None,
            password: None,
        })
    }

    /// Target database (defaults to the server's default database)
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Authenticate with user and password headers
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn insert(&self, batch: &BatchPayload) -> Result<u64, SinkError> {
        if batch.rows == 0 {
            return Ok(0);
        }

        let mut params = vec![("query", batch.statement.as_str())];
        if let Some(database) = &self.database {
            params.push(("database", database.as_str()));
        }

        let mut request = self
            .client
            .post(format!("{}/", self.url))
            .query(&params)
            .body(batch.body.clone());

        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let written = summary_written_rows(response.headers())
                        .unwrap_or(batch.rows as u64);
                    debug!(
                        table = %batch.table,
                        rows = written,
                        status = %status,
                        "Batch inserted"
                    );
                    Ok(written)
                } else {
                    let body = response.text().await.unwrap_or_default();
                    error!(
                        table = %batch.table,
                        status = %status,
                        body = %body,
                        "Insert rejected"
                    );
                    Err(SinkError::Rejected {
                        status: status.as_u16(),
                        body,
                    })
                }
            }
            Err(e) => {
                error!(url = %self.url, error = %e, "ClickHouse connection failed");
                Err(SinkError::Connection(format!(
                    "Failed to connect to {}: {}",
                    self.url, e
                )))
            }
        }
    }

    async fn health(&self) -> bool {
        let url = format!("{}/ping", self.url);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    debug!(url = %url, status = %response.status(), "Ping returned error");
                }
                healthy
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Ping failed");
                false
            }
        }
    }
}
