//! Flush executor
//!
//! Moves a table's buffered values into the datastore:
//!
//! ```text
//! token(table) ──► lock schema ──► read snapshot ──► encode ──► sink.insert ──► trim(snapshot.len())
//!                                       │                                │
//!                                       └─ empty: done, no insert        └─ error: buffer untouched
//! ```
//!
//! At most one flush per table runs at a time. The field list is read from
//! the [`SchemaRegistry`] under the same lock admissions append under, so the
//! snapshot is always decoded with the schema its values were admitted with.
//! Because only the snapshot length is trimmed, values appended while the
//! insert is in flight stay buffered for the next flush.

use crate::buffer::BufferStore;
use crate::encode::{BatchFormat, encode};
use crate::error::FlushError;
use crate::metrics;
use crate::record::Value;
use crate::schema::SchemaRegistry;
use crate::sink::Sink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Occupancy reached the buffer limit
    Immediate,
    /// Quiescence timer fired
    Deferred,
    /// Operator request
    Manual,
    /// Final drain on shutdown
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Immediate => "immediate",
            FlushTrigger::Deferred => "deferred",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Result of a successful flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Rows the datastore reported as written
    pub rows_written: u64,
    /// Values left buffered for the table after the flush
    pub remaining_values: usize,
}

impl FlushOutcome {
    fn empty() -> Self {
        Self {
            rows_written: 0,
            remaining_values: 0,
        }
    }
}

type FlushToken = Arc<tokio::sync::Mutex<()>>;

/// Performs bulk writes and success-gated buffer trims
pub struct FlushExecutor {
    store: Arc<dyn BufferStore>,
    schemas: Arc<SchemaRegistry>,
    sink: Arc<dyn Sink>,
    format: BatchFormat,
    /// Per-table flush tokens, dropped when no flush holds or waits on them
    tokens: Mutex<HashMap<String, FlushToken>>,
}

impl FlushExecutor {
    pub fn new(
        store: Arc<dyn BufferStore>,
        schemas: Arc<SchemaRegistry>,
        sink: Arc<dyn Sink>,
        format: BatchFormat,
    ) -> Self {
        Self {
            store,
            schemas,
            sink,
            format,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn format(&self) -> BatchFormat {
        self.format
    }

    fn token(&self, table: &str) -> FlushToken {
        let mut tokens = self.tokens.lock();
        Arc::clone(tokens.entry(table.to_string()).or_default())
    }

    fn release_token(&self, table: &str, token: FlushToken) {
        let mut tokens = self.tokens.lock();
        // One reference in the map, one here: no flush is waiting
        if Arc::strong_count(&token) == 2
            && tokens.get(table).is_some_and(|t| Arc::ptr_eq(t, &token))
        {
            tokens.remove(table);
        }
    }

    /// Number of tables with a flush running or queued
    pub fn tokens_held(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Whether a flush for the table currently holds its token
    pub fn is_in_flight(&self, table: &str) -> bool {
        self.tokens
            .lock()
            .get(table)
            .is_some_and(|token| token.try_lock().is_err())
    }

    /// Flush everything currently buffered for `table`
    ///
    /// The values are decoded with the field list registered for them.
    /// Flushing an empty buffer performs no insert. On any error the buffer is
    /// left as it was.
    pub async fn flush(&self, table: &str) -> Result<FlushOutcome, FlushError> {
        let token = self.token(table);
        let result = {
            let _guard = token.lock().await;
            self.flush_locked(table).await
        };
        self.release_token(table, token);
        result
    }

    async fn flush_locked(&self, table: &str) -> Result<FlushOutcome, FlushError> {
        let flush_id = ulid::Ulid::new();

        let (fields, snapshot) = self.snapshot(table).await?;

        if snapshot.is_empty() {
            debug!(table = %table, %flush_id, "Nothing buffered, skipping flush");
            self.forget_if_drained(table).await;
            return Ok(FlushOutcome::empty());
        }

        let Some(fields) = fields.filter(|f| !f.is_empty()) else {
            error!(
                table = %table,
                %flush_id,
                buffered = snapshot.len(),
                "Buffered values have no registered schema, leaving buffer untouched"
            );
            return Err(FlushError::NoFields {
                table: table.to_string(),
            });
        };

        let width = fields.len();
        if snapshot.len() % width != 0 {
            error!(
                table = %table,
                %flush_id,
                buffered = snapshot.len(),
                width,
                "Buffered values do not split into whole rows, leaving buffer untouched"
            );
            return Err(FlushError::SchemaMismatch {
                table: table.to_string(),
                buffered: snapshot.len(),
                width,
            });
        }

        let payload = encode(table, &fields, snapshot.chunks(width), self.format).map_err(
            |source| {
                error!(
                    table = %table,
                    %flush_id,
                    error = %source,
                    "Batch encoding failed, leaving buffer untouched"
                );
                FlushError::Encode {
                    table: table.to_string(),
                    source,
                }
            },
        )?;
        debug!(
            table = %table,
            %flush_id,
            rows = payload.rows,
            bytes = payload.body.len(),
            sink = self.sink.name(),
            "Flushing batch"
        );

        let written = self
            .sink
            .insert(&payload)
            .await
            .map_err(|source| {
                error!(
                    table = %table,
                    %flush_id,
                    rows = payload.rows,
                    error = %source,
                    "Bulk insert failed, data stays buffered"
                );
                FlushError::Sink {
                    table: table.to_string(),
                    source,
                }
            })?;

        if written != payload.rows as u64 {
            warn!(
                table = %table,
                %flush_id,
                sent = payload.rows,
                written,
                "Datastore reported a different row count"
            );
        }

        if let Err(source) = self.store.trim_front(table, snapshot.len()).await {
            error!(
                table = %table,
                %flush_id,
                error = %source,
                "Rows written but buffer not trimmed, they will be written again"
            );
            return Err(FlushError::Store {
                table: table.to_string(),
                source,
            });
        }

        let remaining_values = match self.store.len(table).await {
            Ok(len) => len,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not read remaining buffer size");
                0
            }
        };
        if remaining_values == 0 {
            self.forget_if_drained(table).await;
        }

        info!(
            table = %table,
            %flush_id,
            rows = written,
            remaining_values,
            "Batch committed"
        );

        Ok(FlushOutcome {
            rows_written: written,
            remaining_values,
        })
    }

    /// Read the table's field list and buffered values as one unit
    async fn snapshot(&self, table: &str) -> Result<(Option<Vec<String>>, Vec<Value>), FlushError> {
        let slot = self.schemas.slot(table);
        let schema = slot.lock().await;
        let snapshot = self
            .store
            .read_all(table)
            .await
            .map_err(|source| FlushError::Store {
                table: table.to_string(),
                source,
            })?;
        Ok((schema.clone(), snapshot))
    }

    async fn forget_if_drained(&self, table: &str) {
        if self
            .schemas
            .release_if_drained(table, self.store.as_ref())
            .await
        {
            metrics::try_forget_table(table);
        }
    }

    /// Flush and record the attempt under `trigger`
    pub async fn flush_triggered(
        &self,
        trigger: FlushTrigger,
        table: &str,
    ) -> Result<FlushOutcome, FlushError> {
        let started = Instant::now();
        let result = self.flush(table).await;
        let seconds = started.elapsed().as_secs_f64();

        match &result {
            Ok(outcome) => {
                metrics::try_record_flush(
                    table,
                    trigger.as_str(),
                    "ok",
                    outcome.rows_written,
                    seconds,
                );
                if outcome.remaining_values > 0 {
                    metrics::try_set_buffered(table, outcome.remaining_values);
                }
            }
            Err(e) => {
                metrics::try_record_flush(table, trigger.as_str(), e.kind(), 0, seconds);
            }
        }

        result
    }
}
