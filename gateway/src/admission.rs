//! Admission controller
//!
//! Appends each record to its table buffer and decides how the buffer gets
//! flushed:
//!
//! - occupancy >= buffer limit: [`FlushDecision::Immediate`], the caller
//!   flushes before acknowledging the write
//! - otherwise: [`FlushDecision::Deferred`], the caller arms the table's
//!   quiescence timer
//!
//! Occupancy is the buffered value count divided by the record width, i.e.
//! the number of buffered records when every record of the table has the same
//! width. Admissions for one table are serialized on its
//! [`SchemaRegistry`] slot, so the schema check, the append and the occupancy
//! reading all see the same buffer.

use crate::buffer::BufferStore;
use crate::error::IngestError;
use crate::metrics;
use crate::record::Record;
use crate::schema::SchemaRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a freshly buffered record should be flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Threshold reached: flush synchronously, do not arm a timer
    Immediate,
    /// Under threshold: arm the deferred flush
    Deferred,
}

impl FlushDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushDecision::Immediate => "immediate",
            FlushDecision::Deferred => "deferred",
        }
    }
}

/// Result of admitting one record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub decision: FlushDecision,
    /// Values buffered for the table after the append
    pub buffered_values: usize,
    /// Records-equivalent occupancy after the append
    pub occupancy: f64,
}

/// Occupancy of a buffer holding `buffered_values` for records of `width` fields
pub fn occupancy(buffered_values: usize, width: usize) -> f64 {
    if width == 0 {
        return 0.0;
    }
    buffered_values as f64 / width as f64
}

/// Decides, per ingest, between immediate and deferred flushing
pub struct AdmissionController {
    store: Arc<dyn BufferStore>,
    schemas: Arc<SchemaRegistry>,
    buffer_limit: f64,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn BufferStore>,
        schemas: Arc<SchemaRegistry>,
        buffer_limit: f64,
    ) -> Self {
        Self {
            store,
            schemas,
            buffer_limit,
        }
    }

    pub fn buffer_limit(&self) -> f64 {
        self.buffer_limit
    }

    /// Decision for a given occupancy
    pub fn decide(&self, occupancy: f64) -> FlushDecision {
        if occupancy >= self.buffer_limit {
            FlushDecision::Immediate
        } else {
            FlushDecision::Deferred
        }
    }

    /// Field list of the data buffered for `table`, if any has been admitted
    pub async fn schema(&self, table: &str) -> Option<Vec<String>> {
        self.schemas.get(table).await
    }

    /// Append a record to its table buffer and decide how to flush it
    ///
    /// A record whose fields differ from the table's buffered schema is only
    /// accepted once that buffer has been flushed empty.
    pub async fn admit(&self, record: &Record) -> Result<Admission, IngestError> {
        let table = record.table.as_str();
        let slot = self.schemas.slot(table);
        let mut schema = slot.lock().await;

        if let Some(expected) = schema.as_ref().filter(|f| **f != record.fields) {
            let buffered = self
                .store
                .len(table)
                .await
                .map_err(|source| IngestError::IngestFailed {
                    table: table.to_string(),
                    source,
                })?;
            if buffered > 0 {
                warn!(
                    table = %table,
                    expected = ?expected,
                    got = ?record.fields,
                    buffered,
                    "Field list changed while data is buffered, rejecting record"
                );
                metrics::try_record_rejected("schema_mismatch");
                return Err(IngestError::SchemaMismatch {
                    table: table.to_string(),
                    expected: expected.clone(),
                    got: record.fields.clone(),
                });
            }
            info!(table = %table, fields = ?record.fields, "Table schema changed");
        }

        let buffered_values = match self.store.append(table, &record.values).await {
            Ok(total) => total,
            Err(source) => {
                warn!(table = %table, error = %source, "Buffer append failed");
                metrics::try_record_rejected("store");
                return Err(IngestError::IngestFailed {
                    table: table.to_string(),
                    source,
                });
            }
        };

        if schema.as_ref() != Some(&record.fields) {
            *schema = Some(record.fields.clone());
        }
        drop(schema);
        drop(slot);

        let occupancy = occupancy(buffered_values, record.width());
        let decision = self.decide(occupancy);

        metrics::try_record_received(table);
        metrics::try_set_buffered(table, buffered_values);

        debug!(
            table = %table,
            buffered_values,
            occupancy,
            decision = decision.as_str(),
            "Record admitted"
        );

        Ok(Admission {
            decision,
            buffered_values,
            occupancy,
        })
    }
}
