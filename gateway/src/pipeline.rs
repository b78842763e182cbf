//! Pipeline - the ingestion entry point for KASA
//!
//! Composes the admission controller, the flush executor and the flush
//! scheduler over one buffer store and one sink.
//!
//! # Architecture
//!
//! ```text
//!                       ┌─ Immediate ─► cancel timer ─► FlushExecutor ─► Sink
//! Record ─► Admission ──┤
//!                       └─ Deferred ──► FlushScheduler ──(interval)──┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use kasa_gateway::{Pipeline, Record, StdoutSink};
//!
//! let pipeline = Pipeline::builder()
//!     .buffer_limit(500.0)
//!     .sync_interval(Duration::from_secs(2))
//!     .sink(StdoutSink::pretty())
//!     .build()?;
//!
//! pipeline.ingest(record).await?;
//! ```

use crate::admission::{AdmissionController, FlushDecision};
use crate::buffer::{BufferStore, MemoryBufferStore};
use crate::encode::BatchFormat;
use crate::error::{FlushError, IngestError, KasaError, Result, StoreError};
use crate::flush::{FlushExecutor, FlushOutcome, FlushTrigger};
use crate::record::Record;
use crate::scheduler::{FlushScheduler, TimerPolicy};
use crate::schema::SchemaRegistry;
use crate::sink::{Sink, StdoutSink};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Observable state of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    /// Nothing pending
    Idle,
    /// A deferred flush is scheduled
    TimerArmed,
    /// A flush holds the table's token
    FlushInFlight,
}

/// What happened to one ingested record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub table: String,
    #[serde(serialize_with = "serialize_decision")]
    pub decision: FlushDecision,
    /// Values buffered for the table right after the append
    pub buffered_values: usize,
    /// Rows written by the immediate flush, if one ran and succeeded
    pub rows_written: Option<u64>,
    /// Why the immediate flush failed; the record is still buffered
    pub flush_error: Option<String>,
}

fn serialize_decision<S: serde::Serializer>(
    decision: &FlushDecision,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(decision.as_str())
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    store: Option<Arc<dyn BufferStore>>,
    sink: Option<Arc<dyn Sink>>,
    buffer_limit: f64,
    sync_interval: Duration,
    timer_policy: TimerPolicy,
    format: BatchFormat,
}

impl PipelineBuilder {
    fn new() -> Self {
        Self {
            store: None,
            sink: None,
            buffer_limit: 1000.0,
            sync_interval: Duration::from_millis(5000),
            timer_policy: TimerPolicy::default(),
            format: BatchFormat::default(),
        }
    }

    /// Occupancy at which a record triggers an immediate flush
    ///
    /// Default is 1000.
    pub fn buffer_limit(mut self, limit: f64) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Quiescence interval of the deferred flush
    ///
    /// Default is 5 seconds.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn timer_policy(mut self, policy: TimerPolicy) -> Self {
        self.timer_policy = policy;
        self
    }

    pub fn format(mut self, format: BatchFormat) -> Self {
        self.format = format;
        self
    }

    /// Buffer store. Default is an unbounded [`MemoryBufferStore`].
    pub fn store<B: BufferStore + 'static>(self, store: B) -> Self {
        self.store_arc(Arc::new(store))
    }

    /// Buffer store (Arc version)
    pub fn store_arc(mut self, store: Arc<dyn BufferStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Destination datastore. Default is [`StdoutSink`].
    pub fn sink<S: Sink + 'static>(self, sink: S) -> Self {
        self.sink_arc(Arc::new(sink))
    }

    /// Destination datastore (Arc version)
    pub fn sink_arc(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if !self.buffer_limit.is_finite() || self.buffer_limit <= 0.0 {
            return Err(KasaError::Config(format!(
                "buffer limit must be a positive number, got {}",
                self.buffer_limit
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(KasaError::Config(
                "sync interval must be greater than zero".to_string(),
            ));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryBufferStore::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(StdoutSink::new()));
        let schemas = Arc::new(SchemaRegistry::new());

        let executor = Arc::new(FlushExecutor::new(
            Arc::clone(&store),
            Arc::clone(&schemas),
            sink,
            self.format,
        ));
        let scheduler = FlushScheduler::new(
            Arc::clone(&executor),
            self.sync_interval,
            self.timer_policy,
        );

        Ok(Pipeline {
            admission: AdmissionController::new(
                Arc::clone(&store),
                Arc::clone(&schemas),
                self.buffer_limit,
            ),
            store,
            schemas,
            executor,
            scheduler,
        })
    }
}

/// Buffered batch ingestion pipeline
pub struct Pipeline {
    store: Arc<dyn BufferStore>,
    schemas: Arc<SchemaRegistry>,
    admission: AdmissionController,
    executor: Arc<FlushExecutor>,
    scheduler: FlushScheduler,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn buffer_limit(&self) -> f64 {
        self.admission.buffer_limit()
    }

    pub fn sync_interval(&self) -> Duration {
        self.scheduler.interval()
    }

    pub fn timer_policy(&self) -> TimerPolicy {
        self.scheduler.policy()
    }

    pub fn format(&self) -> BatchFormat {
        self.executor.format()
    }

    /// Buffer a record and flush according to the admission decision
    ///
    /// Once this returns `Ok` the record is buffered. A failed immediate flush
    /// does not fail the ingest; it is reported in
    /// [`IngestOutcome::flush_error`] and the data stays buffered.
    pub async fn ingest(&self, record: Record) -> std::result::Result<IngestOutcome, IngestError> {
        let admission = self.admission.admit(&record).await?;

        let mut outcome = IngestOutcome {
            table: record.table.clone(),
            decision: admission.decision,
            buffered_values: admission.buffered_values,
            rows_written: None,
            flush_error: None,
        };

        match admission.decision {
            FlushDecision::Deferred => {
                self.scheduler.arm(&record.table);
            }
            FlushDecision::Immediate => {
                // The immediate flush covers everything the timer would have
                self.scheduler.cancel(&record.table);
                match self
                    .executor
                    .flush_triggered(FlushTrigger::Immediate, &record.table)
                    .await
                {
                    Ok(flushed) => outcome.rows_written = Some(flushed.rows_written),
                    Err(e) => {
                        warn!(
                            table = %record.table,
                            error = %e,
                            "Immediate flush failed, record stays buffered"
                        );
                        outcome.flush_error = Some(e.to_string());
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Flush a table now
    ///
    /// A table with nothing buffered flushes as a no-op.
    pub async fn flush(&self, table: &str) -> std::result::Result<FlushOutcome, FlushError> {
        self.scheduler.cancel(table);
        self.executor
            .flush_triggered(FlushTrigger::Manual, table)
            .await
    }

    /// Field list of the values buffered for `table`
    pub async fn schema(&self, table: &str) -> Option<Vec<String>> {
        self.admission.schema(table).await
    }

    /// Tables whose schema or flush token is held in memory
    ///
    /// Drops back to zero once every buffer has been flushed empty.
    pub fn tracked_tables(&self) -> usize {
        self.schemas.len() + self.executor.tokens_held()
    }

    pub fn state(&self, table: &str) -> TableState {
        if self.executor.is_in_flight(table) {
            TableState::FlushInFlight
        } else if self.scheduler.is_armed(table) {
            TableState::TimerArmed
        } else {
            TableState::Idle
        }
    }

    /// Tables holding buffered values
    pub async fn buffered_tables(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.store.tables().await
    }

    /// Values buffered for `table`
    pub async fn buffered_values(&self, table: &str) -> std::result::Result<usize, StoreError> {
        self.store.len(table).await
    }

    /// Tables with a deferred flush pending
    pub fn pending_flushes(&self) -> Vec<String> {
        self.scheduler.pending()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn sink_name(&self) -> &'static str {
        self.executor.sink().name()
    }

    pub async fn sink_health(&self) -> bool {
        self.executor.sink().health().await
    }

    /// Stop timers, flush every buffered table once, then shut the sink down
    ///
    /// Tables are drained concurrently.
    ///
    /// Returns the number of rows written during the drain. Tables whose
    /// flush fails are logged and left buffered.
    pub async fn shutdown(&self) -> Result<u64> {
        info!("Shutting down pipeline");
        self.scheduler.cancel_all();

        let tables = match self.store.tables().await {
            Ok(tables) => tables,
            Err(e) => {
                error!(error = %e, "Could not list buffered tables, skipping final flush");
                Vec::new()
            }
        };

        let flushes = tables.iter().map(|table| async move {
            match self
                .executor
                .flush_triggered(FlushTrigger::Shutdown, table)
                .await
            {
                Ok(outcome) => outcome.rows_written,
                Err(e) => {
                    error!(table = %table, error = %e, "Final flush failed");
                    0
                }
            }
        });
        let rows_written: u64 = join_all(flushes).await.into_iter().sum();

        debug!(rows_written, "Final flush complete");
        self.executor.sink().shutdown().await?;
        info!(rows_written, "Pipeline shutdown complete");
        Ok(rows_written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::sink::mock::RecordingSink;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    const INTERVAL: Duration = Duration::from_millis(100);

    /// Memory store whose first snapshot read waits for `release`
    struct StalledReadStore {
        inner: MemoryBufferStore,
        gate: parking_lot::Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    }

    impl StalledReadStore {
        fn new(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
            Self {
                inner: MemoryBufferStore::new(),
                gate: parking_lot::Mutex::new(Some((entered, release))),
            }
        }
    }

    #[async_trait]
    impl BufferStore for StalledReadStore {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn append(&self, table: &str, values: &[Value]) -> std::result::Result<usize, StoreError> {
            self.inner.append(table, values).await
        }

        async fn read_all(&self, table: &str) -> std::result::Result<Vec<Value>, StoreError> {
            let gate = self.gate.lock().take();
            if let Some((entered, release)) = gate {
                entered.notify_one();
                release.notified().await;
            }
            self.inner.read_all(table).await
        }

        async fn trim_front(&self, table: &str, count: usize) -> std::result::Result<(), StoreError> {
            self.inner.trim_front(table, count).await
        }

        async fn clear(&self, table: &str) -> std::result::Result<(), StoreError> {
            self.inner.clear(table).await
        }

        async fn len(&self, table: &str) -> std::result::Result<usize, StoreError> {
            self.inner.len(table).await
        }

        async fn tables(&self) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.tables().await
        }
    }

    fn pipeline(limit: f64, sink: Arc<RecordingSink>) -> Pipeline {
        Pipeline::builder()
            .buffer_limit(limit)
            .sync_interval(INTERVAL)
            .sink_arc(sink)
            .build()
            .unwrap()
    }

    fn event(table: &str, id: i64) -> Record {
        Record::new(table, [("id", Value::Int(id))])
    }

    async fn advance(by: Duration) {
        tokio::time::sleep(by).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_builder_rejects_bad_settings() {
        assert!(Pipeline::builder().buffer_limit(0.0).build().is_err());
        assert!(Pipeline::builder().buffer_limit(f64::NAN).build().is_err());
        assert!(
            Pipeline::builder()
                .sync_interval(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(Pipeline::builder().build().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_ingest_flushes_after_interval() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(10.0, sink.clone());

        let outcome = pipeline.ingest(event("t", 1)).await.unwrap();
        assert_eq!(outcome.decision, FlushDecision::Deferred);
        assert_eq!(outcome.buffered_values, 1);
        assert_eq!(outcome.rows_written, None);
        assert_eq!(pipeline.state("t"), TableState::TimerArmed);

        advance(INTERVAL * 2).await;
        assert_eq!(sink.writes(), 1);
        assert_eq!(pipeline.state("t"), TableState::Idle);
        assert!(pipeline.buffered_tables().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_ingest_cancels_timer() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(2.0, sink.clone());

        pipeline.ingest(event("t", 1)).await.unwrap();
        assert_eq!(pipeline.pending_flushes(), vec!["t".to_string()]);

        let outcome = pipeline.ingest(event("t", 2)).await.unwrap();
        assert_eq!(outcome.decision, FlushDecision::Immediate);
        assert_eq!(outcome.rows_written, Some(2));
        assert!(pipeline.pending_flushes().is_empty());

        advance(INTERVAL * 3).await;
        assert_eq!(sink.attempts(), 1);
        assert_eq!(sink.rows(), vec!["[1]".to_string(), "[2]".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_ingests_flush_once() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(100.0, sink.clone());

        pipeline.ingest(event("t", 1)).await.unwrap();
        advance(INTERVAL / 4).await;
        pipeline.ingest(event("t", 2)).await.unwrap();

        advance(INTERVAL * 2).await;
        assert_eq!(sink.attempts(), 1);
        assert_eq!(sink.total_rows(), 2);
    }

    #[tokio::test]
    async fn test_failed_immediate_flush_keeps_record() {
        let sink = Arc::new(RecordingSink::new());
        sink.set_failing(true);
        let pipeline = pipeline(1.0, sink.clone());

        let outcome = pipeline.ingest(event("t", 1)).await.unwrap();
        assert_eq!(outcome.decision, FlushDecision::Immediate);
        assert!(outcome.flush_error.is_some());
        assert_eq!(pipeline.buffered_values("t").await.unwrap(), 1);

        sink.set_failing(false);
        let flushed = pipeline.flush("t").await.unwrap();
        assert_eq!(flushed.rows_written, 1);
        assert_eq!(pipeline.buffered_values("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_flush_unknown_table() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(10.0, sink.clone());

        let flushed = pipeline.flush("missing").await.unwrap();
        assert_eq!(flushed.rows_written, 0);
        assert_eq!(sink.attempts(), 0);
        assert_eq!(pipeline.tracked_tables(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_tables_are_not_tracked() {
        let pipeline = pipeline(1000.0, Arc::new(RecordingSink::new()));

        for i in 0..200 {
            pipeline.ingest(event(&format!("table_{i}"), i)).await.unwrap();
        }
        assert_eq!(pipeline.tracked_tables(), 200);

        for i in 0..100 {
            pipeline.flush(&format!("table_{i}")).await.unwrap();
        }
        assert_eq!(pipeline.tracked_tables(), 100);
        assert_eq!(pipeline.schema("table_0").await, None);
        assert_eq!(pipeline.schema("table_150").await, Some(vec!["id".to_string()]));

        pipeline.shutdown().await.unwrap();
        assert_eq!(pipeline.tracked_tables(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_flush_never_decodes_with_a_stale_schema() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let store = Arc::new(StalledReadStore::new(entered.clone(), release.clone()));
        let sink = Arc::new(RecordingSink::new());
        let pipeline = Arc::new(
            Pipeline::builder()
                .buffer_limit(100.0)
                .sync_interval(INTERVAL)
                .store_arc(store)
                .sink_arc(sink.clone())
                .build()
                .unwrap(),
        );

        pipeline
            .ingest(Record::new("t", [("a", Value::Int(1))]))
            .await
            .unwrap();

        // Manual flush holds the token and stalls reading its snapshot
        let manual = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.flush("t").await }
        });
        entered.notified().await;

        // Same-schema record arrives and any timer gets a chance to fire
        let second = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                pipeline
                    .ingest(Record::new("t", [("a", Value::Int(2))]))
                    .await
            }
        });
        advance(INTERVAL * 2).await;

        release.notify_one();
        assert_eq!(manual.await.unwrap().unwrap().rows_written, 1);
        second.await.unwrap().unwrap();

        // `[a]` values are still buffered, so `[b, c]` is refused
        let drift = Record::new("t", [("b", Value::from("y1")), ("c", Value::from("y2"))]);
        let err = pipeline.ingest(drift.clone()).await.unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch { .. }));

        // Once the deferred flush drains them the new schema is accepted
        advance(INTERVAL * 2).await;
        assert_eq!(pipeline.schema("t").await, None);
        pipeline.ingest(drift).await.unwrap();
        pipeline.flush("t").await.unwrap();

        let batches = sink.batches.lock();
        let written: Vec<(Vec<String>, String)> = batches
            .iter()
            .map(|b| {
                (
                    b.columns.clone(),
                    String::from_utf8_lossy(&b.body).into_owned(),
                )
            })
            .collect();
        assert_eq!(
            written,
            vec![
                (vec!["a".to_string()], "[1]\n".to_string()),
                (vec!["a".to_string()], "[2]\n".to_string()),
                (
                    vec!["b".to_string(), "c".to_string()],
                    "[\"y1\",\"y2\"]\n".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_schema_drift_rejected() {
        let pipeline = pipeline(10.0, Arc::new(RecordingSink::new()));
        pipeline.ingest(event("t", 1)).await.unwrap();

        let other = Record::new("t", [("name", Value::from("x"))]);
        let err = pipeline.ingest(other).await.unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_and_deferred_write_each_row_once() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink::gated(entered.clone(), release.clone()));
        let pipeline = Arc::new(pipeline(3.0, sink.clone()));

        pipeline.ingest(event("t", 1)).await.unwrap();
        pipeline.ingest(event("t", 2)).await.unwrap();

        // Timer fires and holds its insert open
        entered.notified().await;
        assert_eq!(pipeline.state("t"), TableState::FlushInFlight);

        // Third record reaches the limit while the deferred flush is in flight
        let ingest = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.ingest(event("t", 3)).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        release.notify_one();
        entered.notified().await;
        release.notify_one();

        let outcome = ingest.await.unwrap().unwrap();
        assert_eq!(outcome.decision, FlushDecision::Immediate);
        assert_eq!(outcome.rows_written, Some(1));

        assert_eq!(sink.writes(), 2);
        assert_eq!(
            sink.rows(),
            vec!["[1]".to_string(), "[2]".to_string(), "[3]".to_string()]
        );
        assert_eq!(pipeline.buffered_values("t").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_during_flush_are_not_lost() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink::gated(entered.clone(), release.clone()));
        let pipeline = Arc::new(pipeline(100.0, sink.clone()));

        for id in 0..3 {
            pipeline.ingest(event("t", id)).await.unwrap();
        }

        let manual = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.flush("t").await }
        });
        entered.notified().await;

        for id in 3..5 {
            pipeline.ingest(event("t", id)).await.unwrap();
        }

        release.notify_one();
        let flushed = manual.await.unwrap().unwrap();
        assert_eq!(flushed.rows_written, 3);
        assert_eq!(flushed.remaining_values, 2);
        assert_eq!(pipeline.state("t"), TableState::TimerArmed);

        // Let the deferred flush through
        release.notify_one();
        advance(INTERVAL * 2).await;

        let rows = sink.rows();
        assert_eq!(rows.len(), 5);
        let expected: Vec<String> = (0..5).map(|id| format!("[{id}]")).collect();
        assert_eq!(rows, expected);
        assert_eq!(pipeline.buffered_values("t").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_all_tables() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(100.0, sink.clone());

        pipeline.ingest(event("a", 1)).await.unwrap();
        pipeline.ingest(event("b", 2)).await.unwrap();
        pipeline.ingest(event("b", 3)).await.unwrap();

        let rows = pipeline.shutdown().await.unwrap();
        assert_eq!(rows, 3);
        assert!(pipeline.pending_flushes().is_empty());
        assert!(pipeline.buffered_tables().await.unwrap().is_empty());

        advance(INTERVAL * 2).await;
        assert_eq!(sink.attempts(), 2);
    }

    #[test]
    fn test_outcome_serializes_decision() {
        let outcome = IngestOutcome {
            table: "t".to_string(),
            decision: FlushDecision::Immediate,
            buffered_values: 4,
            rows_written: Some(4),
            flush_error: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["decision"], "immediate");
        assert_eq!(json["rows_written"], 4);
    }
}
