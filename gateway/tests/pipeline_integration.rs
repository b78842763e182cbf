//! Integration tests for the ingestion pipeline
//!
//! These tests drive the public API with concurrent producers and
//! misbehaving sinks, and check that every admitted record reaches the
//! datastore exactly once.

use async_trait::async_trait;
use futures::future::join_all;
use kasa_gateway::{
    BatchFormat, BatchPayload, FlushDecision, IngestError, MemoryBufferStore, Pipeline, Record,
    Sink, SinkError, StoreError, TimerPolicy, Value,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Test Sinks
// ============================================================================

/// Sink that keeps every committed batch
#[derive(Default)]
struct TrackingSink {
    batches: Mutex<Vec<BatchPayload>>,
}

impl TrackingSink {
    fn new() -> Self {
        Self::default()
    }

    /// First column of every committed JSON row
    fn ids(&self) -> Vec<i64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|batch| {
                String::from_utf8_lossy(&batch.body)
                    .lines()
                    .map(|line| {
                        let row: Vec<serde_json::Value> = serde_json::from_str(line).unwrap();
                        row[0].as_i64().unwrap()
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn statements(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .map(|b| b.statement.clone())
            .collect()
    }
}

#[async_trait]
impl Sink for TrackingSink {
    fn name(&self) -> &'static str {
        "tracking"
    }

    async fn insert(&self, batch: &BatchPayload) -> Result<u64, SinkError> {
        // Give concurrent ingests a chance to interleave with the write
        tokio::task::yield_now().await;
        self.batches.lock().push(batch.clone());
        Ok(batch.rows as u64)
    }

    async fn health(&self) -> bool {
        true
    }
}

/// Sink that fails a configurable number of times then succeeds
struct FailNTimesSink {
    failures_remaining: AtomicU32,
    rows_written: AtomicU64,
}

impl FailNTimesSink {
    fn new(fail_count: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(fail_count),
            rows_written: AtomicU64::new(0),
        }
    }

    fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FailNTimesSink {
    fn name(&self) -> &'static str {
        "fail_n_times"
    }

    async fn insert(&self, batch: &BatchPayload) -> Result<u64, SinkError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(SinkError::Rejected {
                status: 503,
                body: "simulated overload".into(),
            });
        }
        self.rows_written
            .fetch_add(batch.rows as u64, Ordering::SeqCst);
        Ok(batch.rows as u64)
    }

    async fn health(&self) -> bool {
        self.failures_remaining.load(Ordering::SeqCst) == 0
    }
}

fn event(table: &str, id: i64) -> Record {
    Record::new(
        table,
        [
            ("id", Value::Int(id)),
            ("source", Value::from("integration")),
        ],
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_write_every_record_once() {
    let sink = Arc::new(TrackingSink::new());
    let pipeline = Arc::new(
        Pipeline::builder()
            .buffer_limit(25.0)
            .sync_interval(Duration::from_millis(20))
            .sink_arc(sink.clone())
            .build()
            .unwrap(),
    );

    const PRODUCERS: i64 = 8;
    const PER_PRODUCER: i64 = 250;

    let producers = (0..PRODUCERS).map(|p| {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let table = if p % 2 == 0 { "even" } else { "odd" };
            for i in 0..PER_PRODUCER {
                let id = p * PER_PRODUCER + i;
                pipeline.ingest(event(table, id)).await.unwrap();
            }
        })
    });
    for result in join_all(producers).await {
        result.unwrap();
    }

    pipeline.shutdown().await.unwrap();

    let ids = sink.ids();
    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "a record was written twice");
    assert_eq!(unique.len() as i64, PRODUCERS * PER_PRODUCER);
    assert!(pipeline.buffered_tables().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_flushes_keep_data_until_sink_recovers() {
    let sink = Arc::new(FailNTimesSink::new(2));
    let pipeline = Pipeline::builder()
        .buffer_limit(2.0)
        .sync_interval(Duration::from_secs(60))
        .sink_arc(sink.clone())
        .build()
        .unwrap();

    pipeline.ingest(event("t", 1)).await.unwrap();

    // Limit reached twice, both immediate flushes fail
    let second = pipeline.ingest(event("t", 2)).await.unwrap();
    assert_eq!(second.decision, FlushDecision::Immediate);
    assert!(second.flush_error.is_some());

    let third = pipeline.ingest(event("t", 3)).await.unwrap();
    assert!(third.flush_error.is_some());
    assert_eq!(third.buffered_values, 6);

    // Sink is back: the next immediate flush writes the whole backlog
    let fourth = pipeline.ingest(event("t", 4)).await.unwrap();
    assert_eq!(fourth.rows_written, Some(4));
    assert_eq!(sink.rows_written(), 4);
    assert!(sink.health().await);
}

#[tokio::test]
async fn test_values_format_statement() {
    let sink = Arc::new(TrackingSink::new());
    let pipeline = Pipeline::builder()
        .buffer_limit(100.0)
        .format(BatchFormat::Values)
        .sink_arc(sink.clone())
        .build()
        .unwrap();

    pipeline
        .ingest(Record::new(
            "audit log",
            [("who", Value::from("o'brien")), ("ok", Value::Bool(true))],
        ))
        .await
        .unwrap();
    let flushed = pipeline.flush("audit log").await.unwrap();
    assert_eq!(flushed.rows_written, 1);

    let batches = sink.batches.lock();
    assert_eq!(
        batches[0].statement,
        "INSERT INTO `audit log` (`who`, `ok`) VALUES"
    );
    assert_eq!(&batches[0].body[..], b"('o\\'brien', true)");
    drop(batches);
    assert_eq!(sink.statements().len(), 1);
}

#[tokio::test]
async fn test_full_store_refuses_then_recovers() {
    let sink = Arc::new(TrackingSink::new());
    let pipeline = Pipeline::builder()
        .buffer_limit(100.0)
        .sync_interval(Duration::from_secs(60))
        .store(MemoryBufferStore::with_capacity(4))
        .sink_arc(sink.clone())
        .build()
        .unwrap();

    pipeline.ingest(event("t", 1)).await.unwrap();
    pipeline.ingest(event("t", 2)).await.unwrap();

    let err = pipeline.ingest(event("t", 3)).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::IngestFailed {
            source: StoreError::Full { .. },
            ..
        }
    ));

    pipeline.flush("t").await.unwrap();
    pipeline.ingest(event("t", 3)).await.unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(sink.ids(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_policy_waits_for_quiet_period() {
    let sink = Arc::new(TrackingSink::new());
    let pipeline = Pipeline::builder()
        .buffer_limit(1000.0)
        .sync_interval(Duration::from_millis(100))
        .timer_policy(TimerPolicy::Reset)
        .sink_arc(sink.clone())
        .build()
        .unwrap();

    // A record every 50ms keeps pushing the deadline out
    for id in 0..10 {
        pipeline.ingest(event("t", id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(sink.ids().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sink.ids(), (0..10).collect::<Vec<_>>());
}
