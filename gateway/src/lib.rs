//! KASA - Buffered Batch Ingestion Gateway
//!
//! Accepts single records over HTTP, buffers them per destination table and
//! writes them to a columnar datastore (ClickHouse) in bulk.
//!
//! # Architecture
//!
//! ```text
//! HTTP ──► Record ──► AdmissionController ──► BufferStore
//!                            │
//!              Immediate ────┴──── Deferred
//!                  │                  │
//!                  │           FlushScheduler
//!                  ▼                  ▼
//!              FlushExecutor ──► encode ──► Sink
//! ```
//!
//! A table is flushed right away once its occupancy reaches the buffer limit,
//! otherwise one sync interval after it was first written to. Buffered data
//! is only trimmed after the sink confirms the write.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod admission;
pub mod buffer;
pub mod config;
pub mod encode;
pub mod error;
pub mod flush;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod sink;

pub use admission::{Admission, AdmissionController, FlushDecision};
pub use buffer::{BufferStore, MemoryBufferStore};
pub use config::Config;
pub use encode::{BatchFormat, BatchPayload};
pub use error::{
    DecodeError, EncodeError, FlushError, IngestError, KasaError, Result, SinkError, StoreError,
};
pub use flush::{FlushExecutor, FlushOutcome, FlushTrigger};
pub use pipeline::{IngestOutcome, Pipeline, PipelineBuilder, TableState};
pub use record::{Record, Value};
pub use scheduler::{FlushScheduler, TimerPolicy};
pub use schema::SchemaRegistry;
pub use sink::{ClickHouseSink, Sink, StdoutSink};
