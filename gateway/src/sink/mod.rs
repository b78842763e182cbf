//! Sink system for KASA
//!
//! A sink is the analytical datastore's bulk-insert contract. The flush
//! executor hands it one encoded [`BatchPayload`] per flush and only clears
//! buffered data after the sink reports success.

pub mod clickhouse;
pub mod stdout;

use crate::encode::BatchPayload;
use crate::error::SinkError;
use async_trait::async_trait;

pub use clickhouse::ClickHouseSink;
pub use stdout::StdoutSink;

/// Sink trait - commits encoded batches to a datastore
///
/// # Example
///
/// ```ignore
/// struct MyWarehouseSink {
///     client: MyWarehouseClient,
/// }
///
/// #[async_trait]
/// impl Sink for MyWarehouseSink {
///     fn name(&self) -> &'static str { "my-warehouse" }
///
///     async fn insert(&self, batch: &BatchPayload) -> Result<u64, SinkError> {
///         self.client.execute(&batch.statement, batch.body.clone()).await?;
///         Ok(batch.rows as u64)
///     }
///
///     async fn health(&self) -> bool {
///         self.client.ping().await.is_ok()
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sink name for identification and logging
    fn name(&self) -> &'static str;

    /// Commit one batch
    ///
    /// Returns the number of rows the datastore reports as written. An `Err`
    /// means nothing may be assumed written; the caller keeps the data buffered.
    async fn insert(&self, batch: &BatchPayload) -> Result<u64, SinkError>;

    /// Health check for the datastore
    async fn health(&self) -> bool;

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
