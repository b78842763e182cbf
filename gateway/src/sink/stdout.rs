//! Stdout sink for debugging
//!
//! Prints each batch instead of writing it anywhere. Used when no ClickHouse
//! endpoint is configured.

use crate::encode::BatchPayload;
use crate::error::SinkError;
use crate::sink::Sink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stdout sink - prints batches for debugging
pub struct StdoutSink {
    /// Print batch bodies as well as statements
    pretty: bool,
    /// Count of rows printed
    row_count: AtomicU64,
}

impl StdoutSink {
    /// Create a new StdoutSink that prints one line per batch
    pub fn new() -> Self {
        Self {
            pretty: false,
            row_count: AtomicU64::new(0),
        }
    }

    /// Create a new StdoutSink that also prints the encoded rows
    pub fn pretty() -> Self {
        Self {
            pretty: true,
            row_count: AtomicU64::new(0),
        }
    }

    /// Get total rows printed
    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed)
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn insert(&self, batch: &BatchPayload) -> Result<u64, SinkError> {
        use std::io::Write;

        let mut stdout = std::io::stdout().lock();

        if self.pretty {
            writeln!(
                stdout,
                "┌─ Batch ─────────────────────────────────────────────",
            )
            .ok();
            writeln!(stdout, "│ Table:     {}", batch.table).ok();
            writeln!(stdout, "│ Rows:      {}", batch.rows).ok();
            writeln!(stdout, "│ Statement: {}", batch.statement).ok();
            for line in String::from_utf8_lossy(&batch.body).lines() {
                writeln!(stdout, "│   {line}").ok();
            }
            writeln!(
                stdout,
                "└─────────────────────────────────────────────────────",
            )
            .ok();
        } else {
            writeln!(
                stdout,
                "[{}] {} rows ({} bytes)",
                batch.table,
                batch.rows,
                batch.body.len()
            )
            .ok();
        }

        self.row_count
            .fetch_add(batch.rows as u64, Ordering::Relaxed);

        Ok(batch.rows as u64)
    }

    async fn health(&self) -> bool {
        true
    }
}
