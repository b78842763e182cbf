//! Buffer store for per-table value accumulation
//!
//! The store holds one append-only sequence of values per table. Records are
//! flattened into it, so a table with N buffered records of width W holds
//! N * W values. Flushes read a snapshot and then trim exactly the snapshot
//! length from the front, which keeps values appended mid-flush buffered.

use crate::error::StoreError;
use crate::record::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Contract for the buffer backing the pipeline
///
/// Implementations must preserve insertion order per table and must only ever
/// append at the tail, so that a prefix observed by `read_all` is still the
/// prefix when `trim_front` runs.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Store name for identification and logging
    fn name(&self) -> &'static str;

    /// Append values to a table's buffer
    ///
    /// Returns the number of values stored for the table after the append.
    async fn append(&self, table: &str, values: &[Value]) -> Result<usize, StoreError>;

    /// Read the full buffer of a table (empty if none)
    async fn read_all(&self, table: &str) -> Result<Vec<Value>, StoreError>;

    /// Remove the first `count` values of a table's buffer
    async fn trim_front(&self, table: &str, count: usize) -> Result<(), StoreError>;

    /// Drop a table's buffer entirely
    async fn clear(&self, table: &str) -> Result<(), StoreError>;

    /// Number of values currently buffered for a table
    async fn len(&self, table: &str) -> Result<usize, StoreError>;

    /// Tables that currently hold buffered values
    async fn tables(&self) -> Result<Vec<String>, StoreError>;
}

/// Counters for store monitoring
#[derive(Default)]
pub struct StoreMetrics {
    /// Total values appended
    pub appended: AtomicU64,
    /// Total values removed by trims and clears
    pub trimmed: AtomicU64,
    /// Appends refused due to capacity
    pub rejected: AtomicU64,
}

/// In-process buffer store
///
/// An optional capacity bounds the total number of values held across all
/// tables. Appends that would exceed it are refused as a whole rather than
/// evicting older data.
pub struct MemoryBufferStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    capacity: Option<usize>,
    metrics: StoreMetrics,
}

impl MemoryBufferStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            capacity: None,
            metrics: StoreMetrics::default(),
        }
    }

    /// Create a store holding at most `capacity` values in total
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Configured capacity, if bounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Total values held across all tables
    pub fn total_len(&self) -> usize {
        self.tables.lock().values().map(Vec::len).sum()
    }

    /// Get total values appended
    pub fn total_appended(&self) -> u64 {
        self.metrics.appended.load(Ordering::Relaxed)
    }

    /// Get total values trimmed
    pub fn total_trimmed(&self) -> u64 {
        self.metrics.trimmed.load(Ordering::Relaxed)
    }

    /// Get total appends refused
    pub fn total_rejected(&self) -> u64 {
        self.metrics.rejected.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, table: &str, values: &[Value]) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();

        if let Some(capacity) = self.capacity {
            let stored: usize = tables.values().map(Vec::len).sum();
            if stored + values.len() > capacity {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::Full { stored, capacity });
            }
        }

        let buffer = tables.entry(table.to_string()).or_default();
        buffer.extend_from_slice(values);

        self.metrics
            .appended
            .fetch_add(values.len() as u64, Ordering::Relaxed);

        Ok(buffer.len())
    }

    async fn read_all(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.tables.lock().get(table).cloned().unwrap_or_default())
    }

    async fn trim_front(&self, table: &str, count: usize) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let Some(buffer) = tables.get_mut(table) else {
            return Ok(());
        };

        let trimmed = count.min(buffer.len());
        buffer.drain(..trimmed);
        if buffer.is_empty() {
            tables.remove(table);
        }

        self.metrics
            .trimmed
            .fetch_add(trimmed as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<(), StoreError> {
        if let Some(buffer) = self.tables.lock().remove(table) {
            self.metrics
                .trimmed
                .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn len(&self, table: &str) -> Result<usize, StoreError> {
        Ok(self.tables.lock().get(table).map_or(0, Vec::len))
    }

    async fn tables(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
