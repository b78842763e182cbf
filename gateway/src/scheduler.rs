//! Flush scheduler
//!
//! Owns at most one deferred flush per table. A timer fires once, after the
//! sync interval, and flushes whatever the table has buffered by then.
//!
//! Re-arming a table that already has a timer pending depends on the policy:
//!
//! - [`TimerPolicy::Coalesce`]: the pending timer is kept, so a steady trickle
//!   of records is still flushed at least once per interval
//! - [`TimerPolicy::Reset`]: the pending timer is replaced, so the flush runs
//!   one interval after the last record (debounce)
//!
//! A timer removes its own slot before flushing. Cancellation only aborts
//! timers whose slot is still present, so a flush that has started is never
//! interrupted. Timers carry no field list: the flush reads the schema of
//! the buffered values when it runs.

use crate::flush::{FlushExecutor, FlushTrigger};
use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What re-arming a pending table does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerPolicy {
    /// Keep the pending timer
    #[default]
    Coalesce,
    /// Restart the interval
    Reset,
}

impl TimerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerPolicy::Coalesce => "coalesce",
            TimerPolicy::Reset => "reset",
        }
    }
}

impl FromStr for TimerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coalesce" => Ok(TimerPolicy::Coalesce),
            "reset" | "debounce" => Ok(TimerPolicy::Reset),
            other => Err(format!(
                "unknown timer policy '{other}' (expected 'coalesce' or 'reset')"
            )),
        }
    }
}

/// Result of arming a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// No timer was pending, a new one was started
    Armed,
    /// A timer was pending and kept
    Coalesced,
    /// A timer was pending and replaced
    Reset,
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<String, TimerSlot>>>;

/// Per-table deferred flush timers
pub struct FlushScheduler {
    executor: Arc<FlushExecutor>,
    interval: Duration,
    policy: TimerPolicy,
    slots: Slots,
    next_generation: AtomicU64,
}

impl FlushScheduler {
    pub fn new(executor: Arc<FlushExecutor>, interval: Duration, policy: TimerPolicy) -> Self {
        Self {
            executor,
            interval,
            policy,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> TimerPolicy {
        self.policy
    }

    /// Ensure a deferred flush is pending for `table`
    pub fn arm(&self, table: &str) -> ArmOutcome {
        let mut slots = self.slots.lock();

        let replacing = match slots.get(table) {
            Some(slot) => match self.policy {
                TimerPolicy::Coalesce => {
                    debug!(table = %table, "Deferred flush already pending");
                    return ArmOutcome::Coalesced;
                }
                TimerPolicy::Reset => {
                    slot.handle.abort();
                    true
                }
            },
            None => false,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        // Spawned under the slots lock: the task cannot observe the map
        // before its own slot is inserted.
        let handle = tokio::spawn(run_timer(
            Arc::clone(&self.slots),
            Arc::clone(&self.executor),
            self.interval,
            table.to_string(),
            generation,
        ));

        slots.insert(
            table.to_string(),
            TimerSlot { generation, handle },
        );
        metrics::try_set_timers_armed(slots.len());

        debug!(
            table = %table,
            interval_ms = self.interval.as_millis() as u64,
            reset = replacing,
            "Deferred flush armed"
        );

        if replacing {
            ArmOutcome::Reset
        } else {
            ArmOutcome::Armed
        }
    }

    /// Cancel the pending timer for `table`
    ///
    /// Returns false if none was pending. A timer that already started
    /// flushing is not affected.
    pub fn cancel(&self, table: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.remove(table) else {
            return false;
        };
        slot.handle.abort();
        metrics::try_set_timers_armed(slots.len());
        debug!(table = %table, "Deferred flush cancelled");
        true
    }

    /// Cancel every pending timer, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let count = slots.len();
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
        metrics::try_set_timers_armed(0);
        if count > 0 {
            info!(count, "Cancelled pending deferred flushes");
        }
        count
    }

    pub fn is_armed(&self, table: &str) -> bool {
        self.slots.lock().contains_key(table)
    }

    /// Tables with a timer pending
    pub fn pending(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.slots.lock().keys().cloned().collect();
        tables.sort();
        tables
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        for (_, slot) in self.slots.lock().drain() {
            slot.handle.abort();
        }
    }
}

async fn run_timer(
    slots: Slots,
    executor: Arc<FlushExecutor>,
    interval: Duration,
    table: String,
    generation: u64,
) {
    tokio::time::sleep(interval).await;

    {
        let mut slots = slots.lock();
        match slots.get(&table) {
            Some(slot) if slot.generation == generation => {}
            // Cancelled or superseded while waiting for the lock
            _ => return,
        }
        slots.remove(&table);
        metrics::try_set_timers_armed(slots.len());
    }

    match executor
        .flush_triggered(FlushTrigger::Deferred, &table)
        .await
    {
        Ok(outcome) => {
            debug!(
                table = %table,
                rows = outcome.rows_written,
                remaining = outcome.remaining_values,
                "Deferred flush complete"
            );
        }
        Err(e) => {
            // Not re-armed: the data stays buffered until the next record or
            // an explicit flush.
            error!(table = %table, error = %e, "Deferred flush failed");
        }
    }
}
