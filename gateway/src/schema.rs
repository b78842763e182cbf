//! Per-table schema registry
//!
//! Holds the field list of the values currently buffered for each table.
//! Admission writes it under the table's slot lock together with the append;
//! a flush reads it under the same lock together with its snapshot, so the
//! field list and the values it decodes always belong together.
//!
//! Entries are dropped once a table's buffer is empty and no admission or
//! flush holds the slot, so arbitrary table names from clients do not
//! accumulate.

use crate::buffer::BufferStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Field list of one table, behind the table's admission lock
pub type SchemaSlot = Arc<tokio::sync::Mutex<Option<Vec<String>>>>;

/// Field lists of buffered tables
#[derive(Default)]
pub struct SchemaRegistry {
    slots: Mutex<HashMap<String, SchemaSlot>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `table`, created empty if missing
    pub fn slot(&self, table: &str) -> SchemaSlot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(table.to_string()).or_default())
    }

    /// Field list registered for `table`
    pub async fn get(&self, table: &str) -> Option<Vec<String>> {
        let slot = self.slots.lock().get(table).cloned()?;
        let schema = slot.lock().await;
        schema.clone()
    }

    /// Register `fields` for `table` without appending anything
    pub async fn set(&self, table: &str, fields: Vec<String>) {
        let slot = self.slot(table);
        *slot.lock().await = Some(fields);
    }

    /// Number of tables with a slot
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the slot of `table` if its buffer is empty and nobody else holds it
    ///
    /// Returns true if the slot was removed.
    pub async fn release_if_drained(&self, table: &str, store: &dyn BufferStore) -> bool {
        let Some(slot) = self.slots.lock().get(table).cloned() else {
            return false;
        };

        // Admissions append under this lock, so the length cannot grow
        // before the entry is removed.
        let _schema = slot.lock().await;
        if !matches!(store.len(table).await, Ok(0)) {
            return false;
        }

        let mut slots = self.slots.lock();
        // One reference in the map, one here
        let unused = Arc::strong_count(&slot) == 2
            && slots.get(table).is_some_and(|s| Arc::ptr_eq(s, &slot));
        if unused {
            slots.remove(table);
            debug!(table = %table, "Buffer drained, schema forgotten");
        }
        unused
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBufferStore;
    use crate::record::Value;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let registry = SchemaRegistry::new();
        assert_eq!(registry.get("t").await, None);

        registry.set("t", fields(&["a", "b"])).await;
        assert_eq!(registry.get("t").await, Some(fields(&["a", "b"])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_release_only_when_drained() {
        let store = MemoryBufferStore::new();
        let registry = SchemaRegistry::new();
        registry.set("t", fields(&["a"])).await;
        store.append("t", &[Value::Int(1)]).await.unwrap();

        assert!(!registry.release_if_drained("t", &store).await);
        assert_eq!(registry.len(), 1);

        store.clear("t").await.unwrap();
        assert!(registry.release_if_drained("t", &store).await);
        assert!(registry.is_empty());
        assert_eq!(registry.get("t").await, None);

        // Nothing left to release
        assert!(!registry.release_if_drained("t", &store).await);
    }

    #[tokio::test]
    async fn test_release_skips_slot_in_use() {
        let store = MemoryBufferStore::new();
        let registry = SchemaRegistry::new();

        let held = registry.slot("t");
        assert!(!registry.release_if_drained("t", &store).await);
        assert_eq!(registry.len(), 1);

        drop(held);
        assert!(registry.release_if_drained("t", &store).await);
        assert!(registry.is_empty());
    }
}
