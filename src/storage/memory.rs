//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//! Both backends can inject transient failures so callers can exercise their
//! fault paths without a real engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::audit::{LastMetric, MetricRecord};
use crate::entity::{AuditId, EntityKey};
use crate::storage::traits::{AuditStore, EntitySink, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Consume one pending injected fault, if any.
fn take_fault(pending: &AtomicU32, context: &'static str) -> Result<(), StorageError> {
    let took = pending
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok();
    if took {
        return Err(StorageError::ConnectionError(format!(
            "injected fault ({context})"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct AuditState {
    by_id: HashMap<AuditId, MetricRecord>,
    // Append order per key; `latest` resolves timestamp ties to the later entry.
    by_key: HashMap<EntityKey, Vec<AuditId>>,
}

impl AuditState {
    fn latest(&self, key: &EntityKey) -> Option<&MetricRecord> {
        let ids = self.by_key.get(key)?;
        let mut best: Option<&MetricRecord> = None;
        for id in ids {
            let Some(record) = self.by_id.get(id) else {
                continue;
            };
            match best {
                Some(b) if record.timestamp < b.timestamp => {}
                _ => best = Some(record),
            }
        }
        best
    }

    fn insert(&mut self, record: MetricRecord) -> Result<(), StorageError> {
        if self.by_id.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey(record.id.to_string()));
        }
        self.by_key
            .entry(record.entity_key.clone())
            .or_default()
            .push(record.id);
        self.by_id.insert(record.id, record);
        Ok(())
    }
}

/// Thread-safe in-memory audit store with append-only history.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    state: RwLock<AuditState>,
    pending_faults: AtomicU32,
}

impl InMemoryAuditStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient `ConnectionError`.
    pub fn fail_next(&self, n: u32) {
        self.pending_faults.store(n, Ordering::Release);
    }

    /// Total number of records across all keys.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("audit.len"))?;
        Ok(state.by_id.len())
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl AuditStore for InMemoryAuditStore {
    fn get_last(&self, key: &EntityKey) -> Result<Option<LastMetric>, StorageError> {
        take_fault(&self.pending_faults, "audit.get_last")?;
        let state = self.state.read().map_err(|_| lock_err("audit.get_last"))?;
        Ok(state.latest(key).map(LastMetric::from))
    }

    fn append(&self, record: MetricRecord) -> Result<(), StorageError> {
        take_fault(&self.pending_faults, "audit.append")?;
        let mut state = self.state.write().map_err(|_| lock_err("audit.append"))?;
        state.insert(record)
    }

    fn append_if_latest(
        &self,
        record: MetricRecord,
        expected: Option<AuditId>,
    ) -> Result<(), StorageError> {
        take_fault(&self.pending_faults, "audit.append_if_latest")?;
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("audit.append_if_latest"))?;

        let actual = state.latest(&record.entity_key).map(|r| r.id);
        if actual != expected {
            let describe = |id: Option<AuditId>| id.map_or_else(|| "none".to_string(), |i| i.to_string());
            return Err(StorageError::StaleRead {
                key: record.entity_key.clone(),
                expected: describe(expected),
                actual: describe(actual),
            });
        }
        state.insert(record)
    }

    fn delete(&self, id: AuditId) -> Result<(), StorageError> {
        take_fault(&self.pending_faults, "audit.delete")?;
        let mut state = self.state.write().map_err(|_| lock_err("audit.delete"))?;
        let record = state.by_id.remove(&id).ok_or(StorageError::NotFound(id))?;
        if let Some(ids) = state.by_key.get_mut(&record.entity_key) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                state.by_key.remove(&record.entity_key);
            }
        }
        Ok(())
    }

    fn history(&self, key: &EntityKey) -> Result<Vec<MetricRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("audit.history"))?;
        let mut out: Vec<MetricRecord> = state
            .by_key
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default();
        // Stable sort keeps append order for equal timestamps.
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("audit.purge_before"))?;
        let before = state.by_id.len();
        state.by_id.retain(|_, r| r.timestamp >= cutoff);

        let AuditState { by_id, by_key } = &mut *state;
        by_key.retain(|_, ids| {
            ids.retain(|id| by_id.contains_key(id));
            !ids.is_empty()
        });

        Ok(before - state.by_id.len())
    }
}

/// Thread-safe in-memory entity sink.
#[derive(Debug, Default)]
pub struct InMemoryEntitySink {
    entities: RwLock<HashMap<(String, String), serde_json::Value>>,
    pending_faults: AtomicU32,
}

impl InMemoryEntitySink {
    /// Create a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient `ConnectionError`.
    pub fn fail_next(&self, n: u32) {
        self.pending_faults.store(n, Ordering::Release);
    }

    /// Fetch a committed entity payload.
    pub fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        let entities = self.entities.read().map_err(|_| lock_err("sink.get"))?;
        Ok(entities
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned())
    }

    /// Number of committed entities.
    pub fn len(&self) -> Result<usize, StorageError> {
        let entities = self.entities.read().map_err(|_| lock_err("sink.len"))?;
        Ok(entities.len())
    }

    /// Returns true if nothing has been committed.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl EntitySink for InMemoryEntitySink {
    fn save(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StorageError> {
        take_fault(&self.pending_faults, "sink.save")?;
        let mut entities = self.entities.write().map_err(|_| lock_err("sink.save"))?;
        entities.insert(
            (entity_type.to_string(), entity_id.to_string()),
            payload.clone(),
        );
        Ok(())
    }

    fn delete(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        take_fault(&self.pending_faults, "sink.delete")?;
        let mut entities = self.entities.write().map_err(|_| lock_err("sink.delete"))?;
        Ok(entities
            .remove(&(entity_type.to_string(), entity_id.to_string()))
            .is_some())
    }
}
