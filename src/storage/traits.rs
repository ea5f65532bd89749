//! Abstract storage traits for KyroGuard.
//!
//! These traits define the contract the validation core needs from its
//! external collaborators:
//! - `AuditStore` holds the metric history used as the comparison basis
//! - `EntitySink` is where committed business entities finally land
//!
//! Concrete engines (relational, document) live outside this crate; the
//! in-memory backends in `storage::memory` are the reference implementation.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::{LastMetric, MetricRecord};
use crate::entity::{AuditId, EntityKey};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Audit record not found.
    #[error("Audit record not found: {0}")]
    NotFound(AuditId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The latest record for a key changed between read and append.
    #[error("Stale read for {key}: expected latest {expected}, found {actual}")]
    StaleRead {
        /// Key whose history moved.
        key: EntityKey,
        /// Latest record id the writer read.
        expected: String,
        /// Latest record id at append time.
        actual: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true for failures that may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendError(_) | Self::ConnectionError(_) | Self::StaleRead { .. }
        )
    }
}

/// Storage trait for the audit history.
///
/// # Ordering
/// For a given key, the record with the latest timestamp is the comparison
/// basis for the next validation. Ties resolve to the record appended last.
///
/// # Concurrency
/// Plain `get_last` followed by `append` races between concurrent writers of
/// the same key. Writers that need read-then-append atomicity use
/// `append_if_latest`, which rejects the append if the history moved.
pub trait AuditStore: Send + Sync {
    /// Latest metric recorded for `key`, if any.
    fn get_last(&self, key: &EntityKey) -> Result<Option<LastMetric>, StorageError>;

    /// Append a record. Returns error if the ID already exists.
    fn append(&self, record: MetricRecord) -> Result<(), StorageError>;

    /// Compare-and-append: append only if the latest record for the key is
    /// still `expected` (`None` meaning the key has no history yet).
    ///
    /// # Errors
    /// - `StaleRead`: another writer appended for the same key in between
    fn append_if_latest(
        &self,
        record: MetricRecord,
        expected: Option<AuditId>,
    ) -> Result<(), StorageError>;

    /// Hard-delete a single record.
    ///
    /// # Errors
    /// - `NotFound`: no record with this ID
    fn delete(&self, id: AuditId) -> Result<(), StorageError>;

    /// Full history for a key, oldest first.
    fn history(&self, key: &EntityKey) -> Result<Vec<MetricRecord>, StorageError>;

    /// Retention: remove every record older than `cutoff`. Returns the number removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Destination for committed business entities.
///
/// The commit stage of the save and delete pipelines writes here after a
/// change passed validation.
pub trait EntitySink: Send + Sync {
    /// Persist (create or replace) an entity payload.
    fn save(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StorageError>;

    /// Remove an entity. Idempotent: returns `false` if it did not exist.
    fn delete(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError>;
}
