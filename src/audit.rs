//! Audit records.
//!
//! A `MetricRecord` is written on every validate/commit cycle and captures the
//! metric value together with the verdict it received. History is append-only:
//! the record with the latest timestamp for a key is the comparison basis for
//! the next validation. Records are only removed by explicit retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{AuditId, CorrelationId, EntityKey};

/// Kind of mutation an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Entity creation.
    Create,
    /// Entity update.
    #[default]
    Update,
    /// Entity deletion.
    Delete,
    /// Aggregate record for a whole save batch.
    Batch,
    /// Committed output of the summarisation pipeline.
    Summary,
}

impl OperationKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Batch => "batch",
            Self::Summary => "summary",
        }
    }
}

/// One audit entry: a metric value and the verdict it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Unique record id.
    pub id: AuditId,
    /// Key whose history this record extends.
    pub entity_key: EntityKey,
    /// Entity type the key belongs to.
    pub entity_type: String,
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Candidate metric that was judged.
    pub metric_value: f64,
    /// Verdict captured at validation time.
    pub validated: bool,
    /// When the record was written; orders the history.
    pub timestamp: DateTime<Utc>,
    /// Request that produced the record.
    pub correlation_id: CorrelationId,
    /// Kind of change that was validated.
    pub operation: OperationKind,

    /// Item count, for batch summary records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Payload property the metric was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,

    /// Raw property value as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_value: Option<String>,
}

impl MetricRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        entity_key: EntityKey,
        entity_type: impl Into<String>,
        app_name: impl Into<String>,
        metric_value: f64,
        validated: bool,
        operation: OperationKind,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id: AuditId::new(),
            entity_key,
            entity_type: entity_type.into(),
            app_name: app_name.into(),
            metric_value,
            validated,
            timestamp: Utc::now(),
            correlation_id,
            operation,
            batch_size: None,
            property_name: None,
            property_value: None,
        }
    }

    /// Sets the batch size (aggregate batch records only).
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Records which property the metric came from.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.property_name = Some(name.into());
        self.property_value = Some(value.into());
        self
    }

    /// Overrides the timestamp (imports and tests).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The comparison basis returned by `AuditStore::get_last`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastMetric {
    /// Record the value came from.
    pub id: AuditId,
    /// Metric value.
    pub value: f64,
    /// Record timestamp.
    pub timestamp: DateTime<Utc>,
}

impl From<&MetricRecord> for LastMetric {
    fn from(record: &MetricRecord) -> Self {
        Self {
            id: record.id,
            value: record.metric_value,
            timestamp: record.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builders() {
        let key = EntityKey::new("server:a").unwrap();
        let record = MetricRecord::new(
            key.clone(),
            "server",
            "ops",
            12.5,
            true,
            OperationKind::Batch,
            CorrelationId::new(),
        )
        .with_batch_size(4)
        .with_property("cpu", "12.5");

        assert_eq!(record.entity_key, key);
        assert_eq!(record.batch_size, Some(4));
        assert_eq!(record.property_name.as_deref(), Some("cpu"));

        let last = LastMetric::from(&record);
        assert_eq!(last.id, record.id);
        assert!((last.value - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_serialization_skips_empty_options() {
        let record = MetricRecord::new(
            EntityKey::new("k").unwrap(),
            "t",
            "app",
            1.0,
            false,
            OperationKind::Delete,
            CorrelationId::new(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operation"], "delete");
        assert!(json.get("batch_size").is_none());

        let back: MetricRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
