//! Pipeline message contracts.
//!
//! Every message is an immutable value record compared structurally, so a
//! redelivered message is recognisably the same message. Field names are the
//! wire contract and serialize in camelCase; [`PipelineMessage`] is the tagged
//! union that travels on the bus.
//!
//! Flow per entity:
//!
//! ```text
//! SaveRequested   -> SaveValidated{validated} -> SaveCommitted | SaveRejected | SaveCommitFault
//! DeleteRequested -> DeleteValidated{validated} -> DeleteCommitted | DeleteRejected | DeleteCommitFault
//! SaveBatchRequested -> SaveBatchValidated | SaveBatchRejected
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::audit::OperationKind;
use crate::entity::{AuditId, BatchId, CorrelationId, EntityKey};
use crate::error::{ExecutionError, GuardError, ValidationError};
use crate::threshold::AggregationStrategy;

/// Why a commit-stage operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Store or transport hiccup; a later redelivery may succeed.
    Transient,
    /// Malformed input or configuration; redelivery fails the same way.
    NonRetryable,
    /// The reliability policy refused to run the operation.
    CircuitOpen,
    /// The reliability policy retried and gave up.
    RetriesExhausted,
    /// The external stop signal fired first.
    Cancelled,
}

impl FaultKind {
    /// Map an error onto the fault taxonomy.
    #[must_use]
    pub const fn classify(err: &GuardError) -> Self {
        match err {
            GuardError::Execution(ExecutionError::CircuitOpen { .. }) => Self::CircuitOpen,
            GuardError::Execution(ExecutionError::RetriesExhausted { .. }) => Self::RetriesExhausted,
            GuardError::Execution(ExecutionError::Cancelled) => Self::Cancelled,
            e if e.is_retryable() => Self::Transient,
            _ => Self::NonRetryable,
        }
    }
}

/// Request to validate and persist an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequested {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Entity payload the metric is read from.
    pub payload: JsonValue,
    /// Threads the request through every stage.
    #[serde(default)]
    pub correlation_id: CorrelationId,
    /// Kind of change requested.
    #[serde(default)]
    pub operation: OperationKind,
}

impl SaveRequested {
    /// New update request with a fresh correlation id.
    #[must_use]
    pub fn new(
        app_name: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            correlation_id: CorrelationId::new(),
            operation: OperationKind::Update,
        }
    }

    /// Sets the operation kind.
    #[must_use]
    pub fn with_operation(mut self, operation: OperationKind) -> Self {
        self.operation = operation;
        self
    }

    /// Reuses an existing correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Audit key for this entity (`"{entity_type}:{entity_id}"`).
    pub fn entity_key(&self) -> Result<EntityKey, ValidationError> {
        EntityKey::for_entity(&self.entity_type, &self.entity_id)
    }
}

/// Verdict of the save validate stage. The audit record is already written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveValidated {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Entity payload the metric is read from.
    pub payload: JsonValue,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Kind of change requested.
    #[serde(default)]
    pub operation: OperationKind,
    /// Verdict: true if the change passed validation.
    pub validated: bool,
    /// Candidate metric extracted from the payload.
    pub metric_value: f64,
    /// Comparison basis; `None` if the key had no history.
    #[serde(default)]
    pub previous_value: Option<f64>,
    /// Audit record written for this outcome.
    pub audit_id: AuditId,
}

/// Terminal business rejection of a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRejected {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Why the change was rejected.
    pub reason: String,
}

/// A validated save reached the entity sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCommitted {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Audit record written by the validate stage.
    pub audit_id: AuditId,
}

/// A save failed operationally. Reported once; saves are not retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCommitFault {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Entity payload the metric is read from.
    pub payload: JsonValue,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Rendered error that ended the operation.
    pub error_message: String,
    /// Classification of the failure.
    pub fault_kind: FaultKind,
}

/// Request to delete an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequested {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    #[serde(default)]
    pub correlation_id: CorrelationId,
}

impl DeleteRequested {
    /// New delete request with a fresh correlation id.
    #[must_use]
    pub fn new(app_name: impl Into<String>, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            correlation_id: CorrelationId::new(),
        }
    }

    /// Audit key for this entity (`"{entity_type}:{entity_id}"`).
    pub fn entity_key(&self) -> Result<EntityKey, ValidationError> {
        EntityKey::for_entity(&self.entity_type, &self.entity_id)
    }
}

/// Verdict of the delete validation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteValidated {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Verdict: true if the change passed validation.
    pub validated: bool,
}

/// Terminal business rejection of a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRejected {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Why the change was rejected.
    pub reason: String,
}

/// The entity was removed from the sink and the delete audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCommitted {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// False when the entity was already gone (deletes are idempotent).
    pub existed: bool,
}

/// A delete failed after the reliability policy gave up (or refused to run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCommitFault {
    /// Tenant / application that issued the change.
    pub app_name: String,
    /// Entity type; selects the validation plan.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Rendered error that ended the operation.
    pub error_message: String,
    /// Classification of the failure.
    pub fault_kind: FaultKind,
}

/// An all-or-nothing batch of saves, validated in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBatchRequested {
    /// Identifier of the batch.
    #[serde(default)]
    pub batch_id: BatchId,
    /// Saves to validate, in order.
    pub items: Vec<SaveRequested>,
    /// Threads the request through every stage.
    #[serde(default)]
    pub correlation_id: CorrelationId,
    /// Reduction used for the single aggregate audit record.
    #[serde(default)]
    pub strategy: AggregationStrategy,
}

impl SaveBatchRequested {
    /// A batch with a fresh batch id and the default strategy.
    #[must_use]
    pub fn new(items: Vec<SaveRequested>) -> Self {
        Self {
            batch_id: BatchId::new(),
            items,
            correlation_id: CorrelationId::new(),
            strategy: AggregationStrategy::default(),
        }
    }

    /// Sets the reduction for the aggregate record.
    #[must_use]
    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// The whole batch passed and its aggregate record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBatchValidated {
    /// Identifier of the batch.
    pub batch_id: BatchId,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Number of items validated.
    pub item_count: usize,
    /// Reduction of the item metrics.
    pub aggregate_metric: f64,
    /// Audit record written for this outcome.
    pub audit_id: AuditId,
}

/// The batch was rejected as a whole; nothing was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBatchRejected {
    /// Identifier of the batch.
    pub batch_id: BatchId,
    /// Threads the request through every stage.
    pub correlation_id: CorrelationId,
    /// Position of the first offending item, if one item is to blame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
    /// Entity id of the offending item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_entity_id: Option<String>,
    /// Why the change was rejected.
    pub reason: String,
    /// Set when the rejection is operational rather than a business verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_kind: Option<FaultKind>,
}

/// A summary value passed validation and was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCommitted {
    /// Audit key the summary is recorded under.
    pub entity_key: EntityKey,
    /// Application the summary is reported for.
    pub app_name: String,
    /// Identifies this run.
    pub correlation_id: CorrelationId,
    /// Summary value.
    pub value: f64,
    /// Last committed summary, if any.
    #[serde(default)]
    pub previous_value: Option<f64>,
    /// Number of samples reduced.
    pub sample_count: usize,
    /// Audit record written for this outcome.
    pub audit_id: AuditId,
}

/// A summary value failed validation (or could not be produced) and was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDiscarded {
    /// Audit key the summary is recorded under.
    pub entity_key: EntityKey,
    /// Application the summary is reported for.
    pub app_name: String,
    /// Identifies this run.
    pub correlation_id: CorrelationId,
    /// Summary value; `None` if the run failed before producing one.
    #[serde(default)]
    pub value: Option<f64>,
    /// Last committed summary, if any.
    #[serde(default)]
    pub previous_value: Option<f64>,
    /// Failing rule or the error that ended the run.
    pub reason: String,
}

/// Stage of the save/delete state machine a message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Awaiting validation.
    Requested,
    /// The validate stage is running.
    Validating,
    /// A verdict was reached and audited.
    Validated,
    /// Terminal: the change failed validation.
    Rejected,
    /// The commit stage is running.
    Committing,
    /// Terminal: the change was persisted.
    Committed,
    /// Terminal: an operational failure ended the flow.
    CommitFault,
}

impl PipelineState {
    /// Legal edges of `Requested → Validating → {Validated | Rejected} →
    /// Committing → {Committed | CommitFault}`.
    ///
    /// Operational failures can also end the validate stage (`Validating →
    /// CommitFault`), and a `validated = false` verdict ends in `Rejected`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Validating)
                | (Self::Validating, Self::Validated | Self::Rejected | Self::CommitFault)
                | (Self::Validated, Self::Committing | Self::Rejected)
                | (Self::Committing, Self::Committed | Self::CommitFault)
        )
    }

    /// True if no further stage consumes this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Committed | Self::CommitFault)
    }
}

/// Everything that travels on the pipeline bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineMessage {
    /// See [`SaveRequested`].
    SaveRequested(SaveRequested),
    /// See [`SaveValidated`].
    SaveValidated(SaveValidated),
    /// See [`SaveRejected`].
    SaveRejected(SaveRejected),
    /// See [`SaveCommitted`].
    SaveCommitted(SaveCommitted),
    /// See [`SaveCommitFault`].
    SaveCommitFault(SaveCommitFault),
    /// See [`DeleteRequested`].
    DeleteRequested(DeleteRequested),
    /// See [`DeleteValidated`].
    DeleteValidated(DeleteValidated),
    /// See [`DeleteRejected`].
    DeleteRejected(DeleteRejected),
    /// See [`DeleteCommitted`].
    DeleteCommitted(DeleteCommitted),
    /// See [`DeleteCommitFault`].
    DeleteCommitFault(DeleteCommitFault),
    /// See [`SaveBatchRequested`].
    SaveBatchRequested(SaveBatchRequested),
    /// See [`SaveBatchValidated`].
    SaveBatchValidated(SaveBatchValidated),
    /// See [`SaveBatchRejected`].
    SaveBatchRejected(SaveBatchRejected),
    /// See [`SummaryCommitted`].
    SummaryCommitted(SummaryCommitted),
    /// See [`SummaryDiscarded`].
    SummaryDiscarded(SummaryDiscarded),
}

impl PipelineMessage {
    /// Correlation id carried by the message.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        match self {
            Self::SaveRequested(m) => m.correlation_id,
            Self::SaveValidated(m) => m.correlation_id,
            Self::SaveRejected(m) => m.correlation_id,
            Self::SaveCommitted(m) => m.correlation_id,
            Self::SaveCommitFault(m) => m.correlation_id,
            Self::DeleteRequested(m) => m.correlation_id,
            Self::DeleteValidated(m) => m.correlation_id,
            Self::DeleteRejected(m) => m.correlation_id,
            Self::DeleteCommitted(m) => m.correlation_id,
            Self::DeleteCommitFault(m) => m.correlation_id,
            Self::SaveBatchRequested(m) => m.correlation_id,
            Self::SaveBatchValidated(m) => m.correlation_id,
            Self::SaveBatchRejected(m) => m.correlation_id,
            Self::SummaryCommitted(m) => m.correlation_id,
            Self::SummaryDiscarded(m) => m.correlation_id,
        }
    }

    /// Wire tag of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SaveRequested(_) => "save_requested",
            Self::SaveValidated(_) => "save_validated",
            Self::SaveRejected(_) => "save_rejected",
            Self::SaveCommitted(_) => "save_committed",
            Self::SaveCommitFault(_) => "save_commit_fault",
            Self::DeleteRequested(_) => "delete_requested",
            Self::DeleteValidated(_) => "delete_validated",
            Self::DeleteRejected(_) => "delete_rejected",
            Self::DeleteCommitted(_) => "delete_committed",
            Self::DeleteCommitFault(_) => "delete_commit_fault",
            Self::SaveBatchRequested(_) => "save_batch_requested",
            Self::SaveBatchValidated(_) => "save_batch_validated",
            Self::SaveBatchRejected(_) => "save_batch_rejected",
            Self::SummaryCommitted(_) => "summary_committed",
            Self::SummaryDiscarded(_) => "summary_discarded",
        }
    }

    /// State-machine position of this message.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        match self {
            Self::SaveRequested(_) | Self::DeleteRequested(_) | Self::SaveBatchRequested(_) => {
                PipelineState::Requested
            }
            Self::SaveValidated(_) | Self::DeleteValidated(_) => PipelineState::Validated,
            Self::SaveRejected(_)
            | Self::DeleteRejected(_)
            | Self::SaveBatchRejected(_)
            | Self::SummaryDiscarded(_) => PipelineState::Rejected,
            Self::SaveCommitted(_)
            | Self::DeleteCommitted(_)
            | Self::SaveBatchValidated(_)
            | Self::SummaryCommitted(_) => PipelineState::Committed,
            Self::SaveCommitFault(_) | Self::DeleteCommitFault(_) => PipelineState::CommitFault,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String, crate::error::TransportError> {
        serde_json::to_string(self).map_err(|e| crate::error::TransportError::SerializationFailed {
            message: e.to_string(),
        })
    }

    /// Parse the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, crate::error::TransportError> {
        serde_json::from_str(json).map_err(|e| crate::error::TransportError::SerializationFailed {
            message: e.to_string(),
        })
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for PipelineMessage {
                fn from(m: $variant) -> Self {
                    Self::$variant(m)
                }
            }
        )*
    };
}

impl_from_message!(
    SaveRequested,
    SaveValidated,
    SaveRejected,
    SaveCommitted,
    SaveCommitFault,
    DeleteRequested,
    DeleteValidated,
    DeleteRejected,
    DeleteCommitted,
    DeleteCommitFault,
    SaveBatchRequested,
    SaveBatchValidated,
    SaveBatchRejected,
    SummaryCommitted,
    SummaryDiscarded,
);
