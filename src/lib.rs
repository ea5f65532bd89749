//! # KyroGuard - Threshold-Guarded Mutation Validation
//!
//! KyroGuard decides whether a change to an entity is plausible given that
//! entity's recorded history, and drives the change through an audited,
//! message-based save/delete pipeline.
//!
//! ## Core Concepts
//!
//! - **Threshold rule**: a comparison between the previous and candidate metric
//!   (raw difference, percent change, or a direct comparison)
//! - **Validation plan**: per entity type, how to extract the metric and which
//!   rules it must satisfy
//! - **Audit record**: every validation is recorded; the latest record for a key
//!   is the comparison basis for the next one
//! - **Reliability policy**: retry plus circuit breaker around delete commits
//! - **Summary pipeline**: gather, aggregate, validate, then commit or discard
//!
//! ## Usage
//!
//! ```rust
//! use kyroguard::{EntityKey, InMemoryAuditStore, SequenceValidator, ThresholdRule};
//!
//! let store = InMemoryAuditStore::new();
//! let rule = ThresholdRule::raw_difference(5.0);
//! let validator = SequenceValidator::default();
//!
//! // No history: the previous value counts as 0.
//! let ok = validator
//!     .validate(&3.0_f64, |v| *v, &store, |_| EntityKey::new("server:a"), &rule)
//!     .unwrap();
//! assert!(ok);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod audit;
pub mod entity;
pub mod error;

// Validation
pub mod config;
pub mod plan;
pub mod sequence;
pub mod threshold;

// Storage and execution
pub mod cancel;
pub mod reliability;
pub mod storage;

// Pipelines
pub mod bus;
pub mod messages;
pub mod pipeline;
pub mod summary;

// Re-export primary types at crate root for convenience
pub use audit::{LastMetric, MetricRecord, OperationKind};
pub use cancel::CancellationToken;
pub use config::{DeletePolicy, EntityValidationConfig, FirstValuePolicy, GuardConfig};
pub use entity::{AuditId, BatchId, CorrelationId, EntityKey};
pub use error::{ExecutionError, GuardError, GuardResult, TransportError, ValidationError};
pub use plan::{extract_property, MetricExtractor, PlanRegistry, ValidationPlan};
pub use reliability::{CircuitState, ReliabilityConfig, ReliabilityPolicy};
pub use sequence::{BatchFailure, BatchOutcome, SequenceValidator};
pub use storage::{AuditStore, EntitySink, InMemoryAuditStore, InMemoryEntitySink, StorageError};
pub use threshold::{
    aggregate, validate, validate_aggregate, validate_all, AggregationStrategy, PredicateRule,
    ThresholdKind, ThresholdRule, ValidationRule,
};

pub use bus::{BusReceiver, InProcessBus, MessagePublisher, RecordingPublisher};
pub use messages::{FaultKind, PipelineMessage, PipelineState};
pub use pipeline::{BatchStage, DeleteStage, PipelineContext, PipelineHost, SaveStage};
pub use summary::{
    FnSource, HistorySource, MetricSource, StaticSource, SummaryOutcome, SummaryPipeline,
    SummaryPipelineConfig,
};
