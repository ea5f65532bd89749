//! Per-entity-type validation configuration.
//!
//! Configuration is plain data: callers build it in code or parse it from
//! JSON. Loading it from files or the environment is the host's job.
//!
//! ```json
//! {
//!   "app_name": "inventory",
//!   "default": { "metric_property": "value", "threshold_kind": "raw_difference", "threshold_value": 5.0 },
//!   "entities": {
//!     "server": { "metric_property": "cpu", "threshold_kind": "percent_change", "threshold_value": 20.0 }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::plan::{PlanRegistry, ValidationPlan};
use crate::reliability::ReliabilityConfig;
use crate::threshold::{ThresholdKind, ThresholdRule};

/// How to treat the first value ever seen for an entity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstValuePolicy {
    /// Compare against an implicit previous value of 0.
    #[default]
    CompareToZero,
    /// Accept the first value without evaluating any rule.
    Bypass,
}

/// How delete requests are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Evaluate the plan with a fixed candidate of 0 against the last metric.
    #[default]
    CompareToZero,
    /// Deletes are not subject to metric thresholds.
    SkipThreshold,
}

/// Validation and reliability settings for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityValidationConfig {
    /// Payload property holding the metric. Dotted paths address nested objects.
    pub metric_property: String,
    /// How previous and candidate are compared.
    pub threshold_kind: ThresholdKind,
    /// Bound for `threshold_kind`.
    pub threshold_value: f64,
    /// Attempts per reliability-wrapped operation (including the first).
    pub max_retry_attempts: u32,
    /// Per-attempt time limit in milliseconds. Must be positive.
    pub validation_timeout_ms: u64,
    /// Consecutive exhausted operations before the circuit opens.
    pub circuit_breaker_threshold: u32,
    /// How long an open circuit rejects calls, in milliseconds.
    pub circuit_breaker_timeout_ms: u64,
    /// Delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Treatment of a key with no history.
    pub first_value_policy: FirstValuePolicy,
    /// How delete requests are checked.
    pub delete_policy: DeletePolicy,
}

impl Default for EntityValidationConfig {
    fn default() -> Self {
        Self {
            metric_property: "value".to_string(),
            threshold_kind: ThresholdKind::RawDifference,
            threshold_value: 10.0,
            max_retry_attempts: 3,
            validation_timeout_ms: 5_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 30_000,
            retry_delay_ms: 200,
            first_value_policy: FirstValuePolicy::default(),
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl EntityValidationConfig {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.metric_property.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "metric_property".to_string(),
            });
        }
        self.threshold_rule()?;
        if self.max_retry_attempts == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_retry_attempts must be at least 1".to_string(),
            });
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "circuit_breaker_threshold must be at least 1".to_string(),
            });
        }
        if self.validation_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "validation_timeout_ms must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// The configured threshold rule.
    pub fn threshold_rule(&self) -> Result<ThresholdRule, ValidationError> {
        ThresholdRule::new(self.threshold_kind, self.threshold_value)
    }

    /// `validation_timeout_ms` as a `Duration`.
    #[must_use]
    pub const fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// `circuit_breaker_timeout_ms` as a `Duration`.
    #[must_use]
    pub const fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    /// `retry_delay_ms` as a `Duration`.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reliability policy settings derived from this configuration.
    #[must_use]
    pub const fn reliability(&self) -> ReliabilityConfig {
        ReliabilityConfig {
            max_retry_attempts: self.max_retry_attempts,
            retry_delay: self.retry_delay(),
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_timeout: self.circuit_breaker_timeout(),
            operation_timeout: Some(self.validation_timeout()),
        }
    }
}

/// Top-level configuration: a default plus per-entity-type overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Application name stamped on records produced outside a request (summaries).
    pub app_name: String,
    /// Settings for entity types without an override.
    pub default: EntityValidationConfig,
    /// Per-entity-type overrides, keyed by entity type.
    pub entities: HashMap<String, EntityValidationConfig>,
}

impl GuardConfig {
    /// Parse configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid config JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Adds or replaces the configuration for `entity_type`.
    #[must_use]
    pub fn with_entity(mut self, entity_type: impl Into<String>, config: EntityValidationConfig) -> Self {
        self.entities.insert(entity_type.into(), config);
        self
    }

    /// Configuration for `entity_type`, falling back to `default`.
    #[must_use]
    pub fn for_entity(&self, entity_type: &str) -> &EntityValidationConfig {
        self.entities.get(entity_type).unwrap_or(&self.default)
    }

    /// Validates the default and every override.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.default.validate()?;
        for (entity_type, config) in &self.entities {
            if entity_type.trim().is_empty() {
                return Err(ValidationError::EmptyEntityType);
            }
            config.validate().map_err(|e| ValidationError::InvalidConfig {
                reason: format!("entity type '{entity_type}': {e}"),
            })?;
        }
        Ok(())
    }

    /// Registers a property-based plan for every configured entity type.
    ///
    /// Types without an override get no plan and therefore validate
    /// unconditionally; the default only supplies reliability settings.
    pub fn build_registry(&self) -> Result<PlanRegistry, ValidationError> {
        let registry = PlanRegistry::new();
        for (entity_type, config) in &self.entities {
            registry.add_plan(entity_type.clone(), ValidationPlan::from_config(config)?);
        }
        Ok(registry)
    }
}
