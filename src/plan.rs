//! Validation plans and the plan registry.
//!
//! A `ValidationPlan` says how to pull a metric out of an entity payload and
//! which rules the metric must satisfy. Plans are immutable once registered.
//! The registry is an injected component, not global state; a missing plan is
//! the empty plan, which accepts everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value as JsonValue;

use crate::config::EntityValidationConfig;
use crate::error::ValidationError;
use crate::threshold::{ThresholdRule, ValidationRule};

/// Pure metric extractor: entity payload → number.
pub type MetricExtractor = Arc<dyn Fn(&JsonValue) -> Result<f64, ValidationError> + Send + Sync>;

/// Read a numeric property from a JSON payload.
///
/// `property` may be a dotted path (`"stats.cpu"`). Numbers and numeric
/// strings are accepted; anything else is `MetricNotFound`.
pub fn extract_property(payload: &JsonValue, property: &str) -> Result<f64, ValidationError> {
    let not_found = || ValidationError::MetricNotFound {
        property: property.to_string(),
    };

    let mut current = payload;
    for segment in property.split('.') {
        current = current.get(segment).ok_or_else(not_found)?;
    }

    let value = match current {
        JsonValue::Number(n) => n.as_f64().ok_or_else(not_found)?,
        JsonValue::String(s) => s.trim().parse::<f64>().map_err(|_| not_found())?,
        _ => return Err(not_found()),
    };

    if !value.is_finite() {
        return Err(ValidationError::NonFiniteMetric { value });
    }
    Ok(value)
}

/// How to validate one entity type.
#[derive(Clone, Default)]
pub struct ValidationPlan {
    metric_property: Option<String>,
    extractor: Option<MetricExtractor>,
    rules: Vec<ThresholdRule>,
    custom_rules: Vec<Arc<dyn ValidationRule>>,
}

impl ValidationPlan {
    /// The no-op plan: no extractor, no rules.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Plan with a custom extractor and one threshold rule.
    pub fn new<F>(extractor: F, rule: ThresholdRule) -> Self
    where
        F: Fn(&JsonValue) -> Result<f64, ValidationError> + Send + Sync + 'static,
    {
        Self {
            metric_property: None,
            extractor: Some(Arc::new(extractor)),
            rules: vec![rule],
            custom_rules: Vec::new(),
        }
    }

    /// Plan reading `property` from the payload.
    #[must_use]
    pub fn property(property: impl Into<String>, rule: ThresholdRule) -> Self {
        let property = property.into();
        let extract_from = property.clone();
        Self {
            metric_property: Some(property),
            extractor: Some(Arc::new(move |payload: &JsonValue| {
                extract_property(payload, &extract_from)
            })),
            rules: vec![rule],
            custom_rules: Vec::new(),
        }
    }

    /// Plan built from an entity-type configuration.
    pub fn from_config(config: &EntityValidationConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self::property(config.metric_property.clone(), config.threshold_rule()?))
    }

    /// Adds another threshold rule (AND semantics).
    #[must_use]
    pub fn with_rule(mut self, rule: ThresholdRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Adds a custom ("manual") rule.
    #[must_use]
    pub fn with_custom_rule(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.custom_rules.push(rule);
        self
    }

    /// True if this plan has no rules at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.custom_rules.is_empty()
    }

    /// Payload property the plan reads, when built from a property name.
    #[must_use]
    pub fn metric_property(&self) -> Option<&str> {
        self.metric_property.as_deref()
    }

    /// Threshold rules, in registration order.
    #[must_use]
    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Extract the candidate metric. A plan without an extractor yields 0.
    pub fn extract(&self, payload: &JsonValue) -> Result<f64, ValidationError> {
        match &self.extractor {
            Some(extractor) => extractor(payload),
            None => Ok(0.0),
        }
    }

    /// Every rule (threshold and custom), for AND evaluation.
    pub fn all_rules(&self) -> impl Iterator<Item = &dyn ValidationRule> + '_ {
        self.rules
            .iter()
            .map(|r| r as &dyn ValidationRule)
            .chain(self.custom_rules.iter().map(|r| {
                let rule: &dyn ValidationRule = r.as_ref();
                rule
            }))
    }

    /// Name of the first rule rejecting `(previous, candidate)`, if any.
    #[must_use]
    pub fn first_failing_rule(&self, previous: f64, candidate: f64) -> Option<&str> {
        self.all_rules()
            .find(|r| !r.validate(previous, candidate))
            .map(|r| r.name())
    }

    /// AND of every rule. The empty plan accepts.
    #[must_use]
    pub fn evaluate(&self, previous: f64, candidate: f64) -> bool {
        self.first_failing_rule(previous, candidate).is_none()
    }
}

impl fmt::Debug for ValidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationPlan")
            .field("metric_property", &self.metric_property)
            .field("has_extractor", &self.extractor.is_some())
            .field("rules", &self.rules)
            .field("custom_rules", &self.custom_rules)
            .finish()
    }
}

impl PartialEq for ValidationPlan {
    fn eq(&self, other: &Self) -> bool {
        let same_extractor = match (&self.extractor, &other.extractor) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || self.metric_property.is_some(),
            _ => false,
        };
        let same_custom = self.custom_rules.len() == other.custom_rules.len()
            && self
                .custom_rules
                .iter()
                .zip(&other.custom_rules)
                .all(|(a, b)| Arc::ptr_eq(a, b));

        self.metric_property == other.metric_property
            && same_extractor
            && self.rules == other.rules
            && same_custom
    }
}

/// Concurrency-safe map from entity type to plan.
#[derive(Debug, Default)]
pub struct PlanRegistry {
    plans: RwLock<HashMap<String, Arc<ValidationPlan>>>,
}

impl PlanRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan for `entity_type`; the empty plan if none is registered. Never fails.
    #[must_use]
    pub fn get_plan(&self, entity_type: &str) -> Arc<ValidationPlan> {
        // Plans are immutable values, so a poisoned map is still consistent.
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        plans
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(ValidationPlan::empty()))
    }

    /// Register `plan`, replacing any existing mapping (last write wins).
    pub fn add_plan(&self, entity_type: impl Into<String>, plan: ValidationPlan) {
        let entity_type = entity_type.into();
        tracing::debug!(entity_type = %entity_type, rules = plan.rules.len(), "registering validation plan");
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        plans.insert(entity_type, Arc::new(plan));
    }

    /// Remove the mapping for `entity_type`, returning the old plan.
    pub fn remove(&self, entity_type: &str) -> Option<Arc<ValidationPlan>> {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        plans.remove(entity_type)
    }

    /// Number of registered entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no plan is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered entity types, sorted.
    #[must_use]
    pub fn entity_types(&self) -> Vec<String> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = plans.keys().cloned().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::threshold::PredicateRule;

    #[test]
    fn extract_property_handles_numbers_strings_and_paths() {
        let payload = json!({ "cpu": 12.5, "mem": "64", "stats": { "disk": 3 }, "name": "a" });
        assert!((extract_property(&payload, "cpu").unwrap() - 12.5).abs() < f64::EPSILON);
        assert!((extract_property(&payload, "mem").unwrap() - 64.0).abs() < f64::EPSILON);
        assert!((extract_property(&payload, "stats.disk").unwrap() - 3.0).abs() < f64::EPSILON);
        assert!(matches!(
            extract_property(&payload, "name"),
            Err(ValidationError::MetricNotFound { .. })
        ));
        assert!(matches!(
            extract_property(&payload, "missing"),
            Err(ValidationError::MetricNotFound { .. })
        ));
    }

    #[test]
    fn missing_plan_is_empty_and_accepts() {
        let registry = PlanRegistry::new();
        let plan = registry.get_plan("unknown");
        assert!(plan.is_empty());
        assert!(plan.evaluate(0.0, 1e12));
        assert!((plan.extract(&json!({})).unwrap()).abs() < f64::EPSILON);
    }

    #[test]
    fn add_plan_replaces_rather_than_merges() {
        let registry = PlanRegistry::new();
        let plan_a = ValidationPlan::property("cpu", ThresholdRule::raw_difference(5.0));
        let plan_b = ValidationPlan::property("mem", ThresholdRule::percent_change(10.0));

        registry.add_plan("server", plan_a.clone());
        registry.add_plan("server", plan_b.clone());

        let got = registry.get_plan("server");
        assert_eq!(*got, plan_b);
        assert_ne!(*got, plan_a);
        assert_eq!(got.rules().len(), 1);
        assert_eq!(registry.entity_types(), vec!["server".to_string()]);

        assert!(registry.remove("server").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn evaluate_ands_threshold_and_custom_rules() {
        let plan = ValidationPlan::property("cpu", ThresholdRule::raw_difference(10.0))
            .with_custom_rule(Arc::new(PredicateRule::new("below_ceiling", |_p, c| c <= 95.0)));

        assert!(plan.evaluate(80.0, 89.0));
        assert_eq!(plan.first_failing_rule(80.0, 90.0), None);
        assert_eq!(plan.first_failing_rule(80.0, 91.0), Some("raw_difference"));
        // Within the threshold but over the ceiling: only the custom rule fails.
        assert_eq!(plan.first_failing_rule(90.0, 96.0), Some("below_ceiling"));
        assert!(!plan.evaluate(90.0, 96.0));
        assert_eq!(plan.first_failing_rule(10.0, 50.0), Some("raw_difference"));
    }

    #[test]
    fn registry_is_safe_under_concurrent_access() {
        let registry = Arc::new(PlanRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let ty = format!("type-{}", (i + j) % 4);
                        registry.add_plan(ty.clone(), ValidationPlan::property("v", ThresholdRule::raw_difference(f64::from(j))));
                        let _ = registry.get_plan(&ty);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
