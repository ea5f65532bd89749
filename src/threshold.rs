//! Threshold evaluation.
//!
//! The built-in comparisons are a closed set (`ThresholdKind`) interpreted by a
//! single pure function, [`validate`]. Callers that need something else plug
//! in a [`ValidationRule`]; several rules combine with AND semantics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Built-in threshold comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    /// `|candidate - previous| <= threshold`.
    #[default]
    RawDifference,
    /// `|candidate - previous| / |previous| * 100 <= threshold`; vacuously true when `previous == 0`.
    PercentChange,
    /// `candidate > previous + threshold`.
    GreaterThan,
    /// `candidate < previous - threshold`.
    LessThan,
    /// `candidate == previous`; threshold unused.
    EqualTo,
    /// `candidate != previous`; threshold unused.
    NotEqualTo,
}

impl ThresholdKind {
    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RawDifference => "raw_difference",
            Self::PercentChange => "percent_change",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::EqualTo => "equal_to",
            Self::NotEqualTo => "not_equal_to",
        }
    }
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold kind plus its numeric bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Comparison performed.
    pub kind: ThresholdKind,
    /// Bound the comparison is checked against.
    pub threshold: f64,
}

impl ThresholdRule {
    /// Creates a rule, rejecting bounds that would make every comparison meaningless.
    pub fn new(kind: ThresholdKind, threshold: f64) -> Result<Self, ValidationError> {
        if !threshold.is_finite() {
            return Err(ValidationError::InvalidThreshold {
                value: threshold,
                reason: "threshold must be finite".to_string(),
            });
        }
        if threshold < 0.0 && matches!(kind, ThresholdKind::RawDifference | ThresholdKind::PercentChange) {
            return Err(ValidationError::InvalidThreshold {
                value: threshold,
                reason: format!("{kind} threshold cannot be negative"),
            });
        }
        Ok(Self { kind, threshold })
    }

    /// `|candidate - previous| <= threshold`.
    #[must_use]
    pub const fn raw_difference(threshold: f64) -> Self {
        Self {
            kind: ThresholdKind::RawDifference,
            threshold,
        }
    }

    /// Percent change bounded by `threshold` percent.
    #[must_use]
    pub const fn percent_change(threshold: f64) -> Self {
        Self {
            kind: ThresholdKind::PercentChange,
            threshold,
        }
    }

    /// `candidate > previous + threshold`.
    #[must_use]
    pub const fn greater_than(threshold: f64) -> Self {
        Self {
            kind: ThresholdKind::GreaterThan,
            threshold,
        }
    }

    /// `candidate < previous - threshold`.
    #[must_use]
    pub const fn less_than(threshold: f64) -> Self {
        Self {
            kind: ThresholdKind::LessThan,
            threshold,
        }
    }

    /// Exact equality.
    #[must_use]
    pub const fn equal_to() -> Self {
        Self {
            kind: ThresholdKind::EqualTo,
            threshold: 0.0,
        }
    }

    /// Exact inequality.
    #[must_use]
    pub const fn not_equal_to() -> Self {
        Self {
            kind: ThresholdKind::NotEqualTo,
            threshold: 0.0,
        }
    }

    /// Compare an aggregated scalar directly against this rule's bound.
    ///
    /// Used by the aggregate-over-collection path, where there is no
    /// "previous" value: differences are read as magnitudes and the direct
    /// comparisons test the scalar against the threshold itself.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn check_bound(&self, scalar: f64) -> bool {
        match self.kind {
            ThresholdKind::RawDifference => scalar.abs() <= self.threshold,
            ThresholdKind::PercentChange => scalar <= self.threshold,
            ThresholdKind::GreaterThan => scalar > self.threshold,
            ThresholdKind::LessThan => scalar < self.threshold,
            ThresholdKind::EqualTo => scalar == self.threshold,
            ThresholdKind::NotEqualTo => scalar != self.threshold,
        }
    }
}

/// Pure comparison of `previous` vs `candidate` under `rule`.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn validate(previous: f64, candidate: f64, rule: ThresholdRule) -> bool {
    let threshold = rule.threshold;
    match rule.kind {
        ThresholdKind::RawDifference => (candidate - previous).abs() <= threshold,
        ThresholdKind::PercentChange => {
            if previous == 0.0 {
                // No base to measure a percentage against.
                return true;
            }
            (candidate - previous).abs() / previous.abs() * 100.0 <= threshold
        }
        ThresholdKind::GreaterThan => candidate > previous + threshold,
        ThresholdKind::LessThan => candidate < previous - threshold,
        ThresholdKind::EqualTo => candidate == previous,
        ThresholdKind::NotEqualTo => candidate != previous,
    }
}

/// A validation predicate over a (previous, candidate) pair.
///
/// This is the open extension point: `ThresholdRule` implements it for the
/// built-in kinds and [`PredicateRule`] wraps arbitrary closures.
pub trait ValidationRule: Send + Sync + fmt::Debug {
    /// Short name used in logs and rejection reasons.
    fn name(&self) -> &str;

    /// Returns true if `candidate` is acceptable given `previous`.
    fn validate(&self, previous: f64, candidate: f64) -> bool;
}

impl ValidationRule for ThresholdRule {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn validate(&self, previous: f64, candidate: f64) -> bool {
        validate(previous, candidate, *self)
    }
}

/// Custom rule backed by a closure.
pub struct PredicateRule<F> {
    name: String,
    predicate: F,
}

impl<F> PredicateRule<F>
where
    F: Fn(f64, f64) -> bool + Send + Sync,
{
    /// Wraps `predicate(previous, candidate)` under `name`.
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> fmt::Debug for PredicateRule<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRule").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<F> ValidationRule for PredicateRule<F>
where
    F: Fn(f64, f64) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, previous: f64, candidate: f64) -> bool {
        (self.predicate)(previous, candidate)
    }
}

/// AND-combination: true iff every rule accepts. An empty rule set accepts.
pub fn validate_all<'a, I>(previous: f64, candidate: f64, rules: I) -> bool
where
    I: IntoIterator<Item = &'a dyn ValidationRule>,
{
    rules.into_iter().all(|r| r.validate(previous, candidate))
}

/// Reduction applied to a numeric collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Sum of all values.
    #[default]
    Sum,
    /// Arithmetic mean.
    Average,
    /// Number of values.
    Count,
    /// Population variance (divisor N).
    Variance,
}

impl AggregationStrategy {
    /// Reduce `values`. Every strategy yields 0 for an empty collection.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let n = values.len() as f64;
        match self {
            Self::Sum => values.iter().sum(),
            Self::Count => n,
            Self::Average => values.iter().sum::<f64>() / n,
            Self::Variance => {
                let mean = values.iter().sum::<f64>() / n;
                values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
            }
        }
    }
}

/// Project `items` through `selector` and reduce with `strategy`.
pub fn aggregate<T, F>(items: &[T], selector: F, strategy: AggregationStrategy) -> f64
where
    F: Fn(&T) -> f64,
{
    let values: Vec<f64> = items.iter().map(selector).collect();
    strategy.apply(&values)
}

/// Aggregate-over-collection validation: reduce, then compare against the rule's bound.
pub fn validate_aggregate<T, F>(
    items: &[T],
    selector: F,
    strategy: AggregationStrategy,
    rule: ThresholdRule,
) -> bool
where
    F: Fn(&T) -> f64,
{
    rule.check_bound(aggregate(items, selector, strategy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_difference_matches_absolute_delta() {
        let rule = ThresholdRule::raw_difference(5.0);
        for (prev, cand) in [(0.0, 5.0), (10.0, 4.9), (-3.0, 2.0), (100.0, 106.0), (7.5, 7.5)] {
            assert_eq!(validate(prev, cand, rule), (cand - prev).abs() <= 5.0, "{prev} -> {cand}");
        }
    }

    #[test]
    fn percent_change_guards_zero_previous() {
        let rule = ThresholdRule::percent_change(10.0);
        assert!(validate(0.0, 1_000_000.0, rule));
        assert!(validate(100.0, 110.0, rule));
        assert!(!validate(100.0, 110.5, rule));
        assert!(validate(50.0, 45.0, rule));
    }

    #[test]
    fn direct_comparisons_offset_by_threshold() {
        assert!(validate(10.0, 13.1, ThresholdRule::greater_than(3.0)));
        assert!(!validate(10.0, 13.0, ThresholdRule::greater_than(3.0)));
        assert!(validate(10.0, 6.9, ThresholdRule::less_than(3.0)));
        assert!(!validate(10.0, 7.0, ThresholdRule::less_than(3.0)));
        assert!(validate(4.0, 4.0, ThresholdRule::equal_to()));
        assert!(!validate(4.0, 4.5, ThresholdRule::equal_to()));
        assert!(validate(4.0, 4.5, ThresholdRule::not_equal_to()));
    }

    #[test]
    fn rule_constructor_rejects_bad_bounds() {
        assert!(ThresholdRule::new(ThresholdKind::RawDifference, f64::NAN).is_err());
        assert!(ThresholdRule::new(ThresholdKind::PercentChange, -1.0).is_err());
        assert!(ThresholdRule::new(ThresholdKind::LessThan, -1.0).is_ok());
    }

    #[test]
    fn validate_all_is_conjunction() {
        let raw = ThresholdRule::raw_difference(10.0);
        let positive = PredicateRule::new("positive", |_prev, cand| cand > 0.0);
        let rules: Vec<&dyn ValidationRule> = vec![&raw, &positive];

        assert!(validate_all(5.0, 8.0, rules.iter().copied()));
        assert!(!validate_all(5.0, -1.0, rules.iter().copied()));
        assert!(!validate_all(5.0, 20.0, rules.iter().copied()));
        assert!(validate_all(5.0, 1e9, std::iter::empty()));
        assert_eq!(positive.name(), "positive");
    }

    #[test]
    fn aggregation_strategies() {
        let values = [1.0, 2.0, 3.0];
        assert!((AggregationStrategy::Sum.apply(&values) - 6.0).abs() < 1e-12);
        assert!((AggregationStrategy::Average.apply(&values) - 2.0).abs() < 1e-12);
        assert!((AggregationStrategy::Count.apply(&values) - 3.0).abs() < 1e-12);
        assert!((AggregationStrategy::Variance.apply(&values) - 2.0 / 3.0).abs() < 1e-12);

        for strategy in [
            AggregationStrategy::Sum,
            AggregationStrategy::Average,
            AggregationStrategy::Count,
            AggregationStrategy::Variance,
        ] {
            assert_eq!(strategy.apply(&[]), 0.0);
        }
    }

    #[test]
    fn aggregate_over_projection() {
        #[derive(Debug)]
        struct Reading {
            load: f64,
        }
        let readings = [Reading { load: 2.0 }, Reading { load: 4.0 }, Reading { load: 9.0 }];

        assert!((aggregate(&readings, |r| r.load, AggregationStrategy::Average) - 5.0).abs() < 1e-12);
        assert!(validate_aggregate(&readings, |r| r.load, AggregationStrategy::Sum, ThresholdRule::less_than(20.0)));
        assert!(!validate_aggregate(&readings, |r| r.load, AggregationStrategy::Sum, ThresholdRule::raw_difference(10.0)));
        assert!(validate_aggregate::<Reading, _>(&[], |r| r.load, AggregationStrategy::Count, ThresholdRule::equal_to()));
    }
}
