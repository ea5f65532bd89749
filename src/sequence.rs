//! Validation of one entity, or an ordered batch, against its audit history.
//!
//! A batch is a causally ordered chain per key: each item is measured against
//! the most recent value for its key, whether that value came from the audit
//! store or from an earlier item in the same batch. Batches are validated
//! serially in input order and are all-or-nothing. Nothing here writes.

use std::collections::HashMap;

use crate::config::FirstValuePolicy;
use crate::entity::EntityKey;
use crate::error::{GuardResult, ValidationError};
use crate::plan::ValidationPlan;
use crate::storage::AuditStore;
use crate::threshold::{validate_all, ValidationRule};

/// Where a batch stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// Position of the offending item in the input.
    pub index: usize,
    /// Audit key of the offending item.
    pub key: EntityKey,
    /// Comparison basis; `None` if the key had no history.
    pub previous: Option<f64>,
    /// Metric that failed.
    pub candidate: f64,
}

/// Result of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every item passed.
    Passed {
        /// Number of items checked.
        checked: usize,
    },
    /// The first failing item; later items were not examined.
    Failed(BatchFailure),
}

impl BatchOutcome {
    /// True if every item passed.
    #[must_use]
    pub const fn is_passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }

    /// The failing item, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&BatchFailure> {
        match self {
            Self::Passed { .. } => None,
            Self::Failed(f) => Some(f),
        }
    }
}

/// Validates single entities and ordered batches against the audit store.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceValidator {
    first_value_policy: FirstValuePolicy,
}

impl SequenceValidator {
    /// A validator applying `first_value_policy` to keys with no history.
    #[must_use]
    pub const fn new(first_value_policy: FirstValuePolicy) -> Self {
        Self { first_value_policy }
    }

    /// Treatment of keys with no history.
    #[must_use]
    pub const fn first_value_policy(&self) -> FirstValuePolicy {
        self.first_value_policy
    }

    /// Decide a (previous, candidate) pair under the first-value policy.
    ///
    /// An absent previous value is either compared as 0 or bypasses the
    /// rules entirely.
    pub fn evaluate<'a, I>(&self, previous: Option<f64>, candidate: f64, rules: I) -> bool
    where
        I: IntoIterator<Item = &'a dyn ValidationRule>,
    {
        match (previous, self.first_value_policy) {
            (None, FirstValuePolicy::Bypass) => true,
            (previous, _) => validate_all(previous.unwrap_or(0.0), candidate, rules),
        }
    }

    /// `evaluate` against every rule of `plan`.
    #[must_use]
    pub fn evaluate_plan(&self, previous: Option<f64>, candidate: f64, plan: &ValidationPlan) -> bool {
        self.evaluate(previous, candidate, plan.all_rules())
    }

    /// Validate one entity against the last recorded metric for its key.
    ///
    /// Returns the verdict only; the store is read, never written.
    pub fn validate<T, M, K>(
        &self,
        entity: &T,
        metric: M,
        store: &dyn AuditStore,
        key_of: K,
        rule: &dyn ValidationRule,
    ) -> GuardResult<bool>
    where
        M: Fn(&T) -> f64,
        K: Fn(&T) -> Result<EntityKey, ValidationError>,
    {
        let key = key_of(entity)?;
        let previous = store.get_last(&key)?.map(|last| last.value);
        let candidate = metric(entity);
        let verdict = self.evaluate(previous, candidate, [rule]);
        tracing::debug!(
            entity_key = %key,
            previous = ?previous,
            candidate,
            rule = rule.name(),
            verdict,
            "validated entity against history"
        );
        Ok(verdict)
    }

    /// All-or-nothing batch validation with a single rule.
    ///
    /// `key_of` resolves the audit-store key. `key_selector`, when given,
    /// chooses the key that chains items within the batch; it defaults to
    /// `key_of`.
    pub fn validate_batch<T, M, K>(
        &self,
        items: &[T],
        metric: M,
        store: &dyn AuditStore,
        key_of: K,
        rule: &dyn ValidationRule,
        key_selector: Option<&dyn Fn(&T) -> Result<EntityKey, ValidationError>>,
    ) -> GuardResult<bool>
    where
        M: Fn(&T) -> f64,
        K: Fn(&T) -> Result<EntityKey, ValidationError>,
    {
        let outcome = self.run_chain(items, &metric, store, &key_of, key_selector, |_, previous, candidate| {
            self.evaluate(previous, candidate, [rule])
        })?;
        Ok(outcome.is_passed())
    }

    /// Batch validation with a per-item check, reporting the first failure.
    ///
    /// `check(item, previous, candidate)` receives the raw previous value;
    /// callers apply the first-value policy (see [`Self::evaluate`]).
    pub fn validate_batch_with<T, M, K, C>(
        &self,
        items: &[T],
        metric: M,
        store: &dyn AuditStore,
        key_of: K,
        check: C,
    ) -> GuardResult<BatchOutcome>
    where
        M: Fn(&T) -> f64,
        K: Fn(&T) -> Result<EntityKey, ValidationError>,
        C: Fn(&T, Option<f64>, f64) -> bool,
    {
        self.run_chain(items, &metric, store, &key_of, None, check)
    }

    fn run_chain<T, M, K, C>(
        &self,
        items: &[T],
        metric: &M,
        store: &dyn AuditStore,
        key_of: &K,
        key_selector: Option<&dyn Fn(&T) -> Result<EntityKey, ValidationError>>,
        check: C,
    ) -> GuardResult<BatchOutcome>
    where
        M: Fn(&T) -> f64,
        K: Fn(&T) -> Result<EntityKey, ValidationError>,
        C: Fn(&T, Option<f64>, f64) -> bool,
    {
        let mut seen: HashMap<EntityKey, f64> = HashMap::new();

        for (index, item) in items.iter().enumerate() {
            let store_key = key_of(item)?;
            let chain_key = match key_selector {
                Some(select) => select(item)?,
                None => store_key.clone(),
            };

            let previous = match seen.get(&chain_key) {
                Some(value) => Some(*value),
                None => store.get_last(&store_key)?.map(|last| last.value),
            };
            let candidate = metric(item);

            if !check(item, previous, candidate) {
                tracing::debug!(
                    index,
                    entity_key = %store_key,
                    previous = ?previous,
                    candidate,
                    "batch item failed validation"
                );
                return Ok(BatchOutcome::Failed(BatchFailure {
                    index,
                    key: store_key,
                    previous,
                    candidate,
                }));
            }

            seen.insert(chain_key, candidate);
        }

        Ok(BatchOutcome::Passed { checked: items.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::audit::{MetricRecord, OperationKind};
    use crate::entity::CorrelationId;
    use crate::storage::InMemoryAuditStore;
    use crate::threshold::ThresholdRule;

    #[derive(Debug)]
    struct Reading {
        host: &'static str,
        value: f64,
    }

    fn key_of(r: &Reading) -> Result<EntityKey, ValidationError> {
        EntityKey::new(r.host)
    }

    fn seed(store: &InMemoryAuditStore, key: &str, value: f64) {
        store
            .append(MetricRecord::new(
                EntityKey::new(key).unwrap(),
                "server",
                "ops",
                value,
                true,
                OperationKind::Update,
                CorrelationId::new(),
            ))
            .unwrap();
    }

    #[test]
    fn single_entity_sequence_against_growing_history() {
        let store = InMemoryAuditStore::new();
        let validator = SequenceValidator::default();
        let rule = ThresholdRule::raw_difference(5.0);

        // No prior audit: previous is 0, so 16 is too far.
        let first = Reading { host: "Server-A", value: 16.0 };
        assert!(!validator.validate(&first, |r| r.value, &store, key_of, &rule).unwrap());

        seed(&store, "Server-A", 16.0);
        let second = Reading { host: "Server-A", value: 18.0 };
        assert!(validator.validate(&second, |r| r.value, &store, key_of, &rule).unwrap());

        seed(&store, "Server-A", 18.0);
        let third = Reading { host: "Server-A", value: 24.0 };
        assert!(!validator.validate(&third, |r| r.value, &store, key_of, &rule).unwrap());

        // Validation never writes.
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn first_value_bypass_accepts_unseen_keys_only() {
        let store = InMemoryAuditStore::new();
        let validator = SequenceValidator::new(FirstValuePolicy::Bypass);
        let rule = ThresholdRule::raw_difference(5.0);

        let first = Reading { host: "Server-A", value: 16.0 };
        assert!(validator.validate(&first, |r| r.value, &store, key_of, &rule).unwrap());

        seed(&store, "Server-A", 16.0);
        let jump = Reading { host: "Server-A", value: 30.0 };
        assert!(!validator.validate(&jump, |r| r.value, &store, key_of, &rule).unwrap());
    }

    #[test]
    fn batch_chains_items_with_the_same_key() {
        let store = InMemoryAuditStore::new();
        let rule = ThresholdRule::raw_difference(3.0);
        let items = [Reading { host: "k", value: 10.0 }, Reading { host: "k", value: 14.0 }];

        // Compared to an implicit 0, the first item already fails.
        let strict = SequenceValidator::default();
        let outcome = strict
            .validate_batch_with(&items, |r| r.value, &store, key_of, |_, prev, cand| {
                strict.evaluate(prev, cand, [&rule as &dyn ValidationRule])
            })
            .unwrap();
        assert_eq!(outcome.failure().map(|f| f.index), Some(0));

        // With bypass, A passes and B is measured against A (14 - 10 = 4 > 3).
        let bypass = SequenceValidator::new(FirstValuePolicy::Bypass);
        let outcome = bypass
            .validate_batch_with(&items, |r| r.value, &store, key_of, |_, prev, cand| {
                bypass.evaluate(prev, cand, [&rule as &dyn ValidationRule])
            })
            .unwrap();
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.previous, Some(10.0));
        assert!(!bypass
            .validate_batch(&items, |r| r.value, &store, key_of, &rule, None)
            .unwrap());

        // No partial effects.
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn batch_reads_store_once_per_key_and_keeps_keys_independent() {
        let store = InMemoryAuditStore::new();
        seed(&store, "a", 100.0);
        seed(&store, "b", 5.0);
        let validator = SequenceValidator::default();
        let rule = ThresholdRule::raw_difference(3.0);

        let items = [
            Reading { host: "a", value: 102.0 },
            Reading { host: "b", value: 7.0 },
            Reading { host: "a", value: 104.5 },
            Reading { host: "b", value: 9.5 },
        ];
        assert!(validator
            .validate_batch(&items, |r| r.value, &store, key_of, &rule, None)
            .unwrap());

        // Out of order relative to the chain: 100 -> 104.5 directly fails.
        let reordered = [Reading { host: "a", value: 104.5 }, Reading { host: "a", value: 102.0 }];
        assert!(!validator
            .validate_batch(&reordered, |r| r.value, &store, key_of, &rule, None)
            .unwrap());
    }

    #[test]
    fn key_selector_groups_distinct_store_keys_into_one_chain() {
        let store = InMemoryAuditStore::new();
        let validator = SequenceValidator::new(FirstValuePolicy::Bypass);
        let rule = ThresholdRule::raw_difference(1.0);
        let items = [Reading { host: "rack1-a", value: 10.0 }, Reading { host: "rack1-b", value: 20.0 }];

        // Separate keys: both are first values and bypass.
        assert!(validator
            .validate_batch(&items, |r| r.value, &store, key_of, &rule, None)
            .unwrap());

        // Chained by rack: b is compared to a.
        let by_rack = |r: &Reading| EntityKey::new(r.host.split('-').next().unwrap_or(r.host));
        assert!(!validator
            .validate_batch(&items, |r| r.value, &store, key_of, &rule, Some(&by_rack))
            .unwrap());
    }

    #[test]
    fn store_failures_propagate() {
        let store = InMemoryAuditStore::new();
        store.fail_next(1);
        let validator = SequenceValidator::default();
        let err = validator
            .validate(
                &Reading { host: "a", value: 1.0 },
                |r| r.value,
                &store,
                key_of,
                &ThresholdRule::raw_difference(1.0),
            )
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
