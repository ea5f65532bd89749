//! Batch save consumer.
//!
//! A batch passes or fails as a whole. Items are checked in input order,
//! each against the latest value for its key (from the store, or from an
//! earlier item of the same batch), under every threshold and custom rule of
//! its entity type's plan. On success exactly one aggregate audit record is
//! written; on failure nothing is.

use std::sync::Arc;

use crate::audit::{MetricRecord, OperationKind};
use crate::entity::EntityKey;
use crate::error::{GuardError, GuardResult};
use crate::messages::{
    FaultKind, PipelineMessage, SaveBatchRejected, SaveBatchRequested, SaveBatchValidated, SaveRequested,
};
use crate::plan::ValidationPlan;
use crate::sequence::{BatchOutcome, SequenceValidator};

use super::PipelineContext;

struct PreparedItem {
    key: EntityKey,
    candidate: f64,
    plan: Arc<ValidationPlan>,
    validator: SequenceValidator,
}

/// Handler for `SaveBatchRequested`.
#[derive(Debug, Clone)]
pub struct BatchStage {
    ctx: Arc<PipelineContext>,
}

impl BatchStage {
    /// A batch stage over the shared pipeline context.
    #[must_use]
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Validate the batch and, if every item passes, persist its aggregate.
    pub fn handle(&self, req: &SaveBatchRequested) -> PipelineMessage {
        match self.try_handle(req) {
            Ok(msg) => msg,
            Err(err) => {
                let fault_kind = FaultKind::classify(&err);
                tracing::error!(
                    batch_id = %req.batch_id,
                    correlation_id = %req.correlation_id,
                    error = %err,
                    "batch rejected: operational failure"
                );
                self.rejected(req, None, err.to_string(), Some(fault_kind))
            }
        }
    }

    fn try_handle(&self, req: &SaveBatchRequested) -> GuardResult<PipelineMessage> {
        if req.items.is_empty() {
            return Ok(self.rejected(req, None, "batch contains no items".to_string(), None));
        }

        let mut prepared = Vec::with_capacity(req.items.len());
        for (index, item) in req.items.iter().enumerate() {
            match self.prepare(item) {
                Ok(p) => prepared.push(p),
                Err(err) if err.is_validation() => {
                    return Ok(self.rejected(req, Some(index), err.to_string(), None));
                }
                Err(err) => return Err(err),
            }
        }

        let outcome = SequenceValidator::default().validate_batch_with(
            &prepared,
            |p| p.candidate,
            self.ctx.store.as_ref(),
            |p| Ok(p.key.clone()),
            |p, previous, candidate| p.validator.evaluate_plan(previous, candidate, &p.plan),
        )?;

        if let BatchOutcome::Failed(failure) = outcome {
            let item = &prepared[failure.index];
            let rule = item
                .plan
                .first_failing_rule(failure.previous.unwrap_or(0.0), failure.candidate)
                .unwrap_or("validation");
            let reason = format!(
                "item {} ({}): metric {} rejected by {rule} against previous {}",
                failure.index,
                failure.key,
                failure.candidate,
                failure.previous.unwrap_or(0.0),
            );
            return Ok(self.rejected(req, Some(failure.index), reason, None));
        }

        let candidates: Vec<f64> = prepared.iter().map(|p| p.candidate).collect();
        let aggregate_metric = req.strategy.apply(&candidates);
        let first = &req.items[0];
        let record = MetricRecord::new(
            EntityKey::new(format!("batch:{}", req.batch_id))?,
            first.entity_type.as_str(),
            first.app_name.as_str(),
            aggregate_metric,
            true,
            OperationKind::Batch,
            req.correlation_id,
        )
        .with_batch_size(req.items.len());
        let audit_id = record.id;
        self.ctx.store.append(record)?;

        tracing::info!(
            batch_id = %req.batch_id,
            correlation_id = %req.correlation_id,
            items = req.items.len(),
            aggregate = aggregate_metric,
            strategy = ?req.strategy,
            "batch validated"
        );
        Ok(SaveBatchValidated {
            batch_id: req.batch_id,
            correlation_id: req.correlation_id,
            item_count: req.items.len(),
            aggregate_metric,
            audit_id,
        }
        .into())
    }

    fn prepare(&self, item: &SaveRequested) -> Result<PreparedItem, GuardError> {
        let key = item.entity_key()?;
        let plan = self.ctx.plans.get_plan(&item.entity_type);
        let candidate = plan.extract(&item.payload)?;
        let policy = self.ctx.config.for_entity(&item.entity_type).first_value_policy;
        Ok(PreparedItem {
            key,
            candidate,
            plan,
            validator: SequenceValidator::new(policy),
        })
    }

    fn rejected(
        &self,
        req: &SaveBatchRequested,
        failed_index: Option<usize>,
        reason: String,
        fault_kind: Option<FaultKind>,
    ) -> PipelineMessage {
        if fault_kind.is_none() {
            tracing::info!(
                batch_id = %req.batch_id,
                correlation_id = %req.correlation_id,
                failed_index = ?failed_index,
                reason = %reason,
                "batch rejected"
            );
        }
        SaveBatchRejected {
            batch_id: req.batch_id,
            correlation_id: req.correlation_id,
            failed_index,
            failed_entity_id: failed_index
                .and_then(|i| req.items.get(i))
                .map(|item| item.entity_id.clone()),
            reason,
            fault_kind,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::{EntityValidationConfig, FirstValuePolicy};
    use crate::pipeline::test_support::harness;
    use crate::storage::AuditStore;
    use crate::threshold::{AggregationStrategy, PredicateRule, ThresholdRule};

    fn bypass() -> EntityValidationConfig {
        EntityValidationConfig {
            first_value_policy: FirstValuePolicy::Bypass,
            ..EntityValidationConfig::default()
        }
    }

    fn item(id: &str, cpu: f64) -> SaveRequested {
        SaveRequested::new("ops", "server", id, json!({ "cpu": cpu }))
    }

    #[test]
    fn passing_batch_writes_one_aggregate_record() {
        let h = harness(bypass());
        let stage = BatchStage::new(h.ctx);
        let req = SaveBatchRequested::new(vec![item("a", 10.0), item("a", 13.0), item("b", 50.0)])
            .with_strategy(AggregationStrategy::Average);

        let PipelineMessage::SaveBatchValidated(ok) = stage.handle(&req) else {
            panic!("expected SaveBatchValidated");
        };
        assert_eq!(ok.item_count, 3);
        assert!((ok.aggregate_metric - 73.0 / 3.0).abs() < 1e-9);

        assert_eq!(h.store.len().unwrap(), 1);
        let key = EntityKey::new(format!("batch:{}", req.batch_id)).unwrap();
        let history = h.store.history(&key).unwrap();
        assert_eq!(history[0].batch_size, Some(3));
        assert_eq!(history[0].operation, OperationKind::Batch);
    }

    #[test]
    fn chained_items_fail_the_whole_batch_without_persisting() {
        let h = harness(bypass());
        let stage = BatchStage::new(h.ctx);
        // 10 then 16 for the same key: 6 > 5.
        let req = SaveBatchRequested::new(vec![item("a", 10.0), item("b", 1.0), item("a", 16.0)]);

        let PipelineMessage::SaveBatchRejected(rejected) = stage.handle(&req) else {
            panic!("expected SaveBatchRejected");
        };
        assert_eq!(rejected.failed_index, Some(2));
        assert_eq!(rejected.failed_entity_id.as_deref(), Some("a"));
        assert!(rejected.reason.contains("raw_difference"));
        assert!(rejected.fault_kind.is_none());
        assert!(h.store.is_empty().unwrap());
    }

    #[test]
    fn custom_rule_failure_names_the_item() {
        let h = harness(bypass());
        h.ctx.plans.add_plan(
            "server",
            ValidationPlan::property("cpu", ThresholdRule::raw_difference(100.0))
                .with_custom_rule(Arc::new(PredicateRule::new("below_ceiling", |_p, c| c <= 95.0))),
        );
        let stage = BatchStage::new(h.ctx);

        let req = SaveBatchRequested::new(vec![item("a", 50.0), item("b", 99.0)]);
        let PipelineMessage::SaveBatchRejected(rejected) = stage.handle(&req) else {
            panic!("expected SaveBatchRejected");
        };
        assert_eq!(rejected.failed_index, Some(1));
        assert!(rejected.reason.contains("below_ceiling"));
    }

    #[test]
    fn empty_and_malformed_batches_are_rejected() {
        let h = harness(bypass());
        let stage = BatchStage::new(h.ctx);

        let PipelineMessage::SaveBatchRejected(empty) = stage.handle(&SaveBatchRequested::new(vec![])) else {
            panic!("expected SaveBatchRejected");
        };
        assert_eq!(empty.failed_index, None);

        let bad = SaveRequested::new("ops", "server", "c", json!({ "mem": 1 }));
        let PipelineMessage::SaveBatchRejected(rejected) =
            stage.handle(&SaveBatchRequested::new(vec![item("a", 1.0), bad]))
        else {
            panic!("expected SaveBatchRejected");
        };
        assert_eq!(rejected.failed_index, Some(1));
        assert!(rejected.reason.contains("cpu"));
    }

    #[test]
    fn store_failure_becomes_a_fault_rejection() {
        let h = harness(bypass());
        h.store.fail_next(1);
        let stage = BatchStage::new(h.ctx);
        let PipelineMessage::SaveBatchRejected(rejected) =
            stage.handle(&SaveBatchRequested::new(vec![item("a", 1.0)]))
        else {
            panic!("expected SaveBatchRejected");
        };
        assert_eq!(rejected.fault_kind, Some(FaultKind::Transient));
        assert!(h.store.is_empty().unwrap());
    }
}
