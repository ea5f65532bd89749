//! Save pipeline: validate stage and commit stage.

use std::sync::Arc;

use crate::audit::MetricRecord;
use crate::error::{GuardError, GuardResult};
use crate::messages::{
    FaultKind, PipelineMessage, SaveCommitFault, SaveCommitted, SaveRejected, SaveRequested,
    SaveValidated,
};
use crate::sequence::SequenceValidator;
use crate::storage::StorageError;

use super::{PipelineContext, MAX_STALE_RETRIES};

/// Handlers for `SaveRequested` and `SaveValidated`.
#[derive(Debug, Clone)]
pub struct SaveStage {
    ctx: Arc<PipelineContext>,
}

impl SaveStage {
    /// A save stage over the shared pipeline context.
    #[must_use]
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Validate stage.
    ///
    /// Reads the last metric for the key, evaluates the candidate and appends
    /// an audit record carrying the verdict, pass or fail. The append is
    /// compare-and-append; if another writer got in first the stage
    /// re-reads and re-evaluates, up to [`MAX_STALE_RETRIES`] times.
    pub fn validate(&self, req: &SaveRequested) -> PipelineMessage {
        match self.try_validate(req) {
            Ok(validated) => {
                tracing::info!(
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    correlation_id = %req.correlation_id,
                    metric = validated.metric_value,
                    previous = ?validated.previous_value,
                    validated = validated.validated,
                    "save validated"
                );
                validated.into()
            }
            Err(err) if err.is_validation() => {
                tracing::warn!(
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    correlation_id = %req.correlation_id,
                    error = %err,
                    "save rejected: malformed request"
                );
                SaveRejected {
                    app_name: req.app_name.clone(),
                    entity_type: req.entity_type.clone(),
                    entity_id: req.entity_id.clone(),
                    correlation_id: req.correlation_id,
                    reason: err.to_string(),
                }
                .into()
            }
            Err(err) => fault(req, &err).into(),
        }
    }

    fn try_validate(&self, req: &SaveRequested) -> GuardResult<SaveValidated> {
        let key = req.entity_key()?;
        let plan = self.ctx.plans.get_plan(&req.entity_type);
        let policy = self.ctx.config.for_entity(&req.entity_type).first_value_policy;
        let validator = SequenceValidator::new(policy);
        let candidate = plan.extract(&req.payload)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = self.ctx.store.get_last(&key)?;
            let previous = last.map(|l| l.value);
            let validated = validator.evaluate_plan(previous, candidate, &plan);

            let mut record = MetricRecord::new(
                key.clone(),
                req.entity_type.as_str(),
                req.app_name.as_str(),
                candidate,
                validated,
                req.operation,
                req.correlation_id,
            );
            if let Some(property) = plan.metric_property() {
                record = record.with_property(property, candidate.to_string());
            }
            let audit_id = record.id;

            match self.ctx.store.append_if_latest(record, last.map(|l| l.id)) {
                Ok(()) => {
                    return Ok(SaveValidated {
                        app_name: req.app_name.clone(),
                        entity_type: req.entity_type.clone(),
                        entity_id: req.entity_id.clone(),
                        payload: req.payload.clone(),
                        correlation_id: req.correlation_id,
                        operation: req.operation,
                        validated,
                        metric_value: candidate,
                        previous_value: previous,
                        audit_id,
                    })
                }
                Err(StorageError::StaleRead { .. }) if attempt < MAX_STALE_RETRIES => {
                    tracing::debug!(entity_key = %key, attempt, "history moved during validation; re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Commit stage.
    ///
    /// A negative verdict ends in `SaveRejected`. A positive one is written
    /// to the entity sink; a sink failure is reported once as
    /// `SaveCommitFault` and not retried.
    pub fn commit(&self, validated: &SaveValidated) -> PipelineMessage {
        if !validated.validated {
            let reason = match validated.previous_value {
                Some(previous) => format!(
                    "metric {} rejected against previous value {previous}",
                    validated.metric_value
                ),
                None => format!(
                    "metric {} rejected with no prior history",
                    validated.metric_value
                ),
            };
            tracing::info!(
                entity_type = %validated.entity_type,
                entity_id = %validated.entity_id,
                correlation_id = %validated.correlation_id,
                reason = %reason,
                "save rejected"
            );
            return SaveRejected {
                app_name: validated.app_name.clone(),
                entity_type: validated.entity_type.clone(),
                entity_id: validated.entity_id.clone(),
                correlation_id: validated.correlation_id,
                reason,
            }
            .into();
        }

        match self
            .ctx
            .sink
            .save(&validated.entity_type, &validated.entity_id, &validated.payload)
        {
            Ok(()) => {
                tracing::info!(
                    entity_type = %validated.entity_type,
                    entity_id = %validated.entity_id,
                    correlation_id = %validated.correlation_id,
                    "save committed"
                );
                SaveCommitted {
                    app_name: validated.app_name.clone(),
                    entity_type: validated.entity_type.clone(),
                    entity_id: validated.entity_id.clone(),
                    correlation_id: validated.correlation_id,
                    audit_id: validated.audit_id,
                }
                .into()
            }
            Err(err) => {
                let err = GuardError::from(err);
                tracing::error!(
                    entity_type = %validated.entity_type,
                    entity_id = %validated.entity_id,
                    correlation_id = %validated.correlation_id,
                    error = %err,
                    "save commit fault"
                );
                SaveCommitFault {
                    app_name: validated.app_name.clone(),
                    entity_type: validated.entity_type.clone(),
                    entity_id: validated.entity_id.clone(),
                    payload: validated.payload.clone(),
                    correlation_id: validated.correlation_id,
                    error_message: err.to_string(),
                    fault_kind: FaultKind::classify(&err),
                }
                .into()
            }
        }
    }
}

fn fault(req: &SaveRequested, err: &GuardError) -> SaveCommitFault {
    tracing::error!(
        entity_type = %req.entity_type,
        entity_id = %req.entity_id,
        correlation_id = %req.correlation_id,
        error = %err,
        "save validation fault"
    );
    SaveCommitFault {
        app_name: req.app_name.clone(),
        entity_type: req.entity_type.clone(),
        entity_id: req.entity_id.clone(),
        payload: req.payload.clone(),
        correlation_id: req.correlation_id,
        error_message: err.to_string(),
        fault_kind: FaultKind::classify(err),
    }
}
