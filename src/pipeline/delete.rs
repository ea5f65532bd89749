//! Delete pipeline.
//!
//! Validate and commit run as one unit under the entity type's reliability
//! policy: transient failures retry with a delay, and exhaustion or an open
//! circuit is reported as its own fault kind. The candidate metric for a
//! delete is fixed at 0.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::audit::{MetricRecord, OperationKind};
use crate::cancel::CancellationToken;
use crate::config::DeletePolicy;
use crate::error::GuardResult;
use crate::messages::{
    DeleteCommitFault, DeleteCommitted, DeleteRejected, DeleteRequested, DeleteValidated, FaultKind,
    PipelineMessage,
};
use crate::reliability::ReliabilityPolicy;
use crate::sequence::SequenceValidator;

use super::PipelineContext;

const DELETE_CANDIDATE: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DeleteOutcome {
    Rejected { previous: Option<f64> },
    Committed { existed: bool },
}

/// Handler for `DeleteRequested`.
#[derive(Debug)]
pub struct DeleteStage {
    ctx: Arc<PipelineContext>,
    policies: RwLock<HashMap<String, Arc<ReliabilityPolicy>>>,
}

impl DeleteStage {
    /// A delete stage with no reliability policies created yet.
    #[must_use]
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// The reliability policy guarding deletes of `entity_type`.
    ///
    /// One policy per entity type, created on first use from that type's
    /// configuration, so a failing backend for one type does not open the
    /// circuit for the others.
    pub fn policy_for(&self, entity_type: &str) -> Arc<ReliabilityPolicy> {
        if let Some(policy) = self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_type)
        {
            return Arc::clone(policy);
        }

        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        let policy = policies.entry(entity_type.to_string()).or_insert_with(|| {
            let config = self.ctx.config.for_entity(entity_type).reliability();
            Arc::new(ReliabilityPolicy::new(config))
        });
        Arc::clone(policy)
    }

    /// Run a delete through validation and commit.
    ///
    /// Emits `DeleteValidated` followed by `DeleteCommitted` or
    /// `DeleteRejected`, or a single `DeleteCommitFault`.
    pub async fn handle(&self, req: &DeleteRequested, token: &CancellationToken) -> Vec<PipelineMessage> {
        let policy = self.policy_for(&req.entity_type);
        // Set once the sink delete succeeds; retries then only redo the audit append.
        let sink_result = OnceLock::new();
        let sink_result = &sink_result;
        let result = policy
            .execute(token, move |attempt| async move {
                if attempt > 1 {
                    tracing::debug!(
                        entity_type = %req.entity_type,
                        entity_id = %req.entity_id,
                        attempt,
                        "retrying delete"
                    );
                }
                self.attempt(req, sink_result)
            })
            .await;

        match result {
            Ok(DeleteOutcome::Committed { existed }) => {
                tracing::info!(
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    correlation_id = %req.correlation_id,
                    existed,
                    "delete committed"
                );
                vec![
                    validated(req, true).into(),
                    DeleteCommitted {
                        app_name: req.app_name.clone(),
                        entity_type: req.entity_type.clone(),
                        entity_id: req.entity_id.clone(),
                        correlation_id: req.correlation_id,
                        existed,
                    }
                    .into(),
                ]
            }
            Ok(DeleteOutcome::Rejected { previous }) => {
                let reason = match previous {
                    Some(previous) => format!("delete rejected: last metric {previous} is too far from 0"),
                    None => "delete rejected by validation plan".to_string(),
                };
                tracing::info!(
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    correlation_id = %req.correlation_id,
                    reason = %reason,
                    "delete rejected"
                );
                vec![
                    validated(req, false).into(),
                    DeleteRejected {
                        app_name: req.app_name.clone(),
                        entity_type: req.entity_type.clone(),
                        entity_id: req.entity_id.clone(),
                        correlation_id: req.correlation_id,
                        reason,
                    }
                    .into(),
                ]
            }
            Err(err) if err.is_validation() => {
                tracing::warn!(
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    correlation_id = %req.correlation_id,
                    error = %err,
                    "delete rejected: malformed request"
                );
                vec![DeleteRejected {
                    app_name: req.app_name.clone(),
                    entity_type: req.entity_type.clone(),
                    entity_id: req.entity_id.clone(),
                    correlation_id: req.correlation_id,
                    reason: err.to_string(),
                }
                .into()]
            }
            Err(err) => {
                let fault_kind = FaultKind::classify(&err);
                let sink_deleted = sink_result.get().is_some();
                tracing::error!(
                    entity_type = %req.entity_type,
                    entity_id = %req.entity_id,
                    correlation_id = %req.correlation_id,
                    fault_kind = ?fault_kind,
                    sink_deleted,
                    error = %err,
                    "delete commit fault"
                );
                let error_message = if sink_deleted {
                    format!("{err} (entity already removed from the sink; audit record missing)")
                } else {
                    err.to_string()
                };
                vec![DeleteCommitFault {
                    app_name: req.app_name.clone(),
                    entity_type: req.entity_type.clone(),
                    entity_id: req.entity_id.clone(),
                    correlation_id: req.correlation_id,
                    error_message,
                    fault_kind,
                }
                .into()]
            }
        }
    }

    fn attempt(&self, req: &DeleteRequested, sink_result: &OnceLock<bool>) -> GuardResult<DeleteOutcome> {
        let key = req.entity_key()?;
        let config = self.ctx.config.for_entity(&req.entity_type);
        let store = &self.ctx.store;

        let last = store.get_last(&key)?;
        let previous = last.map(|l| l.value);
        let passes = match config.delete_policy {
            DeletePolicy::SkipThreshold => true,
            DeletePolicy::CompareToZero => {
                let plan = self.ctx.plans.get_plan(&req.entity_type);
                SequenceValidator::new(config.first_value_policy).evaluate_plan(
                    previous,
                    DELETE_CANDIDATE,
                    &plan,
                )
            }
        };

        let record = MetricRecord::new(
            key,
            req.entity_type.as_str(),
            req.app_name.as_str(),
            DELETE_CANDIDATE,
            passes,
            OperationKind::Delete,
            req.correlation_id,
        );

        if !passes {
            store.append_if_latest(record, last.map(|l| l.id))?;
            return Ok(DeleteOutcome::Rejected { previous });
        }

        let existed = match sink_result.get() {
            Some(existed) => *existed,
            None => {
                let existed = self.ctx.sink.delete(&req.entity_type, &req.entity_id)?;
                *sink_result.get_or_init(|| existed)
            }
        };
        store.append(record)?;
        Ok(DeleteOutcome::Committed { existed })
    }
}

fn validated(req: &DeleteRequested, validated: bool) -> DeleteValidated {
    DeleteValidated {
        app_name: req.app_name.clone(),
        entity_type: req.entity_type.clone(),
        entity_id: req.entity_id.clone(),
        correlation_id: req.correlation_id,
        validated,
    }
}
