//! Consumer loop routing bus messages to pipeline stages.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::bus::{BusReceiver, MessagePublisher};
use crate::cancel::CancellationToken;
use crate::error::GuardError;
use crate::messages::{
    DeleteCommitFault, FaultKind, PipelineMessage, SaveBatchRejected, SaveCommitFault,
};

use super::{BatchStage, DeleteStage, PipelineContext, SaveStage};

/// Routes each inbound message to its stage and publishes the outputs.
///
/// Every message is handled on its own task; there is no ordering across
/// entities. A handler that panics is converted into the matching fault
/// event, so the loop keeps consuming.
pub struct PipelineHost {
    save: SaveStage,
    delete: DeleteStage,
    batch: BatchStage,
    publisher: Arc<dyn MessagePublisher>,
}

impl std::fmt::Debug for PipelineHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHost")
            .field("save", &self.save)
            .field("delete", &self.delete)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl PipelineHost {
    /// A host whose stages share `ctx` and publish through `publisher`.
    #[must_use]
    pub fn new(ctx: PipelineContext, publisher: Arc<dyn MessagePublisher>) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            save: SaveStage::new(Arc::clone(&ctx)),
            delete: DeleteStage::new(Arc::clone(&ctx)),
            batch: BatchStage::new(ctx),
            publisher,
        }
    }

    /// The delete stage, for inspecting per-type reliability policies.
    #[must_use]
    pub const fn delete_stage(&self) -> &DeleteStage {
        &self.delete
    }

    /// Run the stage for `message` and return what it emits.
    ///
    /// Outcome messages (commits, rejections, faults, summaries) and
    /// `DeleteValidated` notifications produce nothing.
    pub async fn dispatch(&self, message: PipelineMessage, token: &CancellationToken) -> Vec<PipelineMessage> {
        match message {
            PipelineMessage::SaveRequested(req) => vec![self.save.validate(&req)],
            PipelineMessage::SaveValidated(validated) => vec![self.save.commit(&validated)],
            PipelineMessage::DeleteRequested(req) => self.delete.handle(&req, token).await,
            PipelineMessage::SaveBatchRequested(req) => vec![self.batch.handle(&req)],
            _ => Vec::new(),
        }
    }

    /// Dispatch and publish. Returns the number of messages published.
    pub async fn handle(&self, message: PipelineMessage, token: &CancellationToken) -> usize {
        let outputs = self.dispatch(message, token).await;
        self.publish_all(outputs)
    }

    fn publish_all(&self, outputs: Vec<PipelineMessage>) -> usize {
        let mut published = 0;
        for output in outputs {
            let kind = output.kind();
            let correlation_id = output.correlation_id();
            match self.publisher.publish(output) {
                Ok(()) => published += 1,
                Err(err) => tracing::error!(
                    kind,
                    correlation_id = %correlation_id,
                    error = %err,
                    "failed to publish pipeline output"
                ),
            }
        }
        published
    }

    /// Consume `rx` until `token` is cancelled or the bus closes, then wait
    /// for in-flight handlers.
    pub async fn run(self: Arc<Self>, mut rx: BusReceiver, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        tracing::info!("pipeline host started");

        loop {
            let message = tokio::select! {
                biased;
                () = token.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let host = Arc::clone(&self);
            let token = token.clone();
            tasks.spawn(async move { host.handle_isolated(message, token).await });

            while let Some(done) = tasks.try_join_next() {
                if let Err(err) = done {
                    tracing::error!(error = %err, "pipeline task failed");
                }
            }
        }

        while let Some(done) = tasks.join_next().await {
            if let Err(err) = done {
                tracing::error!(error = %err, "pipeline task failed");
            }
        }
        tracing::info!("pipeline host stopped");
    }

    async fn handle_isolated(self: Arc<Self>, message: PipelineMessage, token: CancellationToken) {
        let inner = {
            let host = Arc::clone(&self);
            let message = message.clone();
            tokio::spawn(async move { host.dispatch(message, &token).await })
        };

        let outputs = match inner.await {
            Ok(outputs) => outputs,
            Err(err) => {
                tracing::error!(
                    kind = message.kind(),
                    correlation_id = %message.correlation_id(),
                    error = %err,
                    "pipeline handler failed"
                );
                boundary_fault(&message, &GuardError::internal(format!("handler failed: {err}")))
                    .into_iter()
                    .collect()
            }
        };
        self.publish_all(outputs);
    }
}

/// The fault event standing in for a handler that never produced one.
fn boundary_fault(message: &PipelineMessage, err: &GuardError) -> Option<PipelineMessage> {
    let error_message = err.to_string();
    let fault_kind = FaultKind::classify(err);
    let fault: PipelineMessage = match message {
        PipelineMessage::SaveRequested(m) => SaveCommitFault {
            app_name: m.app_name.clone(),
            entity_type: m.entity_type.clone(),
            entity_id: m.entity_id.clone(),
            payload: m.payload.clone(),
            correlation_id: m.correlation_id,
            error_message: error_message.clone(),
            fault_kind,
        }
        .into(),
        PipelineMessage::SaveValidated(m) => SaveCommitFault {
            app_name: m.app_name.clone(),
            entity_type: m.entity_type.clone(),
            entity_id: m.entity_id.clone(),
            payload: m.payload.clone(),
            correlation_id: m.correlation_id,
            error_message: error_message.clone(),
            fault_kind,
        }
        .into(),
        PipelineMessage::DeleteRequested(m) => DeleteCommitFault {
            app_name: m.app_name.clone(),
            entity_type: m.entity_type.clone(),
            entity_id: m.entity_id.clone(),
            correlation_id: m.correlation_id,
            error_message: error_message.clone(),
            fault_kind,
        }
        .into(),
        PipelineMessage::SaveBatchRequested(m) => SaveBatchRejected {
            batch_id: m.batch_id,
            correlation_id: m.correlation_id,
            failed_index: None,
            failed_entity_id: None,
            reason: error_message,
            fault_kind: Some(fault_kind),
        }
        .into(),
        _ => return None,
    };
    Some(fault)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::bus::RecordingPublisher;
    use crate::config::EntityValidationConfig;
    use crate::messages::{DeleteRequested, SaveRequested};
    use crate::pipeline::test_support::harness;

    #[tokio::test]
    async fn dispatch_routes_by_message_type() {
        let h = harness(EntityValidationConfig::default());
        let recorder = Arc::new(RecordingPublisher::new());
        let host = PipelineHost::new((*h.ctx).clone(), Arc::clone(&recorder) as Arc<dyn MessagePublisher>);
        let token = CancellationToken::new();

        let out = host
            .dispatch(SaveRequested::new("ops", "server", "a", json!({ "cpu": 2.0 })).into(), &token)
            .await;
        assert!(matches!(out.as_slice(), [PipelineMessage::SaveValidated(v)] if v.validated));

        let committed = host.dispatch(out[0].clone(), &token).await;
        assert!(matches!(committed.as_slice(), [PipelineMessage::SaveCommitted(_)]));

        // Terminal messages are not consumed.
        assert!(host.dispatch(committed[0].clone(), &token).await.is_empty());

        assert_eq!(host.handle(DeleteRequested::new("ops", "server", "a").into(), &token).await, 2);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn boundary_faults_match_the_inbound_flow() {
        let boom = GuardError::internal("handler failed: boom");
        let save: PipelineMessage = SaveRequested::new("ops", "server", "a", json!({})).into();
        let Some(PipelineMessage::SaveCommitFault(fault)) = boundary_fault(&save, &boom) else {
            panic!("expected SaveCommitFault");
        };
        assert_eq!(fault.error_message, "Internal error: handler failed: boom");
        assert_eq!(fault.fault_kind, FaultKind::NonRetryable);

        let delete: PipelineMessage = DeleteRequested::new("ops", "server", "a").into();
        assert!(matches!(boundary_fault(&delete, &boom), Some(PipelineMessage::DeleteCommitFault(_))));
        let terminal = boundary_fault(&delete, &boom).unwrap();
        assert!(boundary_fault(&terminal, &boom).is_none());
    }
}
