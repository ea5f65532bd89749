//! Save / delete / batch pipeline stages and the host that drives them.
//!
//! Each stage is a handler from one inbound message to its outbound messages.
//! Stages never return errors: business rejections and operational failures
//! both become events, so a bad message cannot stop the consumer loop.

mod batch;
mod delete;
mod host;
mod save;

use std::sync::Arc;

use crate::config::GuardConfig;
use crate::error::ValidationError;
use crate::plan::PlanRegistry;
use crate::storage::{AuditStore, EntitySink};

pub use batch::BatchStage;
pub use delete::DeleteStage;
pub use host::PipelineHost;
pub use save::SaveStage;

/// Attempts of the save validate stage when the key's history moves under it.
pub const MAX_STALE_RETRIES: u32 = 3;

/// Collaborators shared by every stage.
#[derive(Clone)]
pub struct PipelineContext {
    /// Audit history, the comparison basis.
    pub store: Arc<dyn AuditStore>,
    /// Destination for committed entities.
    pub sink: Arc<dyn EntitySink>,
    /// Plans by entity type.
    pub plans: Arc<PlanRegistry>,
    /// Per-entity-type settings.
    pub config: Arc<GuardConfig>,
}

impl PipelineContext {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn AuditStore>,
        sink: Arc<dyn EntitySink>,
        plans: Arc<PlanRegistry>,
        config: Arc<GuardConfig>,
    ) -> Self {
        Self {
            store,
            sink,
            plans,
            config,
        }
    }

    /// Context whose plan registry is built from `config`.
    pub fn from_config(
        config: GuardConfig,
        store: Arc<dyn AuditStore>,
        sink: Arc<dyn EntitySink>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let plans = config.build_registry()?;
        Ok(Self::new(store, sink, Arc::new(plans), Arc::new(config)))
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("plans", &self.plans)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
