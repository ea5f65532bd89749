//! Sample sources feeding the summarisation pipeline.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::EntityKey;
use crate::error::GuardResult;
use crate::storage::AuditStore;

/// Produces a numeric sample sequence for one summarisation run.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Samples for this run. An error fails the whole run.
    async fn gather(&self) -> GuardResult<Vec<f64>>;
}

/// Fixed samples.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    samples: Vec<f64>,
}

impl StaticSource {
    /// A source that always yields `samples`.
    #[must_use]
    pub fn new(name: impl Into<String>, samples: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }
}

#[async_trait]
impl MetricSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn gather(&self) -> GuardResult<Vec<f64>> {
        Ok(self.samples.clone())
    }
}

/// Samples produced by a synchronous closure, called once per run.
pub struct FnSource<F> {
    name: String,
    gather: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> GuardResult<Vec<f64>> + Send + Sync,
{
    /// A source calling `gather` on every run.
    pub fn new(name: impl Into<String>, gather: F) -> Self {
        Self {
            name: name.into(),
            gather,
        }
    }
}

impl<F> fmt::Debug for FnSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSource").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> MetricSource for FnSource<F>
where
    F: Fn() -> GuardResult<Vec<f64>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn gather(&self) -> GuardResult<Vec<f64>> {
        (self.gather)()
    }
}

/// Validated metric values recorded for an entity key, oldest first.
///
/// Rejected values are skipped. `limit` keeps only the most recent samples.
pub struct HistorySource {
    name: String,
    store: Arc<dyn AuditStore>,
    key: EntityKey,
    limit: Option<usize>,
}

impl HistorySource {
    /// Every validated value recorded for `key`.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, key: EntityKey) -> Self {
        Self {
            name: format!("history:{key}"),
            store,
            key,
            limit: None,
        }
    }

    /// Keep only the last `limit` samples.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl fmt::Debug for HistorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistorySource")
            .field("key", &self.key)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MetricSource for HistorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn gather(&self) -> GuardResult<Vec<f64>> {
        let values: Vec<f64> = self
            .store
            .history(&self.key)?
            .into_iter()
            .filter(|r| r.validated)
            .map(|r| r.metric_value)
            .collect();
        let skip = self.limit.map_or(0, |limit| values.len().saturating_sub(limit));
        Ok(values.into_iter().skip(skip).collect())
    }
}
