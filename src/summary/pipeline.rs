//! The summarisation pipeline and its polling loop.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::{MetricRecord, OperationKind};
use crate::bus::MessagePublisher;
use crate::cancel::CancellationToken;
use crate::config::FirstValuePolicy;
use crate::entity::{AuditId, CorrelationId, EntityKey};
use crate::error::{GuardResult, ValidationError};
use crate::messages::{PipelineMessage, SummaryCommitted, SummaryDiscarded};
use crate::sequence::SequenceValidator;
use crate::storage::AuditStore;
use crate::threshold::{AggregationStrategy, ThresholdRule, ValidationRule};

use super::source::MetricSource;

/// Settings for one summarisation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPipelineConfig {
    /// Audit key the summaries are recorded under.
    pub entity_key: EntityKey,
    /// Entity type stamped on summary records.
    pub entity_type: String,
    /// Application stamped on summary records and events.
    pub app_name: String,
    /// Reduction over the gathered samples.
    pub strategy: AggregationStrategy,
    /// Rule applied between the last committed summary and the new one.
    pub rule: ThresholdRule,
    /// Delay between runs of the polling loop.
    pub interval: Duration,
    /// Treatment of the very first summary.
    pub first_value_policy: FirstValuePolicy,
}

impl SummaryPipelineConfig {
    /// Defaults: sum, 60 second interval, entity type `summary`.
    #[must_use]
    pub fn new(entity_key: EntityKey, rule: ThresholdRule) -> Self {
        Self {
            entity_key,
            entity_type: "summary".to_string(),
            app_name: String::new(),
            strategy: AggregationStrategy::default(),
            rule,
            interval: Duration::from_secs(60),
            first_value_policy: FirstValuePolicy::default(),
        }
    }

    /// Sets the reduction.
    #[must_use]
    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the polling delay.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Sets the first-value policy.
    #[must_use]
    pub fn with_first_value_policy(mut self, policy: FirstValuePolicy) -> Self {
        self.first_value_policy = policy;
        self
    }
}

/// What one run did.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    /// Passed validation; recorded and announced.
    Committed {
        /// Summary value.
        value: f64,
        /// Last committed summary, if any.
        previous: Option<f64>,
        /// Audit record written for the summary.
        audit_id: AuditId,
    },
    /// Failed validation; announced but not recorded.
    Discarded {
        /// Summary value.
        value: f64,
        /// Last committed summary, if any.
        previous: Option<f64>,
        /// Which rule rejected it.
        reason: String,
    },
}

impl SummaryOutcome {
    /// True for `Committed`.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Gather → summarise → validate → commit or discard.
///
/// Each run is stateless apart from reading the last committed summary from
/// the audit store as its comparison basis.
pub struct SummaryPipeline {
    config: SummaryPipelineConfig,
    sources: Vec<Arc<dyn MetricSource>>,
    custom_rules: Vec<Arc<dyn ValidationRule>>,
    store: Arc<dyn AuditStore>,
    publisher: Arc<dyn MessagePublisher>,
}

impl std::fmt::Debug for SummaryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryPipeline")
            .field("config", &self.config)
            .field("sources", &self.sources.iter().map(|s| s.name().to_string()).collect::<Vec<_>>())
            .field("custom_rules", &self.custom_rules)
            .finish_non_exhaustive()
    }
}

impl SummaryPipeline {
    /// A pipeline with no sources and no extra rules.
    #[must_use]
    pub fn new(
        config: SummaryPipelineConfig,
        store: Arc<dyn AuditStore>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            config,
            sources: Vec::new(),
            custom_rules: Vec::new(),
            store,
            publisher,
        }
    }

    /// Adds a sample source. Samples from all sources are concatenated.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds a rule evaluated alongside the configured threshold.
    #[must_use]
    pub fn with_rule(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.custom_rules.push(rule);
        self
    }

    /// The pipeline settings.
    #[must_use]
    pub const fn config(&self) -> &SummaryPipelineConfig {
        &self.config
    }

    /// One gather/summarise/validate/commit pass.
    ///
    /// A summary failing validation is discarded and reported as
    /// `SummaryDiscarded`; that is an `Ok` outcome. Source or store failures
    /// are also reported as `SummaryDiscarded` and then returned as errors.
    pub async fn run_once(&self) -> GuardResult<SummaryOutcome> {
        let correlation_id = CorrelationId::new();
        match self.try_run(correlation_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::error!(
                    entity_key = %self.config.entity_key,
                    correlation_id = %correlation_id,
                    error = %err,
                    "summary run failed"
                );
                self.notify(
                    SummaryDiscarded {
                        entity_key: self.config.entity_key.clone(),
                        app_name: self.config.app_name.clone(),
                        correlation_id,
                        value: None,
                        previous_value: None,
                        reason: err.to_string(),
                    }
                    .into(),
                );
                Err(err)
            }
        }
    }

    async fn try_run(&self, correlation_id: CorrelationId) -> GuardResult<SummaryOutcome> {
        let samples = self.gather().await?;
        let value = self.config.strategy.apply(&samples);

        let last = self.store.get_last(&self.config.entity_key)?;
        let previous = last.map(|l| l.value);
        let mut rules: Vec<&dyn ValidationRule> = Vec::with_capacity(1 + self.custom_rules.len());
        rules.push(&self.config.rule);
        for rule in &self.custom_rules {
            rules.push(rule.as_ref());
        }
        let passes =
            SequenceValidator::new(self.config.first_value_policy).evaluate(previous, value, rules.iter().copied());

        if !passes {
            let basis = previous.unwrap_or(0.0);
            let rule = rules
                .iter()
                .find(|r| !r.validate(basis, value))
                .map_or("validation", |r| r.name());
            let reason = format!("summary {value} rejected by {rule} against previous {basis}");
            tracing::warn!(
                entity_key = %self.config.entity_key,
                correlation_id = %correlation_id,
                value,
                previous = ?previous,
                "summary discarded"
            );
            self.notify(
                SummaryDiscarded {
                    entity_key: self.config.entity_key.clone(),
                    app_name: self.config.app_name.clone(),
                    correlation_id,
                    value: Some(value),
                    previous_value: previous,
                    reason: reason.clone(),
                }
                .into(),
            );
            return Ok(SummaryOutcome::Discarded { value, previous, reason });
        }

        let record = MetricRecord::new(
            self.config.entity_key.clone(),
            self.config.entity_type.as_str(),
            self.config.app_name.as_str(),
            value,
            true,
            OperationKind::Summary,
            correlation_id,
        )
        .with_batch_size(samples.len());
        let audit_id = record.id;
        self.store.append_if_latest(record, last.map(|l| l.id))?;

        tracing::info!(
            entity_key = %self.config.entity_key,
            correlation_id = %correlation_id,
            value,
            samples = samples.len(),
            "summary committed"
        );
        self.notify(
            SummaryCommitted {
                entity_key: self.config.entity_key.clone(),
                app_name: self.config.app_name.clone(),
                correlation_id,
                value,
                previous_value: previous,
                sample_count: samples.len(),
                audit_id,
            }
            .into(),
        );
        Ok(SummaryOutcome::Committed {
            value,
            previous,
            audit_id,
        })
    }

    async fn gather(&self) -> GuardResult<Vec<f64>> {
        let mut samples = Vec::new();
        for source in &self.sources {
            let gathered = source.gather().await?;
            tracing::debug!(source = source.name(), count = gathered.len(), "gathered samples");
            if let Some(bad) = gathered.iter().find(|v| !v.is_finite()) {
                return Err(ValidationError::NonFiniteMetric { value: *bad }.into());
            }
            samples.extend(gathered);
        }
        Ok(samples)
    }

    fn notify(&self, message: PipelineMessage) {
        if let Err(err) = self.publisher.publish(message) {
            tracing::warn!(entity_key = %self.config.entity_key, error = %err, "summary notification not delivered");
        }
    }

    /// Serial poller: run, wait `interval`, repeat until `token` is cancelled.
    ///
    /// A failed run is logged and does not stop the loop. Returns the number
    /// of completed runs.
    pub async fn run(&self, token: &CancellationToken) -> u64 {
        let mut runs = 0;
        loop {
            if token.is_cancelled() {
                break;
            }
            // Errors are already logged and published by `run_once`.
            let _ = self.run_once().await;
            runs += 1;

            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }
        tracing::info!(entity_key = %self.config.entity_key, runs, "summary loop stopped");
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::RecordingPublisher;
    use crate::storage::{InMemoryAuditStore, StorageError};
    use crate::summary::{FnSource, StaticSource};

    fn pipeline(
        store: &Arc<InMemoryAuditStore>,
        recorder: &Arc<RecordingPublisher>,
        samples: Vec<f64>,
    ) -> SummaryPipeline {
        let config = SummaryPipelineConfig::new(EntityKey::new("fleet:cpu").unwrap(), ThresholdRule::raw_difference(10.0))
            .with_first_value_policy(FirstValuePolicy::Bypass)
            .with_app_name("ops");
        SummaryPipeline::new(
            config,
            Arc::clone(store) as Arc<dyn AuditStore>,
            Arc::clone(recorder) as Arc<dyn MessagePublisher>,
        )
        .with_source(Arc::new(StaticSource::new("a", samples)))
    }

    #[tokio::test]
    async fn commits_then_discards_against_last_summary() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = Arc::new(RecordingPublisher::new());

        let first = pipeline(&store, &recorder, vec![10.0, 20.0]).run_once().await.unwrap();
        assert!(matches!(first, SummaryOutcome::Committed { value, previous: None, .. } if (value - 30.0).abs() < 1e-9));

        let close = pipeline(&store, &recorder, vec![15.0, 20.0]).run_once().await.unwrap();
        assert!(close.is_committed());

        let jump = pipeline(&store, &recorder, vec![100.0]).run_once().await.unwrap();
        assert!(matches!(jump, SummaryOutcome::Discarded { previous: Some(p), .. } if (p - 35.0).abs() < 1e-9));

        // Discards are not persisted.
        let key = EntityKey::new("fleet:cpu").unwrap();
        let history = store.history(&key).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.operation == OperationKind::Summary));

        let kinds: Vec<_> = recorder.messages().iter().map(PipelineMessage::kind).collect();
        assert_eq!(kinds, vec!["summary_committed", "summary_committed", "summary_discarded"]);
    }

    #[tokio::test]
    async fn source_failure_is_reported_and_returned() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = Arc::new(RecordingPublisher::new());
        let config = SummaryPipelineConfig::new(EntityKey::new("fleet:cpu").unwrap(), ThresholdRule::raw_difference(1.0));
        let pipeline = SummaryPipeline::new(
            config,
            Arc::clone(&store) as Arc<dyn AuditStore>,
            Arc::clone(&recorder) as Arc<dyn MessagePublisher>,
        )
        .with_source(Arc::new(FnSource::new("down", || {
            Err(StorageError::ConnectionError("refused".to_string()).into())
        })));

        assert!(pipeline.run_once().await.is_err());
        assert!(store.is_empty().unwrap());
        assert!(matches!(
            recorder.messages().as_slice(),
            [PipelineMessage::SummaryDiscarded(d)] if d.value.is_none()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_loop_stops_on_cancel() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = Arc::new(RecordingPublisher::new());
        let pipeline = Arc::new(pipeline(&store, &recorder, vec![1.0]));
        let token = CancellationToken::new();

        let handle = {
            let pipeline = Arc::clone(&pipeline);
            let token = token.clone();
            tokio::spawn(async move { pipeline.run(&token).await })
        };

        // Default interval is 60s: runs at t=0, 60, 120.
        tokio::time::sleep(Duration::from_secs(150)).await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(recorder.len(), 3);
    }
}
