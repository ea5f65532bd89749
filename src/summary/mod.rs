//! Metrics summarisation pipeline.
//!
//! Gather samples from one or more sources, reduce them with an
//! `AggregationStrategy`, validate the result against the last committed
//! summary, then commit (persist and notify) or discard (log and notify, no
//! persistence). Runs on demand or as a serial, cancellable poller.

mod pipeline;
mod source;

pub use pipeline::{SummaryOutcome, SummaryPipeline, SummaryPipelineConfig};
pub use source::{FnSource, HistorySource, MetricSource, StaticSource};
