//! Cooperative cancellation.
//!
//! A `CancellationToken` is the external stop signal for the pipeline host and
//! the summary poller, and it aborts reliability-policy retry delays. Clones
//! share state: cancelling any clone cancels all of them.

pub use tokio_util::sync::CancellationToken;
