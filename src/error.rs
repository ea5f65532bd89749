//! Error types for KyroGuard.
//!
//! All errors in KyroGuard are strongly typed using thiserror.
//! Business rejections (a candidate failing its threshold) are never errors:
//! they travel as `validated = false` verdicts and `*Rejected` events. The
//! types here cover malformed input, operational failures and the
//! reliability policy's own outcomes.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors for malformed input or configuration.
///
/// These are never retried: the same input fails the same way every time.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// An entity key was empty.
    #[error("Entity key cannot be empty")]
    EmptyEntityKey,

    /// An entity type was empty.
    #[error("Entity type cannot be empty")]
    EmptyEntityType,

    /// A required request field was absent.
    #[error("Required field '{field}' is missing")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// The payload lacks the metric property.
    #[error("Metric property '{property}' is missing or not numeric")]
    MetricNotFound {
        /// Property that was looked up.
        property: String,
    },

    /// The metric is NaN or infinite.
    #[error("Metric value {value} is not a finite number")]
    NonFiniteMetric {
        /// Offending value.
        value: f64,
    },

    /// A threshold bound is unusable.
    #[error("Threshold value {value} is invalid: {reason}")]
    InvalidThreshold {
        /// Offending value.
        value: f64,
        /// What is wrong with it.
        reason: String,
    },

    /// Configuration failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },
}

/// Execution errors raised while running an operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// An attempt exceeded its time limit.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// The limit that was exceeded.
        duration_ms: u64,
    },

    /// The circuit breaker refused the call.
    #[error("Circuit open after {consecutive_failures} consecutive failures; retry in {retry_after_ms}ms")]
    CircuitOpen {
        /// Exhausted calls that opened the circuit.
        consecutive_failures: u32,
        /// Time until the circuit closes again.
        retry_after_ms: u64,
    },

    /// Every attempt failed.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: Box<GuardError>,
    },

    /// The cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// A channel closed mid-operation.
    #[error("Channel disconnected: {path}")]
    Disconnected {
        /// Which channel.
        path: String,
    },
}

/// Transport errors for the message bus.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No subscriber is listening.
    #[error("Channel '{channel}' is closed")]
    ChannelClosed {
        /// Channel name.
        channel: String,
    },

    /// A subscriber queue was full.
    #[error("Queue is full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// A message could not be encoded.
    #[error("Failed to serialize message: {message}")]
    SerializationFailed {
        /// Encoder or internal error message.
        message: String,
    },
}

/// Top-level error type for KyroGuard.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Malformed input or configuration.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Failure while running an operation.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Message bus failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Audit store or entity sink failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Broken internal invariant, such as a panicked handler.
    #[error("Internal error: {message}")]
    Internal {
        /// Encoder or internal error message.
        message: String,
    },
}

impl GuardError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the circuit breaker rejected the call.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::CircuitOpen { .. }))
    }

    /// Returns true if the reliability policy gave up after retrying.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::RetriesExhausted { .. }))
    }

    /// Returns true if the operation was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Cancelled))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false, // Validation errors won't change on retry
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::Disconnected { .. }
            ),
            Self::Transport(e) => matches!(
                e,
                TransportError::ChannelClosed { .. } | TransportError::QueueFull { .. }
            ),
            Self::Storage(e) => e.is_transient(),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for KyroGuard operations.
pub type GuardResult<T> = Result<T, GuardError>;
