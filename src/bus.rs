//! Publish/subscribe transport for pipeline messages.
//!
//! Stages never block on the bus: `publish` uses non-blocking `try_send` and a
//! full subscriber queue drops the message and bumps a counter. A broker-backed
//! transport only has to implement [`MessagePublisher`] and feed a receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{ExecutionError, GuardError, GuardResult, TransportError};
use crate::messages::PipelineMessage;

const BUS_CHANNEL: &str = "pipeline_bus";

/// Outbound side of the transport.
pub trait MessagePublisher: Send + Sync {
    /// Publish without blocking.
    ///
    /// # Errors
    /// - `QueueFull`: at least one subscriber was full and missed the message
    /// - `ChannelClosed`: nobody is listening
    fn publish(&self, message: PipelineMessage) -> Result<(), TransportError>;
}

/// In-process fan-out bus over bounded tokio channels.
#[derive(Debug)]
pub struct InProcessBus {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<PipelineMessage>>>,
    dropped: AtomicU64,
}

impl InProcessBus {
    /// Bus whose subscriber queues hold up to `capacity` messages each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach a new subscriber. It sees messages published from now on.
    pub fn subscribe(&self) -> BusReceiver {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        BusReceiver { rx }
    }

    /// Messages dropped because a subscriber queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Live subscribers. Closed receivers are pruned first.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessagePublisher for InProcessBus {
    fn publish(&self, message: PipelineMessage) -> Result<(), TransportError> {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| !tx.is_closed());
        if subs.is_empty() {
            return Err(TransportError::ChannelClosed {
                channel: BUS_CHANNEL.to_string(),
            });
        }

        let mut full = false;
        for tx in subs.iter() {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    full = true;
                }
                // Receiver went away between retain and send; pruned next time.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if full {
            tracing::warn!(
                kind = message.kind(),
                correlation_id = %message.correlation_id(),
                capacity = self.capacity,
                "bus subscriber queue full; message dropped"
            );
            return Err(TransportError::QueueFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Inbound side of an [`InProcessBus`] subscription.
#[derive(Debug)]
pub struct BusReceiver {
    rx: mpsc::Receiver<PipelineMessage>,
}

impl BusReceiver {
    /// Next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<PipelineMessage> {
        self.rx.recv().await
    }

    /// Next message, waiting at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> GuardResult<PipelineMessage> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(GuardError::Execution(ExecutionError::Disconnected {
                path: BUS_CHANNEL.to_string(),
            })),
            Err(_) => Err(GuardError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })),
        }
    }

    /// A message if one is already queued.
    pub fn try_recv(&mut self) -> Option<PipelineMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publisher that keeps everything it is handed.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<PipelineMessage>>,
}

impl RecordingPublisher {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded messages, in publish order.
    #[must_use]
    pub fn messages(&self) -> Vec<PipelineMessage> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain recorded messages.
    pub fn take(&self) -> Vec<PipelineMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of recorded messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessagePublisher for RecordingPublisher {
    fn publish(&self, message: PipelineMessage) -> Result<(), TransportError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}
