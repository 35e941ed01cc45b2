use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::report::{AttemptOutcome, RunStatus, StageStatus, StepStatus};

/// Metadata envelope attached to every step event.
#[derive(Clone, Debug)]
pub struct EventMeta {
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::now()
    }
}

/// Lifecycle events emitted as the run progresses.
///
/// Consumers (the CLI progress logger, tests) subscribe via
/// [`StepEventBus::subscribe`]; publishing never blocks on slow
/// subscribers.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StepEvent {
    StageStarted {
        meta: EventMeta,
        stage: String,
    },
    StageFinished {
        meta: EventMeta,
        stage: String,
        status: StageStatus,
    },
    StepStarted {
        meta: EventMeta,
        stage: String,
        step: String,
        flavor: String,
        attempt: u16,
    },
    AttemptFinished {
        meta: EventMeta,
        stage: String,
        step: String,
        attempt: u16,
        outcome: AttemptOutcome,
    },
    StepFinished {
        meta: EventMeta,
        stage: String,
        step: String,
        status: StepStatus,
        attempts: u16,
    },
    RunFinished {
        meta: EventMeta,
        status: RunStatus,
    },
}

/// In-process event bus using a tokio broadcast channel.
///
/// Fan-out to all active subscribers; a lagging subscriber receives
/// `RecvError::Lagged` but never blocks the publisher. Events published
/// with no subscribers are silently dropped.
pub struct StepEventBus {
    sender: broadcast::Sender<StepEvent>,
    capacity: usize,
}

impl std::fmt::Debug for StepEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl StepEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers. Non-blocking.
    pub fn publish(&self, event: StepEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to step lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for StepEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
