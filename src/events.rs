use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::ProgressStep;
use crate::dispatcher::QueueItem;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out channel: every subscriber sees every event published after it
/// subscribed.
#[derive(Clone)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers reached. Having none is not an error.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Events published by one dispatcher queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueueEvent<R> {
    #[serde(rename_all = "camelCase")]
    Progress { entity_number: u64, step: ProgressStep },
    #[serde(rename_all = "camelCase")]
    Complete { entity_number: u64, result: R },
    #[serde(rename_all = "camelCase")]
    Error { entity_number: u64, error: String },
    /// Full snapshot of the queue after any state change.
    QueueUpdate { queue: Vec<QueueItem<R>> },
}

impl<R> QueueEvent<R> {
    pub fn suffix(&self) -> &'static str {
        match self {
            QueueEvent::Progress { .. } => "progress",
            QueueEvent::Complete { .. } => "complete",
            QueueEvent::Error { .. } => "error",
            QueueEvent::QueueUpdate { .. } => "queue-update",
        }
    }

    /// Channel name for this event on a queue, e.g. `review-progress`.
    pub fn name(&self, queue: &str) -> String {
        format!("{queue}-{}", self.suffix())
    }

    pub fn entity_number(&self) -> Option<u64> {
        match self {
            QueueEvent::Progress { entity_number, .. }
            | QueueEvent::Complete { entity_number, .. }
            | QueueEvent::Error { entity_number, .. } => Some(*entity_number),
            QueueEvent::QueueUpdate { .. } => None,
        }
    }
}
