//! Progress events emitted by the engine
//!
//! Events go out on a `tokio::sync::broadcast` channel. Emitting never
//! blocks: with no subscribers the event is dropped, and a lagging
//! subscriber loses the oldest events rather than slowing posting down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AttemptRecord, Disposition};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging kicks in
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A driver took over a submission
    SubmissionStarted {
        submission_id: String,
        destinations: Vec<String>,
    },

    /// The driver picked its next destination and is waiting for its slot
    DestinationScheduled {
        submission_id: String,
        destination: String,
        wait_ms: u64,
        /// Set only for long waits, in milliseconds since the epoch
        resume_at: Option<i64>,
    },

    /// One attempt finished
    DestinationAttempted {
        submission_id: String,
        record: AttemptRecord,
    },

    /// A posting pass ended
    SubmissionCompleted {
        submission_id: String,
        disposition: Disposition,
        attempts: Vec<AttemptRecord>,
        /// Destinations left for a later pass (failed first, then unattempted)
        pending: Vec<String>,
    },

    /// The halt-on-failure policy cleared the queue
    QueueHalted {
        submission_id: String,
        cleared: usize,
    },
}

impl Event {
    pub fn submission_id(&self) -> &str {
        match self {
            Event::SubmissionStarted { submission_id, .. }
            | Event::DestinationScheduled { submission_id, .. }
            | Event::DestinationAttempted { submission_id, .. }
            | Event::SubmissionCompleted { submission_id, .. }
            | Event::QueueHalted { submission_id, .. } => submission_id,
        }
    }
}
