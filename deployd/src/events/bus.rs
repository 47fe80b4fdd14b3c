//! In-process event bus
//!
//! Fans state machine events and progress records out to every host
//! controller and observer in the process. Delivery is at-most-once per
//! subscriber: a receiver that falls more than `capacity` events behind
//! loses the oldest ones and is told how many.

use std::sync::Arc;

use deployd_api::{Event, JobKey};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus over a tokio broadcast channel
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish to all current subscribers
    pub fn publish(&self, event: Event) {
        debug!("Publishing event: {}", event.name());

        let receivers = self.sender.send(event).unwrap_or(0);
        if receivers == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single job
    pub fn subscribe_job(&self, key: JobKey) -> JobEventReceiver {
        JobEventReceiver {
            inner: self.subscribe(),
            key,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

/// Receiver for every event on the bus
pub struct EventReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => RecvError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                RecvError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<Event, RecvError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => RecvError::Empty,
            broadcast::error::TryRecvError::Closed => RecvError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                RecvError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one job, progress records included
pub struct JobEventReceiver {
    inner: EventReceiver,
    key: JobKey,
}

impl JobEventReceiver {
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        loop {
            let event = self.inner.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match event {
            Event::Progress(record) => record.job == self.key,
            other => other.job().is_some_and(|job| job.key() == self.key),
        }
    }
}
