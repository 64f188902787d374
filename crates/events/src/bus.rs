//! In-process event bus for observers running on other tasks.

use cape_core::RecoveryState;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::RecoveryEvent;
use crate::sink::EventSink;

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 1000;

/// Pattern for filtering events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Match all events.
    All,
    /// Match events about an assembly or any of its resources.
    ByAssembly(String),
    /// Match events about one resource.
    ByResource(String),
    /// Match transitions into a state.
    ByState(RecoveryState),
}

impl EventPattern {
    /// Check if an event matches this pattern.
    #[must_use]
    pub fn matches(&self, event: &RecoveryEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByAssembly(name) => event.assembly.as_deref() == Some(name.as_str()),
            Self::ByResource(name) => event.resource.as_deref() == Some(name.as_str()),
            Self::ByState(state) => event.state == *state,
        }
    }
}

/// Subscription handle for receiving events.
pub struct EventSubscription {
    receiver: broadcast::Receiver<RecoveryEvent>,
    pattern: EventPattern,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] once the bus is gone and
    /// [`Error::Lagged`] when this subscriber fell behind.
    pub async fn recv(&mut self) -> Result<RecoveryEvent> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.pattern.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Receive a matching event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] when no matching event is buffered,
    /// [`Error::Lagged`] when this subscriber fell behind and
    /// [`Error::ChannelClosed`] once the bus is gone and drained.
    pub fn try_recv(&mut self) -> Result<RecoveryEvent> {
        loop {
            let event = self.receiver.try_recv().map_err(map_try_recv_error)?;
            if self.pattern.matches(&event) {
                return Ok(event);
            }
        }
    }
}

fn map_recv_error(err: broadcast::error::RecvError) -> Error {
    match err {
        broadcast::error::RecvError::Closed => Error::ChannelClosed,
        broadcast::error::RecvError::Lagged(skipped) => Error::Lagged { skipped },
    }
}

fn map_try_recv_error(err: broadcast::error::TryRecvError) -> Error {
    match err {
        broadcast::error::TryRecvError::Empty => Error::Empty,
        broadcast::error::TryRecvError::Closed => Error::ChannelClosed,
        broadcast::error::TryRecvError::Lagged(skipped) => Error::Lagged { skipped },
    }
}

/// Broadcasts recovery events to any number of subscribers.
///
/// Publishing never waits: with no subscribers the event is dropped, and a
/// slow subscriber loses the oldest events instead of holding up the loop.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RecoveryEvent>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, event: RecoveryEvent) -> usize {
        debug!(subject = event.subject(), state = %event.state, "publishing event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with_pattern(EventPattern::All)
    }

    /// Subscribe to events matching a pattern.
    #[must_use]
    pub fn subscribe_with_pattern(&self, pattern: EventPattern) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            pattern,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &RecoveryEvent) {
        self.publish(event.clone());
    }
}
