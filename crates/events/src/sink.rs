//! Event sinks.
//!
//! Delivery is best effort everywhere: a sink that cannot deliver logs the
//! problem and drops the event. Nothing is acknowledged or retried.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use crate::event::RecoveryEvent;

/// Destination of recovery events.
pub trait EventSink {
    /// Deliver an event.
    fn emit(&self, event: &RecoveryEvent);
}

impl<T: EventSink + ?Sized> EventSink for Rc<T> {
    fn emit(&self, event: &RecoveryEvent) {
        (**self).emit(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn emit(&self, event: &RecoveryEvent) {
        (**self).emit(event);
    }
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &RecoveryEvent) {
        info!(
            application = %event.application,
            assembly = event.assembly.as_deref().unwrap_or("-"),
            resource = event.resource.as_deref().unwrap_or("-"),
            state = %event.state,
            reason = %event.reason,
            "recovery event"
        );
    }
}

/// Keeps events in memory. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Rc<RefCell<Vec<RecoveryEvent>>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events delivered so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecoveryEvent> {
        self.events.borrow().clone()
    }

    /// Remove and return the events delivered so far.
    pub fn take(&self) -> Vec<RecoveryEvent> {
        self.events.borrow_mut().drain(..).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &RecoveryEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

/// Delivers every event to each of several sinks.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &RecoveryEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
