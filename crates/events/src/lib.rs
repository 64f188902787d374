//! Recovery event notification.
//!
//! Every recovery state transition of an assembly or resource becomes a
//! [`RecoveryEvent`] handed to an [`EventSink`]. Delivery is best effort:
//! no acknowledgement, no retry.
//!
//! - [`LogSink`]: structured log line per event
//! - [`EventBus`]: broadcast to in-process subscribers, with [`EventPattern`] filters
//! - [`UnixSocketSink`]: JSON lines to an admin socket
//! - [`FanoutSink`]: several of the above at once

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod sink;
pub mod socket;

pub use bus::{EventBus, EventPattern, EventSubscription};
pub use error::{Error, Result};
pub use event::RecoveryEvent;
pub use sink::{EventSink, FanoutSink, LogSink, RecordingSink};
pub use socket::{CircuitBreaker, UnixSocketSink};
