//! Single-threaded cooperative reactor.
//!
//! One loop multiplexes prioritized deferred jobs and timers. Jobs run to
//! completion; long operations are split into steps that either make
//! progress or queue themselves again, so nothing ever blocks the loop.
//!
//! The state driven by the loop owns it and implements [`Reactor`]. Tests
//! move the clock by hand with [`Reactor::advance`]; the daemon hands the
//! reactor to [`run`], which follows real (tokio) time and feeds it commands
//! from other tasks.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod mainloop;
pub mod reactor;
pub mod stopwatch;

pub use mainloop::{Job, Mainloop, Priority, TimerId};
pub use reactor::{Reactor, run};
pub use stopwatch::Stopwatch;
