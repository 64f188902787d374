//! Core types for cape.
//!
//! - [`OcfExitCode`]: the outcome taxonomy every transport normalizes into
//! - [`EscalationPolicy`] and [`Recovery`]: the failure escalation state machine
//! - [`Operation`] and [`OpHandle`]: planner actions and their shared handle
//! - [`derive_state`]: the single mapping from outcomes to resource states

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod error;
pub mod exitcode;
pub mod operation;
pub mod outcome;
pub mod recovery;
pub mod result;

pub use error::Error;
pub use exitcode::OcfExitCode;
pub use operation::{Method, OpHandle, Operation};
pub use outcome::{derive_state, state_for_outcome};
pub use recovery::{EscalationPolicy, Recovery, RecoveryState, Remedy, StateChange};
pub use result::{Result, ResultExt};
