//! Ways of running resource actions on remote nodes.
//!
//! Every transport implements [`Transport`] and is driven by the engine's
//! reactor through a [`TransportContext`]; none of them blocks. Outcomes are
//! normalized into [`cape_core::OcfExitCode`] before they leave the crate.
//!
//! - [`ssh`]: shell commands over a non-blocking session
//! - [`cim`]: service management through a CIM client
//! - [`bus`]: method calls to node agents on a message bus

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod bus;
pub mod cim;
pub mod error;
pub mod ssh;
pub mod transport;

pub use error::{Result, TransportError};
pub use transport::{
    NodeInfo, Transport, TransportContext, TransportFactory, TransportInput, Wakeup,
};
