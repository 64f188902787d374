//! Reconciliation engine keeping an application's assemblies and resources
//! in line with its topology.
//!
//! The engine runs on a single-threaded reactor. Each pass it:
//! 1. Renders a [`StatusSnapshot`] of every assembly and the operation
//!    history of its resources
//! 2. Asks a [`Planner`] for the operations that close the gap to the
//!    [`Topology`]
//! 3. Runs them through the assembly's transport and feeds every outcome
//!    back to the planner
//!
//! Failures move resources and assemblies through their recovery states.
//! A failure restarts the resource, or the whole assembly once its
//! escalation policy is exhausted.
//!
//! # Example
//!
//! ```ignore
//! use cape_reconciler::{EngineBuilder, EngineConfig, EngineHandle, Topology};
//!
//! let topology = Topology::load(Path::new("shop.yaml"))?;
//! let mut engine = EngineBuilder::new()
//!     .with_config(EngineConfig::load(Path::new("cape.toml"))?)
//!     .with_transport(ssh_factory)
//!     .build(topology)?;
//!
//! let (handle, mut commands) = EngineHandle::channel();
//! engine.start();
//! cape_mainloop::run(&mut engine, &mut commands).await;
//! ```

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod status;
pub mod topology;
pub mod transports;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineCommand, EngineHandle};
pub use error::{Error, Result};
pub use history::{HistoryEntry, OperationHistory};
pub use planner::{BasicPlanner, Confirmation, PlanStep, Planner, Verdict};
pub use provider::{InstanceProvider, InstanceState, StaticProvider};
pub use registry::{Application, Assembly, Registry, Resource};
pub use status::StatusSnapshot;
pub use topology::{AssemblySpec, Scalar, ServiceSpec, Topology, resource_name};
pub use transports::TransportSet;
