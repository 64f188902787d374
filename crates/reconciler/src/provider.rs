//! Instance providers create, watch and destroy the machines assemblies run
//! on.

use std::fmt;

use crate::error::{Error, Result};
use crate::registry::Assembly;

/// Provisioning state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Still booting.
    Pending,
    Running { address: String },
    Failed { reason: String },
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running { address } => write!(f, "running at {address}"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Backend that owns instances.
#[allow(clippy::missing_errors_doc)]
pub trait InstanceProvider {
    /// Ask for a new instance for `assembly`; returns its id.
    fn create_instance(&mut self, assembly: &Assembly) -> Result<String>;

    fn instance_state(&mut self, instance_id: &str) -> Result<InstanceState>;

    fn destroy_instance(&mut self, instance_id: &str) -> Result<()>;
}

impl<P: InstanceProvider + ?Sized> InstanceProvider for Box<P> {
    fn create_instance(&mut self, assembly: &Assembly) -> Result<String> {
        (**self).create_instance(assembly)
    }

    fn instance_state(&mut self, instance_id: &str) -> Result<InstanceState> {
        (**self).instance_state(instance_id)
    }

    fn destroy_instance(&mut self, instance_id: &str) -> Result<()> {
        (**self).destroy_instance(instance_id)
    }
}

/// Pre-provisioned nodes at the addresses given in the topology.
///
/// The instance id is the address itself, so an instance is running as soon
/// as it is "created" and destroying it does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProvider;

impl InstanceProvider for StaticProvider {
    fn create_instance(&mut self, assembly: &Assembly) -> Result<String> {
        assembly.static_address.clone().ok_or_else(|| {
            Error::provider(format!("assembly '{}' has no static address", assembly.name))
        })
    }

    fn instance_state(&mut self, instance_id: &str) -> Result<InstanceState> {
        Ok(InstanceState::Running {
            address: instance_id.to_string(),
        })
    }

    fn destroy_instance(&mut self, _instance_id: &str) -> Result<()> {
        Ok(())
    }
}
