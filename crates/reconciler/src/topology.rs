//! Declarative topology: the application, its assemblies and the services
//! each assembly runs.
//!
//! Documents are YAML or JSON. Escalation settings and agent parameters are
//! accepted as strings or plain scalars; a malformed document, a duplicate
//! name or a service the assembly's transport cannot run is rejected at load.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use cape_core::EscalationPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transports::TransportSet;

/// Default agent timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// A scalar setting written as a string, number or boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

fn default_class() -> String {
    "lsb".to_string()
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn escalation_policy(failures: Option<&Scalar>, period: Option<&Scalar>) -> EscalationPolicy {
    let failures = failures.map(ToString::to_string);
    let period = period.map(ToString::to_string);
    EscalationPolicy::from_config(failures.as_deref(), period.as_deref())
}

/// Name of the resource running `service` on `assembly`.
#[must_use]
pub fn resource_name(assembly: &str, service: &str) -> String {
    format!("rsc_{assembly}_{service}")
}

/// A service that must run on an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Agent type: the init script or OCF agent name.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default)]
    pub provider: Option<String>,
    /// Recurring monitor period in seconds, zero for none.
    #[serde(default)]
    pub monitor_interval: u64,
    /// Agent timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, Scalar>,
    #[serde(default)]
    pub escalation_failures: Option<Scalar>,
    #[serde(default)]
    pub escalation_period: Option<Scalar>,
}

impl ServiceSpec {
    /// Create an lsb service without monitoring.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            class: default_class(),
            provider: None,
            monitor_interval: 0,
            timeout: DEFAULT_TIMEOUT_SECS,
            parameters: BTreeMap::new(),
            escalation_failures: None,
            escalation_period: None,
        }
    }

    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>, provider: Option<String>) -> Self {
        self.class = class.into();
        self.provider = provider;
        self
    }

    #[must_use]
    pub const fn with_monitor_interval(mut self, secs: u64) -> Self {
        self.monitor_interval = secs;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_escalation(mut self, failures: impl Into<Scalar>, period: impl Into<Scalar>) -> Self {
        self.escalation_failures = Some(failures.into());
        self.escalation_period = Some(period.into());
        self
    }

    #[must_use]
    pub fn monitor_interval_ms(&self) -> u64 {
        self.monitor_interval.saturating_mul(1000)
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.saturating_mul(1000)
    }

    /// Agent parameters rendered as strings.
    #[must_use]
    pub fn params(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect()
    }

    #[must_use]
    pub fn policy(&self) -> EscalationPolicy {
        escalation_policy(self.escalation_failures.as_ref(), self.escalation_period.as_ref())
    }
}

/// A node of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblySpec {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    /// Provider template the instance is created from.
    #[serde(default)]
    pub image: String,
    /// Fixed address of a pre-provisioned node.
    #[serde(default)]
    pub address: Option<String>,
    /// Transport kind; the engine default when absent.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub escalation_failures: Option<Scalar>,
    #[serde(default)]
    pub escalation_period: Option<Scalar>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl AssemblySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            image: String::new(),
            address: None,
            transport: None,
            escalation_failures: None,
            escalation_period: None,
            services: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn with_transport(mut self, kind: impl Into<String>) -> Self {
        self.transport = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_escalation(mut self, failures: impl Into<Scalar>, period: impl Into<Scalar>) -> Self {
        self.escalation_failures = Some(failures.into());
        self.escalation_period = Some(period.into());
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    /// Transport kind, falling back to `default`.
    #[must_use]
    pub fn transport_kind<'a>(&'a self, default: &'a str) -> &'a str {
        self.transport.as_deref().unwrap_or(default)
    }

    #[must_use]
    pub fn policy(&self) -> EscalationPolicy {
        escalation_policy(self.escalation_failures.as_ref(), self.escalation_period.as_ref())
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|service| service.name == name)
    }
}

/// The whole application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub assemblies: Vec<AssemblySpec>,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            assemblies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_assembly(mut self, assembly: AssemblySpec) -> Self {
        self.assemblies.push(assembly);
        self
    }

    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error when the document does not describe a topology.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::malformed("yaml", e))
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error when the document does not describe a topology.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::malformed("json", e))
    }

    /// Read a topology file; `.json` files are JSON, anything else YAML.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    #[must_use]
    pub fn assembly(&self, name: &str) -> Option<&AssemblySpec> {
        self.assemblies.iter().find(|assembly| assembly.name == name)
    }

    /// Check names and transport support.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: an empty or duplicate name, an
    /// unknown transport kind, or a service class the transport cannot run.
    pub fn validate(&self, transports: &TransportSet, default_transport: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_topology("application name is empty"));
        }
        let mut assemblies = BTreeSet::new();
        let mut resources = BTreeSet::new();
        for assembly in &self.assemblies {
            if assembly.name.trim().is_empty() {
                return Err(Error::invalid_topology("assembly name is empty"));
            }
            if !assemblies.insert(assembly.name.as_str()) {
                return Err(Error::duplicate("assembly", &assembly.name));
            }
            let kind = assembly.transport_kind(default_transport);
            let factory = transports
                .get(kind)
                .ok_or_else(|| Error::unknown_transport(&assembly.name, kind))?;

            for service in &assembly.services {
                if service.name.trim().is_empty() || service.kind.trim().is_empty() {
                    return Err(Error::invalid_topology(format!(
                        "service on assembly '{}' needs a name and a type",
                        assembly.name
                    )));
                }
                let resource = resource_name(&assembly.name, &service.name);
                if !factory.supports_class(&service.class) {
                    return Err(Error::unsupported_class(resource, &service.class, kind));
                }
                if !resources.insert(resource.clone()) {
                    return Err(Error::duplicate("resource", resource));
                }
            }
        }
        Ok(())
    }
}
