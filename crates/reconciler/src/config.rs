//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is a valid
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cape_transport::ssh::SshConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the reconciliation engine and the transports it builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Debounce window between a re-evaluation request and the planning pass.
    pub schedule_delay_ms: u64,
    /// Period of instance state polls while provisioning.
    pub pending_poll_interval_ms: u64,
    /// Time a single remote command may take.
    pub exec_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
    /// Period of the remote shell liveness check.
    pub healthcheck_interval_ms: u64,
    /// Age after which a missing bus heartbeat fails the node.
    pub heartbeat_timeout_ms: u64,
    /// Transport used by assemblies that do not name one.
    pub default_transport: String,
    /// Admin socket receiving recovery events as JSON lines.
    pub event_socket: Option<PathBuf>,
    pub ssh_user: String,
    pub ssh_identity: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_delay_ms: 1000,
            pending_poll_interval_ms: 1000,
            exec_timeout_ms: 5000,
            keepalive_interval_secs: 15,
            healthcheck_interval_ms: 3000,
            heartbeat_timeout_ms: 20_000,
            default_transport: "ssh".to_string(),
            event_socket: None,
            ssh_user: "root".to_string(),
            ssh_identity: None,
        }
    }
}

impl EngineConfig {
    /// Create a config for testing with shorter intervals.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            schedule_delay_ms: 100,
            pending_poll_interval_ms: 100,
            exec_timeout_ms: 1000,
            healthcheck_interval_ms: 60_000,
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error when the document is not valid TOML or a field has
    /// the wrong type.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::malformed("toml", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.default_transport.trim().is_empty() {
            return Err(Error::invalid_config("default_transport is empty"));
        }
        if self.schedule_delay_ms == 0 {
            return Err(Error::invalid_config("schedule_delay_ms must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_schedule_delay_ms(mut self, ms: u64) -> Self {
        self.schedule_delay_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_pending_poll_interval_ms(mut self, ms: u64) -> Self {
        self.pending_poll_interval_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_exec_timeout_ms(mut self, ms: u64) -> Self {
        self.exec_timeout_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_default_transport(mut self, kind: impl Into<String>) -> Self {
        self.default_transport = kind.into();
        self
    }

    #[must_use]
    pub fn with_event_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_socket = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_ssh_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_identity = Some(path.into());
        self
    }

    #[must_use]
    pub const fn schedule_delay(&self) -> Duration {
        Duration::from_millis(self.schedule_delay_ms)
    }

    #[must_use]
    pub const fn pending_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pending_poll_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Timing knobs for remote shell transports.
    #[must_use]
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            exec_timeout: Duration::from_millis(self.exec_timeout_ms),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            healthcheck_interval: Duration::from_millis(self.healthcheck_interval_ms),
            ..SshConfig::default()
        }
    }
}
