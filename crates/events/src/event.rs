//! Recovery events.

use std::fmt;

use cape_core::RecoveryState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recovery state transition of an application, assembly or resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub application: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub state: RecoveryState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryEvent {
    /// Event about the whole application.
    pub fn for_application(
        application: impl Into<String>,
        state: RecoveryState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            assembly: None,
            resource: None,
            state,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Event about an assembly.
    pub fn for_assembly(
        application: impl Into<String>,
        assembly: impl Into<String>,
        state: RecoveryState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            assembly: Some(assembly.into()),
            ..Self::for_application(application, state, reason)
        }
    }

    /// Event about a resource on an assembly.
    pub fn for_resource(
        application: impl Into<String>,
        assembly: impl Into<String>,
        resource: impl Into<String>,
        state: RecoveryState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Self::for_assembly(application, assembly, state, reason)
        }
    }

    /// Most specific entity the event is about.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.resource
            .as_deref()
            .or(self.assembly.as_deref())
            .unwrap_or(&self.application)
    }
}

impl fmt::Display for RecoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.subject(), self.state, self.reason)
    }
}
