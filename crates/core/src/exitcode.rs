//! OCF exit code taxonomy.
//!
//! Every remote outcome, whatever produced it, is normalized into an
//! [`OcfExitCode`] before it reaches the engine. LSB init scripts report a
//! different set of codes for `status`, see [`OcfExitCode::from_lsb`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Outcome of a resource agent action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum OcfExitCode {
    /// Action has not completed yet.
    Pending,
    Ok,
    UnknownError,
    InvalidParam,
    UnimplementFeature,
    InsufficientPriv,
    NotInstalled,
    NotConfigured,
    NotRunning,
    RunningMaster,
    FailedMaster,
}

impl OcfExitCode {
    /// Numeric code as reported by resource agents.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Pending => -1,
            Self::Ok => 0,
            Self::UnknownError => 1,
            Self::InvalidParam => 2,
            Self::UnimplementFeature => 3,
            Self::InsufficientPriv => 4,
            Self::NotInstalled => 5,
            Self::NotConfigured => 6,
            Self::NotRunning => 7,
            Self::RunningMaster => 8,
            Self::FailedMaster => 9,
        }
    }

    /// Map a raw agent exit status, clamping anything unknown to
    /// [`OcfExitCode::UnknownError`].
    #[must_use]
    pub fn from_agent(rc: i32) -> Self {
        Self::try_from(rc).unwrap_or(Self::UnknownError)
    }

    /// Map an LSB init script exit status onto the OCF taxonomy.
    ///
    /// `status` (and `monitor`, which runs `status` for LSB services) uses the
    /// LSB status table; every other action reports 0..=7 with OCF meaning
    /// and anything above that is an unknown error.
    #[must_use]
    pub fn from_lsb(action: &str, rc: i32) -> Self {
        if action == "status" || action == "monitor" {
            return match rc {
                0 => Self::Ok,
                // dead with pid file, dead with lock file, not running
                1..=3 => Self::NotRunning,
                _ => Self::UnknownError,
            };
        }
        if rc > Self::NotRunning.code() {
            return Self::UnknownError;
        }
        Self::from_agent(rc)
    }

    /// Codes that no amount of retrying will fix.
    #[must_use]
    pub const fn is_hard_error(self) -> bool {
        matches!(
            self,
            Self::InvalidParam
                | Self::UnimplementFeature
                | Self::InsufficientPriv
                | Self::NotInstalled
                | Self::NotConfigured
        )
    }

    /// Human readable reason, used in events and logs.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::UnknownError => "unknown error",
            Self::InvalidParam => "invalid parameter",
            Self::UnimplementFeature => "unimplemented feature",
            Self::InsufficientPriv => "insufficient privileges",
            Self::NotInstalled => "not installed",
            Self::NotConfigured => "not configured",
            Self::NotRunning => "not running",
            Self::RunningMaster => "running master",
            Self::FailedMaster => "failed master",
        }
    }
}

impl TryFrom<i32> for OcfExitCode {
    type Error = Error;

    fn try_from(rc: i32) -> Result<Self, Self::Error> {
        match rc {
            -1 => Ok(Self::Pending),
            0 => Ok(Self::Ok),
            1 => Ok(Self::UnknownError),
            2 => Ok(Self::InvalidParam),
            3 => Ok(Self::UnimplementFeature),
            4 => Ok(Self::InsufficientPriv),
            5 => Ok(Self::NotInstalled),
            6 => Ok(Self::NotConfigured),
            7 => Ok(Self::NotRunning),
            8 => Ok(Self::RunningMaster),
            9 => Ok(Self::FailedMaster),
            other => Err(Error::UnknownExitCode(other)),
        }
    }
}

impl From<OcfExitCode> for i32 {
    fn from(rc: OcfExitCode) -> Self {
        rc.code()
    }
}

impl fmt::Display for OcfExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_lsb_status_mapping() {
        assert_eq!(OcfExitCode::from_lsb("status", 0), OcfExitCode::Ok);
        assert_eq!(OcfExitCode::from_lsb("status", 1), OcfExitCode::NotRunning);
        assert_eq!(OcfExitCode::from_lsb("status", 2), OcfExitCode::NotRunning);
        assert_eq!(OcfExitCode::from_lsb("monitor", 3), OcfExitCode::NotRunning);
        assert_eq!(OcfExitCode::from_lsb("status", 4), OcfExitCode::UnknownError);
        assert_eq!(OcfExitCode::from_lsb("status", 150), OcfExitCode::UnknownError);
    }

    #[test]
    fn test_lsb_action_mapping() {
        assert_eq!(OcfExitCode::from_lsb("start", 0), OcfExitCode::Ok);
        assert_eq!(OcfExitCode::from_lsb("start", 5), OcfExitCode::NotInstalled);
        assert_eq!(OcfExitCode::from_lsb("stop", 7), OcfExitCode::NotRunning);
        assert_eq!(OcfExitCode::from_lsb("start", 8), OcfExitCode::UnknownError);
        assert_eq!(OcfExitCode::from_lsb("start", 255), OcfExitCode::UnknownError);
    }

    #[test]
    fn test_hard_errors() {
        let hard: Vec<_> = (-1..=9)
            .map(|rc| OcfExitCode::try_from(rc).unwrap())
            .filter(|rc| rc.is_hard_error())
            .collect();
        assert_eq!(
            hard,
            vec![
                OcfExitCode::InvalidParam,
                OcfExitCode::UnimplementFeature,
                OcfExitCode::InsufficientPriv,
                OcfExitCode::NotInstalled,
                OcfExitCode::NotConfigured,
            ]
        );
    }

    #[test]
    fn test_code_round_trip() {
        for rc in -1..=9 {
            assert_eq!(OcfExitCode::try_from(rc).unwrap().code(), rc);
        }
        assert_eq!(OcfExitCode::try_from(10), Err(Error::UnknownExitCode(10)));
        assert_eq!(OcfExitCode::from_agent(10), OcfExitCode::UnknownError);
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(OcfExitCode::NotInstalled.reason(), "not installed");
        assert_eq!(OcfExitCode::Ok.to_string(), "0 (ok)");
    }
}
