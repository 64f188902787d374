//! Recovery state machine with time-windowed failure escalation.
//!
//! Assemblies and resources each own a [`Recovery`]: the current
//! [`RecoveryState`] plus an [`EscalationPolicy`]. Setting the state returns
//! a [`StateChange`] instead of calling back into the owner, so the owner can
//! report the transition and dispatch the remedy without fighting the borrow
//! of the recovery it is mutating.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Error;

/// Lifecycle status of an assembly or resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    #[default]
    Unknown,
    Running,
    Failed,
    Stopped,
    Unrecoverable,
}

impl RecoveryState {
    /// Get the state as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Unrecoverable => "unrecoverable",
        }
    }

    /// Check if the entity is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "unrecoverable" => Ok(Self::Unrecoverable),
            other => Err(Error::UnknownState(other.to_string())),
        }
    }
}

/// What the owner should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    /// Recover locally (retry, re-provision).
    Restart,
    /// Too many failures in the window, hand the problem upward.
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    max_failures: usize,
    window: Duration,
}

/// Time-windowed failure counter.
///
/// Keeps the timestamps of the last `max_failures` failures. When the ring is
/// full and the span from its oldest to its newest entry fits in the window,
/// the failure escalates and the ring starts over from empty. Otherwise the
/// oldest entry is overwritten by the next failure, so the check slides over
/// the most recent failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPolicy {
    limits: Option<Limits>,
    failures: VecDeque<Duration>,
}

impl EscalationPolicy {
    /// Create a policy. A zero `max_failures` or zero window disables it.
    #[must_use]
    pub fn new(max_failures: u32, window: Duration) -> Self {
        let limits = usize::try_from(max_failures)
            .ok()
            .filter(|max| *max > 0 && !window.is_zero())
            .map(|max_failures| Limits {
                max_failures,
                window,
            });
        Self {
            failures: VecDeque::with_capacity(limits.map_or(0, |l| l.max_failures)),
            limits,
        }
    }

    /// A policy that never escalates.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            limits: None,
            failures: VecDeque::new(),
        }
    }

    /// Build a policy from string-encoded configuration values.
    ///
    /// `failures` is a count and `period` a number of seconds. Either value
    /// missing, unparseable or not positive leaves escalation disabled.
    #[must_use]
    pub fn from_config(failures: Option<&str>, period: Option<&str>) -> Self {
        let failures = failures
            .and_then(parse_leading_int)
            .and_then(|v| u32::try_from(v).ok());
        let period = period
            .and_then(parse_leading_int)
            .and_then(|v| u64::try_from(v).ok());

        match (failures, period) {
            (Some(failures), Some(period)) => Self::new(failures, Duration::from_secs(period)),
            _ => Self::disabled(),
        }
    }

    /// Check if escalation can ever happen.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.limits.is_some()
    }

    /// Configured failure count, if enabled.
    #[must_use]
    pub fn max_failures(&self) -> Option<usize> {
        self.limits.map(|l| l.max_failures)
    }

    /// Configured window, if enabled.
    #[must_use]
    pub fn window(&self) -> Option<Duration> {
        self.limits.map(|l| l.window)
    }

    /// Failures recorded since the ring last reset.
    #[must_use]
    pub fn recorded_failures(&self) -> usize {
        self.failures.len()
    }

    /// Record a failure at `now` and decide what to do about it.
    pub fn on_failure(&mut self, now: Duration) -> Remedy {
        let Some(limits) = self.limits else {
            return Remedy::Restart;
        };

        if self.failures.len() >= limits.max_failures {
            self.failures.pop_front();
        }
        self.failures.push_back(now);

        trace!(
            failure = self.failures.len(),
            max_failures = limits.max_failures,
            "recorded failure"
        );

        if self.failures.len() < limits.max_failures {
            return Remedy::Restart;
        }

        let span = match (self.failures.front(), self.failures.back()) {
            (Some(oldest), Some(newest)) => newest.saturating_sub(*oldest),
            _ => return Remedy::Restart,
        };
        trace!(span_ms = span.as_millis(), window_ms = limits.window.as_millis(), "failure span");

        if span <= limits.window {
            self.failures.clear();
            Remedy::Escalate
        } else {
            Remedy::Restart
        }
    }

    /// Forget all recorded failures.
    pub fn reset(&mut self) {
        self.failures.clear();
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Parse the leading integer of `s` the way C's `strtol` does: optional
/// leading whitespace, an optional sign, then as many decimal digits as are
/// present. Returns `None` when there are no digits or the value overflows.
fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, s.get(1..)?),
        Some(b'+') => (false, s.get(1..)?),
        _ => (false, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value: i64 = digits.get(..end)?.parse().ok()?;
    Some(if negative { value.checked_neg()? } else { value })
}

/// A transition produced by [`Recovery::set_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: RecoveryState,
    pub to: RecoveryState,
    /// Set when the transition entered [`RecoveryState::Failed`].
    pub remedy: Option<Remedy>,
}

/// Recovery state holder composed with an escalation policy.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    state: RecoveryState,
    policy: EscalationPolicy,
}

impl Recovery {
    /// Create a recovery in [`RecoveryState::Unknown`].
    #[must_use]
    pub const fn new(policy: EscalationPolicy) -> Self {
        Self {
            state: RecoveryState::Unknown,
            policy,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RecoveryState {
        self.state
    }

    /// The escalation policy.
    #[must_use]
    pub const fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Move to `to`. Returns `None` when nothing changed.
    ///
    /// Entering [`RecoveryState::Failed`] records a failure with the policy and
    /// the chosen remedy is returned with the change.
    pub fn set_state(&mut self, to: RecoveryState, now: Duration) -> Option<StateChange> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;

        let remedy = (to == RecoveryState::Failed).then(|| self.policy.on_failure(now));
        Some(StateChange { from, to, remedy })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    /// Fail and recover once, returning the remedy of the failure.
    fn fail(recovery: &mut Recovery, at: Duration) -> Remedy {
        let change = recovery.set_state(RecoveryState::Failed, at).unwrap();
        recovery.set_state(RecoveryState::Running, at);
        change.remedy.unwrap()
    }

    #[test]
    fn test_parse_leading_int() {
        assert_eq!(parse_leading_int("3"), Some(3));
        assert_eq!(parse_leading_int("  10"), Some(10));
        assert_eq!(parse_leading_int("3x"), Some(3));
        assert_eq!(parse_leading_int("+4"), Some(4));
        assert_eq!(parse_leading_int("-1"), Some(-1));
        assert_eq!(parse_leading_int("x3"), None);
        assert_eq!(parse_leading_int(""), None);
        assert_eq!(parse_leading_int("-"), None);
        assert_eq!(parse_leading_int("99999999999999999999"), None);
    }

    #[test]
    fn test_from_config_disabled_inputs() {
        for (failures, period) in [
            (None, Some("10")),
            (Some("3"), None),
            (Some("three"), Some("10")),
            (Some("3"), Some("")),
            (Some("0"), Some("10")),
            (Some("3"), Some("-5")),
        ] {
            let policy = EscalationPolicy::from_config(failures, period);
            assert!(!policy.is_enabled(), "{failures:?}/{period:?}");
        }

        let policy = EscalationPolicy::from_config(Some("3"), Some("10"));
        assert_eq!(policy.max_failures(), Some(3));
        assert_eq!(policy.window(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_disabled_always_restarts() {
        let mut policy = EscalationPolicy::disabled();
        for i in 0..10 {
            assert_eq!(policy.on_failure(ms(i)), Remedy::Restart);
        }
    }

    #[test]
    fn test_transition_only_on_change() {
        let mut recovery = Recovery::default();
        assert!(recovery.set_state(RecoveryState::Unknown, ms(0)).is_none());

        let change = recovery.set_state(RecoveryState::Running, ms(0)).unwrap();
        assert_eq!(change.from, RecoveryState::Unknown);
        assert_eq!(change.to, RecoveryState::Running);
        assert_eq!(change.remedy, None);

        assert!(recovery.set_state(RecoveryState::Running, ms(1)).is_none());

        let change = recovery.set_state(RecoveryState::Stopped, ms(2)).unwrap();
        assert_eq!((change.from, change.to), (RecoveryState::Running, RecoveryState::Stopped));
    }

    #[test]
    fn test_escalates_on_third_failure_in_window() {
        let mut recovery = Recovery::new(EscalationPolicy::from_config(Some("3"), Some("10")));
        recovery.set_state(RecoveryState::Running, ms(0));

        assert_eq!(fail(&mut recovery, ms(0)), Remedy::Restart);
        assert_eq!(fail(&mut recovery, ms(300)), Remedy::Restart);
        assert_eq!(fail(&mut recovery, ms(900)), Remedy::Escalate);

        // the window starts over from the next failure
        assert_eq!(fail(&mut recovery, ms(1200)), Remedy::Restart);
    }

    #[test]
    fn test_failed_to_failed_is_not_a_failure() {
        let mut recovery = Recovery::new(EscalationPolicy::new(2, Duration::from_secs(10)));
        assert!(recovery.set_state(RecoveryState::Failed, ms(0)).is_some());
        assert!(recovery.set_state(RecoveryState::Failed, ms(1)).is_none());
        assert_eq!(recovery.policy().recorded_failures(), 1);
    }

    #[test]
    fn test_sliding_window() {
        // 3 failures within 1 second
        let mut recovery = Recovery::new(EscalationPolicy::from_config(Some("3"), Some("1")));

        for round in 0..2u64 {
            let base = round * 100;
            assert_eq!(fail(&mut recovery, ms(base)), Remedy::Restart);
            assert_eq!(fail(&mut recovery, ms(base + 10)), Remedy::Restart);
            assert_eq!(fail(&mut recovery, ms(base + 20)), Remedy::Escalate);
        }

        // spread out: every span of three exceeds one second
        assert_eq!(fail(&mut recovery, ms(10_300)), Remedy::Restart);
        assert_eq!(fail(&mut recovery, ms(10_900)), Remedy::Restart);
        assert_eq!(fail(&mut recovery, ms(11_500)), Remedy::Restart);
        // 10.9, 11.5 and 11.8 fit in one second
        assert_eq!(fail(&mut recovery, ms(11_800)), Remedy::Escalate);
        assert_eq!(fail(&mut recovery, ms(11_900)), Remedy::Restart);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let mut policy = EscalationPolicy::new(2, Duration::from_secs(1));
        assert_eq!(policy.on_failure(ms(0)), Remedy::Restart);
        assert_eq!(policy.on_failure(ms(1000)), Remedy::Escalate);
    }

    #[test]
    fn test_state_strings() {
        for state in [
            RecoveryState::Unknown,
            RecoveryState::Running,
            RecoveryState::Failed,
            RecoveryState::Stopped,
            RecoveryState::Unrecoverable,
        ] {
            assert_eq!(state.as_str().parse::<RecoveryState>().unwrap(), state);
        }
        assert!("degraded".parse::<RecoveryState>().is_err());
    }

    proptest! {
        #[test]
        fn prop_spaced_failures_never_escalate(gaps in proptest::collection::vec(5_001u64..60_000, 1..40)) {
            // any two consecutive failures are more than half the window apart,
            // so three of them never fit in it
            let mut policy = EscalationPolicy::new(3, Duration::from_secs(10));
            let mut now = 0u64;
            for gap in gaps {
                now += gap;
                prop_assert_eq!(policy.on_failure(ms(now)), Remedy::Restart);
            }
        }

        #[test]
        fn prop_burst_escalates_every_nth(max in 1u32..8, bursts in 1usize..5) {
            let mut policy = EscalationPolicy::new(max, Duration::from_secs(10));
            let mut now = 0u64;
            for _ in 0..bursts {
                for i in 1..=max {
                    now += 1;
                    let expected = if i == max { Remedy::Escalate } else { Remedy::Restart };
                    prop_assert_eq!(policy.on_failure(ms(now)), expected);
                }
            }
        }
    }
}
