//! Mapping of action outcomes onto resource recovery states.

use crate::exitcode::OcfExitCode;
use crate::operation::Method;
use crate::recovery::RecoveryState;

/// Derive the resource state implied by an action outcome.
///
/// | method  | rc == OK | one-shot, not OK | otherwise |
/// |---------|----------|------------------|-----------|
/// | monitor | Running  | Stopped          | Failed    |
/// | start   | Running  | Unrecoverable on a hard error, else Unknown ||
/// | stop    | Stopped  | Unrecoverable on a hard error, else Unknown ||
///
/// `delete` does not imply a state and yields `None`.
#[must_use]
pub const fn derive_state(
    method: Method,
    rc: OcfExitCode,
    interval_ms: u64,
    is_hard_error: bool,
) -> Option<RecoveryState> {
    let ok = matches!(rc, OcfExitCode::Ok);
    let state = match method {
        Method::Monitor if ok => RecoveryState::Running,
        Method::Monitor if interval_ms == 0 => RecoveryState::Stopped,
        Method::Monitor => RecoveryState::Failed,
        Method::Start if ok => RecoveryState::Running,
        Method::Stop if ok => RecoveryState::Stopped,
        Method::Start | Method::Stop if is_hard_error => RecoveryState::Unrecoverable,
        Method::Start | Method::Stop => RecoveryState::Unknown,
        Method::Delete => return None,
    };
    Some(state)
}

/// [`derive_state`] with the hard-error predicate taken from the exit code.
#[must_use]
pub const fn state_for_outcome(method: Method, rc: OcfExitCode, interval_ms: u64) -> Option<RecoveryState> {
    derive_state(method, rc, interval_ms, rc.is_hard_error())
}
