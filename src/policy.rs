//! Restart policy, backoff, and the restart decision function.
//!
//! [`decide`] is a pure mapping from the entry's policy, the outcome of the
//! last instance, and its restart history to a [`RestartDecision`]. The
//! driver thread feeds every exit through it, including exits it caused
//! itself (stop requests, watched file changes).
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::{
    constants::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_HEALTHY_RUN},
    state::{ExitKind, ExitOutcome, ExitTrigger},
};

/// Rule deciding whether an exited entry is launched again.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart after any exit.
    #[default]
    #[strum(to_string = "always")]
    Always,
    /// Restart after a non-zero exit, a signal, or a launch failure.
    #[strum(to_string = "on-failure", serialize = "on_failure")]
    OnFailure,
    /// Never restart.
    #[strum(to_string = "never", serialize = "no")]
    Never,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap on the delay.
    pub max: Duration,
    /// A run at least this long resets the attempt counter.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            reset_after: DEFAULT_HEALTHY_RUN,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given 0-based attempt: `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Consecutive-failure tracker for one entry.
#[derive(Debug, Default, Clone)]
pub struct BackoffState {
    attempt: u32,
}

impl BackoffState {
    /// Accounts for a finished run; long enough runs reset the counter.
    pub fn record_run(&mut self, policy: &BackoffPolicy, uptime: Duration) {
        if uptime >= policy.reset_after {
            self.attempt = 0;
        }
    }

    /// Returns the delay for the next retry and advances the counter.
    pub fn next_delay(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Current attempt counter.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Why no restart will happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An explicit stop was requested.
    Requested,
    /// Policy is `never`.
    PolicyNever,
    /// Policy is `on-failure` and the child exited with code 0.
    CleanExit,
    /// The restart ceiling was reached.
    CeilingReached {
        /// Restarts performed.
        restarts: u32,
        /// Configured ceiling.
        ceiling: u32,
    },
}

/// Result of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Launch a replacement immediately.
    RestartNow,
    /// Launch a replacement after the next backoff delay.
    RestartAfterBackoff,
    /// Leave the entry stopped.
    NoRestart(StopReason),
}

/// Maps the last exit of an entry to what happens next.
///
/// File-change restarts ignore both the policy and the ceiling; every other
/// restart counts against the ceiling.
pub fn decide(
    policy: RestartPolicy,
    outcome: &ExitOutcome,
    restart_count: u32,
    ceiling: Option<u32>,
    healthy_after: Duration,
) -> RestartDecision {
    match outcome.trigger {
        ExitTrigger::StopRequest => return RestartDecision::NoRestart(StopReason::Requested),
        ExitTrigger::FileChange => return RestartDecision::RestartNow,
        ExitTrigger::Child => {}
    }

    match policy {
        RestartPolicy::Never => return RestartDecision::NoRestart(StopReason::PolicyNever),
        RestartPolicy::OnFailure if outcome.success() => {
            return RestartDecision::NoRestart(StopReason::CleanExit);
        }
        _ => {}
    }

    if let Some(ceiling) = ceiling
        && restart_count >= ceiling
    {
        return RestartDecision::NoRestart(StopReason::CeilingReached {
            restarts: restart_count,
            ceiling,
        });
    }

    if matches!(outcome.kind, ExitKind::LaunchFailed(_)) {
        return RestartDecision::RestartAfterBackoff;
    }

    if outcome.uptime >= healthy_after {
        RestartDecision::RestartNow
    } else {
        RestartDecision::RestartAfterBackoff
    }
}
