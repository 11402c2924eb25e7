//! Lifecycle states, instances, and exit outcomes.
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::{
    fmt,
    process::ExitStatus,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle state of a managed entry.
///
/// `Pending -> Starting -> Running -> (Exited | Crashed) -> (Restarting -> Starting) | Stopped`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum State {
    /// Spec loaded, never launched.
    Pending,
    /// Process creation requested.
    Starting,
    /// Process handle is live.
    Running,
    /// Child terminated with an exit code.
    Exited,
    /// Child was killed by a signal or failed to launch.
    Crashed,
    /// Waiting out a backoff delay before the next launch.
    Restarting,
    /// Terminal: stopped on request or after exhausting the restart ceiling.
    Stopped,
}

impl State {
    /// Whether the state represents a live child process.
    pub fn is_live(self) -> bool {
        matches!(self, State::Starting | State::Running)
    }
}

/// What ended an instance, as reported by the OS or the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Normal termination with an exit code.
    Code(i32),
    /// Termination by signal.
    Signal(i32),
    /// The process never started.
    LaunchFailed(String),
}

/// Why the supervisor observed the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    /// The child ended on its own.
    Child,
    /// The supervisor terminated it because a stop was requested.
    StopRequest,
    /// The supervisor terminated it because a watched file changed.
    FileChange,
}

/// Observed end of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, signal, or launch failure.
    pub kind: ExitKind,
    /// How long the instance ran (monotonic).
    pub uptime: Duration,
    /// What caused the exit.
    pub trigger: ExitTrigger,
}

impl ExitOutcome {
    /// Builds an outcome from an OS exit status.
    pub fn from_status(status: ExitStatus, uptime: Duration, trigger: ExitTrigger) -> Self {
        #[cfg(unix)]
        let kind = match (status.code(), status.signal()) {
            (Some(code), _) => ExitKind::Code(code),
            (None, Some(signal)) => ExitKind::Signal(signal),
            (None, None) => ExitKind::Code(-1),
        };
        #[cfg(not(unix))]
        let kind = ExitKind::Code(status.code().unwrap_or(-1));

        Self {
            kind,
            uptime,
            trigger,
        }
    }

    /// Outcome for an instance that failed before the process existed.
    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self {
            kind: ExitKind::LaunchFailed(reason.into()),
            uptime: Duration::ZERO,
            trigger: ExitTrigger::Child,
        }
    }

    /// Exit code if the child exited normally.
    pub fn code(&self) -> Option<i32> {
        match self.kind {
            ExitKind::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Signal number if the child was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        match self.kind {
            ExitKind::Signal(signal) => Some(signal),
            _ => None,
        }
    }

    /// True for a normal exit with code 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// The state an entry enters when this outcome is observed.
    pub fn terminal_state(&self) -> State {
        match self.kind {
            ExitKind::Code(_) => State::Exited,
            ExitKind::Signal(_) | ExitKind::LaunchFailed(_) => State::Crashed,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExitKind::Code(code) => write!(f, "exit code {code}"),
            ExitKind::Signal(signal) => write!(f, "signal {signal}"),
            ExitKind::LaunchFailed(reason) => write!(f, "launch failed: {reason}"),
        }
    }
}

/// One launch attempt of an entry.
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    /// Monotonically increasing id, unique within a supervisor.
    pub id: u64,
    /// OS process id once spawned.
    pub pid: Option<u32>,
    /// Wall-clock start time, for display only.
    pub started_at: Option<DateTime<Local>>,
    /// Monotonic start time, used for uptime and backoff resets.
    pub started: Option<Instant>,
    /// Present once the exit has been fully observed.
    pub exit: Option<ExitOutcome>,
    /// Restarts that preceded this instance.
    pub restart_count: u32,
}

impl ProcessInstance {
    pub(crate) fn new(id: u64, restart_count: u32) -> Self {
        Self {
            id,
            pid: None,
            started_at: None,
            started: None,
            exit: None,
            restart_count,
        }
    }

    pub(crate) fn mark_spawned(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.started_at = Some(Local::now());
        self.started = Some(Instant::now());
    }

    /// Time since spawn for a live instance.
    pub fn uptime(&self) -> Option<Duration> {
        if self.exit.is_some() {
            return None;
        }
        self.started.map(|started| started.elapsed())
    }
}

/// Summary of a finished instance for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSummary {
    /// Exit code, when the child exited normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Terminating signal, when killed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Launch error text, when the process never started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ExitOutcome> for ExitSummary {
    fn from(outcome: &ExitOutcome) -> Self {
        let error = match &outcome.kind {
            ExitKind::LaunchFailed(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            code: outcome.code(),
            signal: outcome.signal(),
            error,
        }
    }
}

/// Point-in-time view of an entry. Never carries environment values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Entry name.
    pub name: String,
    /// Current lifecycle state.
    pub state: State,
    /// Live process id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Restarts performed so far.
    pub restarts: u32,
    /// Start of the current or most recent instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    /// Uptime of the live instance in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    /// How the most recent finished instance ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitSummary>,
    /// Set when the entry gave up restarting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
