//! Constants and default values used across the supervisor.
//!
//! Timing defaults follow the conventions of common Node/Python process
//! managers so that descriptors written for them behave the same here.

use std::time::Duration;

// ============================================================================
// Descriptor Defaults
// ============================================================================

/// Descriptor file looked up when no `--config` is given.
pub const DEFAULT_DESCRIPTOR: &str = "procward.yaml";

/// Secondary descriptor name checked when the default is absent.
pub const FALLBACK_DESCRIPTOR: &str = "pward.yaml";

/// Initial restart delay after a failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Upper bound on the restart delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(15);

/// A run at least this long resets the backoff and counts as healthy.
pub const DEFAULT_HEALTHY_RUN: Duration = Duration::from_secs(30);

/// Time a child is given between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1600);

// ============================================================================
// Supervision Loop
// ============================================================================

/// How often a driver re-checks its child when nothing wakes it.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll cadence while waiting for a signalled child to go away.
pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Extra time `stop` waits beyond the grace period before giving up.
pub const STOP_SLACK: Duration = Duration::from_secs(5);

/// Finished instances remembered per entry for `await_exit` on older handles.
pub const INSTANCE_HISTORY: usize = 16;

// ============================================================================
// File Watching
// ============================================================================

/// File events arriving this soon after an instance starts are ignored.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Path components never considered source changes.
pub const WATCH_ALWAYS_IGNORED: &[&str] =
    &[".git", "node_modules", "__pycache__", ".venv", "venv", "target"];

// ============================================================================
// Runtime Files
// ============================================================================

/// Directory under `$HOME` holding the control socket and pid file.
pub const RUNTIME_SUBDIR: &str = ".local/share/procward";

/// Control socket file name.
pub const SOCKET_FILE: &str = "control.sock";

/// Resident supervisor pid file name.
pub const PID_FILE: &str = "pward.pid";

/// Log file used when the supervisor is daemonized.
pub const SUPERVISOR_LOG_FILE: &str = "supervisor.log";
