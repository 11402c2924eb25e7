//! procward is a small single-host supervisor. It launches the processes
//! declared in a descriptor, watches them, restarts them according to a
//! per-entry policy with exponential backoff, and stops them on request
//! with a SIGTERM/SIGKILL grace period. A resident mode serves `pward`
//! CLI requests over a unix socket.

/// CLI interface.
pub mod cli;

/// Descriptor loading and process specs.
pub mod config;

/// Shared constants.
pub mod constants;

/// Resident supervisor process and control loop.
pub mod daemon;

mod driver;

/// Environment overlay helpers.
pub mod env;

/// Error handling.
pub mod error;

/// IPC helpers for communicating with the resident supervisor.
pub mod ipc;

/// Child output forwarding.
pub mod logs;

/// Restart policy and backoff.
pub mod policy;

/// Spawning and terminating child processes.
pub mod process;

/// Runtime file locations.
pub mod runtime;

/// Lifecycle states and exit outcomes.
pub mod state;

/// Status rendering.
pub mod status;

/// The supervisor and its registry.
pub mod supervisor;

/// Restart-on-change file watching.
pub mod watch;

#[doc(hidden)]
pub mod test_utils;

pub use config::{Descriptor, ProcessSpec};
pub use error::{ConfigError, LaunchError, SupervisorError};
pub use policy::{RestartDecision, RestartPolicy};
pub use state::{ExitOutcome, State, StatusReport};
pub use supervisor::{InstanceHandle, Supervisor};
