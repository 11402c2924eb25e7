//! Error handling for procward.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Problems with the descriptor. Fatal at startup: nothing is launched.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The descriptor file could not be read.
    #[error("Failed to read descriptor {path:?}: {source}")]
    Read {
        /// Path that was being read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The descriptor is not valid YAML or does not match the schema.
    #[error("Invalid descriptor format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names a variable that is not set.
    #[error("Descriptor references unset environment variable '{0}'")]
    MissingVariable(String),

    /// Two entries share the same name.
    #[error("Entry '{0}' is declared more than once")]
    DuplicateEntry(String),

    /// A field of an entry failed validation.
    #[error("Entry '{entry}': {reason}")]
    Invalid {
        /// The offending entry.
        entry: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A duration string could not be parsed.
    #[error("Invalid duration '{0}' (expected e.g. 500ms, 5s, 2m, 1h)")]
    InvalidDuration(String),

    /// An env file referenced by an entry could not be read.
    #[error("Entry '{entry}': failed to read env file {path:?}: {source}")]
    EnvFile {
        /// The entry declaring the env file.
        entry: String,
        /// Resolved env file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Failure to bring a child process into existence.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The working directory is missing or not a directory.
    #[error("Entry '{entry}': working directory {path:?} does not exist")]
    WorkingDirectory {
        /// The entry being launched.
        entry: String,
        /// The directory that was requested.
        path: PathBuf,
    },

    /// The executable could not be resolved on disk or on `PATH`.
    #[error("Entry '{entry}': executable '{program}' not found")]
    ExecutableNotFound {
        /// The entry being launched.
        entry: String,
        /// The program as written in the descriptor.
        program: String,
    },

    /// An output forwarding file could not be opened.
    #[error("Entry '{entry}': cannot open output file {path:?}: {source}")]
    OutputFile {
        /// The entry being launched.
        entry: String,
        /// The log target.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The operating system refused to create the process.
    #[error("Entry '{entry}': failed to spawn: {source}")]
    Spawn {
        /// The entry being launched.
        entry: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the supervisor API.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Descriptor problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The child could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The entry exhausted its restart ceiling and is now stopped.
    #[error("Entry '{entry}' reached its restart ceiling after {restarts} restarts")]
    RestartCeilingExceeded {
        /// The entry that gave up.
        entry: String,
        /// Restarts performed before giving up.
        restarts: u32,
    },

    /// No entry with that name is known.
    #[error("Entry '{0}' not found")]
    UnknownEntry(String),

    /// The entry already has a live process or a pending restart.
    #[error("Entry '{0}' is already running")]
    AlreadyRunning(String),

    /// The handle refers to an instance whose record has been discarded.
    #[error("Instance {instance} of entry '{entry}' is no longer tracked")]
    InstanceExpired {
        /// The entry name.
        entry: String,
        /// The instance id carried by the handle.
        instance: u64,
    },

    /// The entry did not reach `Stopped` in time after a stop request.
    #[error("Entry '{entry}' did not stop within {waited:?}")]
    StopTimedOut {
        /// The entry name.
        entry: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// I/O failure inside the supervisor itself.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `SupervisorError`.
impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}
