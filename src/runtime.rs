//! Runtime file locations for the resident supervisor.
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::constants::{PID_FILE, RUNTIME_SUBDIR, SOCKET_FILE, SUPERVISOR_LOG_FILE};

/// Paths of the files shared between the resident supervisor and CLI calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Directory holding every runtime file.
    pub dir: PathBuf,
    /// Control socket.
    pub socket: PathBuf,
    /// PID of the resident supervisor.
    pub pid_file: PathBuf,
    /// Supervisor log when daemonized.
    pub log_file: PathBuf,
}

impl RuntimePaths {
    /// Runtime paths under the given home directory.
    pub fn under_home(home: &Path) -> Self {
        let dir = home.join(RUNTIME_SUBDIR);
        Self {
            socket: dir.join(SOCKET_FILE),
            pid_file: dir.join(PID_FILE),
            log_file: dir.join(SUPERVISOR_LOG_FILE),
            dir,
        }
    }

    /// Runtime paths for the current user, creating the directory.
    pub fn resolve() -> io::Result<Self> {
        let home = std::env::var_os("HOME")
            .filter(|home| !home.is_empty())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))?;
        let paths = Self::under_home(Path::new(&home));
        fs::create_dir_all(&paths.dir)?;
        Ok(paths)
    }

    /// Records the supervisor PID.
    pub fn write_pid(&self, pid: libc::pid_t) -> io::Result<()> {
        fs::write(&self.pid_file, pid.to_string())
    }

    /// Reads the recorded supervisor PID, if any.
    pub fn read_pid(&self) -> io::Result<Option<libc::pid_t>> {
        match fs::read_to_string(&self.pid_file) {
            Ok(contents) => contents
                .trim()
                .parse::<libc::pid_t>()
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Removes the socket and PID files.
    pub fn cleanup(&self) {
        for path in [&self.socket, &self.pid_file] {
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
    }
}
