//! Resident supervisor process: owns a [`Supervisor`] and serves control
//! requests on a unix socket until told to shut down.
use std::{
    fs, io,
    os::unix::{
        io::IntoRawFd,
        net::{UnixListener, UnixStream},
    },
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    error::SupervisorError,
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    runtime::RuntimePaths,
    supervisor::Supervisor,
};

/// Errors emitted by the resident runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Long-lived control loop around a [`Supervisor`].
#[derive(Clone)]
pub struct Resident {
    supervisor: Supervisor,
    paths: RuntimePaths,
    shutdown: Arc<AtomicBool>,
}

impl Resident {
    /// Wraps an already configured supervisor.
    pub fn new(supervisor: Supervisor, paths: RuntimePaths) -> Self {
        Self {
            supervisor,
            paths,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds the control socket, records the PID, and serves commands until
    /// a shutdown request arrives. Entries must already be started.
    /// Each connection is served on its own thread.
    pub fn run(&self) -> Result<(), DaemonError> {
        if self.paths.socket.exists() {
            fs::remove_file(&self.paths.socket)?;
        }
        let listener = UnixListener::bind(&self.paths.socket)?;
        self.paths.write_pid(std::process::id() as libc::pid_t)?;
        info!("pward supervisor listening on {:?}", self.paths.socket);

        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let resident = self.clone();
                    let spawned = thread::Builder::new()
                        .name("pward-control".into())
                        .spawn(move || resident.serve(stream));
                    if let Err(err) = spawned {
                        error!("Failed to spawn control handler: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Supervisor listener error: {err}");
                    break;
                }
            }
        }

        self.paths.cleanup();
        info!("pward supervisor exited");
        Ok(())
    }

    fn serve(&self, mut stream: UnixStream) {
        let command = match ipc::read_command(&mut stream) {
            Ok(command) => command,
            Err(err) => {
                if !self.shutdown.load(Ordering::SeqCst) {
                    warn!("Invalid supervisor command: {err}");
                    let _ =
                        ipc::write_response(&mut stream, &ControlResponse::Error(err.to_string()));
                }
                return;
            }
        };

        debug!("Supervisor received command: {command:?}");
        let is_shutdown = matches!(command, ControlCommand::Shutdown);
        let response = self.handle_command(command).unwrap_or_else(|err| {
            error!("Supervisor command failed: {err}");
            ControlResponse::Error(err.to_string())
        });
        let shutting_down = is_shutdown && !matches!(response, ControlResponse::Error(_));
        let _ = ipc::write_response(&mut stream, &response);
        drop(stream);

        if shutting_down {
            self.request_exit();
        }
    }

    /// Ends the accept loop after the current request.
    fn request_exit(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock `accept`.
        let _ = UnixStream::connect(&self.paths.socket);
    }

    /// Applies one control command to the supervisor.
    pub fn handle_command(
        &self,
        command: ControlCommand,
    ) -> Result<ControlResponse, SupervisorError> {
        match command {
            ControlCommand::Start { name } => {
                let handle = self.supervisor.start(&name)?;
                Ok(ControlResponse::Message(match handle.pid() {
                    Some(pid) => format!("Entry '{name}' started (PID {pid})"),
                    None => format!("Entry '{name}' started"),
                }))
            }
            ControlCommand::Stop { name } => {
                self.supervisor.stop_entry(&name)?;
                Ok(ControlResponse::Message(format!("Entry '{name}' stopped")))
            }
            ControlCommand::Restart { name: Some(name) } => {
                self.supervisor.restart(&name)?;
                Ok(ControlResponse::Message(format!("Entry '{name}' restarted")))
            }
            ControlCommand::Restart { name: None } => {
                self.supervisor.shutdown()?;
                self.supervisor.start_all()?;
                Ok(ControlResponse::Message("All entries restarted".into()))
            }
            ControlCommand::Status { name: Some(name) } => {
                Ok(ControlResponse::Status(vec![self.supervisor.report(&name)?]))
            }
            ControlCommand::Status { name: None } => {
                Ok(ControlResponse::Status(self.supervisor.reports()?))
            }
            ControlCommand::Shutdown => {
                self.supervisor.shutdown()?;
                Ok(ControlResponse::Message("Supervisor shutting down".into()))
            }
        }
    }
}

/// Detaches from the controlling terminal with the classic double fork.
/// Only the grandchild returns.
pub fn daemonize() -> io::Result<()> {
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    std::env::set_current_dir("/")?;
    let devnull = fs::File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}
