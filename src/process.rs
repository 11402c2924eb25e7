//! Launching and terminating child processes.
use std::{
    collections::BTreeMap,
    io,
    os::unix::{fs::PermissionsExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::{
    config::ProcessSpec,
    constants::TERMINATION_POLL_INTERVAL,
    env,
    error::LaunchError,
    logs::{open_output, spawn_log_writer, stdio_for},
};

fn is_executable_file(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolves the spec's executable the way a shell would, using the `PATH`
/// of the child's environment. Paths with a separator resolve against the
/// working directory.
pub fn resolve_executable(
    spec: &ProcessSpec,
    child_env: &BTreeMap<String, String>,
) -> Result<PathBuf, LaunchError> {
    let not_found = || LaunchError::ExecutableNotFound {
        entry: spec.name.clone(),
        program: spec.executable.clone(),
    };
    let program = Path::new(&spec.executable);

    if spec.executable.contains('/') {
        let candidate = if program.is_absolute() {
            program.to_path_buf()
        } else {
            spec.cwd.join(program)
        };
        return if is_executable_file(&candidate) {
            Ok(candidate)
        } else {
            Err(not_found())
        };
    }

    let search = child_env.get("PATH").map(String::as_str).unwrap_or_default();
    std::env::split_paths(search)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| {
            if dir.is_absolute() {
                dir.join(program)
            } else {
                spec.cwd.join(dir).join(program)
            }
        })
        .find(|candidate| is_executable_file(candidate))
        .ok_or_else(not_found)
}

/// Starts the child described by `spec` with `inherited` overlaid by the
/// spec's environment. Returns as soon as the process exists.
pub fn spawn(
    spec: &ProcessSpec,
    inherited: &BTreeMap<String, String>,
) -> Result<Child, LaunchError> {
    if !spec.cwd.is_dir() {
        return Err(LaunchError::WorkingDirectory {
            entry: spec.name.clone(),
            path: spec.cwd.clone(),
        });
    }

    let child_env = env::overlay(inherited, &spec.env);
    let program = resolve_executable(spec, &child_env)?;

    let open = |path: &Option<PathBuf>| -> Result<Option<std::fs::File>, LaunchError> {
        path.as_deref()
            .map(|path| {
                open_output(path).map_err(|source| LaunchError::OutputFile {
                    entry: spec.name.clone(),
                    path: path.to_path_buf(),
                    source,
                })
            })
            .transpose()
    };
    let stdout_sink = open(&spec.stdout_file)?;
    let stderr_sink = open(&spec.stderr_file)?;

    let mut cmd = Command::new(&program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&child_env)
        .stdin(Stdio::null())
        .stdout(stdio_for(stdout_sink.as_ref()))
        .stderr(stdio_for(stderr_sink.as_ref()));

    debug!(
        "Launching '{}': {:?} {:?} in {:?} with env keys {:?}",
        spec.name,
        program,
        spec.args,
        spec.cwd,
        env::keys(&spec.env)
    );

    unsafe {
        cmd.pre_exec(|| {
            // Own process group so signals reach the whole tree but never the supervisor.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            LaunchError::ExecutableNotFound {
                entry: spec.name.clone(),
                program: spec.executable.clone(),
            }
        } else {
            LaunchError::Spawn {
                entry: spec.name.clone(),
                source,
            }
        }
    })?;

    if let (Some(out), Some(sink)) = (child.stdout.take(), stdout_sink) {
        spawn_log_writer(&spec.name, out, sink, "stdout");
    }
    if let (Some(err), Some(sink)) = (child.stderr.take(), stderr_sink) {
        spawn_log_writer(&spec.name, err, sink, "stderr");
    }

    debug!("Entry '{}' started with PID {}", spec.name, child.id());
    Ok(child)
}

/// Delivers `sig` to the child's process group and to the child itself.
/// A process that is already gone is not an error.
pub fn signal_child(pid: u32, sig: Signal) -> Result<(), Errno> {
    let pid = Pid::from_raw(pid as i32);

    match signal::killpg(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(Errno::EPERM) => {
            warn!("Insufficient permissions to signal process group {pid}; signalling PID directly");
        }
        Err(err) => return Err(err),
    }

    match signal::kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Asks the child to exit with SIGTERM and escalates to SIGKILL once
/// `grace` has elapsed on the monotonic clock.
pub fn terminate(child: &mut Child, entry: &str, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    let pid = child.id();
    debug!("Sending SIGTERM to '{entry}' (PID {pid})");
    if let Err(err) = signal_child(pid, Signal::SIGTERM) {
        warn!("Failed to deliver SIGTERM to '{entry}': {err}");
    }

    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(TERMINATION_POLL_INTERVAL.min(deadline - now));
    }

    warn!("Entry '{entry}' did not exit within {grace:?} of SIGTERM; sending SIGKILL");
    if let Err(err) = signal_child(pid, Signal::SIGKILL) {
        warn!("Failed to deliver SIGKILL to '{entry}': {err}");
    }
    match child.kill() {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
        Err(err) => return Err(err),
    }
    child.wait()
}
