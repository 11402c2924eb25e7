use nix::{errno::Errno, sys::signal, unistd::Pid};
use std::{
    error::Error,
    fs::OpenOptions,
    path::Path,
    process::ExitCode,
    sync::Mutex,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use procward::{
    cli::{Commands, LogLevelArg, parse_args},
    config::load_descriptor,
    daemon::{self, Resident},
    error::SupervisorError,
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    runtime::RuntimePaths,
    status,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let paths = RuntimePaths::resolve()?;

    match args.command {
        Commands::Start {
            config,
            name,
            daemonize,
        } => {
            let log_file = daemonize.then_some(paths.log_file.as_path());
            init_logging(args.log_level, log_file)?;

            if supervisor_running(&paths) {
                let Some(name) = name else {
                    return Err("pward supervisor already running".into());
                };
                print_message(send_control_command(&paths, &ControlCommand::Start { name })?);
                return Ok(());
            }

            let descriptor = load_descriptor(config.as_deref())?;
            if let Some(name) = &name
                && descriptor.get(name).is_none()
            {
                return Err(SupervisorError::UnknownEntry(name.clone()).into());
            }
            if let Some(path) = &descriptor.path {
                info!("Starting pward supervisor with descriptor {path:?}");
            }

            if daemonize {
                daemon::daemonize()?;
            }

            let supervisor = Supervisor::new(descriptor);
            register_signal_handler(supervisor.clone(), paths.clone())?;

            match &name {
                Some(name) => {
                    supervisor.start(name)?;
                }
                None => {
                    supervisor.start_all()?;
                }
            }

            if let Err(err) = Resident::new(supervisor.clone(), paths.clone()).run() {
                error!("Supervisor exited with error: {err}");
                let _ = supervisor.shutdown();
                paths.cleanup();
                return Err(err.into());
            }
        }
        Commands::Stop { name } => {
            init_logging(args.log_level, None)?;
            let command = match name {
                Some(name) => ControlCommand::Stop { name },
                None => ControlCommand::Shutdown,
            };
            print_message(send_control_command(&paths, &command)?);
        }
        Commands::Restart { name } => {
            init_logging(args.log_level, None)?;
            print_message(send_control_command(&paths, &ControlCommand::Restart { name })?);
        }
        Commands::Status {
            name,
            json,
            no_color,
        } => {
            init_logging(args.log_level, None)?;
            match send_control_command(&paths, &ControlCommand::Status { name })? {
                ControlResponse::Status(reports) if json => {
                    println!("{}", status::render_json(&reports)?);
                }
                ControlResponse::Status(reports) => {
                    println!("{}", status::render_reports(&reports, !no_color));
                }
                other => print_message(other),
            }
        }
    }

    Ok(())
}

fn init_logging(
    level: Option<LogLevelArg>,
    log_file: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let filter = if let Some(level) = level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
    Ok(())
}

fn supervisor_running(paths: &RuntimePaths) -> bool {
    match paths.read_pid() {
        Ok(Some(pid)) => match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                paths.cleanup();
                false
            }
            Err(err) => {
                warn!("Failed to query supervisor pid {pid}: {err}");
                false
            }
        },
        Ok(None) | Err(_) => false,
    }
}

fn send_control_command(
    paths: &RuntimePaths,
    command: &ControlCommand,
) -> Result<ControlResponse, Box<dyn Error>> {
    match ipc::send_command(&paths.socket, command) {
        Ok(response) => Ok(response),
        Err(ControlError::NotAvailable) => {
            if !supervisor_running(paths) {
                paths.cleanup();
            }
            Err(ControlError::NotAvailable.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn print_message(response: ControlResponse) {
    if let ControlResponse::Message(message) = response {
        println!("{message}");
    }
}

fn register_signal_handler(
    supervisor: Supervisor,
    paths: RuntimePaths,
) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        info!("pward is shutting down; stopping all entries");
        if let Err(err) = supervisor.shutdown() {
            error!("Shutdown incomplete: {err}");
        }
        paths.cleanup();
        std::process::exit(0);
    })?;

    Ok(())
}
