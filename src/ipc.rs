//! JSON-line protocol between CLI invocations and the resident supervisor.
use serde::{Deserialize, Serialize};
use std::{
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
};
use thiserror::Error;

use crate::state::StatusReport;

/// Message sent from CLI invocations to the resident supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Start { name: String },
    Stop { name: String },
    Restart { name: Option<String> },
    Status { name: Option<String> },
    Shutdown,
}

/// Response sent by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Message(String),
    Status(Vec<StatusReport>),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("no resident supervisor is running")]
    NotAvailable,
}

/// Sends a command over `socket` and waits for the response.
pub fn send_command(
    socket: &Path,
    command: &ControlCommand,
) -> Result<ControlResponse, ControlError> {
    if !socket.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => ControlError::NotAvailable,
        _ => ControlError::Io(err),
    })?;
    write_line(&mut stream, command)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Reads one command from a connected client.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to the connected client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    write_line(stream, response)
}

fn write_line<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
