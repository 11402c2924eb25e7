//! Forwarding of child output streams.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read},
    path::Path,
    process::Stdio,
    thread,
};

use tracing::{debug, warn};

/// Opens (creating parent directories) a file for appending forwarded output.
pub fn open_output(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Stdio configuration for one stream: piped when a target file exists.
pub fn stdio_for(target: Option<&File>) -> Stdio {
    if target.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    }
}

/// Copies `source` into `sink` byte for byte until EOF on a background thread.
pub fn spawn_log_writer<R>(entry: &str, source: R, mut sink: File, kind: &'static str)
where
    R: Read + Send + 'static,
{
    let entry = entry.to_string();
    let spawned = thread::Builder::new()
        .name(format!("{entry}-{kind}"))
        .spawn(move || {
            let mut source = source;
            match io::copy(&mut source, &mut sink) {
                Ok(bytes) => debug!("Forwarded {bytes} bytes of {kind} for '{entry}'"),
                Err(err) => warn!("Stopped forwarding {kind} for '{entry}': {err}"),
            }
        });

    if let Err(err) = spawned {
        warn!("Failed to start {kind} forwarder: {err}");
    }
}
