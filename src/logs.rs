//! Line-oriented handling of child process output.
use std::{
    io::{BufRead, BufReader, Read},
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

/// Calls `on_line` for every line of `stream`, without the trailing newline.
///
/// Invalid UTF-8 is replaced rather than aborting the scan, so a stray byte
/// in the server's output cannot hide a later readiness line.
pub fn for_each_line<R: Read>(stream: R, mut on_line: impl FnMut(&str)) {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                on_line(line.trim_end_matches(['\n', '\r']));
            }
            Err(err) => {
                debug!("Stopped reading process output: {err}");
                break;
            }
        }
    }
}

/// Forwards a child's stderr to the log at `warn` level on a background thread.
pub fn spawn_stderr_forwarder<R>(label: &str, stream: R) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let prefix = label.to_string();
    thread::Builder::new()
        .name(format!("{label}-stderr"))
        .spawn(move || {
            for_each_line(stream, |line| warn!(target: "server", "[{prefix}] {line}"));
        })
        .map_err(|err| warn!("Unable to forward stderr of '{label}': {err}"))
        .ok()
}
