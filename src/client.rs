//! Client side of the IPC protocol, used by the CLI subcommands
//!
//! Sends a single request to the daemon and reads back its one-line reply.

use crate::ipc::{Request, Response};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Client-side failure talking to the daemon
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon not running ({path}): {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error talking to daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad message from daemon: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("daemon closed the connection without replying")]
    NoReply,
}

/// Send `request` to the daemon listening at `path` and wait for the reply.
pub fn send(path: &Path, request: &Request) -> Result<Response, ClientError> {
    let mut stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
        path: path.display().to_string(),
        source,
    })?;

    let json = serde_json::to_string(request)?;
    writeln!(stream, "{json}")?;
    stream.flush()?;

    let mut line = String::new();
    let n = BufReader::new(&stream).read_line(&mut line)?;
    if n == 0 {
        return Err(ClientError::NoReply);
    }
    Ok(serde_json::from_str(&line)?)
}
