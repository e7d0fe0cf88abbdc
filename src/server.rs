//! Unix socket server exposing the tracker to local clients
//!
//! Each line received is one JSON `Request`; each gets exactly one JSON
//! `Response` line back. Tracker errors become `Response::Error` values, so a
//! bad request never tears down the connection or the daemon.
//!
//! Stop is followed by a separate settlement step. If the ledger call fails
//! the session is already gone from the tracker; the response carries the
//! tally so the client can retry with a `settle` request. Only tallies from
//! a stop that have not been committed yet are accepted by `settle`.

use crate::error::TrackerError;
use crate::ipc::{Request, Response, SettlementOutcome};
use crate::tracker::SessionTracker;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Bind the socket at `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("IPC server listening on {}", path.display());
    Ok(listener)
}

/// Accept connections forever, serving each on its own task.
pub async fn serve(listener: UnixListener, tracker: SessionTracker) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, tracker).await {
                        debug!("connection closed with error: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept socket connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, tracker: SessionTracker) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(?request, "ipc request");
                handle_request(&tracker, request).await
            }
            Err(e) => {
                debug!("Failed to parse IPC message: {} (line: {})", e, line);
                Response::malformed(e)
            }
        };

        let json = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Execute one request against the tracker.
pub async fn handle_request(tracker: &SessionTracker, request: Request) -> Response {
    let result = match request {
        Request::Ping => Ok(Response::Pong),
        Request::Start { driver, charger } => tracker
            .start(&driver, &charger)
            .await
            .map(Response::Started),
        Request::Status { session_id } => tracker.status(&session_id).map(Response::Status),
        Request::Stop {
            session_id,
            charger,
        } => match tracker.stop(&session_id, &charger) {
            Ok(tally) => {
                let settlement = match tracker.settle(&tally).await {
                    Ok(record) => SettlementOutcome::Committed { record },
                    Err(e) => SettlementOutcome::Failed {
                        retryable: matches!(&e, TrackerError::Collaborator(c) if c.retryable()),
                        message: e.to_string(),
                    },
                };
                Ok(Response::Stopped { tally, settlement })
            }
            Err(e) => Err(e),
        },
        Request::Live => Ok(Response::Live {
            sessions: tracker.list_live(),
        }),
        Request::Driver { driver } => tracker.get_by_driver(&driver).map(Response::Status),
        Request::Recent => Ok(Response::Recent {
            sessions: tracker.list_recent(),
        }),
        Request::Settle { tally } => tracker
            .settle(&tally)
            .await
            .map(|record| Response::Settled { record }),
        Request::History { driver } => tracker
            .driver_history(&driver)
            .await
            .map(|records| Response::History { driver, records }),
        Request::Drivers => tracker
            .drivers()
            .await
            .map(|drivers| Response::Drivers { drivers }),
        Request::Insights => tracker.insights().await.map(Response::Insights),
    };

    result.unwrap_or_else(|e| Response::from(&e))
}
