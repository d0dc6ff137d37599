//! Wire format of the control channel between the UI process and the supervisor.
//!
//! One JSON document per line in both directions.
use crate::process::{FaultSpec, Notification, Snapshot, SupervisorState, TlsConfig};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Exit code telling the outer process manager to relaunch the application.
pub const UPDATE_EXIT_CODE: i32 = 20;

/// Message sent from the UI process to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum BridgeRequest {
    GetStatus,
    SetStatus {
        status: serde_json::Value,
    },
    GetState,
    GetTlsConfig,
    GetSnapshot,
    /// Fire-and-forget. On success the whole application exits with [`UPDATE_EXIT_CODE`].
    AwaitUpdate,
    Restart {
        #[serde(default)]
        forced: bool,
    },
    Stop {
        #[serde(default)]
        forced: bool,
    },
    InjectFault {
        fault: FaultSpec,
    },
    /// Turns the connection into a stream of notifications.
    Subscribe,
}

/// Message sent by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum BridgeResponse {
    Ok,
    Status { status: serde_json::Value },
    State { state: SupervisorState },
    TlsConfig { tls: Option<TlsConfig> },
    Snapshot { snapshot: Snapshot },
    Notification { notification: Notification },
    Error { message: String },
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
    #[error("control socket closed")]
    Closed,
}

/// Writes one message followed by a newline.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ControlError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next non-empty message. `Ok(None)` means the peer hung up.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, ControlError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(serde_json::from_str(line.trim())?));
        }
    }
}

/// Connects to the supervisor, sends one request and returns the first response.
pub async fn send_request(
    path: &Path,
    request: &BridgeRequest,
) -> Result<(BridgeResponse, BufReader<UnixStream>), ControlError> {
    let mut stream = BufReader::new(UnixStream::connect(path).await?);
    write_message(stream.get_mut(), request).await?;
    let response = read_message(&mut stream)
        .await?
        .ok_or(ControlError::Closed)?;
    if let BridgeResponse::Error { message } = response {
        return Err(ControlError::Server(message));
    }
    Ok((response, stream))
}
