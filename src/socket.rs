use crate::configs::NodewardenConfig;
use crate::ipc::{read_message, write_message, BridgeRequest, BridgeResponse, UPDATE_EXIT_CODE};
use crate::process::{Outcome, SupervisorHandle, SupervisorState};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::Path;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Answers UI requests on behalf of the supervisor.
#[derive(Debug, Clone)]
pub struct Bridge {
    supervisor: SupervisorHandle,
    /// Receives the code the whole application should exit with.
    exit: UnboundedSender<i32>,
}

impl Bridge {
    pub fn new(supervisor: SupervisorHandle, exit: UnboundedSender<i32>) -> Self {
        Self { supervisor, exit }
    }

    pub async fn respond(&self, request: BridgeRequest) -> BridgeResponse {
        match request {
            BridgeRequest::GetStatus => BridgeResponse::Status {
                status: self.supervisor.status(),
            },
            BridgeRequest::GetState => BridgeResponse::State {
                state: self.supervisor.state(),
            },
            BridgeRequest::GetTlsConfig => BridgeResponse::TlsConfig {
                tls: self.supervisor.tls_config(),
            },
            BridgeRequest::GetSnapshot => BridgeResponse::Snapshot {
                snapshot: self.supervisor.snapshot(),
            },
            BridgeRequest::SetStatus { status } => match self.supervisor.set_status(status).await {
                Ok(_) => BridgeResponse::Ok,
                Err(err) => error_response(err),
            },
            BridgeRequest::AwaitUpdate => {
                self.await_update();
                BridgeResponse::Ok
            }
            BridgeRequest::Restart { forced } => {
                state_response(self.supervisor.request_restart(forced).await)
            }
            BridgeRequest::Stop { forced } => {
                state_response(self.supervisor.request_stop(forced).await)
            }
            BridgeRequest::InjectFault { fault } => {
                state_response(self.supervisor.inject_fault(fault).await)
            }
            BridgeRequest::Subscribe => BridgeResponse::Error {
                message: "subscribe must be the last request on a connection".into(),
            },
        }
    }

    fn await_update(&self) {
        let supervisor = self.supervisor.clone();
        let exit = self.exit.clone();
        tokio::spawn(
            async move {
                match supervisor.expect_update().await {
                    Ok(SupervisorState::Updated) => {
                        info!("Node updated, restarting application");
                        let _ = exit.send(UPDATE_EXIT_CODE);
                    }
                    Ok(state) => warn!(%state, "Update wait ended without an update"),
                    Err(err) => warn!(%err, "Update did not complete"),
                }
            }
            .instrument(info_span!("await_update")),
        );
    }
}

fn state_response(outcome: Outcome) -> BridgeResponse {
    match outcome {
        Ok(state) => BridgeResponse::State { state },
        Err(err) => error_response(err),
    }
}

fn error_response(err: impl std::fmt::Display) -> BridgeResponse {
    BridgeResponse::Error {
        message: err.to_string(),
    }
}

#[instrument(skip_all)]
pub async fn setup(config: &NodewardenConfig, bridge: Bridge) -> Result<()> {
    let Some(socket_path) = &config.socket else {
        info!("No socket set");
        return Ok(());
    };
    serve(socket_path, bridge)
}

/// Removes the socket file left behind by [`setup`].
pub fn cleanup(config: &NodewardenConfig) {
    if let Some(path) = &config.socket {
        if let Err(err) = std::fs::remove_file(path) {
            debug!(?err, "Socket already removed");
        }
    }
}

#[instrument(skip(bridge))]
fn serve(path: &Path, bridge: Bridge) -> Result<()> {
    if path.exists() {
        warn!("Removing stale socket at {}", path.to_string_lossy());
        std::fs::remove_file(path).wrap_err("Failed to remove stale socket")?;
    }
    let listener = UnixListener::bind(path).wrap_err("Failed to bind socket")?;
    info!("Opened socket at {}", path.to_string_lossy());

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let peer_cred = stream
                        .peer_cred()
                        .map(|c| format!("{c:?}"))
                        .unwrap_or_else(|_| "<unknown>".into());
                    let bridge = bridge.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) = handle_client(stream, bridge).await {
                                warn!(%err, "Client connection failed");
                            }
                        }
                        .instrument(info_span!("handle_client", ?peer_cred)),
                    );
                }
                Err(err) => {
                    error!(?err, "Failed to accept connection");
                }
            }
        }
    });

    Ok(())
}

async fn handle_client(stream: UnixStream, bridge: Bridge) -> Result<()> {
    debug!("Client connection opened");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        let request = match read_message::<_, BridgeRequest>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("Client connection closed");
                return Ok(());
            }
            Err(err) => {
                warn!(%err, "Malformed request");
                write_message(&mut writer, &error_response(err)).await?;
                continue;
            }
        };
        debug!(?request, "Request received");
        if request == BridgeRequest::Subscribe {
            break;
        }
        let response = bridge.respond(request).await;
        write_message(&mut writer, &response).await?;
    }

    // Subscribed before acknowledging so nothing committed after the ack is missed
    let mut notifications = bridge.supervisor.subscribe();
    write_message(&mut writer, &BridgeResponse::Ok).await?;
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                write_message(&mut writer, &BridgeResponse::Notification { notification })
                    .await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Subscriber fell behind, notifications dropped");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
