use crate::configs::{NodeConfig, ReadinessProbe};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Node is serving on the given API port.
    Ready { port: u16 },
    TimedOut,
}

/// Everything the prober needs to watch one launched node.
#[derive(Debug)]
pub struct ReadySignal {
    probe: ReadinessProbe,
    host: String,
    port: u16,
    lines: mpsc::UnboundedReceiver<String>,
}

impl ReadySignal {
    pub fn new(config: &NodeConfig, lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            probe: config.readiness.clone(),
            host: config.api_host.clone(),
            port: config.api_port,
            lines,
        }
    }
}

/// Waits for the node to become ready. Retry policy is left to the caller.
#[instrument(skip(signal), fields(probe = ?signal.probe))]
pub async fn await_ready(signal: &mut ReadySignal, timeout: Duration) -> ReadyOutcome {
    let deadline = Instant::now() + timeout;
    let outcome = match signal.probe.clone() {
        ReadinessProbe::LogMarker { marker } => {
            tokio::time::timeout_at(deadline, watch_marker(&mut signal.lines, &marker, signal.port))
                .await
        }
        ReadinessProbe::Port {
            host,
            port,
            interval,
        } => {
            let host = host.unwrap_or_else(|| signal.host.clone());
            let port = port.unwrap_or(signal.port);
            tokio::time::timeout_at(deadline, poll_port(host, port, interval)).await
        }
    };
    outcome.unwrap_or(ReadyOutcome::TimedOut)
}

async fn watch_marker(
    lines: &mut mpsc::UnboundedReceiver<String>,
    marker: &str,
    port: u16,
) -> ReadyOutcome {
    while let Some(line) = lines.recv().await {
        if line.contains(marker) {
            debug!("Readiness marker seen");
            return ReadyOutcome::Ready { port };
        }
    }
    // A node may close its output and keep running; only the deadline ends the wait
    debug!("Node output closed before the readiness marker");
    std::future::pending().await
}

async fn poll_port(host: String, port: u16, interval: Duration) -> ReadyOutcome {
    loop {
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(_) => {
                debug!(%host, port, "API port open");
                return ReadyOutcome::Ready { port };
            }
            Err(err) => debug!(?err, "API port not open yet"),
        }
        tokio::time::sleep(interval).await;
    }
}
