use crate::configs::NodeConfig;
use crate::error::SupervisorError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Externally visible lifecycle state of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Updating,
    Updated,
    Crashed,
    Error,
    Unrecoverable,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Updating => "updating",
            SupervisorState::Updated => "updated",
            SupervisorState::Crashed => "crashed",
            SupervisorState::Error => "error",
            SupervisorState::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

/// Certificate material the UI needs to talk to the node API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub hostname: String,
    pub port: u16,
}

impl TlsConfig {
    pub fn for_node(config: &NodeConfig, port: u16) -> Self {
        let client = config.tls_dir.join("client");
        Self {
            ca_cert: client.join("ca.crt"),
            client_cert: client.join("client.pem"),
            client_key: client.join("client.key"),
            hostname: config.api_host.clone(),
            port,
        }
    }
}

/// Synthetic failure modes, each consumed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultSpec {
    /// Behave as if the node exited unexpectedly.
    Crash,
    /// The next shutdown skips the graceful request, so the graceful window runs out.
    Unresponsive,
    Unrecoverable,
    Error,
}

/// Committed view of the supervisor, readable without going through the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub state: SupervisorState,
    pub status: serde_json::Value,
    pub tls: Option<TlsConfig>,
    pub attempts: u32,
    pub pid: Option<i32>,
    pub since: DateTime<Local>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: SupervisorState::Stopped,
            status: serde_json::Value::Null,
            tls: None,
            attempts: 0,
            pid: None,
            since: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum Notification {
    State(SupervisorState),
    TlsConfig(Option<TlsConfig>),
    Status(serde_json::Value),
}

pub type Outcome = Result<SupervisorState, SupervisorError>;
pub type Reply = oneshot::Sender<Outcome>;

#[derive(Debug)]
pub enum Controls {
    Start(Reply),
    Stop { forced: bool, reply: Reply },
    Restart { forced: bool, reply: Reply },
    ExpectUpdate(Reply),
    InjectFault { fault: FaultSpec, reply: Reply },
    SetStatus(serde_json::Value, Reply),
}

/// What the running node reported, tagged by the launch epoch it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessSignal {
    Ready(TlsConfig),
    NotReady,
    Exited(i32),
    UpdateSignalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Phase,
    UpdateWait,
}

#[derive(Debug)]
pub enum Event {
    Control(Controls),
    Process { epoch: u64, signal: ProcessSignal },
    TimeoutReached { timer: Timer, epoch: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantedState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    /// `recovering` is set when this start was triggered by a crash.
    Starting {
        recovering: bool,
    },
    Running,
    Crashed {
        restart_at: Instant,
        epoch: u64,
    },
    Stopping(StoppingState),
    /// `relaunched` is set once the old node is gone and the updated one is starting.
    Updating {
        relaunched: bool,
    },
    Updated,
    Error,
    Unrecoverable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoppingState {
    Graceful { timeout_at: Instant, epoch: u64 },
    Kill { timeout_at: Instant, epoch: u64 },
}

impl Phase {
    pub fn state(&self) -> SupervisorState {
        match self {
            Phase::Stopped => SupervisorState::Stopped,
            Phase::Starting { .. } => SupervisorState::Starting,
            Phase::Running => SupervisorState::Running,
            Phase::Crashed { .. } => SupervisorState::Crashed,
            Phase::Stopping(_) => SupervisorState::Stopping,
            Phase::Updating { .. } => SupervisorState::Updating,
            Phase::Updated => SupervisorState::Updated,
            Phase::Error => SupervisorState::Error,
            Phase::Unrecoverable => SupervisorState::Unrecoverable,
        }
    }

    /// Deadline the event loop has to wake up for, with the epoch it was armed under.
    pub fn deadline(&self) -> Option<(Instant, u64)> {
        match self {
            Phase::Crashed { restart_at, epoch } => Some((*restart_at, *epoch)),
            Phase::Stopping(StoppingState::Graceful { timeout_at, epoch }) => {
                Some((*timeout_at, *epoch))
            }
            Phase::Stopping(StoppingState::Kill { timeout_at, epoch }) => {
                Some((*timeout_at, *epoch))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::test_node_config;

    #[test]
    fn tls_paths_live_under_client_dir() {
        let tls = TlsConfig::for_node(&test_node_config(), 8090);
        assert_eq!(tls.ca_cert, PathBuf::from("/tmp/tls/client/ca.crt"));
        assert_eq!(tls.client_key, PathBuf::from("/tmp/tls/client/client.key"));
        assert_eq!(tls.hostname, "127.0.0.1");
        assert_eq!(tls.port, 8090);
    }

    #[test]
    fn notifications_are_tagged() {
        let json = serde_json::to_string(&Notification::State(SupervisorState::Crashed)).unwrap();
        assert_eq!(json, r#"{"kind":"state","value":"crashed"}"#);
        let json = serde_json::to_string(&Notification::TlsConfig(None)).unwrap();
        assert_eq!(json, r#"{"kind":"tls-config","value":null}"#);
    }

    #[test]
    fn only_timed_phases_have_deadlines() {
        let now = Instant::now();
        assert_eq!(Phase::Running.deadline(), None);
        assert_eq!(
            Phase::Crashed { restart_at: now, epoch: 3 }.deadline(),
            Some((now, 3))
        );
        assert_eq!(
            Phase::Updating { relaunched: true }.state(),
            SupervisorState::Updating
        );
    }
}
