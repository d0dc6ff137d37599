//! Typed outcomes reported across the supervisor boundary.
use crate::process::SupervisorState;
use thiserror::Error;

/// Why a supervisor request did not end in the state the caller asked for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// The request makes no sense in the current state.
    #[error("cannot {action} while {state}")]
    Rejected {
        action: &'static str,
        state: SupervisorState,
    },

    /// The node could not be spawned.
    #[error("failed to launch node: {0}")]
    Launch(String),

    /// A termination signal could not be delivered.
    #[error("failed to signal node: {0}")]
    Signal(String),

    /// The node outlived both the graceful and the kill window.
    #[error("node did not exit within the kill timeout")]
    ShutdownTimeout,

    #[error("timed out waiting for the node update")]
    UpdateTimeout,

    /// The supervisor left the update path before the update completed.
    #[error("update wait abandoned, supervisor is {0}")]
    UpdateAbandoned(SupervisorState),

    /// The state machine task is gone.
    #[error("supervisor is not running")]
    Closed,
}
