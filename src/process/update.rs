use super::types::Reply;
use super::SupervisorState;
use crate::error::SupervisorError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One shared wait for the node to finish an update.
#[derive(Debug, Default)]
pub struct UpdateWatcher {
    waiters: Vec<Reply>,
    deadline: Option<Instant>,
    epoch: u64,
}

impl UpdateWatcher {
    /// Joins the outstanding wait, or arms a new one.
    pub fn expect(&mut self, reply: Reply, timeout: Duration) {
        if self.deadline.is_none() {
            self.epoch += 1;
            self.deadline = Some(Instant::now() + timeout);
            info!(
                "Waiting up to {} for the node update",
                humantime::format_duration(timeout)
            );
        } else {
            debug!("Joining pending update wait");
        }
        self.waiters.push(reply);
    }

    pub fn deadline(&self) -> Option<(Instant, u64)> {
        self.deadline.map(|at| (at, self.epoch))
    }

    pub fn time_out(&mut self, epoch: u64) {
        if epoch != self.epoch || self.deadline.is_none() {
            return;
        }
        warn!("Node update did not complete in time");
        self.resolve(Err(SupervisorError::UpdateTimeout));
    }

    /// Settles the wait once the supervisor reaches a state that decides it.
    pub fn observe(&mut self, state: SupervisorState) {
        if self.deadline.is_none() {
            return;
        }
        match state {
            SupervisorState::Updated => self.resolve(Ok(state)),
            SupervisorState::Stopped | SupervisorState::Error | SupervisorState::Unrecoverable => {
                warn!(%state, "Update wait abandoned");
                self.resolve(Err(SupervisorError::UpdateAbandoned(state)));
            }
            _ => {}
        }
    }

    fn resolve(&mut self, outcome: Result<SupervisorState, SupervisorError>) {
        self.deadline = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}
